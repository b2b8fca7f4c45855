// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared harness for driving the kernel on the hosted port.
//!
//! The harness plays the CPU: it advances the tick counter, invokes the
//! scheduler wherever hardware would take a timer interrupt or a pended
//! context switch, and "runs" whichever task the scheduler picked by
//! issuing kernel calls on its behalf.
//!
//! The hosted tick counter is process-global, so simulations serialize on
//! one gate; each test file is its own process.

#![allow(dead_code)]

use std::sync::{Mutex, MutexGuard, OnceLock};

use abi::Handle;
use kern::arch::{self, TaskContext};
use kern::Kernel;

static GATE: OnceLock<Mutex<()>> = OnceLock::new();

pub struct Sim {
    pub k: Kernel,
    pub ctx: TaskContext,
    _gate: MutexGuard<'static, ()>,
}

impl Sim {
    /// Fresh kernel at tick zero, idle task ready.
    pub fn boot() -> Sim {
        let gate = GATE
            .get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        arch::set_tick_count(0);
        let mut k = Kernel::new();
        k.init().expect("kernel init");
        Sim {
            k,
            ctx: TaskContext::default(),
            _gate: gate,
        }
    }

    /// Starts scheduling and performs the initial context hand-off.
    pub fn start(&mut self) {
        self.k.start().expect("kernel start");
        self.settle();
    }

    /// Serves any pending reschedule request, as the pended context-switch
    /// interrupt would on hardware.
    pub fn settle(&mut self) {
        while self.k.yield_requested() {
            self.k.scheduler(&mut self.ctx);
        }
    }

    /// One timer tick: advance time, run the scheduler.
    pub fn tick(&mut self) {
        arch::advance_ticks(1);
        self.k.scheduler(&mut self.ctx);
    }

    pub fn ticks(&mut self, n: u32) {
        for _ in 0..n {
            self.tick();
        }
    }

    pub fn now(&self) -> u32 {
        arch::tick_count()
    }

    /// Handle of the running task; `None` while the idle task runs.
    pub fn current(&self) -> Option<Handle> {
        self.k.task_handle()
    }

    /// Asserts which task the upcoming kernel calls act for.
    pub fn expect_current(&self, h: Handle) {
        assert_eq!(self.current(), Some(h), "unexpected running task");
    }

    pub fn expect_idle(&self) {
        assert_eq!(self.current(), None, "expected the idle task to run");
    }

    /// Parks the running task out of the way.
    pub fn suspend_current(&mut self) {
        let h = self.current().expect("no current task to suspend");
        self.k.suspend_task(h).expect("suspend");
        self.settle();
    }

    /// Ticks until `h` is the running task, failing after `limit` ticks.
    /// Returns how many ticks it took.
    pub fn ticks_until_running(&mut self, h: Handle, limit: u32) -> u32 {
        for i in 0..=limit {
            if self.current() == Some(h) {
                return i;
            }
            self.tick();
        }
        panic!(
            "task did not run within {limit} ticks (t = {})",
            self.now()
        );
    }
}

/// Entry point for tasks the harness drives by hand; never actually
/// executed on the hosted port.
pub fn noop_task(_arg: usize) -> u16 {
    0
}
