// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hosted port: runs the kernel as an ordinary library on a development
//! machine.
//!
//! Contexts are opaque tokens (nothing executes through them; a harness
//! drives the kernel state machine directly), the tick counter is a plain
//! atomic the harness advances, and the scheduler lock is a no-op token --
//! there are no interrupts to mask. This is the port the test suite runs
//! against.

use core::sync::atomic::{AtomicU32, Ordering};

use abi::{Error, Ticks};

/// Smallest stack the port will accept, so undersized-stack handling is
/// exercised even where no stack is ever materialized.
pub const MIN_STACK_SIZE: usize = 0x40;

/// Saved CPU state of a task. On this port it is a bare token identifying
/// the context; the harness, standing in for the CPU, observes which token
/// the scheduler hands back.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TaskContext {
    token: u32,
}

impl TaskContext {
    pub fn token(&self) -> u32 {
        self.token
    }
}

static NEXT_CONTEXT: AtomicU32 = AtomicU32::new(1);

/// Builds a fresh context such that a later restore would enter the task's
/// entry point. Here that means minting a token.
pub fn create_task_context(stack_size: usize) -> Result<TaskContext, Error> {
    if stack_size < MIN_STACK_SIZE {
        return Err(Error::TooSmallStackSize);
    }
    Ok(TaskContext {
        token: NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed),
    })
}

pub fn release_task_context(_ctx: &mut TaskContext) -> Result<(), Error> {
    Ok(())
}

/// Scoped scheduler lock. On hardware this masks interrupts until dropped;
/// here it is a token whose only job is making the locking discipline
/// visible in the code.
#[must_use]
pub struct SchedLock(());

pub fn lock() -> SchedLock {
    SchedLock(())
}

impl Drop for SchedLock {
    fn drop(&mut self) {}
}

static TICKS: AtomicU32 = AtomicU32::new(0);

/// Monotonic kernel tick counter.
pub fn tick_count() -> Ticks {
    TICKS.load(Ordering::Relaxed)
}

/// Test-harness control of time.
pub fn set_tick_count(t: Ticks) {
    TICKS.store(t, Ordering::Relaxed);
}

/// Advances time by `n` ticks and returns the new count.
pub fn advance_ticks(n: Ticks) -> Ticks {
    TICKS.fetch_add(n, Ordering::Relaxed) + n
}

/// Idle hook. Nothing useful to power down on a host.
pub fn save_power() {}

#[doc(hidden)]
pub fn klog_impl(args: core::fmt::Arguments<'_>) {
    eprintln!("kern: {args}");
}
