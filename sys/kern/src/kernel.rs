// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The kernel state: one struct owning every arena and queue.
//!
//! The original-style globals -- current task, ISR flag, ready queue,
//! deferred-signal tree, time-notification structures -- are fields here,
//! and every public entry point is a method. A port owns exactly one
//! `Kernel`, installs [`Kernel::scheduler`] as its preemption handler, and
//! forwards syscalls to the methods.

use core::ptr::NonNull;

use abi::{Error, Ticks};
use kerncore::avl::AvlTree;
use kerncore::handles::HandleTable;
use kerncore::heap::{Heap, HeapInfo};
use kerncore::pool::Pool;
use kerncore::pqueue::PQueue;

use crate::arch;
use crate::config;
use crate::err::heap_error;
use crate::obj::{ChildLink, KObject, ObjIdx};
use crate::profiling;
use crate::task::{Task, TaskIdx, UsageStats};
use crate::timenotify::TnRef;

pub struct Kernel {
    pub(crate) tasks: Pool<Task, { config::NUM_TASKS }>,
    pub(crate) objects: Pool<KObject, { config::NUM_OBJECTS }>,
    pub(crate) handles: HandleTable<ObjIdx, { config::NUM_HANDLES }>,
    pub(crate) children: Pool<ChildLink, { config::NUM_CHILD_LINKS }>,

    /// Ready-to-run tasks, round-robin within each priority.
    pub(crate) ready: PQueue<TaskIdx>,
    /// Signals that are signaled and have waiters, keyed by their most
    /// important waiter.
    pub(crate) deferred: AvlTree<ObjIdx>,

    /// Time-notification engine state (see `timenotify`).
    pub(crate) time_queue: PQueue<TnRef>,
    pub(crate) notify_slot: [Option<TnRef>; config::PRIORITY_COUNT],
    pub(crate) notify_min: [Ticks; 2 * config::PRIORITY_COUNT],

    /// Running task; `None` exactly when the kernel is stopped.
    pub(crate) current: Option<TaskIdx>,
    pub(crate) idle: Option<TaskIdx>,

    pub(crate) in_isr: bool,
    pub(crate) yield_after_isr: bool,
    /// Latched by `yield_now`; the port honours it by invoking the
    /// scheduler once the current kernel call returns (on hardware, the
    /// pended context-switch interrupt firing at unmask).
    pub(crate) yield_pending: bool,

    pub(crate) start_requested: bool,
    pub(crate) stop_requested: bool,
    pub(crate) caller_context: arch::TaskContext,

    /// Global quantum stamp for FIFO tie-breaking.
    pub(crate) last_quantum_time: Ticks,
    pub(crate) last_quantum_index: u32,

    /// Last error recorded while no task is current or an ISR section is
    /// open; otherwise errors go to the task.
    pub(crate) last_error: Option<Error>,

    pub(crate) stats: UsageStats,

    /// General-purpose kernel heap, fed by `mem_init`/`mem_expand`.
    pub(crate) mem: Heap,
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    pub fn new() -> Self {
        Self {
            tasks: Pool::new(),
            objects: Pool::new(),
            handles: HandleTable::new(),
            children: Pool::new(),
            ready: PQueue::new(),
            deferred: AvlTree::new(),
            time_queue: PQueue::new(),
            notify_slot: [None; config::PRIORITY_COUNT],
            notify_min: [abi::INFINITE; 2 * config::PRIORITY_COUNT],
            current: None,
            idle: None,
            in_isr: false,
            yield_after_isr: false,
            yield_pending: false,
            start_requested: false,
            stop_requested: false,
            caller_context: arch::TaskContext::default(),
            last_quantum_time: 0,
            last_quantum_index: 0,
            last_error: None,
            stats: UsageStats::new(arch::tick_count()),
            mem: Heap::new(),
        }
    }

    /// Index of the running task, if the kernel is running.
    pub fn current_task(&self) -> Option<TaskIdx> {
        self.current
    }

    /// Records a failure. Task-local when a task is running, global when
    /// the kernel is stopped or inside an ISR section.
    pub(crate) fn set_last_error(&mut self, e: Error) {
        match self.current {
            Some(cur) if !self.in_isr => {
                self.tasks[cur.0].last_error = Some(e)
            }
            _ => self.last_error = Some(e),
        }
    }

    /// Most recent failure visible to the caller.
    pub fn last_error(&self) -> Option<Error> {
        match self.current {
            Some(cur) if !self.in_isr => self.tasks[cur.0].last_error,
            _ => self.last_error,
        }
    }

    /// Records `e` and fails with it.
    pub(crate) fn fail<T>(&mut self, e: Error) -> Result<T, Error> {
        self.set_last_error(e);
        Err(e)
    }

    /// Records `e` and returns it, for the non-`Result` paths.
    pub(crate) fn fail_status(&mut self, e: Error) -> Error {
        self.set_last_error(e);
        e
    }

    /// Requests a reschedule. Inside an ISR section the request is merely
    /// latched; the outermost `leave_isr` honours it.
    pub(crate) fn yield_now(&mut self) {
        if self.in_isr {
            self.yield_after_isr = true;
        } else {
            self.yield_pending = true;
        }
    }

    /// Whether a reschedule has been requested and not yet served. The
    /// port polls this after each kernel call (the hosted harness calls
    /// the scheduler directly; hardware ports yield).
    pub fn yield_requested(&self) -> bool {
        self.yield_pending
    }

    /// Opens an ISR section: scheduler hand-offs are delayed until the
    /// matching [`Kernel::leave_isr`]. Sections nest; the return value
    /// feeds the matching close.
    pub fn enter_isr(&mut self) -> bool {
        let _lock = arch::lock();
        let was = self.in_isr;
        if !was {
            self.yield_after_isr = false;
            self.in_isr = true;
            profiling::event_isr_enter();
        }
        was
    }

    /// Closes an ISR section. On the outermost close, a delayed reschedule
    /// request is converted into a pending yield.
    pub fn leave_isr(&mut self, was: bool) {
        if was {
            return;
        }
        let _lock = arch::lock();
        self.in_isr = false;
        profiling::event_isr_exit();
        if self.yield_after_isr {
            self.yield_after_isr = false;
            self.yield_pending = true;
        }
    }

    /// Gives the kernel heap its memory.
    ///
    /// # Safety
    ///
    /// See [`Heap::init`]: the region must be valid, exclusive, aligned,
    /// and live as long as the kernel.
    pub unsafe fn mem_init(
        &mut self,
        base: NonNull<u8>,
        size: usize,
    ) -> Result<(), Error> {
        let _lock = arch::lock();
        match unsafe { self.mem.init(base, size) } {
            Ok(()) => Ok(()),
            Err(e) => self.fail(heap_error(e)),
        }
    }

    /// Appends another heap region at a fixed address.
    ///
    /// # Safety
    ///
    /// See [`Heap::init`].
    pub unsafe fn mem_expand(
        &mut self,
        base: NonNull<u8>,
        size: usize,
    ) -> Result<(), Error> {
        let _lock = arch::lock();
        match unsafe { self.mem.expand(base, size) } {
            Ok(()) => Ok(()),
            Err(e) => self.fail(heap_error(e)),
        }
    }

    /// Allocates from the kernel heap.
    pub fn mem_alloc(&mut self, size: usize) -> Result<NonNull<u8>, Error> {
        let _lock = arch::lock();
        match self.mem.alloc(size) {
            Ok(p) => Ok(p),
            Err(e) => self.fail(heap_error(e)),
        }
    }

    /// Returns a block to the kernel heap.
    pub fn mem_free(&mut self, ptr: NonNull<u8>) -> Result<(), Error> {
        let _lock = arch::lock();
        match self.mem.free(ptr) {
            Ok(()) => Ok(()),
            Err(e) => self.fail(heap_error(e)),
        }
    }

    /// Total and free bytes across all heap regions.
    pub fn mem_info(&self) -> HeapInfo {
        self.mem.info()
    }
}
