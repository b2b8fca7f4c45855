// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The signal: the single waitable state every synchronization object is
//! built from.
//!
//! A signal is a non-negative counter (zero = not signaled) plus a tree of
//! wait associations ordered by waiter importance. Signals that are
//! signaled *and* have waiters sit in the kernel's deferred-signalization
//! tree, keyed by their most important waiter; the scheduler consults that
//! tree's front on every pass to decide whether releasing a waiter beats
//! running the ready-queue candidate.

use core::cmp::Ordering;

use abi::{Error, SignalFlags};
use kerncore::avl::{AvlLink, AvlStore, AvlTree};
use kerncore::pool::Pool;

use crate::config;
use crate::kernel::Kernel;
use crate::obj::{KObject, ObjIdx};
use crate::task::{task_cmp, Task, TaskIdx};
use crate::wait::WaitRef;

/// The universal waitable.
pub struct Signal {
    pub flags: SignalFlags,
    /// Non-negative signalization state; zero means not signaled.
    pub signaled: u32,
    /// Tasks waiting for this signal, most important first.
    pub waiting: AvlTree<WaitRef>,
}

impl Signal {
    /// Fresh signals start signaled, which is what plain object descriptors
    /// want; object constructors override as needed.
    pub(crate) fn new() -> Self {
        Self {
            flags: SignalFlags::empty(),
            signaled: 1,
            waiting: AvlTree::new(),
        }
    }
}

/// Store for the per-signal wait trees: nodes are wait-association cells
/// inside tasks, ordered by the owning task's importance.
pub(crate) struct WaitStore<'a> {
    pub tasks: &'a mut Pool<Task, { config::NUM_TASKS }>,
}

impl AvlStore for WaitStore<'_> {
    type Node = WaitRef;

    fn link(&self, n: WaitRef) -> &AvlLink<WaitRef> {
        &self.tasks[n.task.0].waiting_for[usize::from(n.slot)].link
    }

    fn link_mut(&mut self, n: WaitRef) -> &mut AvlLink<WaitRef> {
        &mut self.tasks[n.task.0].waiting_for[usize::from(n.slot)].link
    }

    fn order(&self, a: WaitRef, b: WaitRef) -> Ordering {
        task_cmp(self.tasks, a.task, b.task)
    }
}

/// Store for the deferred-signalization tree: nodes are object descriptors,
/// ordered by each signal's most important waiter. Only signals with
/// waiters are ever linked, so the front lookup cannot miss.
pub(crate) struct DeferredStore<'a> {
    pub tasks: &'a Pool<Task, { config::NUM_TASKS }>,
    pub objects: &'a mut Pool<KObject, { config::NUM_OBJECTS }>,
}

impl AvlStore for DeferredStore<'_> {
    type Node = ObjIdx;

    fn link(&self, n: ObjIdx) -> &AvlLink<ObjIdx> {
        &self.objects[n.0].deferred_link
    }

    fn link_mut(&mut self, n: ObjIdx) -> &mut AvlLink<ObjIdx> {
        &mut self.objects[n.0].deferred_link
    }

    fn order(&self, a: ObjIdx, b: ObjIdx) -> Ordering {
        let wa = self.objects[a.0].signal.waiting.first().unwrap();
        let wb = self.objects[b.0].signal.waiting.first().unwrap();
        task_cmp(self.tasks, wa.task, wb.task)
    }
}

impl Kernel {
    /// Re-derives the signal's membership in the deferred-signalization
    /// tree after its state or waiter set changed. Returns the most
    /// important waiter, if any.
    ///
    /// Invariant maintained: a signal is in the tree exactly when it is
    /// signaled and has waiters.
    pub(crate) fn signal_updated(&mut self, obj: ObjIdx) -> Option<TaskIdx> {
        if self.objects[obj.0]
            .signal
            .flags
            .contains(SignalFlags::DEFERRED)
        {
            let mut tree = self.deferred;
            tree.remove(
                &mut DeferredStore {
                    tasks: &self.tasks,
                    objects: &mut self.objects,
                },
                obj,
            );
            self.deferred = tree;
            self.objects[obj.0].signal.flags -= SignalFlags::DEFERRED;
        }

        let front = self.objects[obj.0].signal.waiting.first();
        if self.objects[obj.0].signal.signaled > 0 {
            if front.is_some() {
                let mut tree = self.deferred;
                let linked = tree
                    .insert(
                        &mut DeferredStore {
                            tasks: &self.tasks,
                            objects: &mut self.objects,
                        },
                        obj,
                    )
                    .is_ok();
                self.deferred = tree;
                if linked {
                    self.objects[obj.0].signal.flags |= SignalFlags::DEFERRED;
                }
            }
        }

        front.map(|w| w.task)
    }

    /// Tries to acquire the signal on behalf of the current task.
    ///
    /// With `on_check` set (the wait entry path), a decrement-on-release
    /// signal refuses the acquisition when some waiter is at least as
    /// important as the caller -- acquisitions queue behind existing waiters
    /// instead of overtaking them. The scheduler's deferred-release path
    /// passes `on_check = false` because the front waiter *is* the task
    /// being released.
    pub(crate) fn acquire(&mut self, obj: ObjIdx, on_check: bool) -> bool {
        let Some(cur) = self.current else { return false };

        if self.objects[obj.0].signal.signaled == 0 {
            // A mutex is always signaled from its owner's point of view:
            // recursive entry, counted so that releases unwind levels.
            if self.objects[obj.0]
                .signal
                .flags
                .contains(SignalFlags::MUTUAL_EXCLUSION)
            {
                let owner = self.objects[obj.0]
                    .cs()
                    .owners
                    .get(0)
                    .map(|a| a.task);
                if owner == Some(cur) {
                    self.record_cs_ownership(obj, cur);
                    return true;
                }
            }
            return false;
        }

        if self.objects[obj.0]
            .signal
            .flags
            .contains(SignalFlags::DEC_ON_RELEASE)
        {
            if on_check {
                if let Some(front) = self.objects[obj.0].signal.waiting.first()
                {
                    if self.tasks[front.task.0].priority.0
                        <= self.tasks[cur.0].priority.0
                    {
                        return false;
                    }
                }
            }
            self.objects[obj.0].signal.signaled -= 1;
            self.signal_updated(obj);
        }

        if self.objects[obj.0]
            .signal
            .flags
            .contains(SignalFlags::CRITICAL_SECTION)
        {
            self.record_cs_ownership(obj, cur);

            if self.objects[obj.0]
                .signal
                .flags
                .contains(SignalFlags::ABANDONED)
            {
                self.objects[obj.0].signal.flags -= SignalFlags::ABANDONED;
                self.tasks[cur.0].wait_exit = Some(Error::WaitAbandoned);
            }
        }

        true
    }

    /// Sets the signal state outright. A change of the boolean state
    /// repositions the signal in the deferred tree and, when the released
    /// front waiter outranks the current task, asks for a reschedule.
    pub(crate) fn update_signal_state(&mut self, obj: ObjIdx, signaled: u32) {
        let _lock = crate::arch::lock();

        let was = self.objects[obj.0].signal.signaled > 0;
        let now = signaled > 0;
        self.objects[obj.0].signal.signaled = signaled;

        if was != now {
            let front = self.signal_updated(obj);
            if now {
                if let (Some(front), Some(cur)) = (front, self.current) {
                    if self.tasks[front.0]
                        .priority
                        .is_more_important_than(self.tasks[cur.0].priority)
                    {
                        self.yield_now();
                    }
                }
            }
        }
    }
}
