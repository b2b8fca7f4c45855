// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The wait manager: waiting on one or many signals, with timeout.
//!
//! A wait first tries to acquire each signal in argument order; the first
//! success returns immediately. Otherwise the task is linked into every
//! signal's wait tree, a timeout notification is registered, the priority
//! path is walked (which is also where deadlocks surface), and the task
//! parks. The kernel itself never blocks: the caller gets
//! [`WaitStatus::Parked`] back and the real outcome is collected with
//! [`Kernel::take_wait_result`] once the scheduler has resumed the task.
//!
//! Cancellation -- timeout, deadlock backout, termination by another task --
//! funnels through `make_not_waiting`, which unpicks every structure the
//! wait touched.

use abi::{BlockingFlags, Error, Handle, Ticks, WaitStatus, INFINITE, NO_WAIT};

use crate::arch;
use crate::config;
use crate::kernel::Kernel;
use crate::profiling;
use crate::signal::WaitStore;
use crate::task::TaskIdx;
use crate::timenotify::TnRef;

/// Names one wait-association cell: a task plus a slot in its wait array.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WaitRef {
    pub task: TaskIdx,
    pub slot: u8,
}

impl Kernel {
    /// Waits for a single object to become signaled.
    pub fn wait_for_object(
        &mut self,
        handle: Handle,
        timeout: Ticks,
    ) -> WaitStatus {
        if self.current.is_none() || self.in_isr {
            return WaitStatus::Failed(self.fail_status(Error::AllowedOnlyForTasks));
        }
        let obj = match self.object_by_handle(handle, None) {
            Ok(o) => o,
            Err(e) => return WaitStatus::Failed(e),
        };
        let cur = match self.current {
            Some(c) => c,
            None => return WaitStatus::Failed(Error::AllowedOnlyForTasks),
        };
        self.tasks[cur.0].waiting_for[0].signal = Some(obj);
        self.tasks[cur.0].waiting_count = 1;
        self.make_waiting(timeout)
    }

    /// Waits for any of several objects; the index of the winning handle is
    /// carried in the status.
    pub fn wait_for_objects(
        &mut self,
        handles: &[Handle],
        timeout: Ticks,
    ) -> WaitStatus {
        if handles.is_empty() || handles.len() > config::MAX_WAIT_FOR_OBJECTS {
            return WaitStatus::Failed(self.fail_status(Error::InvalidParameter));
        }
        if self.current.is_none() || self.in_isr {
            return WaitStatus::Failed(self.fail_status(Error::AllowedOnlyForTasks));
        }

        let mut objs = [None; config::MAX_WAIT_FOR_OBJECTS];
        for (i, &h) in handles.iter().enumerate() {
            let obj = match self.object_by_handle(h, None) {
                Ok(o) => o,
                Err(e) => return WaitStatus::Failed(e),
            };
            // The same signal cannot be waited on twice by one task: the
            // second association would collide in the wait tree.
            if objs[..i].contains(&Some(obj)) {
                return WaitStatus::Failed(
                    self.fail_status(Error::InvalidParameter),
                );
            }
            objs[i] = Some(obj);
        }

        let cur = match self.current {
            Some(c) => c,
            None => return WaitStatus::Failed(Error::AllowedOnlyForTasks),
        };
        for (i, o) in objs.iter().enumerate().take(handles.len()) {
            self.tasks[cur.0].waiting_for[i].signal = *o;
        }
        self.tasks[cur.0].waiting_count = handles.len();
        self.make_waiting(timeout)
    }

    /// Core of the wait path; expects the current task's wait array to be
    /// populated.
    pub(crate) fn make_waiting(&mut self, timeout: Ticks) -> WaitStatus {
        let Some(cur) = self.current else {
            return WaitStatus::Failed(Error::AllowedOnlyForTasks);
        };

        let lock = arch::lock();
        self.tasks[cur.0].wait_exit = None;

        // Immediate acquisition, first-listed signal wins.
        for i in 0..self.tasks[cur.0].waiting_count {
            let Some(obj) = self.tasks[cur.0].waiting_for[i].signal else {
                continue;
            };
            if self.acquire(obj, true) {
                self.tasks[cur.0].waiting_index = i;
                drop(lock);
                return match self.tasks[cur.0].wait_exit.take() {
                    Some(Error::WaitAbandoned) => {
                        self.set_last_error(Error::WaitAbandoned);
                        WaitStatus::AcquiredAbandoned(i)
                    }
                    _ => WaitStatus::Acquired(i),
                };
            }
        }

        // Nothing available and the caller will not wait.
        if timeout == NO_WAIT {
            drop(lock);
            return WaitStatus::Failed(self.fail_status(Error::WaitTimeout));
        }

        self.tasks[cur.0].blocking |= BlockingFlags::WAITING;

        // Park behind every requested signal.
        for i in 0..self.tasks[cur.0].waiting_count {
            let Some(obj) = self.tasks[cur.0].waiting_for[i].signal else {
                continue;
            };
            let w = WaitRef {
                task: cur,
                slot: i as u8,
            };
            let mut tree = self.objects[obj.0].signal.waiting;
            let _ = tree.insert(
                &mut WaitStore {
                    tasks: &mut self.tasks,
                },
                w,
            );
            self.objects[obj.0].signal.waiting = tree;
            self.signal_updated(obj);
        }

        if timeout != INFINITE {
            let now = arch::tick_count();
            // Deadlines saturate at the far end of time rather than wrap.
            let deadline = if INFINITE - now <= timeout {
                INFINITE
            } else {
                now + timeout
            };
            self.register_time_notify(TnRef::Task(cur), deadline);
        }

        // Extend the inheritance chains of every section now waited on; a
        // cycle means this wait can never be satisfied.
        if !self.priority_path(crate::csec::PathRef::Task(cur)) {
            self.make_not_waiting(cur);
            drop(lock);
            return WaitStatus::Failed(self.fail_status(Error::WaitDeadlock));
        }

        profiling::event_wait_enter(usize::from(cur.0));
        self.make_not_ready(cur);
        drop(lock);
        WaitStatus::Parked
    }

    /// Collects the outcome of a wait after the scheduler resumed the
    /// calling task.
    pub fn take_wait_result(&mut self) -> WaitStatus {
        let Some(cur) = self.current else {
            return WaitStatus::Failed(Error::AllowedOnlyForTasks);
        };
        let index = self.tasks[cur.0].waiting_index;
        match self.tasks[cur.0].wait_exit.take() {
            None => WaitStatus::Acquired(index),
            Some(Error::WaitAbandoned) => {
                self.set_last_error(Error::WaitAbandoned);
                WaitStatus::AcquiredAbandoned(index)
            }
            Some(e) => WaitStatus::Failed(self.fail_status(e)),
        }
    }

    /// Takes `task` out of the waiting state: unlinks it from every wait
    /// tree, refreshes each signal's deferred position, replays the
    /// priority path of each critical section it was waiting behind (to
    /// shed boosts the wait had caused), and drops its pending timeout.
    pub(crate) fn make_not_waiting(&mut self, task: TaskIdx) {
        self.tasks[task.0].blocking -= BlockingFlags::WAITING;

        for i in 0..self.tasks[task.0].waiting_count {
            let Some(obj) = self.tasks[task.0].waiting_for[i].signal else {
                continue;
            };
            let w = WaitRef {
                task,
                slot: i as u8,
            };
            let mut tree = self.objects[obj.0].signal.waiting;
            tree.remove(
                &mut WaitStore {
                    tasks: &mut self.tasks,
                },
                w,
            );
            self.objects[obj.0].signal.waiting = tree;
            self.signal_updated(obj);

            if self.objects[obj.0].has_cs() {
                self.priority_path(crate::csec::PathRef::Cs(obj));
            }
        }

        if self.tasks[task.0].wait_timeout.registered {
            self.unregister_time_notify(TnRef::Task(task));
        }

        profiling::event_wait_exit(usize::from(task.0));
    }

    /// Suspends the calling task for `time` ticks. `NO_WAIT` yields the
    /// rest of the quantum without sleeping.
    pub fn sleep(&mut self, time: Ticks) -> Result<(), Error> {
        let Some(cur) = self.current else {
            return self.fail(Error::AllowedOnlyForTasks);
        };
        if self.in_isr {
            return self.fail(Error::AllowedOnlyForTasks);
        }

        if time == NO_WAIT {
            if config::USE_TIME_QUANTA {
                self.tasks[cur.0].quantum_counter = 0;
            }
            self.yield_now();
            return Ok(());
        }

        let now = arch::tick_count();
        let deadline = if INFINITE - now <= time {
            INFINITE
        } else {
            now + time
        };

        let _lock = arch::lock();
        self.tasks[cur.0].blocking |= BlockingFlags::SLEEP;
        self.register_time_notify(TnRef::Task(cur), deadline);
        self.make_not_ready(cur);
        Ok(())
    }
}
