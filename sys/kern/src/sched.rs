// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The scheduler.
//!
//! Entered from the HAL at every preemption point -- the periodic tick and
//! every voluntary yield -- with the preempted task's saved context. One
//! pass consults three ordered sources: the ready queue (round-robin within
//! a priority, driven by time quanta), the earliest due time notification
//! at or above the candidate's priority, and the front of the
//! deferred-signalization tree. The winner's state transition is applied
//! here -- timeout delivery, deferred acquisition, wait cancellation -- and
//! the winner's context goes back to the HAL.
//!
//! Equal-priority ordering: among ready tasks the least recently scheduled
//! runs next, and a freshly unblocked task is queued at the *front* of its
//! priority group before the quantum stamp advances, so it wins over
//! already-ready peers.

use core::cmp::Ordering;

use abi::{BlockingFlags, Error};
use kerncore::avl::{AvlLink, AvlStore};
use kerncore::pool::Pool;
use kerncore::pqueue::{PqStore, RingLink};

use crate::arch;
use crate::config;
use crate::kernel::Kernel;
use crate::profiling;
use crate::task::{task_cmp, Task, TaskIdx};
use crate::timenotify::TnRef;

/// Why the scheduler picked its candidate.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Reason {
    Ready,
    TimeNotification,
    Deferred,
}

/// Store for the ready queue. Ordering is by priority alone; FIFO inside a
/// priority comes from the queue's ring.
pub(crate) struct ReadyStore<'a> {
    pub tasks: &'a mut Pool<Task, { config::NUM_TASKS }>,
}

impl AvlStore for ReadyStore<'_> {
    type Node = TaskIdx;

    fn link(&self, n: TaskIdx) -> &AvlLink<TaskIdx> {
        &self.tasks[n.0].ready_link.avl
    }

    fn link_mut(&mut self, n: TaskIdx) -> &mut AvlLink<TaskIdx> {
        &mut self.tasks[n.0].ready_link.avl
    }

    fn order(&self, a: TaskIdx, b: TaskIdx) -> Ordering {
        self.tasks[a.0].priority.0.cmp(&self.tasks[b.0].priority.0)
    }
}

impl PqStore for ReadyStore<'_> {
    fn ring(&self, n: TaskIdx) -> &RingLink<TaskIdx> {
        &self.tasks[n.0].ready_link.ring
    }

    fn ring_mut(&mut self, n: TaskIdx) -> &mut RingLink<TaskIdx> {
        &mut self.tasks[n.0].ready_link.ring
    }
}

impl Kernel {
    /// Queues a task as ready to run, unless it is blocked or already
    /// queued. If it outranks the current task, a reschedule is requested.
    pub(crate) fn make_ready(&mut self, task: TaskIdx) {
        if self.tasks[task.0].queued
            || !self.tasks[task.0].blocking.is_empty()
        {
            return;
        }
        self.tasks[task.0].queued = true;
        let mut q = self.ready;
        q.insert(
            &mut ReadyStore {
                tasks: &mut self.tasks,
            },
            task,
        );
        self.ready = q;

        if config::USE_TIME_QUANTA {
            self.tasks[task.0].quantum_counter =
                self.tasks[task.0].max_quantum;
        }

        if let Some(cur) = self.current {
            if self.tasks[cur.0].priority.0 > self.tasks[task.0].priority.0 {
                self.yield_now();
            }
        }
    }

    /// Removes a task from the ready queue. Removing the current task
    /// requests a reschedule, which is how blocking operations park.
    pub(crate) fn make_not_ready(&mut self, task: TaskIdx) {
        if !self.tasks[task.0].queued {
            return;
        }
        let mut q = self.ready;
        q.remove(
            &mut ReadyStore {
                tasks: &mut self.tasks,
            },
            task,
        );
        self.ready = q;
        self.tasks[task.0].queued = false;

        if self.current == Some(task) {
            self.yield_now();
        }
    }

    /// Replaces the running candidate when `task` is at least as urgent --
    /// ties go to the newcomer, whose quantum stamp is necessarily older.
    fn sched_cmp(&mut self, reason: &mut Reason, new_reason: Reason, task: TaskIdx) {
        let Some(cand) = self.current else { return };
        if task_cmp(&self.tasks, cand, task) != Ordering::Less {
            *reason = new_reason;
            self.current = Some(task);
        }
    }

    /// One scheduling pass. `ctx` carries the preempted context in and the
    /// chosen task's context out; the HAL performs the actual restore.
    pub fn scheduler(&mut self, ctx: &mut arch::TaskContext) {
        // Inside an ISR section the hand-off is delayed to the closing
        // bracket.
        if self.in_isr {
            self.yield_after_isr = true;
            return;
        }
        profiling::event_scheduler_enter();
        self.yield_pending = false;

        if self.current.is_none() {
            if self.start_requested {
                // First entry after start: remember how to get back to the
                // caller of start().
                self.caller_context = *ctx;
            } else {
                return;
            }
        }

        // Save the preempted task's context.
        if let Some(cur) = self.current {
            self.tasks[cur.0].context = *ctx;
        }

        if self.stop_requested {
            *ctx = self.caller_context;
            self.current = None;
            return;
        }

        let now = arch::tick_count();

        // Candidate from the ready queue; an exhausted quantum rotates the
        // front priority group first.
        let Some(mut front) = self.ready.front() else {
            return;
        };
        if config::USE_TIME_QUANTA
            && self.tasks[front.0].quantum_counter == 0
        {
            self.tasks[front.0].quantum_counter =
                self.tasks[front.0].max_quantum;
            let mut q = self.ready;
            q.rotate(
                &mut ReadyStore {
                    tasks: &mut self.tasks,
                },
                None,
                true,
            );
            self.ready = q;
            front = match self.ready.front() {
                Some(f) => f,
                None => return,
            };
        }
        self.current = Some(front);
        let mut reason = Reason::Ready;

        // A due time notification can outrank the candidate. A task target
        // competes for the CPU; a signal target fires here and the release
        // is arbitrated through the deferred tree below.
        let cand_priority = self.tasks[front.0].priority;
        if let Some(tn) = self.get_time_notify(cand_priority, now) {
            match tn {
                TnRef::Task(t) => {
                    self.sched_cmp(&mut reason, Reason::TimeNotification, t)
                }
                TnRef::Object(o) => {
                    self.objects[o.0].signal.signaled = 1;
                    self.signal_updated(o);
                    let fired_at = self.tn(tn).time;
                    self.unregister_time_notify(tn);
                    self.timer_fired(o, fired_at);
                }
            }
        }

        // Deferred signalization: the most important waiter of the most
        // urgent signaled signal.
        let deferred_front = self.deferred.first();
        if let Some(sig) = deferred_front {
            if let Some(w) = self.objects[sig.0].signal.waiting.first() {
                self.sched_cmp(&mut reason, Reason::Deferred, w.task);
            }
        }

        // Apply the transition that made the winner eligible.
        let cand = match self.current {
            Some(c) => c,
            None => return,
        };
        match reason {
            Reason::Ready => {}
            Reason::TimeNotification => {
                self.unregister_time_notify(TnRef::Task(cand));
                self.tasks[cand.0].wait_exit = Some(Error::WaitTimeout);
                self.tasks[cand.0].blocking -= BlockingFlags::SLEEP;
            }
            Reason::Deferred => {
                if let Some(sig) = deferred_front {
                    self.acquire(sig, false);
                    // Record which of a multi-wait's signals fired.
                    for i in 0..self.tasks[cand.0].waiting_count {
                        if self.tasks[cand.0].waiting_for[i].signal
                            == Some(sig)
                        {
                            self.tasks[cand.0].waiting_index = i;
                            break;
                        }
                    }
                }
            }
        }

        let mut cand = cand;
        if reason != Reason::Ready {
            if self.tasks[cand.0].blocking.contains(BlockingFlags::WAITING) {
                self.make_not_waiting(cand);
            }

            if self.tasks[cand.0].blocking.is_empty() {
                // Queue the woken task at the front of its priority group
                // so subsequent ticks keep it running for its quantum.
                let mut q = self.ready;
                let mut store = ReadyStore {
                    tasks: &mut self.tasks,
                };
                let rep = q.insert(&mut store, cand);
                if rep != cand {
                    q.rotate(&mut store, Some(rep), false);
                }
                self.ready = q;
                self.tasks[cand.0].queued = true;

                self.tasks[cand.0].quantum_counter =
                    self.tasks[cand.0].max_quantum;
            } else {
                // The wake-up transition was applied, but the task is also
                // blocked some other way (suspended, terminating): it stays
                // parked and the ready-queue candidate runs after all.
                cand = front;
                self.current = Some(front);
            }
        }

        // Round-robin bookkeeping.
        if config::USE_TIME_QUANTA {
            self.tasks[cand.0].quantum_counter -= 1;
        } else {
            let mut q = self.ready;
            q.rotate(
                &mut ReadyStore {
                    tasks: &mut self.tasks,
                },
                None,
                true,
            );
            self.ready = q;
        }

        // Advance the global quantum stamp and brand the winner with it.
        if self.last_quantum_time != now {
            self.last_quantum_time = now;
            self.last_quantum_index = 0;
        }
        self.tasks[cand.0].last_quantum_time = now;
        self.tasks[cand.0].last_quantum_index = self.last_quantum_index;
        self.last_quantum_index += 1;

        // CPU usage sampling.
        if now >= self.stats.calc_time.saturating_add(config::STAT_SAMPLE_RATE)
        {
            self.stats.usage_time = self.stats.calc_time;
            self.stats.usage = self.stats.calc;
            self.stats.calc_time = now;
            self.stats.calc = 1;
        } else {
            self.stats.calc += 1;
        }
        let global_calc_time = self.stats.calc_time;
        let t = &mut self.tasks[cand.0];
        if t.stats.calc_time != global_calc_time {
            t.stats.usage_time = t.stats.calc_time;
            t.stats.usage = t.stats.calc;
            t.stats.calc_time = global_calc_time;
            t.stats.calc = 1;
        } else {
            t.stats.calc += 1;
        }

        // Hand the winner's context back to the HAL.
        *ctx = self.tasks[cand.0].context;
        profiling::event_scheduler_exit(usize::from(cand.0));
    }

    /// System-wide CPU usage over the last closed sampling window: samples
    /// spent outside the idle task, and total samples.
    pub fn system_stat(&self) -> (u32, u32) {
        let Some(idle) = self.idle else {
            return (0, 0);
        };
        let it = &self.tasks[idle.0].stats;
        let cpu = if it.usage_time == self.stats.usage_time {
            self.stats.usage - it.usage
        } else if it.calc_time == self.stats.usage_time {
            self.stats.usage - it.calc
        } else {
            self.stats.usage
        };
        (cpu, self.stats.usage)
    }
}
