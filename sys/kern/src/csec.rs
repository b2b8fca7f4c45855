// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Critical sections and priority inheritance.
//!
//! A critical section generalizes mutex and semaphore: owning `n` units of
//! a section with capacity `max_signaled` leaves the fronting signal at
//! `max_signaled - n`. Ownership is tracked per (task, section) in
//! association cells allocated from a pool embedded in the section; each
//! association is simultaneously queued in its owner's owned-section
//! priority queue (keyed by the most important priority waiting on that
//! section) and indexed by object for lookups.
//!
//! The priority-path walk propagates waiter importance along the
//! ownership/waiting graph: starting from a task that began (or stopped)
//! waiting, it alternates between "sections this task waits on" and "tasks
//! owning those sections", raising each owner to the importance of the most
//! important waiter behind it and re-sorting every structure that orders by
//! priority. Meeting the starting task again means the graph has a cycle:
//! deadlock, reported to the wait path, which backs the wait out and
//! replays the walk to undo partial boosts.

use core::cmp::Ordering;

use abi::{BlockingFlags, Error, Priority, SignalFlags};
use kerncore::avl::{AvlLink, AvlStore};
use kerncore::pool::Pool;
use kerncore::pqueue::{PqLink, PqStore, RingLink};

use crate::arch;
use crate::config;
use crate::kernel::Kernel;
use crate::obj::{KObject, ObjIdx};
use crate::signal::WaitStore;
use crate::task::{Task, TaskIdx};

/// Names one owner-association cell: a section object plus a cell index in
/// its embedded pool.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CsaRef {
    pub obj: ObjIdx,
    pub cell: u16,
}

/// One step of the priority-path worklist: a task or a critical section.
/// The links threading the worklist are embedded in both, so the walk
/// allocates nothing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PathRef {
    Task(TaskIdx),
    Cs(ObjIdx),
}

/// Critical-section payload of a mutex or semaphore object.
pub struct CritSect {
    /// Capacity: 1 for a mutex, n for a counting section.
    pub max_signaled: u32,
    /// Worklist link for the priority-path walk.
    pub path_next: Option<PathRef>,
    /// Embedded pool of owner-association cells.
    pub owners: Pool<CsAssoc, { config::CS_OWNER_SLOTS }>,
}

impl CritSect {
    pub(crate) fn new(max_signaled: u32) -> Self {
        Self {
            max_signaled,
            path_next: None,
            owners: Pool::new(),
        }
    }
}

/// Owner association: one per (task, section) pair, with a recursion count.
pub struct CsAssoc {
    pub task: TaskIdx,
    pub count: u32,
    /// Link in the owner's owned-section priority queue.
    pub item: PqLink<CsaRef>,
    /// Link in the owner's owned-section object index.
    pub index_link: AvlLink<CsaRef>,
}

/// Store for per-task owned-section priority queues. Associations are keyed
/// by the most important priority waiting on their section (idle priority
/// when nobody waits), so a task's queue front names the section that
/// determines its inherited priority.
pub(crate) struct OwnedCsPqStore<'a> {
    pub tasks: &'a Pool<Task, { config::NUM_TASKS }>,
    pub objects: &'a mut Pool<KObject, { config::NUM_OBJECTS }>,
}

impl OwnedCsPqStore<'_> {
    fn waiting_priority(&self, n: CsaRef) -> u8 {
        self.objects[n.obj.0]
            .signal
            .waiting
            .first()
            .map(|w| self.tasks[w.task.0].priority.0)
            .unwrap_or(Priority::IDLE.0)
    }
}

impl AvlStore for OwnedCsPqStore<'_> {
    type Node = CsaRef;

    fn link(&self, n: CsaRef) -> &AvlLink<CsaRef> {
        &self.objects[n.obj.0].cs().owners[n.cell].item.avl
    }

    fn link_mut(&mut self, n: CsaRef) -> &mut AvlLink<CsaRef> {
        &mut self.objects[n.obj.0].cs_mut().owners[n.cell].item.avl
    }

    fn order(&self, a: CsaRef, b: CsaRef) -> Ordering {
        self.waiting_priority(a).cmp(&self.waiting_priority(b))
    }
}

impl PqStore for OwnedCsPqStore<'_> {
    fn ring(&self, n: CsaRef) -> &RingLink<CsaRef> {
        &self.objects[n.obj.0].cs().owners[n.cell].item.ring
    }

    fn ring_mut(&mut self, n: CsaRef) -> &mut RingLink<CsaRef> {
        &mut self.objects[n.obj.0].cs_mut().owners[n.cell].item.ring
    }
}

/// Store for per-task owned-section indexes, keyed by object.
pub(crate) struct OwnedCsIndexStore<'a> {
    pub objects: &'a mut Pool<KObject, { config::NUM_OBJECTS }>,
}

impl AvlStore for OwnedCsIndexStore<'_> {
    type Node = CsaRef;

    fn link(&self, n: CsaRef) -> &AvlLink<CsaRef> {
        &self.objects[n.obj.0].cs().owners[n.cell].index_link
    }

    fn link_mut(&mut self, n: CsaRef) -> &mut AvlLink<CsaRef> {
        &mut self.objects[n.obj.0].cs_mut().owners[n.cell].index_link
    }

    fn order(&self, a: CsaRef, b: CsaRef) -> Ordering {
        a.obj.0.cmp(&b.obj.0)
    }
}

impl Kernel {
    /// Turns an object's signal into a critical section. `initial < max`
    /// means the creator starts out owning the difference.
    pub(crate) fn register_cs(
        &mut self,
        obj: ObjIdx,
        initial: u32,
        max: u32,
        mutual_exclusion: bool,
    ) {
        let mut flags =
            SignalFlags::DEC_ON_RELEASE | SignalFlags::CRITICAL_SECTION;
        if mutual_exclusion {
            flags |= SignalFlags::MUTUAL_EXCLUSION;
        }
        self.objects[obj.0].signal.flags = flags;
        self.objects[obj.0].signal.signaled = initial;

        if initial != max {
            let Some(cur) = self.current else { return };
            let _lock = arch::lock();
            let r = self.record_cs_ownership(obj, cur);
            self.objects[obj.0].cs_mut().owners[r.cell].count = max - initial;
        }
    }

    /// Finds the association between `task` and the section behind `obj`.
    pub(crate) fn find_cs_assoc(
        &self,
        obj: ObjIdx,
        task: TaskIdx,
    ) -> Option<u16> {
        // Walk the task's owned-section index without a store: read-only
        // descent over the embedded links.
        let mut node = self.tasks[task.0].owned_cs_index.root();
        while let Some(n) = node {
            match obj.0.cmp(&n.obj.0) {
                Ordering::Equal => return Some(n.cell),
                Ordering::Less => {
                    node =
                        self.objects[n.obj.0].cs().owners[n.cell].index_link.left
                }
                Ordering::Greater => {
                    node = self.objects[n.obj.0].cs().owners[n.cell]
                        .index_link
                        .right
                }
            }
        }
        None
    }

    /// Records one more unit of ownership for (obj, task), creating and
    /// linking the association on first acquisition. Cell allocation cannot
    /// fail: the pool holds one cell per possible task.
    pub(crate) fn record_cs_ownership(
        &mut self,
        obj: ObjIdx,
        task: TaskIdx,
    ) -> CsaRef {
        if let Some(cell) = self.find_cs_assoc(obj, task) {
            self.objects[obj.0].cs_mut().owners[cell].count += 1;
            return CsaRef { obj, cell };
        }

        let cell = self.objects[obj.0]
            .cs_mut()
            .owners
            .insert(CsAssoc {
                task,
                count: 1,
                item: PqLink::new(CsaRef { obj, cell: 0 }),
                index_link: AvlLink::detached(),
            })
            .unwrap();
        let r = CsaRef { obj, cell };
        self.objects[obj.0].cs_mut().owners[cell].item = PqLink::new(r);

        let mut pq = self.tasks[task.0].owned_cs;
        pq.insert(
            &mut OwnedCsPqStore {
                tasks: &self.tasks,
                objects: &mut self.objects,
            },
            r,
        );
        self.tasks[task.0].owned_cs = pq;

        let mut index = self.tasks[task.0].owned_cs_index;
        // A fresh association cannot collide: `find_cs_assoc` just missed.
        let _ = index.insert(
            &mut OwnedCsIndexStore {
                objects: &mut self.objects,
            },
            r,
        );
        self.tasks[task.0].owned_cs_index = index;
        r
    }

    /// Releases `release_count` units of the section held by `task`,
    /// returning the signal state before the release. Dropping the last
    /// unit dissolves the association and re-derives the owner's effective
    /// priority from whatever it still holds.
    pub(crate) fn release_cs(
        &mut self,
        obj: ObjIdx,
        task: TaskIdx,
        release_count: u32,
    ) -> Result<u32, Error> {
        if self.current.is_none() || self.in_isr {
            return self.fail(Error::AllowedOnlyForTasks);
        }

        let _lock = arch::lock();

        let cell = self
            .find_cs_assoc(obj, task)
            .filter(|&c| {
                release_count > 0
                    && release_count <= self.objects[obj.0].cs().owners[c].count
            });
        let Some(cell) = cell else {
            return self.fail(Error::ObjectCannotBeReleased);
        };

        self.objects[obj.0].cs_mut().owners[cell].count -= release_count;
        let fully_released = self.objects[obj.0].cs().owners[cell].count == 0;

        if fully_released {
            let r = CsaRef { obj, cell };

            let mut pq = self.tasks[task.0].owned_cs;
            pq.remove(
                &mut OwnedCsPqStore {
                    tasks: &self.tasks,
                    objects: &mut self.objects,
                },
                r,
            );
            self.tasks[task.0].owned_cs = pq;

            let mut index = self.tasks[task.0].owned_cs_index;
            index.remove(
                &mut OwnedCsIndexStore {
                    objects: &mut self.objects,
                },
                r,
            );
            self.tasks[task.0].owned_cs_index = index;

            self.objects[obj.0].cs_mut().owners.remove(cell);

            // The released section no longer boosts this task; its
            // effective priority comes from what it still owns. The task is
            // not waiting on anything, so no path walk is needed.
            let assigned = self.tasks[task.0].assigned_priority;
            self.change_task_priority(task, assigned);
        }

        let previous = self.objects[obj.0].signal.signaled;
        if self.objects[obj.0]
            .signal
            .flags
            .contains(SignalFlags::MUTUAL_EXCLUSION)
        {
            // Recursion levels of a mutex don't move the signal; only the
            // outermost release frees it.
            if fully_released {
                self.update_signal_state(obj, 1);
            }
        } else {
            self.update_signal_state(obj, previous + release_count);
        }
        Ok(previous)
    }

    fn path_next(&self, r: PathRef) -> Option<PathRef> {
        match r {
            PathRef::Task(t) => self.tasks[t.0].path_next,
            PathRef::Cs(o) => self.objects[o.0].cs().path_next,
        }
    }

    fn set_path_next(&mut self, r: PathRef, next: Option<PathRef>) {
        match r {
            PathRef::Task(t) => self.tasks[t.0].path_next = next,
            PathRef::Cs(o) => self.objects[o.0].cs_mut().path_next = next,
        }
    }

    /// Priority-path walk from `start`. Returns `false` when the walk runs
    /// into the starting task again -- the ownership/waiting graph has a
    /// cycle and whatever wait triggered the walk would deadlock.
    ///
    /// Termination: effective priorities only rise during the walk, each
    /// rise re-links the affected structures at most once, and the graph is
    /// finite.
    pub(crate) fn priority_path(&mut self, start: PathRef) -> bool {
        let origin = match start {
            PathRef::Task(t) => Some(t),
            PathRef::Cs(_) => None,
        };
        self.set_path_next(start, None);
        let mut last = start;
        let mut cursor = Some(start);

        while let Some(item) = cursor {
            match item {
                PathRef::Task(t) => {
                    // Queue every section this task is waiting behind.
                    if self.tasks[t.0].blocking.contains(BlockingFlags::WAITING)
                    {
                        for i in 0..self.tasks[t.0].waiting_count {
                            let Some(sig_obj) =
                                self.tasks[t.0].waiting_for[i].signal
                            else {
                                continue;
                            };
                            if !self.objects[sig_obj.0].has_cs() {
                                continue;
                            }
                            let step = PathRef::Cs(sig_obj);
                            self.set_path_next(step, None);
                            self.set_path_next(last, Some(step));
                            last = step;
                        }
                    }
                }
                PathRef::Cs(cs_obj) => {
                    // Boost every owner of this section and queue each for
                    // its own waiting-edges pass.
                    let owners: [Option<(u16, TaskIdx)>;
                        config::CS_OWNER_SLOTS] = {
                        let mut buf = [None; config::CS_OWNER_SLOTS];
                        for (i, (cell, a)) in
                            self.objects[cs_obj.0].cs().owners.iter().enumerate()
                        {
                            buf[i] = Some((cell, a.task));
                        }
                        buf
                    };
                    for entry in owners.into_iter().flatten() {
                        let (cell, owner) = entry;

                        // The walk has come back around to the task that
                        // started it: cycle.
                        if origin == Some(owner) {
                            return false;
                        }

                        // Re-derive the owner's effective priority from its
                        // assigned one; `change_task_priority` folds in the
                        // most important waiter behind any owned section.
                        let assigned = self.tasks[owner.0].assigned_priority;
                        self.change_task_priority(owner, assigned);

                        let step = PathRef::Task(owner);
                        self.set_path_next(step, None);
                        self.set_path_next(last, Some(step));
                        last = step;

                        // The waiter set of this section changed, so the
                        // association's position in the owner's queue is
                        // stale: re-sort it.
                        let r = CsaRef {
                            obj: cs_obj,
                            cell,
                        };
                        let mut pq = self.tasks[owner.0].owned_cs;
                        pq.remove(
                            &mut OwnedCsPqStore {
                                tasks: &self.tasks,
                                objects: &mut self.objects,
                            },
                            r,
                        );
                        pq.insert(
                            &mut OwnedCsPqStore {
                                tasks: &self.tasks,
                                objects: &mut self.objects,
                            },
                            r,
                        );
                        self.tasks[owner.0].owned_cs = pq;
                    }

                    // Waiters of this section may have been re-prioritized;
                    // refresh its position in the deferred tree.
                    self.signal_updated(cs_obj);
                }
            }
            cursor = self.path_next(item);
        }

        true
    }

    /// Changes a task's effective priority, clamped by inheritance: the
    /// task can never be less important than the most important task
    /// waiting on any section it owns. Re-sorts the task in every structure
    /// ordered by priority. Returns whether anything changed.
    pub(crate) fn change_task_priority(
        &mut self,
        task: TaskIdx,
        priority: Priority,
    ) -> bool {
        let mut priority = priority;

        // Inherited floor: front of the owned-section queue is the section
        // with the most important waiter.
        if let Some(front) = self.tasks[task.0].owned_cs.front() {
            if let Some(w) = self.objects[front.obj.0].signal.waiting.first() {
                let wp = self.tasks[w.task.0].priority;
                if priority.0 > wp.0 {
                    priority = wp;
                }
            }
        }

        if self.tasks[task.0].priority == priority {
            return false;
        }
        let is_higher =
            priority.is_more_important_than(self.tasks[task.0].priority);
        self.tasks[task.0].priority = priority;

        // Ready queue: re-insert under the new priority. A promotion puts
        // the task at the front of its new group so it is considered
        // immediately; a demotion queues it at the back.
        if self.tasks[task.0].queued {
            let mut q = self.ready;
            let mut store = crate::sched::ReadyStore {
                tasks: &mut self.tasks,
            };
            q.remove(&mut store, task);
            let rep = q.insert(&mut store, task);
            if is_higher && rep != task {
                q.rotate(&mut store, Some(rep), false);
            }
            self.ready = q;
        }

        // Pending timeout: the registration is keyed by priority, so move
        // it.
        if self.tasks[task.0].wait_timeout.registered {
            let time = self.tasks[task.0].wait_timeout.time;
            let n = crate::timenotify::TnRef::Task(task);
            self.unregister_time_notify(n);
            self.register_time_notify(n, time);
        }

        // Wait trees: every signal this task waits on orders waiters by
        // priority.
        if self.tasks[task.0].blocking.contains(BlockingFlags::WAITING) {
            for i in 0..self.tasks[task.0].waiting_count {
                let Some(sig_obj) = self.tasks[task.0].waiting_for[i].signal
                else {
                    continue;
                };
                let w = crate::wait::WaitRef {
                    task,
                    slot: i as u8,
                };
                let mut tree = self.objects[sig_obj.0].signal.waiting;
                let mut store = WaitStore {
                    tasks: &mut self.tasks,
                };
                tree.remove(&mut store, w);
                let _ = tree.insert(&mut store, w);
                self.objects[sig_obj.0].signal.waiting = tree;
                self.signal_updated(sig_obj);
            }
        }

        true
    }

    /// Runs the scheduler if any source -- ready queue, due time
    /// notification, deferred signalization -- names a task more important
    /// than the current one.
    pub(crate) fn reschedule_if_higher_priority(&mut self) {
        let Some(cur) = self.current else { return };
        let cur_priority = self.tasks[cur.0].priority;

        let mut preempt = false;

        if let Some(front) = self.ready.front() {
            if cur_priority.0 > self.tasks[front.0].priority.0 {
                preempt = true;
            }
        }

        if !preempt {
            if let Some(tn) =
                self.get_time_notify(cur_priority, self.last_quantum_time)
            {
                match tn {
                    crate::timenotify::TnRef::Task(t) => {
                        if cur_priority.0 > self.tasks[t.0].priority.0 {
                            preempt = true;
                        }
                    }
                    crate::timenotify::TnRef::Object(o) => {
                        if let Some(w) =
                            self.objects[o.0].signal.waiting.first()
                        {
                            if cur_priority.0 > self.tasks[w.task.0].priority.0
                            {
                                preempt = true;
                            }
                        }
                    }
                }
            }
        }

        if !preempt {
            if let Some(sig) = self.deferred.first() {
                if let Some(w) = self.objects[sig.0].signal.waiting.first() {
                    if cur_priority.0 > self.tasks[w.task.0].priority.0 {
                        preempt = true;
                    }
                }
            }
        }

        if preempt {
            self.yield_now();
        }
    }
}
