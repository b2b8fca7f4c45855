// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Time-notification engine.
//!
//! Every pending deadline -- a sleeping task, a wait timeout, a software
//! timer -- is a registration here. The scheduler needs one query answered
//! fast on every pass: "is there a registration with priority at least as
//! important as p whose deadline has passed?". Three structures cooperate:
//!
//! - a priority queue of all registrations keyed by (priority, deadline);
//! - `notify_slot[p]`, the earliest registration per priority;
//! - `notify_min`, a flat binary min-tree of size 2·`PRIORITY_COUNT` whose
//!   leaf `PRIORITY_COUNT + p` holds the earliest deadline at priority `p`
//!   and whose inner nodes hold subtree minima.
//!
//! Registration is a decrease-key bubble up the min-tree; unregistration
//! rebuilds one leaf by searching the queue's tree for the surviving
//! minimum at that priority; the query walks the min-tree left-first,
//! pruning on deadline and on the priority range a subtree spans.

use core::cmp::Ordering;

use abi::{Priority, Ticks, INFINITE};
use kerncore::avl::{AvlLink, AvlStore};
use kerncore::pool::Pool;
use kerncore::pqueue::{PqLink, PqStore, RingLink};

use crate::config::{self, PRIORITY_COUNT};
use crate::kernel::Kernel;
use crate::obj::{KObject, ObjIdx, ObjectKind};
use crate::task::{Task, TaskIdx};

/// Names one time-notification cell: either a task's built-in
/// sleep/timeout slot or a timer object's.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TnRef {
    Task(TaskIdx),
    Object(ObjIdx),
}

/// A registered (or registerable) deadline.
#[derive(Copy, Clone, Debug)]
pub struct TimeNotify {
    pub registered: bool,
    pub time: Ticks,
    /// Priority recorded at registration; the sort key does not float.
    pub priority: u8,
    pub link: PqLink<TnRef>,
}

impl TimeNotify {
    pub(crate) fn new(this: TnRef) -> Self {
        Self {
            registered: false,
            time: 0,
            priority: 0,
            link: PqLink::new(this),
        }
    }
}

/// Store for the registration queue.
pub(crate) struct TimeStore<'a> {
    pub tasks: &'a mut Pool<Task, { config::NUM_TASKS }>,
    pub objects: &'a mut Pool<KObject, { config::NUM_OBJECTS }>,
}

impl TimeStore<'_> {
    fn tn(&self, n: TnRef) -> &TimeNotify {
        match n {
            TnRef::Task(t) => &self.tasks[t.0].wait_timeout,
            TnRef::Object(o) => match &self.objects[o.0].kind {
                ObjectKind::Timer(ts) => &ts.notify,
                _ => panic!("object {} has no time notification", o.0),
            },
        }
    }

    fn tn_mut(&mut self, n: TnRef) -> &mut TimeNotify {
        match n {
            TnRef::Task(t) => &mut self.tasks[t.0].wait_timeout,
            TnRef::Object(o) => match &mut self.objects[o.0].kind {
                ObjectKind::Timer(ts) => &mut ts.notify,
                _ => panic!("object {} has no time notification", o.0),
            },
        }
    }
}

impl AvlStore for TimeStore<'_> {
    type Node = TnRef;

    fn link(&self, n: TnRef) -> &AvlLink<TnRef> {
        &self.tn(n).link.avl
    }

    fn link_mut(&mut self, n: TnRef) -> &mut AvlLink<TnRef> {
        &mut self.tn_mut(n).link.avl
    }

    fn order(&self, a: TnRef, b: TnRef) -> Ordering {
        let ta = self.tn(a);
        let tb = self.tn(b);
        (ta.priority, ta.time).cmp(&(tb.priority, tb.time))
    }
}

impl PqStore for TimeStore<'_> {
    fn ring(&self, n: TnRef) -> &RingLink<TnRef> {
        &self.tn(n).link.ring
    }

    fn ring_mut(&mut self, n: TnRef) -> &mut RingLink<TnRef> {
        &mut self.tn_mut(n).link.ring
    }
}

impl Kernel {
    pub(crate) fn tn(&self, n: TnRef) -> &TimeNotify {
        match n {
            TnRef::Task(t) => &self.tasks[t.0].wait_timeout,
            TnRef::Object(o) => match &self.objects[o.0].kind {
                ObjectKind::Timer(ts) => &ts.notify,
                _ => panic!("object {} has no time notification", o.0),
            },
        }
    }

    fn tn_mut(&mut self, n: TnRef) -> &mut TimeNotify {
        match n {
            TnRef::Task(t) => &mut self.tasks[t.0].wait_timeout,
            TnRef::Object(o) => match &mut self.objects[o.0].kind {
                ObjectKind::Timer(ts) => &mut ts.notify,
                _ => panic!("object {} has no time notification", o.0),
            },
        }
    }

    /// Writes a new per-priority minimum and bubbles it up the min-tree
    /// until an ancestor already holds the right value.
    fn update_notify_slot(&mut self, tn: Option<TnRef>, priority: usize) {
        self.notify_slot[priority] = tn;

        let mut time = match tn {
            Some(n) => self.tn(n).time,
            None => INFINITE,
        };
        let mut i = PRIORITY_COUNT + priority;
        self.notify_min[i] = time;
        loop {
            let sibling = self.notify_min[i ^ 1];
            if time > sibling {
                time = sibling;
            }
            i >>= 1;
            if self.notify_min[i] == time {
                break;
            }
            self.notify_min[i] = time;
            if i <= 1 {
                break;
            }
        }
    }

    /// Registers `n` to fire at `time`. Re-registering an already
    /// registered cell moves it. Must run under the scheduler lock.
    pub(crate) fn register_time_notify(&mut self, n: TnRef, time: Ticks) {
        if self.tn(n).registered {
            self.unregister_time_notify(n);
        }

        // The registration priority: a task's own, or for a signal target
        // the most important task waiting on it.
        let priority = match n {
            TnRef::Task(t) => self.tasks[t.0].priority.0,
            TnRef::Object(o) => self.objects[o.0]
                .signal
                .waiting
                .first()
                .map(|w| self.tasks[w.task.0].priority.0)
                .unwrap_or(config::LOWEST_USED_PRIORITY),
        };
        let priority = priority.min(config::LOWEST_USED_PRIORITY);

        {
            let t = self.tn_mut(n);
            t.registered = true;
            t.time = time;
            t.priority = priority;
        }

        let mut queue = self.time_queue;
        queue.insert(
            &mut TimeStore {
                tasks: &mut self.tasks,
                objects: &mut self.objects,
            },
            n,
        );
        self.time_queue = queue;

        let p = usize::from(priority);
        if time < self.notify_min[PRIORITY_COUNT + p] {
            self.update_notify_slot(Some(n), p);
        }
    }

    /// Removes a registration and recomputes the per-priority minimum it
    /// may have been backing. Must run under the scheduler lock.
    pub(crate) fn unregister_time_notify(&mut self, n: TnRef) {
        if !self.tn(n).registered {
            return;
        }
        let priority = self.tn(n).priority;

        let mut queue = self.time_queue;
        queue.remove(
            &mut TimeStore {
                tasks: &mut self.tasks,
                objects: &mut self.objects,
            },
            n,
        );
        self.time_queue = queue;
        self.tn_mut(n).registered = false;

        // Surviving minimum at this priority: walk the queue's tree keyed
        // by (priority, time); the leftmost node matching the priority has
        // the smallest deadline.
        let mut found: Option<TnRef> = None;
        let mut node = self.time_queue.root();
        while let Some(c) = node {
            let t = self.tn(c);
            if t.priority == priority {
                found = Some(c);
            }
            node = if priority <= t.priority {
                t.link.avl.left
            } else {
                t.link.avl.right
            };
        }

        self.update_notify_slot(found, usize::from(priority));
    }

    /// Answers the scheduler's query: the registration with deadline <=
    /// `time` at priority numerically <= `priority`, if one exists; among
    /// candidates, the one at the most important priority with the smallest
    /// deadline.
    pub(crate) fn get_time_notify(
        &self,
        priority: Priority,
        time: Ticks,
    ) -> Option<TnRef> {
        let p = usize::from(priority.0);
        let mut offset = 0usize;
        let mut base = 1usize;

        let mut span = 1usize;
        while span < PRIORITY_COUNT {
            if self.notify_min[base + offset] > time {
                return None;
            }
            base += span;
            offset <<= 1;
            if self.notify_min[base + offset] > time {
                offset += 1;
            }
            // Prune once the chosen block starts below the priority limit.
            if offset > p / ((PRIORITY_COUNT >> 1) / span) {
                return None;
            }
            span <<= 1;
        }

        self.notify_slot[offset]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Kernel;
    use abi::BlockingFlags;

    /// Registers directly against task slots, bypassing the scheduler, to
    /// pin the engine's own contract.
    fn kernel_with_tasks(prios: &[u8]) -> (Kernel, Vec<TnRef>) {
        let mut k = Kernel::new();
        let mut refs = Vec::new();
        for &p in prios {
            let t = k
                .spawn_task(
                    |_| 0,
                    0,
                    0x200,
                    Priority(p),
                    BlockingFlags::empty(),
                )
                .unwrap();
            refs.push(TnRef::Task(t));
        }
        (k, refs)
    }

    #[test]
    fn query_honours_deadline_and_priority_bounds() {
        let (mut k, r) = kernel_with_tasks(&[3, 7]);
        k.register_time_notify(r[0], 100); // priority 3
        k.register_time_notify(r[1], 50); // priority 7

        // Nothing is due yet.
        assert_eq!(k.get_time_notify(Priority(31), 49), None);
        // The priority-7 deadline is due, but invisible to a query capped
        // at more important priorities.
        assert_eq!(k.get_time_notify(Priority(5), 60), None);
        assert_eq!(k.get_time_notify(Priority(7), 60), Some(r[1]));
        // Once both are due, the more important priority wins.
        assert_eq!(k.get_time_notify(Priority(31), 150), Some(r[0]));
    }

    #[test]
    fn unregister_recomputes_the_per_priority_minimum() {
        let (mut k, r) = kernel_with_tasks(&[4, 4, 4]);
        k.register_time_notify(r[0], 30);
        k.register_time_notify(r[1], 10);
        k.register_time_notify(r[2], 20);

        assert_eq!(k.get_time_notify(Priority(4), 100), Some(r[1]));
        k.unregister_time_notify(r[1]);
        assert_eq!(k.get_time_notify(Priority(4), 100), Some(r[2]));
        k.unregister_time_notify(r[2]);
        assert_eq!(k.get_time_notify(Priority(4), 100), Some(r[0]));
        k.unregister_time_notify(r[0]);
        assert_eq!(k.get_time_notify(Priority(4), 100), None);
    }

    #[test]
    fn reregistration_moves_a_deadline() {
        let (mut k, r) = kernel_with_tasks(&[2]);
        k.register_time_notify(r[0], 500);
        k.register_time_notify(r[0], 40);
        assert_eq!(k.get_time_notify(Priority(2), 45), Some(r[0]));
        k.unregister_time_notify(r[0]);
        assert_eq!(k.get_time_notify(Priority(2), u32::MAX - 1), None);
    }

    #[test]
    fn matches_a_brute_force_model() {
        // Pseudo-random register/unregister churn, checked against a naive
        // scan after every step (property 10).
        let prios = [0u8, 1, 2, 5, 9, 17, 23, 31];
        let (mut k, refs) = kernel_with_tasks(&prios);
        let mut model: Vec<Option<Ticks>> = vec![None; refs.len()];

        let mut x: u32 = 0x2F6E_2B1;
        for step in 0..500 {
            x = x.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let i = (x as usize >> 8) % refs.len();
            if step % 3 == 2 && model[i].is_some() {
                k.unregister_time_notify(refs[i]);
                model[i] = None;
            } else {
                let t = x % 10_000;
                k.register_time_notify(refs[i], t);
                model[i] = Some(t);
            }

            for &(qp, qt) in
                &[(0u8, 100u32), (9, 5_000), (31, 9_999), (17, 0), (31, 20_000)]
            {
                let expect = model
                    .iter()
                    .enumerate()
                    .filter(|(j, t)| {
                        prios[*j] <= qp && t.map_or(false, |t| t <= qt)
                    })
                    .min_by_key(|(j, t)| (prios[*j], t.unwrap()))
                    .map(|(j, _)| refs[j]);
                assert_eq!(
                    k.get_time_notify(Priority(qp), qt),
                    expect,
                    "query ({qp}, {qt}) diverged at step {step}"
                );
            }
        }
    }
}
