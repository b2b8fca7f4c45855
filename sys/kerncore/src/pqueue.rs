// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! FIFO-within-priority queue built on the AVL tree.
//!
//! Distinct priorities are AVL nodes; items sharing a priority form a
//! doubly-linked circular ring, of which exactly one member (the
//! "representative") is physically linked in the tree. Removing the
//! representative hands its tree cell to the ring successor via
//! [`AvlTree::exchange`], so all ring operations are O(1) and only
//! transitions between distinct priorities pay O(log n).

use crate::avl::{AvlLink, AvlStore, AvlTree};

/// Ring half of a queue item. `prev`/`next` are meaningless while the item
/// is not queued.
#[derive(Copy, Clone, Debug)]
pub struct RingLink<N> {
    pub prev: N,
    pub next: N,
    /// Whether this item's AVL cell is the one linked in the tree.
    pub in_tree: bool,
}

impl<N: Copy> RingLink<N> {
    /// A ring of one: the item points at itself.
    pub fn solitary(item: N) -> Self {
        Self {
            prev: item,
            next: item,
            in_tree: true,
        }
    }
}

/// Combined link cell for priority-queue membership: the AVL half plus the
/// ring half. Embed one per queue an item can be in.
#[derive(Copy, Clone, Debug)]
pub struct PqLink<N> {
    pub avl: AvlLink<N>,
    pub ring: RingLink<N>,
}

impl<N: Copy> PqLink<N> {
    pub fn new(item: N) -> Self {
        Self {
            avl: AvlLink::detached(),
            ring: RingLink::solitary(item),
        }
    }
}

/// Store for a priority queue: the AVL store plus access to the ring half of
/// each item's link cell.
pub trait PqStore: AvlStore {
    fn ring(&self, node: Self::Node) -> &RingLink<Self::Node>;
    fn ring_mut(&mut self, node: Self::Node) -> &mut RingLink<Self::Node>;
}

/// Queue control structure; copyable for the same reason [`AvlTree`] is.
#[derive(Copy, Clone, Debug)]
pub struct PQueue<N> {
    tree: AvlTree<N>,
}

impl<N: Copy + PartialEq> Default for PQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: Copy + PartialEq> PQueue<N> {
    pub const fn new() -> Self {
        Self {
            tree: AvlTree::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Highest-priority item, O(1).
    pub fn front(&self) -> Option<N> {
        self.tree.first()
    }

    /// Tree root, for callers running specialized descents over the distinct
    /// priorities (the time-notification engine does this on unregister).
    pub fn root(&self) -> Option<N> {
        self.tree.root()
    }

    /// Enqueues `item`. A new priority becomes a solitary ring; an existing
    /// one gets `item` spliced in at the ring tail (FIFO). Returns the
    /// representative of the item's priority group -- `item` itself when the
    /// priority is new.
    pub fn insert<S: PqStore<Node = N>>(&mut self, s: &mut S, item: N) -> N {
        match self.tree.insert(s, item) {
            Ok(()) => {
                s.ring_mut(item).prev = item;
                s.ring_mut(item).next = item;
                s.ring_mut(item).in_tree = true;
                item
            }
            Err(existing) => {
                let tail = s.ring(existing).prev;
                *s.ring_mut(item) = RingLink {
                    prev: tail,
                    next: existing,
                    in_tree: false,
                };
                s.ring_mut(tail).next = item;
                s.ring_mut(existing).prev = item;
                existing
            }
        }
    }

    /// Removes `item` from the queue. If it was the tree representative of a
    /// non-trivial ring, the ring successor inherits the tree cell.
    pub fn remove<S: PqStore<Node = N>>(&mut self, s: &mut S, item: N) {
        let RingLink {
            prev,
            next,
            in_tree,
        } = *s.ring(item);
        s.ring_mut(prev).next = next;
        s.ring_mut(next).prev = prev;

        if in_tree {
            if next == item {
                self.tree.remove(s, item);
            } else {
                self.tree.exchange(s, item, next);
                s.ring_mut(next).in_tree = true;
                s.ring_mut(item).in_tree = false;
            }
        }
    }

    /// Rotates one priority group by swapping its representative with a ring
    /// neighbour. `item` must be a representative; `None` selects the
    /// highest-priority group. Forward rotation sends the group head to the
    /// tail; backward rotation brings the tail to the head. A group of one
    /// is left alone.
    pub fn rotate<S: PqStore<Node = N>>(
        &mut self,
        s: &mut S,
        item: Option<N>,
        forward: bool,
    ) {
        let Some(item) = item.or_else(|| self.tree.first()) else {
            return;
        };
        let neighbour = if forward {
            s.ring(item).next
        } else {
            s.ring(item).prev
        };
        if neighbour == item {
            return;
        }
        self.tree.exchange(s, item, neighbour);
        s.ring_mut(item).in_tree = false;
        s.ring_mut(neighbour).in_tree = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cmp::Ordering;

    struct Arena {
        links: Vec<PqLink<usize>>,
        prio: Vec<u8>,
    }

    impl Arena {
        fn new() -> Self {
            Self {
                links: Vec::new(),
                prio: Vec::new(),
            }
        }

        fn add(&mut self, prio: u8) -> usize {
            let n = self.links.len();
            self.links.push(PqLink::new(n));
            self.prio.push(prio);
            n
        }
    }

    impl AvlStore for Arena {
        type Node = usize;

        fn link(&self, node: usize) -> &AvlLink<usize> {
            &self.links[node].avl
        }

        fn link_mut(&mut self, node: usize) -> &mut AvlLink<usize> {
            &mut self.links[node].avl
        }

        fn order(&self, a: usize, b: usize) -> Ordering {
            self.prio[a].cmp(&self.prio[b])
        }
    }

    impl PqStore for Arena {
        fn ring(&self, node: usize) -> &RingLink<usize> {
            &self.links[node].ring
        }

        fn ring_mut(&mut self, node: usize) -> &mut RingLink<usize> {
            &mut self.links[node].ring
        }
    }

    /// Drains the queue, returning items front-first, walking each ring from
    /// its representative.
    fn drain(s: &mut Arena, q: &mut PQueue<usize>) -> Vec<usize> {
        let mut out = Vec::new();
        while let Some(front) = q.front() {
            out.push(front);
            q.remove(s, front);
        }
        out
    }

    #[test]
    fn fifo_within_priority() {
        let mut s = Arena::new();
        let mut q = PQueue::new();
        let a = s.add(5);
        let b = s.add(5);
        let c = s.add(5);
        let hi = s.add(1);
        for n in [a, b, c, hi] {
            q.insert(&mut s, n);
        }
        assert_eq!(drain(&mut s, &mut q), vec![hi, a, b, c]);
    }

    #[test]
    fn insert_reports_representative() {
        let mut s = Arena::new();
        let mut q = PQueue::new();
        let a = s.add(3);
        let b = s.add(3);
        assert_eq!(q.insert(&mut s, a), a);
        assert_eq!(q.insert(&mut s, b), a);
    }

    #[test]
    fn removing_representative_promotes_successor() {
        let mut s = Arena::new();
        let mut q = PQueue::new();
        let a = s.add(4);
        let b = s.add(4);
        let c = s.add(4);
        for n in [a, b, c] {
            q.insert(&mut s, n);
        }
        q.remove(&mut s, a);
        assert_eq!(q.front(), Some(b));
        // b now owns the tree cell; removing it must promote c.
        q.remove(&mut s, b);
        assert_eq!(q.front(), Some(c));
    }

    #[test]
    fn removing_ring_member_keeps_representative() {
        let mut s = Arena::new();
        let mut q = PQueue::new();
        let a = s.add(4);
        let b = s.add(4);
        q.insert(&mut s, a);
        q.insert(&mut s, b);
        q.remove(&mut s, b);
        assert_eq!(q.front(), Some(a));
        q.remove(&mut s, a);
        assert!(q.is_empty());
    }

    #[test]
    fn rotate_forward_cycles_the_group() {
        let mut s = Arena::new();
        let mut q = PQueue::new();
        let a = s.add(2);
        let b = s.add(2);
        let c = s.add(2);
        for n in [a, b, c] {
            q.insert(&mut s, n);
        }
        q.rotate(&mut s, None, true);
        assert_eq!(q.front(), Some(b));
        q.rotate(&mut s, None, true);
        assert_eq!(q.front(), Some(c));
        q.rotate(&mut s, None, true);
        assert_eq!(q.front(), Some(a));
    }

    #[test]
    fn rotate_backward_brings_tail_to_front() {
        let mut s = Arena::new();
        let mut q = PQueue::new();
        let a = s.add(2);
        let b = s.add(2);
        let c = s.add(2);
        for n in [a, b, c] {
            q.insert(&mut s, n);
        }
        q.rotate(&mut s, None, false);
        assert_eq!(q.front(), Some(c));
    }

    #[test]
    fn rotate_single_member_group_is_a_no_op() {
        let mut s = Arena::new();
        let mut q = PQueue::new();
        let a = s.add(2);
        q.insert(&mut s, a);
        q.rotate(&mut s, None, true);
        assert_eq!(q.front(), Some(a));
    }

    #[test]
    fn mixed_priorities_drain_in_order() {
        let mut s = Arena::new();
        let mut q = PQueue::new();
        let mut nodes = Vec::new();
        for prio in [9u8, 1, 5, 1, 9, 5, 5, 1] {
            let n = s.add(prio);
            nodes.push(n);
            q.insert(&mut s, n);
        }
        let order = drain(&mut s, &mut q);
        let prios: Vec<u8> = order.iter().map(|&n| s.prio[n]).collect();
        assert_eq!(prios, vec![1, 1, 1, 5, 5, 5, 9, 9]);
        // FIFO inside each priority: arrival index must increase.
        for w in order.windows(2) {
            if s.prio[w[0]] == s.prio[w[1]] {
                assert!(w[0] < w[1]);
            }
        }
    }
}
