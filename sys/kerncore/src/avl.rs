// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Intrusive AVL tree over externally-owned link cells.
//!
//! The tree itself is only a pair of cached node handles (`root` and `min`);
//! the per-node bookkeeping (`AvlLink`) is embedded by composition in
//! whatever structure is being collected. An [`AvlStore`] resolves a node
//! handle to its link cell and orders two nodes, which is what lets one tree
//! collect wait associations living inside tasks while another collects
//! signals living inside object descriptors, without either knowing the
//! concrete layout.
//!
//! Keys are not stored in the tree. Callers must guarantee that a node's
//! position-determining state does not change while the node is linked in; a
//! key change is expressed as remove + reinsert.
//!
//! `exchange` replaces the physical node cell of a linked node with a
//! detached cell, preserving balance, parent/child links, and the min cache.
//! The priority queue depends on it to promote a ring member in O(1).

use core::cmp::Ordering;

/// Per-node link cell. Embed one of these (or a [`crate::pqueue::PqLink`],
/// which contains one) in each collectable structure, one per tree the
/// structure can be in.
#[derive(Copy, Clone, Debug)]
pub struct AvlLink<N> {
    pub parent: Option<N>,
    pub left: Option<N>,
    pub right: Option<N>,
    /// Height of the right subtree minus height of the left subtree;
    /// in {-1, 0, 1} whenever the tree is at rest.
    pub balance: i8,
}

impl<N> AvlLink<N> {
    pub const fn detached() -> Self {
        Self {
            parent: None,
            left: None,
            right: None,
            balance: 0,
        }
    }
}

impl<N> Default for AvlLink<N> {
    fn default() -> Self {
        Self::detached()
    }
}

/// Backing storage for one tree: resolves node handles to link cells and
/// defines the total order the tree maintains.
///
/// Implementations are typically short-lived adapter structs borrowing the
/// arena(s) the collected objects live in.
pub trait AvlStore {
    /// Handle naming one node cell. Small and copyable, e.g. an arena index.
    type Node: Copy + PartialEq;

    fn link(&self, node: Self::Node) -> &AvlLink<Self::Node>;
    fn link_mut(&mut self, node: Self::Node) -> &mut AvlLink<Self::Node>;

    /// Total order over nodes. Must be consistent for the lifetime of each
    /// node's membership in the tree.
    fn order(&self, a: Self::Node, b: Self::Node) -> Ordering;
}

/// Tree control structure. Copyable so it can be lifted out of a containing
/// structure, operated on, and stored back -- which is how the kernel resolves
/// borrows between a tree and the arena its nodes live in.
#[derive(Copy, Clone, Debug)]
pub struct AvlTree<N> {
    root: Option<N>,
    min: Option<N>,
}

impl<N: Copy + PartialEq> Default for AvlTree<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: Copy + PartialEq> AvlTree<N> {
    pub const fn new() -> Self {
        Self {
            root: None,
            min: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Smallest node, O(1) from the cache.
    pub fn first(&self) -> Option<N> {
        self.min
    }

    /// Root node, for callers that run their own specialized descents
    /// (best-fit search, per-priority minimum search).
    pub fn root(&self) -> Option<N> {
        self.root
    }

    /// Rotates the subtree rooted at `root` to the left. `root` must have a
    /// right child.
    fn rotate_left<S: AvlStore<Node = N>>(&mut self, s: &mut S, root: N) {
        let pivot = s.link(root).right.unwrap();

        // Update balance factors for the rotated pair.
        let pb = s.link(pivot).balance;
        s.link_mut(root).balance -= 1 + pb.max(0);
        let rb = s.link(root).balance;
        s.link_mut(pivot).balance -= 1 - rb.min(0);

        // Point the parent at the new subtree root.
        let parent = s.link(root).parent;
        match parent {
            None => self.root = Some(pivot),
            Some(p) => {
                if s.link(p).left == Some(root) {
                    s.link_mut(p).left = Some(pivot);
                } else {
                    s.link_mut(p).right = Some(pivot);
                }
            }
        }

        // Relink the pair itself.
        s.link_mut(pivot).parent = parent;
        s.link_mut(root).parent = Some(pivot);
        let transfer = s.link(pivot).left;
        s.link_mut(root).right = transfer;
        if let Some(t) = transfer {
            s.link_mut(t).parent = Some(root);
        }
        s.link_mut(pivot).left = Some(root);
    }

    /// Mirror image of `rotate_left`. `root` must have a left child.
    fn rotate_right<S: AvlStore<Node = N>>(&mut self, s: &mut S, root: N) {
        let pivot = s.link(root).left.unwrap();

        let pb = s.link(pivot).balance;
        s.link_mut(root).balance += 1 - pb.min(0);
        let rb = s.link(root).balance;
        s.link_mut(pivot).balance += 1 + rb.max(0);

        let parent = s.link(root).parent;
        match parent {
            None => self.root = Some(pivot),
            Some(p) => {
                if s.link(p).left == Some(root) {
                    s.link_mut(p).left = Some(pivot);
                } else {
                    s.link_mut(p).right = Some(pivot);
                }
            }
        }

        s.link_mut(pivot).parent = parent;
        s.link_mut(root).parent = Some(pivot);
        let transfer = s.link(pivot).right;
        s.link_mut(root).left = transfer;
        if let Some(t) = transfer {
            s.link_mut(t).parent = Some(root);
        }
        s.link_mut(pivot).right = Some(root);
    }

    /// Inserts `node` into the tree. On a key collision the tree is left
    /// unmodified and the already-linked node is returned as the error.
    pub fn insert<S: AvlStore<Node = N>>(
        &mut self,
        s: &mut S,
        node: N,
    ) -> Result<(), N> {
        *s.link_mut(node) = AvlLink::detached();

        // Empty tree: node becomes root and cached minimum.
        let Some(mut parent) = self.root else {
            self.root = Some(node);
            self.min = Some(node);
            return Ok(());
        };

        // Track whether the descent ever went right; if it never does, the
        // new node is the new minimum.
        let mut is_new_min = true;

        loop {
            match s.order(node, parent) {
                Ordering::Equal => return Err(parent),
                Ordering::Less => match s.link(parent).left {
                    Some(l) => parent = l,
                    None => {
                        if is_new_min {
                            self.min = Some(node);
                        }
                        s.link_mut(parent).left = Some(node);
                        break;
                    }
                },
                Ordering::Greater => match s.link(parent).right {
                    Some(r) => {
                        parent = r;
                        is_new_min = false;
                    }
                    None => {
                        s.link_mut(parent).right = Some(node);
                        break;
                    }
                },
            }
        }

        s.link_mut(node).parent = Some(parent);

        // Walk back up restoring the AVL shape. Stops at the first node
        // whose height did not change.
        let mut node = node;
        while let Some(parent) = s.link(node).parent {
            let delta = if s.link(parent).left == Some(node) {
                -1
            } else {
                1
            };
            s.link_mut(parent).balance += delta;
            let pb = s.link(parent).balance;

            if pb == 0 {
                break;
            }
            if pb > 1 {
                // Right-heavy; `node` is the right child here.
                if s.link(node).balance == -1 {
                    self.rotate_right(s, node);
                }
                self.rotate_left(s, parent);
                break;
            }
            if pb < -1 {
                if s.link(node).balance == 1 {
                    self.rotate_left(s, node);
                }
                self.rotate_right(s, parent);
                break;
            }

            node = parent;
        }

        Ok(())
    }

    /// Removes `node`, which must currently be linked in this tree.
    pub fn remove<S: AvlStore<Node = N>>(&mut self, s: &mut S, node: N) {
        // The minimum has no left child: its successor is its right child if
        // present, otherwise its parent.
        if self.min == Some(node) {
            self.min = s.link(node).right.or(s.link(node).parent);
        }

        // Unlink `node`, remembering where the height change happened.
        let start: Option<N>;

        if let Some(left) = s.link(node).left {
            // Replace the node with its in-order predecessor, the rightmost
            // node of the left subtree.
            let mut max = left;
            while let Some(r) = s.link(max).right {
                max = r;
            }

            let node_parent = s.link(node).parent;
            match node_parent {
                None => self.root = Some(max),
                Some(p) => {
                    if s.link(p).left == Some(node) {
                        s.link_mut(p).left = Some(max);
                    } else {
                        s.link_mut(p).right = Some(max);
                    }
                }
            }

            if s.link(max).parent == Some(node) {
                // Predecessor is the immediate left child: it moves up,
                // absorbing the removed node's balance plus the weight of
                // the right subtree.
                s.link_mut(max).balance = s.link(node).balance + 1;
                start = Some(max);
            } else {
                // Predecessor leaves a hole deeper in the left subtree. Its
                // old parent loses a right child; its own left child (if
                // any) moves up into its place.
                let mp = s.link(max).parent.unwrap();
                s.link_mut(mp).balance -= 1;
                let child = s.link(max).left;
                s.link_mut(mp).right = child;
                if let Some(c) = child {
                    s.link_mut(c).parent = Some(mp);
                }

                s.link_mut(max).balance = s.link(node).balance;
                let child = s.link(node).left;
                s.link_mut(max).left = child;
                if let Some(c) = child {
                    s.link_mut(c).parent = Some(max);
                }
                start = Some(mp);
            }

            let child = s.link(node).right;
            s.link_mut(max).right = child;
            if let Some(c) = child {
                s.link_mut(c).parent = Some(max);
            }
            s.link_mut(max).parent = node_parent;
        } else {
            // No left child: splice the right child (or nothing) into the
            // node's place.
            let parent = s.link(node).parent;
            let child = s.link(node).right;
            if let Some(c) = child {
                s.link_mut(c).parent = parent;
            }
            match parent {
                None => self.root = child,
                Some(p) => {
                    if s.link(p).left == Some(node) {
                        s.link_mut(p).left = child;
                        s.link_mut(p).balance += 1;
                    } else {
                        s.link_mut(p).right = child;
                        s.link_mut(p).balance -= 1;
                    }
                }
            }
            start = parent;
        }

        // Walk back up restoring the AVL shape. A balance of +/-1 means the
        // subtree height is unchanged and propagation stops.
        let mut cursor = start;
        while let Some(mut c) = cursor {
            let parent = s.link(c).parent;

            let b = s.link(c).balance;
            if b == -1 || b == 1 {
                break;
            }
            if b > 1 {
                let r = s.link(c).right.unwrap();
                if s.link(r).balance == -1 {
                    self.rotate_right(s, r);
                }
                self.rotate_left(s, c);
                c = s.link(c).parent.unwrap();
            } else if b < -1 {
                let l = s.link(c).left.unwrap();
                if s.link(l).balance == 1 {
                    self.rotate_left(s, l);
                }
                self.rotate_right(s, c);
                c = s.link(c).parent.unwrap();
            }

            let b = s.link(c).balance;
            if b == -1 || b == 1 {
                break;
            }

            if let Some(p) = parent {
                let delta = if s.link(p).left == Some(c) { 1 } else { -1 };
                s.link_mut(p).balance += delta;
            }
            cursor = parent;
        }
    }

    /// Finds a node by descending with a caller-supplied probe, which
    /// reports how the sought key compares to each visited node.
    pub fn search_by<S: AvlStore<Node = N>>(
        &self,
        s: &S,
        mut probe: impl FnMut(N) -> Ordering,
    ) -> Option<N> {
        let mut node = self.root;
        while let Some(n) = node {
            match probe(n) {
                Ordering::Equal => return Some(n),
                Ordering::Less => node = s.link(n).left,
                Ordering::Greater => node = s.link(n).right,
            }
        }
        None
    }

    /// In-order successor of a linked node.
    pub fn next_after<S: AvlStore<Node = N>>(
        &self,
        s: &S,
        node: N,
    ) -> Option<N> {
        if let Some(mut n) = s.link(node).right {
            while let Some(l) = s.link(n).left {
                n = l;
            }
            return Some(n);
        }
        let mut n = node;
        while let Some(p) = s.link(n).parent {
            if s.link(p).left == Some(n) {
                return Some(p);
            }
            n = p;
        }
        None
    }

    /// Replaces the physical cell of the linked node `cur` with the detached
    /// cell `new`, preserving balance, linkage, and the min cache. The two
    /// cells must represent the same key, or the tree order is corrupted.
    pub fn exchange<S: AvlStore<Node = N>>(&mut self, s: &mut S, cur: N, new: N) {
        s.link_mut(new).balance = s.link(cur).balance;

        let parent = s.link(cur).parent;
        s.link_mut(new).parent = parent;
        match parent {
            None => self.root = Some(new),
            Some(p) => {
                if s.link(p).left == Some(cur) {
                    s.link_mut(p).left = Some(new);
                } else {
                    s.link_mut(p).right = Some(new);
                }
            }
        }

        let left = s.link(cur).left;
        s.link_mut(new).left = left;
        if let Some(l) = left {
            s.link_mut(l).parent = Some(new);
        }

        let right = s.link(cur).right;
        s.link_mut(new).right = right;
        if let Some(r) = right {
            s.link_mut(r).parent = Some(new);
        }

        if self.min == Some(cur) {
            self.min = Some(new);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Simple arena store: node handles are indices, keys live beside the
    /// links.
    struct Arena {
        links: Vec<AvlLink<usize>>,
        keys: Vec<u64>,
    }

    impl Arena {
        fn new() -> Self {
            Self {
                links: Vec::new(),
                keys: Vec::new(),
            }
        }

        fn add(&mut self, key: u64) -> usize {
            self.links.push(AvlLink::detached());
            self.keys.push(key);
            self.links.len() - 1
        }
    }

    impl AvlStore for Arena {
        type Node = usize;

        fn link(&self, node: usize) -> &AvlLink<usize> {
            &self.links[node]
        }

        fn link_mut(&mut self, node: usize) -> &mut AvlLink<usize> {
            &mut self.links[node]
        }

        fn order(&self, a: usize, b: usize) -> Ordering {
            self.keys[a].cmp(&self.keys[b])
        }
    }

    /// Recomputes subtree heights, checking balance factors and parent links
    /// along the way. Returns the height.
    fn audit(s: &Arena, node: Option<usize>) -> i32 {
        let Some(n) = node else { return 0 };
        let l = s.link(n).left;
        let r = s.link(n).right;
        if let Some(c) = l {
            assert_eq!(s.link(c).parent, Some(n), "broken parent link");
        }
        if let Some(c) = r {
            assert_eq!(s.link(c).parent, Some(n), "broken parent link");
        }
        let lh = audit(s, l);
        let rh = audit(s, r);
        let b = i32::from(s.link(n).balance);
        assert_eq!(b, rh - lh, "stored balance disagrees with shape");
        assert!((-1..=1).contains(&b), "node out of AVL balance");
        lh.max(rh) + 1
    }

    fn audit_tree(s: &Arena, tree: &AvlTree<usize>) {
        audit(s, tree.root());
        // The cached minimum must be the leftmost node.
        let mut walk = tree.root();
        let mut leftmost = None;
        while let Some(n) = walk {
            leftmost = Some(n);
            walk = s.link(n).left;
        }
        assert_eq!(tree.first(), leftmost, "stale min cache");
    }

    fn inorder(s: &Arena, tree: &AvlTree<usize>) -> Vec<u64> {
        let mut out = Vec::new();
        let mut cursor = tree.first();
        while let Some(n) = cursor {
            out.push(s.keys[n]);
            cursor = tree.next_after(s, n);
        }
        out
    }

    #[test]
    fn insert_orders_and_balances() {
        let mut s = Arena::new();
        let mut tree = AvlTree::new();
        for key in [50, 20, 70, 10, 30, 60, 80, 25, 5, 65] {
            let n = s.add(key);
            tree.insert(&mut s, n).unwrap();
            audit_tree(&s, &tree);
        }
        assert_eq!(inorder(&s, &tree), vec![5, 10, 20, 25, 30, 50, 60, 65, 70, 80]);
        assert_eq!(tree.first().map(|n| s.keys[n]), Some(5));
    }

    #[test]
    fn duplicate_insert_reports_existing_and_leaves_tree_alone() {
        let mut s = Arena::new();
        let mut tree = AvlTree::new();
        let a = s.add(7);
        let b = s.add(7);
        tree.insert(&mut s, a).unwrap();
        assert_eq!(tree.insert(&mut s, b), Err(a));
        assert_eq!(inorder(&s, &tree), vec![7]);
    }

    #[test]
    fn remove_all_in_various_orders() {
        let keys: Vec<u64> = (0..64).map(|i| (i * 37) % 101).collect();
        for removal_stride in [1usize, 3, 7, 11] {
            let mut s = Arena::new();
            let mut tree = AvlTree::new();
            let nodes: Vec<usize> = keys.iter().map(|&k| s.add(k)).collect();
            for &n in &nodes {
                tree.insert(&mut s, n).unwrap();
            }
            let mut order: Vec<usize> = Vec::new();
            let mut i = 0;
            let mut pending: Vec<usize> = nodes.clone();
            while !pending.is_empty() {
                i = (i + removal_stride) % pending.len();
                order.push(pending.remove(i));
            }
            for &n in &order {
                tree.remove(&mut s, n);
                audit_tree(&s, &tree);
            }
            assert!(tree.is_empty());
            assert_eq!(tree.first(), None);
        }
    }

    #[test]
    fn search_and_successor() {
        let mut s = Arena::new();
        let mut tree = AvlTree::new();
        for key in [4, 1, 9, 2, 8, 3] {
            let n = s.add(key);
            tree.insert(&mut s, n).unwrap();
        }
        let found = tree.search_by(&s, |n| 8u64.cmp(&s.keys[n])).unwrap();
        assert_eq!(s.keys[found], 8);
        assert!(tree.search_by(&s, |n| 5u64.cmp(&s.keys[n])).is_none());

        let n3 = tree.search_by(&s, |n| 3u64.cmp(&s.keys[n])).unwrap();
        assert_eq!(tree.next_after(&s, n3).map(|n| s.keys[n]), Some(4));
        let n9 = tree.search_by(&s, |n| 9u64.cmp(&s.keys[n])).unwrap();
        assert_eq!(tree.next_after(&s, n9), None);
    }

    #[test]
    fn exchange_preserves_shape_and_min() {
        let mut s = Arena::new();
        let mut tree = AvlTree::new();
        let nodes: Vec<usize> = [10u64, 5, 15, 3].iter().map(|&k| s.add(k)).collect();
        for &n in &nodes {
            tree.insert(&mut s, n).unwrap();
        }
        // Swap out the minimum (key 3) for a fresh cell with the same key.
        let stand_in = s.add(3);
        tree.exchange(&mut s, nodes[3], stand_in);
        audit_tree(&s, &tree);
        assert_eq!(tree.first(), Some(stand_in));
        assert_eq!(inorder(&s, &tree), vec![3, 5, 10, 15]);
    }

    proptest::proptest! {
        #[test]
        fn random_insert_remove_keeps_invariants(
            ops in proptest::collection::vec((proptest::bool::ANY, 0u64..48), 1..200)
        ) {
            let mut s = Arena::new();
            let mut tree = AvlTree::new();
            // key -> node currently linked
            let mut live: std::collections::BTreeMap<u64, usize> =
                std::collections::BTreeMap::new();

            for (is_insert, key) in ops {
                if is_insert {
                    let n = s.add(key);
                    match tree.insert(&mut s, n) {
                        Ok(()) => {
                            live.insert(key, n);
                        }
                        Err(existing) => {
                            assert_eq!(live.get(&key), Some(&existing));
                        }
                    }
                } else if let Some((_, n)) = live.iter().find(|&(k, _)| *k >= key) {
                    let n = *n;
                    let k = s.keys[n];
                    tree.remove(&mut s, n);
                    live.remove(&k);
                }
                audit_tree(&s, &tree);
                let expect: Vec<u64> = live.keys().copied().collect();
                assert_eq!(inorder(&s, &tree), expect);
            }
        }
    }
}
