//! Weight-keyed splay tree over an arena of entries.
//!
//! Each entry carries its own visible length (0 for tombstones) and the
//! weight of its subtree. In-order position equals document order, so the
//! prefix weight of an entry is the visible index of the block it indexes.

use std::fmt::Debug;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct SplayIdx(usize);

impl Default for SplayIdx {
    fn default() -> Self {
        SplayIdx::NONE
    }
}

impl SplayIdx {
    pub(crate) const NONE: SplayIdx = SplayIdx(usize::MAX);

    pub(crate) fn exists(&self) -> bool {
        self.0 != usize::MAX
    }
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    left: SplayIdx,
    right: SplayIdx,
    parent: SplayIdx,
    len: usize,
    weight: usize,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct SplayTree<V: Copy + Eq + Debug> {
    entries: Vec<Entry<V>>,
    root: SplayIdx,
    free: Vec<usize>,
}

impl<V: Copy + Eq + Debug> SplayTree<V> {
    pub fn new() -> Self {
        SplayTree { entries: Vec::new(), root: SplayIdx::NONE, free: Vec::new() }
    }

    pub fn value(&self, idx: SplayIdx) -> V {
        self.entries[idx.0].value
    }

    pub fn len_of(&self, idx: SplayIdx) -> usize {
        self.entries[idx.0].len
    }

    pub fn total_weight(&self) -> usize {
        self.weight(self.root)
    }

    fn weight(&self, idx: SplayIdx) -> usize {
        if idx.exists() {
            self.entries[idx.0].weight
        } else {
            0
        }
    }

    fn alloc(&mut self, value: V, len: usize) -> SplayIdx {
        let entry = Entry {
            value,
            left: SplayIdx::NONE,
            right: SplayIdx::NONE,
            parent: SplayIdx::NONE,
            len,
            weight: len,
        };
        if let Some(slot) = self.free.pop() {
            self.entries[slot] = entry;
            SplayIdx(slot)
        } else {
            self.entries.push(entry);
            SplayIdx(self.entries.len() - 1)
        }
    }

    /// Inserts the first entry. Only valid on an empty tree; every later
    /// insertion goes through `insert_after`.
    pub fn insert_first(&mut self, value: V, len: usize) -> SplayIdx {
        debug_assert!(!self.root.exists());
        let idx = self.alloc(value, len);
        self.root = idx;
        idx
    }

    /// Inserts a new entry immediately after `prev` in document order.
    pub fn insert_after(&mut self, prev: SplayIdx, value: V, len: usize) -> SplayIdx {
        let idx = self.alloc(value, len);
        self.splay(prev, SplayIdx::NONE);
        let right = self.entries[prev.0].right;
        self.entries[idx.0].left = prev;
        self.entries[idx.0].right = right;
        self.entries[prev.0].parent = idx;
        self.entries[prev.0].right = SplayIdx::NONE;
        if right.exists() {
            self.entries[right.0].parent = idx;
        }
        self.update_weight(prev);
        self.update_weight(idx);
        self.root = idx;
        idx
    }

    /// Finds the entry whose prefix weight covers `pos`; returns the entry
    /// and the residual offset within it. Boundaries resolve to the end of
    /// the entry on the left. Returns `None` when `pos` exceeds the total
    /// weight.
    pub fn find(&mut self, mut pos: usize) -> Option<(SplayIdx, usize)> {
        if !self.root.exists() || pos > self.total_weight() {
            return None;
        }
        let mut idx = self.root;
        loop {
            let left = self.entries[idx.0].left;
            let right = self.entries[idx.0].right;
            let lw = self.weight(left);
            let len = self.entries[idx.0].len;
            if left.exists() && pos <= lw {
                idx = left;
            } else if right.exists() && lw + len < pos {
                pos -= lw + len;
                idx = right;
            } else {
                pos -= lw;
                break;
            }
        }
        debug_assert!(pos <= self.entries[idx.0].len);
        self.splay(idx, SplayIdx::NONE);
        Some((idx, pos))
    }

    /// Visible index of an entry: its prefix weight after splaying it to the
    /// root.
    pub fn index_of(&mut self, idx: SplayIdx) -> usize {
        self.splay(idx, SplayIdx::NONE);
        self.weight(self.entries[idx.0].left)
    }

    pub fn update_len(&mut self, idx: SplayIdx, len: usize) {
        self.splay(idx, SplayIdx::NONE);
        self.entries[idx.0].len = len;
        self.update_weight(idx);
    }

    /// Removes one entry, joining its subtrees. The slot is recycled.
    pub fn delete(&mut self, idx: SplayIdx) {
        self.splay(idx, SplayIdx::NONE);
        let left = self.entries[idx.0].left;
        let right = self.entries[idx.0].right;
        if left.exists() {
            self.entries[left.0].parent = SplayIdx::NONE;
        }
        if right.exists() {
            self.entries[right.0].parent = SplayIdx::NONE;
        }
        if !left.exists() {
            self.root = right;
        } else {
            self.root = left;
            if right.exists() {
                let mut max = left;
                while self.entries[max.0].right.exists() {
                    max = self.entries[max.0].right;
                }
                self.splay(max, SplayIdx::NONE);
                self.entries[max.0].right = right;
                self.entries[right.0].parent = max;
                self.update_weight(max);
            }
        }
        self.entries[idx.0].left = SplayIdx::NONE;
        self.entries[idx.0].right = SplayIdx::NONE;
        self.entries[idx.0].parent = SplayIdx::NONE;
        self.entries[idx.0].len = 0;
        self.entries[idx.0].weight = 0;
        self.free.push(idx.0);
    }

    /// Drops the weight of every entry strictly between two kept boundaries.
    /// With `right == NONE` everything after `left` is zeroed. Entries stay
    /// in the tree; their lengths become 0.
    pub fn delete_range(&mut self, left: SplayIdx, right: SplayIdx) {
        if !right.exists() {
            self.splay(left, SplayIdx::NONE);
            let sub = self.entries[left.0].right;
            self.zero_subtree(sub);
            self.update_weight(left);
            return;
        }
        self.splay(left, SplayIdx::NONE);
        self.splay(right, left);
        debug_assert_eq!(self.entries[right.0].parent, left);
        let sub = self.entries[right.0].left;
        self.zero_subtree(sub);
        self.update_weight(right);
        self.update_weight(left);
    }

    fn zero_subtree(&mut self, sub: SplayIdx) {
        let mut stack = vec![sub];
        while let Some(idx) = stack.pop() {
            if !idx.exists() {
                continue;
            }
            let e = &mut self.entries[idx.0];
            e.len = 0;
            e.weight = 0;
            stack.push(e.left);
            stack.push(e.right);
        }
    }

    fn update_weight(&mut self, idx: SplayIdx) {
        let left = self.entries[idx.0].left;
        let right = self.entries[idx.0].right;
        self.entries[idx.0].weight =
            self.entries[idx.0].len + self.weight(left) + self.weight(right);
    }

    /// Splays `idx` until its parent is `until` (`NONE` splays to the root).
    fn splay(&mut self, idx: SplayIdx, until: SplayIdx) {
        loop {
            let parent = self.entries[idx.0].parent;
            if parent == until || !parent.exists() {
                break;
            }
            let grand = self.entries[parent.0].parent;
            if grand == until || !grand.exists() {
                self.rotate(idx);
            } else {
                let idx_is_left = self.entries[parent.0].left == idx;
                let parent_is_left = self.entries[grand.0].left == parent;
                if idx_is_left == parent_is_left {
                    self.rotate(parent);
                    self.rotate(idx);
                } else {
                    self.rotate(idx);
                    self.rotate(idx);
                }
            }
        }
        if !until.exists() {
            self.root = idx;
        }
    }

    /// Rotates `idx` above its parent, keeping weights consistent.
    fn rotate(&mut self, idx: SplayIdx) {
        let parent = self.entries[idx.0].parent;
        debug_assert!(parent.exists());
        let grand = self.entries[parent.0].parent;
        if self.entries[parent.0].left == idx {
            let b = self.entries[idx.0].right;
            self.entries[parent.0].left = b;
            if b.exists() {
                self.entries[b.0].parent = parent;
            }
            self.entries[idx.0].right = parent;
        } else {
            let b = self.entries[idx.0].left;
            self.entries[parent.0].right = b;
            if b.exists() {
                self.entries[b.0].parent = parent;
            }
            self.entries[idx.0].left = parent;
        }
        self.entries[parent.0].parent = idx;
        self.entries[idx.0].parent = grand;
        if grand.exists() {
            if self.entries[grand.0].left == parent {
                self.entries[grand.0].left = idx;
            } else {
                self.entries[grand.0].right = idx;
            }
        }
        self.update_weight(parent);
        self.update_weight(idx);
    }

    #[allow(unused)]
    pub fn dbg_check(&self) {
        if self.root.exists() {
            assert!(!self.entries[self.root.0].parent.exists());
            self.check_subtree(self.root);
        }
    }

    #[allow(unused)]
    fn check_subtree(&self, idx: SplayIdx) -> usize {
        let e = &self.entries[idx.0];
        let mut weight = e.len;
        for child in [e.left, e.right] {
            if child.exists() {
                assert_eq!(self.entries[child.0].parent, idx);
                weight += self.check_subtree(child);
            }
        }
        assert_eq!(weight, e.weight, "weight mismatch at {:?}", idx);
        weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    // Flat model: entries in document order with their lengths.
    struct Model {
        order: Vec<(u32, usize)>, // (id, len)
    }

    impl Model {
        fn index_of(&self, id: u32) -> usize {
            let mut acc = 0;
            for &(i, len) in &self.order {
                if i == id {
                    return acc;
                }
                acc += len;
            }
            unreachable!()
        }

        // Boundary rule: the first entry whose prefix + len covers pos wins,
        // so a boundary position belongs to the end of the entry on the left.
        fn find(&self, pos: usize) -> Option<(u32, usize)> {
            let mut prefix = 0;
            for &(id, len) in &self.order {
                if prefix + len >= pos {
                    return Some((id, pos - prefix));
                }
                prefix += len;
            }
            None
        }
    }

    #[test]
    fn insert_find_and_rank() {
        let mut tree = SplayTree::new();
        let head = tree.insert_first(0u32, 0);
        let a = tree.insert_after(head, 1u32, 3); // "abc"
        let b = tree.insert_after(a, 2u32, 2); // "de"
        tree.dbg_check();

        assert_eq!(tree.total_weight(), 5);
        assert_eq!(tree.find(0), Some((head, 0)));
        let (idx, off) = tree.find(2).unwrap();
        assert_eq!((tree.value(idx), off), (1, 2));
        // Boundary prefers the left entry's end.
        let (idx, off) = tree.find(3).unwrap();
        assert_eq!((tree.value(idx), off), (1, 3));
        let (idx, off) = tree.find(5).unwrap();
        assert_eq!((tree.value(idx), off), (2, 2));
        assert!(tree.find(6).is_none());

        assert_eq!(tree.index_of(a), 0);
        assert_eq!(tree.index_of(b), 3);
        tree.dbg_check();
    }

    #[test]
    fn tombstone_weights_drop() {
        let mut tree = SplayTree::new();
        let head = tree.insert_first(0u32, 0);
        let a = tree.insert_after(head, 1u32, 3);
        let b = tree.insert_after(a, 2u32, 4);
        let c = tree.insert_after(b, 3u32, 2);

        tree.delete_range(a, c); // tombstones b
        tree.dbg_check();
        assert_eq!(tree.total_weight(), 5);
        assert_eq!(tree.index_of(c), 3);
        assert_eq!(tree.index_of(b), 3); // rank of a tombstone collapses
        assert_eq!(tree.len_of(b), 0);

        tree.delete_range(head, SplayIdx::NONE); // zero everything
        assert_eq!(tree.total_weight(), 0);
        tree.dbg_check();
    }

    #[test]
    fn delete_joins_subtrees() {
        let mut tree = SplayTree::new();
        let head = tree.insert_first(0u32, 0);
        let a = tree.insert_after(head, 1u32, 1);
        let b = tree.insert_after(a, 2u32, 1);
        let c = tree.insert_after(b, 3u32, 1);
        tree.delete(b);
        tree.dbg_check();
        assert_eq!(tree.total_weight(), 2);
        assert_eq!(tree.index_of(a), 0);
        assert_eq!(tree.index_of(c), 1);
    }

    #[test]
    fn fuzz_against_flat_model() {
        let mut rng = SmallRng::seed_from_u64(12);
        let mut tree = SplayTree::new();
        let head = tree.insert_first(0u32, 0);
        let mut model = Model { order: vec![(0, 0)] };
        let mut handles = vec![(0u32, head)];
        let mut next_id = 1u32;

        for _ in 0..600 {
            let roll: f64 = rng.gen();
            if roll < 0.5 || handles.len() < 2 {
                // Insert after a random existing entry.
                let &(after_id, after_idx) = handles.choose(&mut rng).unwrap();
                let len = rng.gen_range(1..5);
                let idx = tree.insert_after(after_idx, next_id, len);
                let at = model.order.iter().position(|&(i, _)| i == after_id).unwrap();
                model.order.insert(at + 1, (next_id, len));
                handles.push((next_id, idx));
                next_id += 1;
            } else {
                // Tombstone a random live entry.
                let &(id, idx) = handles.choose(&mut rng).unwrap();
                if id == 0 {
                    continue;
                }
                tree.update_len(idx, 0);
                let at = model.order.iter().position(|&(i, _)| i == id).unwrap();
                model.order[at].1 = 0;
            }
            tree.dbg_check();

            let total: usize = model.order.iter().map(|&(_, l)| l).sum();
            assert_eq!(tree.total_weight(), total);
            for &(id, idx) in &handles {
                assert_eq!(tree.index_of(idx), model.index_of(id), "rank of {}", id);
            }
            for pos in 0..=total {
                let (idx, off) = tree.find(pos).unwrap();
                let (mid, moff) = model.find(pos).unwrap();
                assert_eq!((tree.value(idx), off), (mid, moff), "find({})", pos);
            }
        }
    }
}
