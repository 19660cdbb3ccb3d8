//! Left-leaning red-black tree over an arena of nodes.
//!
//! Keyed by split-node id. `floor_entry` resolves a remote position that
//! names an offset inside a node which was split after the position was
//! minted: the greatest id at or below the probe is the surviving block.

use std::cmp::Ordering;
use std::fmt::Debug;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
struct LlrbIdx(usize);

impl LlrbIdx {
    const NONE: LlrbIdx = LlrbIdx(usize::MAX);

    fn exists(&self) -> bool {
        self.0 != usize::MAX
    }
}

#[derive(Debug, Clone)]
struct LlrbNode<K, V> {
    key: K,
    value: V,
    left: LlrbIdx,
    right: LlrbIdx,
    red: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct Llrb<K: Ord + Copy + Debug, V: Copy + Debug> {
    nodes: Vec<LlrbNode<K, V>>,
    root: LlrbIdx,
    free: Vec<usize>,
    len: usize,
}

impl<K: Ord + Copy + Debug, V: Copy + Debug> Default for Llrb<K, V> {
    fn default() -> Self {
        Llrb { nodes: Vec::new(), root: LlrbIdx::NONE, free: Vec::new(), len: 0 }
    }
}

impl<K: Ord + Copy + Debug, V: Copy + Debug> Llrb<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut idx = self.root;
        while idx.exists() {
            let node = &self.nodes[idx.0];
            match key.cmp(&node.key) {
                Ordering::Equal => return Some(node.value),
                Ordering::Less => idx = node.left,
                Ordering::Greater => idx = node.right,
            }
        }
        None
    }

    /// Greatest entry with key ≤ `key`.
    pub fn floor_entry(&self, key: &K) -> Option<(K, V)> {
        let mut idx = self.root;
        let mut best = LlrbIdx::NONE;
        while idx.exists() {
            let node = &self.nodes[idx.0];
            match key.cmp(&node.key) {
                Ordering::Equal => return Some((node.key, node.value)),
                Ordering::Less => idx = node.left,
                Ordering::Greater => {
                    best = idx;
                    idx = node.right;
                }
            }
        }
        if best.exists() {
            let node = &self.nodes[best.0];
            Some((node.key, node.value))
        } else {
            None
        }
    }

    pub fn put(&mut self, key: K, value: V) {
        let root = self.insert(self.root, key, value);
        self.root = root;
        self.nodes[root.0].red = false;
    }

    pub fn remove(&mut self, key: &K) {
        if self.get(key).is_none() {
            return;
        }
        let root = self.root;
        if !self.is_red(self.nodes[root.0].left) && !self.is_red(self.nodes[root.0].right) {
            self.nodes[root.0].red = true;
        }
        let root = self.delete(root, key);
        self.root = root;
        if root.exists() {
            self.nodes[root.0].red = false;
        }
        self.len -= 1;
    }

    fn alloc(&mut self, key: K, value: V) -> LlrbIdx {
        self.len += 1;
        let node = LlrbNode { key, value, left: LlrbIdx::NONE, right: LlrbIdx::NONE, red: true };
        if let Some(slot) = self.free.pop() {
            self.nodes[slot] = node;
            LlrbIdx(slot)
        } else {
            self.nodes.push(node);
            LlrbIdx(self.nodes.len() - 1)
        }
    }

    fn release(&mut self, idx: LlrbIdx) {
        self.free.push(idx.0);
    }

    fn is_red(&self, idx: LlrbIdx) -> bool {
        idx.exists() && self.nodes[idx.0].red
    }

    fn insert(&mut self, idx: LlrbIdx, key: K, value: V) -> LlrbIdx {
        if !idx.exists() {
            return self.alloc(key, value);
        }
        match key.cmp(&self.nodes[idx.0].key) {
            Ordering::Less => {
                let left = self.insert(self.nodes[idx.0].left, key, value);
                self.nodes[idx.0].left = left;
            }
            Ordering::Greater => {
                let right = self.insert(self.nodes[idx.0].right, key, value);
                self.nodes[idx.0].right = right;
            }
            Ordering::Equal => {
                self.nodes[idx.0].value = value;
            }
        }
        self.fix_up(idx)
    }

    fn rotate_left(&mut self, idx: LlrbIdx) -> LlrbIdx {
        let right = self.nodes[idx.0].right;
        debug_assert!(right.exists());
        self.nodes[idx.0].right = self.nodes[right.0].left;
        self.nodes[right.0].left = idx;
        self.nodes[right.0].red = self.nodes[idx.0].red;
        self.nodes[idx.0].red = true;
        right
    }

    fn rotate_right(&mut self, idx: LlrbIdx) -> LlrbIdx {
        let left = self.nodes[idx.0].left;
        debug_assert!(left.exists());
        self.nodes[idx.0].left = self.nodes[left.0].right;
        self.nodes[left.0].right = idx;
        self.nodes[left.0].red = self.nodes[idx.0].red;
        self.nodes[idx.0].red = true;
        left
    }

    fn flip_colors(&mut self, idx: LlrbIdx) {
        let left = self.nodes[idx.0].left;
        let right = self.nodes[idx.0].right;
        self.nodes[idx.0].red = !self.nodes[idx.0].red;
        if left.exists() {
            self.nodes[left.0].red = !self.nodes[left.0].red;
        }
        if right.exists() {
            self.nodes[right.0].red = !self.nodes[right.0].red;
        }
    }

    fn fix_up(&mut self, mut idx: LlrbIdx) -> LlrbIdx {
        if self.is_red(self.nodes[idx.0].right) && !self.is_red(self.nodes[idx.0].left) {
            idx = self.rotate_left(idx);
        }
        let left = self.nodes[idx.0].left;
        if self.is_red(left) && left.exists() && self.is_red(self.nodes[left.0].left) {
            idx = self.rotate_right(idx);
        }
        if self.is_red(self.nodes[idx.0].left) && self.is_red(self.nodes[idx.0].right) {
            self.flip_colors(idx);
        }
        idx
    }

    fn move_red_left(&mut self, mut idx: LlrbIdx) -> LlrbIdx {
        self.flip_colors(idx);
        let right = self.nodes[idx.0].right;
        if right.exists() && self.is_red(self.nodes[right.0].left) {
            let right = self.rotate_right(right);
            self.nodes[idx.0].right = right;
            idx = self.rotate_left(idx);
            self.flip_colors(idx);
        }
        idx
    }

    fn move_red_right(&mut self, mut idx: LlrbIdx) -> LlrbIdx {
        self.flip_colors(idx);
        let left = self.nodes[idx.0].left;
        if left.exists() && self.is_red(self.nodes[left.0].left) {
            idx = self.rotate_right(idx);
            self.flip_colors(idx);
        }
        idx
    }

    fn min_node(&self, mut idx: LlrbIdx) -> LlrbIdx {
        while self.nodes[idx.0].left.exists() {
            idx = self.nodes[idx.0].left;
        }
        idx
    }

    fn delete_min(&mut self, mut idx: LlrbIdx) -> LlrbIdx {
        if !self.nodes[idx.0].left.exists() {
            self.release(idx);
            return LlrbIdx::NONE;
        }
        let left = self.nodes[idx.0].left;
        if !self.is_red(left) && !self.is_red(self.nodes[left.0].left) {
            idx = self.move_red_left(idx);
        }
        let left = self.delete_min(self.nodes[idx.0].left);
        self.nodes[idx.0].left = left;
        self.fix_up(idx)
    }

    fn delete(&mut self, mut idx: LlrbIdx, key: &K) -> LlrbIdx {
        if *key < self.nodes[idx.0].key {
            let left = self.nodes[idx.0].left;
            if !self.is_red(left) && left.exists() && !self.is_red(self.nodes[left.0].left) {
                idx = self.move_red_left(idx);
            }
            let left = self.delete(self.nodes[idx.0].left, key);
            self.nodes[idx.0].left = left;
        } else {
            if self.is_red(self.nodes[idx.0].left) {
                idx = self.rotate_right(idx);
            }
            if *key == self.nodes[idx.0].key && !self.nodes[idx.0].right.exists() {
                self.release(idx);
                return LlrbIdx::NONE;
            }
            let right = self.nodes[idx.0].right;
            if right.exists() && !self.is_red(right) && !self.is_red(self.nodes[right.0].left) {
                idx = self.move_red_right(idx);
            }
            if *key == self.nodes[idx.0].key {
                let min = self.min_node(self.nodes[idx.0].right);
                self.nodes[idx.0].key = self.nodes[min.0].key;
                self.nodes[idx.0].value = self.nodes[min.0].value;
                let right = self.delete_min(self.nodes[idx.0].right);
                self.nodes[idx.0].right = right;
            } else {
                let right = self.delete(self.nodes[idx.0].right, key);
                self.nodes[idx.0].right = right;
            }
        }
        self.fix_up(idx)
    }

    #[allow(unused)]
    pub fn dbg_check(&self) {
        if self.root.exists() {
            assert!(!self.nodes[self.root.0].red);
            self.check_subtree(self.root, None, None);
        }
    }

    #[allow(unused)]
    fn check_subtree(&self, idx: LlrbIdx, min: Option<K>, max: Option<K>) -> usize {
        let node = &self.nodes[idx.0];
        if let Some(min) = min {
            assert!(node.key > min);
        }
        if let Some(max) = max {
            assert!(node.key < max);
        }
        // No right-leaning red links, no consecutive reds.
        assert!(!self.is_red(node.right));
        if node.red {
            assert!(!self.is_red(node.left));
        }
        let lh = if node.left.exists() {
            self.check_subtree(node.left, min, Some(node.key))
        } else {
            0
        };
        let rh = if node.right.exists() {
            self.check_subtree(node.right, Some(node.key), max)
        } else {
            0
        };
        assert_eq!(lh, rh, "black height mismatch");
        lh + usize::from(!node.red)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use std::collections::BTreeMap;

    #[test]
    fn put_get_floor() {
        let mut tree: Llrb<u32, u32> = Llrb::new();
        for k in [50, 20, 80, 10, 30, 70, 90] {
            tree.put(k, k * 10);
        }
        tree.dbg_check();
        assert_eq!(tree.get(&30), Some(300));
        assert_eq!(tree.get(&31), None);
        assert_eq!(tree.floor_entry(&30), Some((30, 300)));
        assert_eq!(tree.floor_entry(&35), Some((30, 300)));
        assert_eq!(tree.floor_entry(&9), None);
        assert_eq!(tree.floor_entry(&200), Some((90, 900)));
    }

    #[test]
    fn remove_keeps_balance() {
        let mut tree: Llrb<u32, u32> = Llrb::new();
        for k in 0..64 {
            tree.put(k, k);
        }
        for k in (0..64).step_by(2) {
            tree.remove(&k);
            tree.dbg_check();
        }
        assert_eq!(tree.len(), 32);
        assert_eq!(tree.floor_entry(&2), Some((1, 1)));
    }

    #[test]
    fn fuzz_against_btreemap() {
        let mut rng = SmallRng::seed_from_u64(33);
        let mut tree: Llrb<u32, u32> = Llrb::new();
        let mut model: BTreeMap<u32, u32> = BTreeMap::new();

        for i in 0..2000u32 {
            let key = rng.gen_range(0..200);
            if rng.gen_bool(0.6) {
                tree.put(key, i);
                model.insert(key, i);
            } else {
                tree.remove(&key);
                model.remove(&key);
            }
            tree.dbg_check();
            assert_eq!(tree.len(), model.len());

            let probe = rng.gen_range(0..220);
            let expect = model.range(..=probe).next_back().map(|(&k, &v)| (k, v));
            assert_eq!(tree.floor_entry(&probe), expect, "floor({})", probe);
            assert_eq!(tree.get(&probe), model.get(&probe).copied());
        }
    }
}
