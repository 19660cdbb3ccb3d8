//! Array members: an RGA list of child elements.
//!
//! Shares the split list's ordering rule (the walk skips concurrent entries
//! whose tickets are after the placing operation) with element-granularity
//! blocks: every live entry weighs 1 in the splay index.

use std::collections::HashMap;

use crate::error::{DocError, Result};
use crate::index::{SplayIdx, SplayTree};
use crate::time::{TimeTicket, INITIAL_TIME_TICKET};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
struct ArrIdx(usize);

impl ArrIdx {
    const NONE: ArrIdx = ArrIdx(usize::MAX);

    fn exists(&self) -> bool {
        self.0 != usize::MAX
    }
}

#[derive(Debug, Clone)]
struct ArrayNode {
    elem: TimeTicket,
    /// Creation ticket, or the ticket of the latest winning move.
    positioned_at: TimeTicket,
    prev: ArrIdx,
    next: ArrIdx,
    splay: SplayIdx,
    removed: bool,
}

#[derive(Debug, Clone)]
pub struct CrdtArray {
    nodes: Vec<ArrayNode>,
    head: ArrIdx,
    index: SplayTree<usize>,
    by_created: HashMap<TimeTicket, ArrIdx>,
}

impl Default for CrdtArray {
    fn default() -> Self {
        Self::new()
    }
}

impl CrdtArray {
    pub fn new() -> CrdtArray {
        let mut index = SplayTree::new();
        let splay = index.insert_first(0usize, 0);
        CrdtArray {
            nodes: vec![ArrayNode {
                elem: INITIAL_TIME_TICKET,
                positioned_at: INITIAL_TIME_TICKET,
                prev: ArrIdx::NONE,
                next: ArrIdx::NONE,
                splay,
                removed: false,
            }],
            head: ArrIdx(0),
            index,
            by_created: HashMap::new(),
        }
    }

    fn node(&self, idx: ArrIdx) -> &ArrayNode {
        &self.nodes[idx.0]
    }

    fn anchor(&self, prev_created: TimeTicket) -> Result<ArrIdx> {
        if prev_created == INITIAL_TIME_TICKET {
            return Ok(self.head);
        }
        self.by_created
            .get(&prev_created)
            .copied()
            .ok_or_else(|| DocError::invalid_argument("unknown previous element in array"))
    }

    pub fn len(&self) -> usize {
        self.index.total_weight()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts `created` after `prev_created`, walking over entries placed
    /// concurrently with a later ticket. Returns the live index the element
    /// landed at.
    pub fn insert_after(
        &mut self,
        prev_created: TimeTicket,
        created: TimeTicket,
        executed_at: TimeTicket,
    ) -> Result<usize> {
        let mut prev = self.anchor(prev_created)?;
        while self.node(prev).next.exists()
            && self.node(self.node(prev).next).positioned_at.after(executed_at)
        {
            prev = self.node(prev).next;
        }
        let next = self.node(prev).next;
        let idx = ArrIdx(self.nodes.len());
        let splay = self.index.insert_after(self.node(prev).splay, idx.0, 1);
        self.nodes.push(ArrayNode {
            elem: created,
            positioned_at: executed_at,
            prev,
            next,
            splay,
            removed: false,
        });
        self.nodes[prev.0].next = idx;
        if next.exists() {
            self.nodes[next.0].prev = idx;
        }
        self.by_created.insert(created, idx);
        Ok(self.index.index_of(splay))
    }

    /// Repositions an element after `prev_created` iff the move is newer
    /// than the element's current placement.
    pub fn move_after(
        &mut self,
        prev_created: TimeTicket,
        created: TimeTicket,
        executed_at: TimeTicket,
    ) -> Result<bool> {
        if prev_created == created {
            return Err(DocError::invalid_argument("an element cannot anchor its own move"));
        }
        let idx = self
            .by_created
            .get(&created)
            .copied()
            .ok_or_else(|| DocError::invalid_argument("unknown element in array"))?;
        if !executed_at.after(self.node(idx).positioned_at) {
            return Ok(false);
        }
        // Detach, then re-run the placement walk.
        let prev = self.node(idx).prev;
        let next = self.node(idx).next;
        self.nodes[prev.0].next = next;
        if next.exists() {
            self.nodes[next.0].prev = prev;
        }
        self.index.delete(self.node(idx).splay);

        let mut anchor = self.anchor(prev_created)?;
        while self.node(anchor).next.exists()
            && self.node(self.node(anchor).next).positioned_at.after(executed_at)
        {
            anchor = self.node(anchor).next;
        }
        let next = self.node(anchor).next;
        let len = if self.node(idx).removed { 0 } else { 1 };
        let splay = self.index.insert_after(self.node(anchor).splay, idx.0, len);
        self.nodes[idx.0].prev = anchor;
        self.nodes[idx.0].next = next;
        self.nodes[idx.0].splay = splay;
        self.nodes[idx.0].positioned_at = executed_at;
        self.nodes[anchor.0].next = idx;
        if next.exists() {
            self.nodes[next.0].prev = idx;
        }
        Ok(true)
    }

    /// Zeroes the entry's weight once its element is tombstoned.
    pub fn mark_removed(&mut self, created: TimeTicket) {
        if let Some(&idx) = self.by_created.get(&created) {
            if !self.nodes[idx.0].removed {
                self.nodes[idx.0].removed = true;
                let splay = self.nodes[idx.0].splay;
                self.index.update_len(splay, 0);
            }
        }
    }

    pub fn purge(&mut self, created: TimeTicket) -> Result<()> {
        let idx = self
            .by_created
            .remove(&created)
            .ok_or_else(|| DocError::invalid_argument("purge of an unknown array element"))?;
        let prev = self.node(idx).prev;
        let next = self.node(idx).next;
        debug_assert!(prev.exists(), "the head entry is never purged");
        self.nodes[prev.0].next = next;
        if next.exists() {
            self.nodes[next.0].prev = prev;
        }
        self.index.delete(self.node(idx).splay);
        Ok(())
    }

    /// Ticket of the live element at `index`.
    pub fn get(&mut self, index: usize) -> Option<TimeTicket> {
        if index >= self.len() {
            return None;
        }
        let (splay, offset) = self.index.find(index + 1)?;
        debug_assert_eq!(offset, 1);
        Some(self.nodes[self.index.value(splay)].elem)
    }

    pub fn index_of(&mut self, created: TimeTicket) -> Option<usize> {
        let idx = self.by_created.get(&created).copied()?;
        let splay = self.node(idx).splay;
        Some(self.index.index_of(splay))
    }

    /// Last entry in list order, tombstones included; anchors appends.
    pub fn last_created(&self) -> TimeTicket {
        let mut idx = self.head;
        while self.node(idx).next.exists() {
            idx = self.node(idx).next;
        }
        self.node(idx).elem
    }

    /// The element preceding `created` in list order (INITIAL for the head),
    /// used to anchor reverse operations.
    pub fn prev_created(&self, created: TimeTicket) -> Option<TimeTicket> {
        let idx = self.by_created.get(&created).copied()?;
        Some(self.node(self.node(idx).prev).elem)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TimeTicket, bool)> + '_ {
        ArrayIter { array: self, idx: self.node(self.head).next }
    }

    pub fn iter_live(&self) -> impl Iterator<Item = TimeTicket> + '_ {
        self.iter().filter(|(_, removed)| !removed).map(|(t, _)| t)
    }

    #[allow(unused)]
    pub fn check(&self) {
        let mut live = 0;
        let mut idx = self.head;
        while idx.exists() {
            let node = self.node(idx);
            if !node.removed && idx != self.head {
                live += 1;
            }
            if node.next.exists() {
                assert_eq!(self.node(node.next).prev, idx);
            }
            idx = node.next;
        }
        assert_eq!(live, self.index.total_weight());
    }
}

struct ArrayIter<'a> {
    array: &'a CrdtArray,
    idx: ArrIdx,
}

impl Iterator for ArrayIter<'_> {
    type Item = (TimeTicket, bool);

    fn next(&mut self) -> Option<Self::Item> {
        if !self.idx.exists() {
            return None;
        }
        let node = self.array.node(self.idx);
        self.idx = node.next;
        Some((node.elem, node.removed))
    }
}
