//! RGATreeSplit: the block-based split list backing rich text.
//!
//! A doubly linked list of value blocks with two auxiliary indexes: a splay
//! tree keyed by live length (index ↔ node) and an LLRB tree keyed by node id
//! (remote position ↔ node). Blocks split in place; both halves share a
//! creation ticket and differ in offset, and the newer half points at the
//! older one through the insertion chain so positions survive splits.
//!
//! Nodes live in an arena. A purged slot is marked dead and never reused
//! while the list is alive: a stale `ins_prev` back-reference then reads as
//! absent instead of aliasing a recycled slot.

use std::cmp::Ordering;
use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{DocError, Result};
use crate::index::{SplayIdx, SplayTree};
use crate::index::Llrb;
use crate::resource::{DataSize, DocDelta};
use crate::time::{ActorId, TimeTicket, VersionVector, TIME_TICKET_SIZE};

/// Value stored in one block.
pub trait SplitValue: Clone + Default + Debug {
    /// Visible length in content units (chars for text).
    fn content_len(&self) -> usize;
    /// Truncates self to `[0, offset)` and returns the tail.
    fn split_at(&mut self, offset: usize) -> Self;
    fn data_size(&self) -> DataSize;
}

/// ⟨creation ticket, offset⟩ naming one block. The offset is the distance
/// from the start of the original insertion this block was split from.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SplitNodeId {
    pub created_at: TimeTicket,
    pub offset: u32,
}

impl SplitNodeId {
    pub fn new(created_at: TimeTicket, offset: u32) -> SplitNodeId {
        SplitNodeId { created_at, offset }
    }

    pub fn to_id_string(&self) -> String {
        format!("{}:{}", self.created_at.to_id_string(), self.offset)
    }
}

impl Ord for SplitNodeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.offset.cmp(&other.offset))
    }
}

impl PartialOrd for SplitNodeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Debug for SplitNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}+{}", self.created_at, self.offset)
    }
}

/// A logical position: a block id plus an offset relative to the block as it
/// was when the position was minted. Splits after minting are resolved via
/// the absolute id and the floor lookup.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct SplitPos {
    pub id: SplitNodeId,
    pub relative_offset: u32,
}

impl SplitPos {
    pub fn new(id: SplitNodeId, relative_offset: u32) -> SplitPos {
        SplitPos { id, relative_offset }
    }

    pub fn absolute_id(&self) -> SplitNodeId {
        SplitNodeId { created_at: self.id.created_at, offset: self.id.offset + self.relative_offset }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) struct NodeIdx(usize);

impl Default for NodeIdx {
    fn default() -> Self {
        NodeIdx::NONE
    }
}

impl NodeIdx {
    pub(crate) const NONE: NodeIdx = NodeIdx(usize::MAX);

    pub(crate) fn exists(&self) -> bool {
        self.0 != usize::MAX
    }
}

#[derive(Debug, Clone)]
pub(crate) struct SplitNode<V> {
    pub id: SplitNodeId,
    pub value: V,
    pub removed_at: Option<TimeTicket>,
    prev: NodeIdx,
    next: NodeIdx,
    ins_prev: NodeIdx,
    ins_next: NodeIdx,
    splay: SplayIdx,
    dead: bool,
}

impl<V: SplitValue> SplitNode<V> {
    pub fn is_removed(&self) -> bool {
        self.removed_at.is_some()
    }

    fn live_len(&self) -> usize {
        if self.is_removed() {
            0
        } else {
            self.value.content_len()
        }
    }

    /// Block size including its id ticket, excluding the removal ticket.
    fn base_size(&self) -> DataSize {
        let mut size = self.value.data_size();
        size += DataSize::new(0, TIME_TICKET_SIZE);
        size
    }

    /// A node may be deleted by an edit only if the editor had seen its
    /// creation and any prior removal happened before this edit.
    fn can_delete(&self, edited_at: TimeTicket, client_lamport: u64) -> bool {
        self.id.created_at.lamport() <= client_lamport
            && self.removed_at.map_or(true, |r| edited_at.after(r))
    }

    pub fn can_style(&self, edited_at: TimeTicket, client_lamport: u64) -> bool {
        self.id.created_at.lamport() <= client_lamport
            && self.removed_at.map_or(true, |r| edited_at.after(r))
    }
}

/// One user-visible content change produced by an edit. Changes are emitted
/// right-to-left so a plain mirror can apply them in order with stable
/// indexes.
#[derive(Debug, Clone)]
pub struct ValueChange<V> {
    pub actor: ActorId,
    pub from: usize,
    pub to: usize,
    pub value: Option<V>,
}

/// Snapshot of a block tombstoned by an edit; feeds GC pairs and the undo
/// trail.
#[derive(Debug, Clone)]
pub struct RemovedBlock<V> {
    pub id: SplitNodeId,
    pub value: V,
}

#[derive(Debug, Clone)]
pub struct InsertedBlock {
    pub id: SplitNodeId,
    pub content_len: usize,
    /// Boundary position just before the inserted block at edit time.
    pub before: SplitPos,
}

#[derive(Debug)]
pub struct EditOutcome<V> {
    pub caret: SplitPos,
    pub delta: DocDelta,
    pub changes: Vec<ValueChange<V>>,
    pub removed: Vec<RemovedBlock<V>>,
    pub inserted: Option<InsertedBlock>,
}

#[derive(Debug, Clone)]
pub struct RgaTreeSplit<V: SplitValue> {
    nodes: Vec<SplitNode<V>>,
    head: NodeIdx,
    index: SplayTree<NodeIdx>,
    by_id: Llrb<SplitNodeId, NodeIdx>,
}

impl<V: SplitValue> Default for RgaTreeSplit<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: SplitValue> RgaTreeSplit<V> {
    pub fn new() -> Self {
        let mut list = RgaTreeSplit {
            nodes: Vec::new(),
            head: NodeIdx(0),
            index: SplayTree::new(),
            by_id: Llrb::new(),
        };
        // Zero-length head block anchoring the list and both indexes.
        let head_id = SplitNodeId::new(crate::time::INITIAL_TIME_TICKET, 0);
        let splay = list.index.insert_first(NodeIdx(0), 0);
        list.nodes.push(SplitNode {
            id: head_id,
            value: V::default(),
            removed_at: None,
            prev: NodeIdx::NONE,
            next: NodeIdx::NONE,
            ins_prev: NodeIdx::NONE,
            ins_next: NodeIdx::NONE,
            splay,
            dead: false,
        });
        list.by_id.put(head_id, NodeIdx(0));
        list
    }

    pub(crate) fn node(&self, idx: NodeIdx) -> &SplitNode<V> {
        &self.nodes[idx.0]
    }

    fn node_mut(&mut self, idx: NodeIdx) -> &mut SplitNode<V> {
        &mut self.nodes[idx.0]
    }

    pub(crate) fn node_value_mut(&mut self, idx: NodeIdx) -> &mut V {
        &mut self.nodes[idx.0].value
    }

    pub(crate) fn last_node(&self) -> NodeIdx {
        let mut idx = self.head;
        while self.node(idx).next.exists() {
            idx = self.node(idx).next;
        }
        idx
    }

    pub fn content_len(&self) -> usize {
        self.index.total_weight()
    }

    fn alloc(&mut self, id: SplitNodeId, value: V, removed_at: Option<TimeTicket>) -> NodeIdx {
        self.nodes.push(SplitNode {
            id,
            value,
            removed_at,
            prev: NodeIdx::NONE,
            next: NodeIdx::NONE,
            ins_prev: NodeIdx::NONE,
            ins_next: NodeIdx::NONE,
            splay: SplayIdx::NONE,
            dead: false,
        });
        NodeIdx(self.nodes.len() - 1)
    }

    fn link_after(&mut self, prev: NodeIdx, idx: NodeIdx) {
        let next = self.nodes[prev.0].next;
        self.nodes[idx.0].prev = prev;
        self.nodes[idx.0].next = next;
        self.nodes[prev.0].next = idx;
        if next.exists() {
            self.nodes[next.0].prev = idx;
        }
        let len = self.nodes[idx.0].live_len();
        let splay = self.index.insert_after(self.nodes[prev.0].splay, idx, len);
        self.nodes[idx.0].splay = splay;
        self.by_id.put(self.nodes[idx.0].id, idx);
    }

    pub(crate) fn insert_after(
        &mut self,
        prev: NodeIdx,
        id: SplitNodeId,
        value: V,
        removed_at: Option<TimeTicket>,
    ) -> NodeIdx {
        let idx = self.alloc(id, value, removed_at);
        self.link_after(prev, idx);
        idx
    }

    pub(crate) fn find_node(&self, id: &SplitNodeId) -> Option<NodeIdx> {
        self.by_id.get(id)
    }

    /// The surviving block covering `id`: greatest id at or below it sharing
    /// the creation ticket.
    fn find_floor(&self, id: SplitNodeId) -> Option<NodeIdx> {
        let (key, idx) = self.by_id.floor_entry(&id)?;
        if key.created_at == id.created_at {
            Some(idx)
        } else {
            None
        }
    }

    /// Floor lookup for position resolution. When the probe offset lands
    /// exactly on a block boundary the insertion chain is walked one step to
    /// the older half, so the position keeps naming the left side of a split.
    fn find_floor_prefer_left(&self, id: SplitNodeId) -> Result<NodeIdx> {
        let idx = self
            .find_floor(id)
            .ok_or_else(|| DocError::invalid_argument("position refers to a purged block"))?;
        if id.offset > 0 && self.node(idx).id.offset == id.offset {
            let ins_prev = self.node(idx).ins_prev;
            if ins_prev.exists() && !self.node(ins_prev).dead {
                return Ok(ins_prev);
            }
        }
        Ok(idx)
    }

    /// Splits the block at `offset` content units. No-op on either boundary.
    /// The newer half inherits the removal state and joins the insertion
    /// chain behind the older half.
    fn split_node(&mut self, idx: NodeIdx, offset: usize, delta: &mut DocDelta) -> Result<()> {
        let len = self.node(idx).value.content_len();
        if offset > len {
            return Err(DocError::invalid_argument("split offset out of range"));
        }
        if offset == 0 || offset == len {
            return Ok(());
        }
        let before = self.nodes[idx.0].value.data_size();
        let tail = self.nodes[idx.0].value.split_at(offset);
        let removed_at = self.nodes[idx.0].removed_at;
        let id = self.nodes[idx.0].id;
        let new_id = SplitNodeId::new(id.created_at, id.offset + offset as u32);

        let splay = self.nodes[idx.0].splay;
        self.index.update_len(splay, if removed_at.is_some() { 0 } else { offset });
        let left_size = self.nodes[idx.0].value.data_size();
        let right_size = tail.data_size();
        let new_idx = self.alloc(new_id, tail, removed_at);
        self.link_after(idx, new_idx);

        self.nodes[new_idx.0].ins_prev = idx;
        self.nodes[idx.0].ins_next = new_idx;

        // diff = size(left) + size(right) − size(original) + one id ticket;
        // a removed block also carries its removal ticket into the gc bucket.
        let mut grow = crate::resource::SizeDelta::default();
        grow.inc_by(left_size);
        grow.inc_by(right_size);
        grow.dec_by(before);
        grow.inc_by(DataSize::new(0, TIME_TICKET_SIZE));
        if removed_at.is_some() {
            grow.inc_by(DataSize::new(0, TIME_TICKET_SIZE));
            delta.gc += grow;
        } else {
            delta.live += grow;
        }
        Ok(())
    }

    /// Resolves `pos` to the insertion gap for an edit stamped `edited_at`:
    /// splits the floor block at the exact offset, then walks forward over
    /// concurrent blocks whose tickets are after the edit (the RGA
    /// tie-break). Returns (left, right) around the gap; right may be NONE at
    /// the end of the list.
    pub(crate) fn find_node_with_split(
        &mut self,
        pos: SplitPos,
        edited_at: TimeTicket,
        delta: &mut DocDelta,
    ) -> Result<(NodeIdx, NodeIdx)> {
        let abs = pos.absolute_id();
        let mut idx = self.find_floor_prefer_left(abs)?;
        let rel = (abs.offset - self.node(idx).id.offset) as usize;
        self.split_node(idx, rel, delta)?;
        while self.node(idx).next.exists()
            && self.node(self.node(idx).next).id.created_at.after(edited_at)
        {
            idx = self.node(idx).next;
        }
        Ok((idx, self.node(idx).next))
    }

    pub fn find_node_pos(&mut self, index: usize) -> Result<SplitPos> {
        let (splay, offset) = self
            .index
            .find(index)
            .ok_or_else(|| DocError::invalid_argument("index out of range"))?;
        let idx = self.index.value(splay);
        Ok(SplitPos::new(self.node(idx).id, offset as u32))
    }

    pub fn pos_to_index(&mut self, pos: SplitPos, prefer_left: bool) -> Result<usize> {
        let abs = pos.absolute_id();
        let idx = if prefer_left {
            self.find_floor_prefer_left(abs)?
        } else {
            self.find_floor(abs)
                .ok_or_else(|| DocError::invalid_argument("position refers to a purged block"))?
        };
        let rank = self.index.index_of(self.node(idx).splay);
        let offset = if self.node(idx).is_removed() {
            0
        } else {
            (abs.offset - self.node(idx).id.offset) as usize
        };
        Ok(rank + offset)
    }

    pub fn indexes_from_range(&mut self, from: SplitPos, to: SplitPos) -> Result<(usize, usize)> {
        Ok((self.pos_to_index(from, false)?, self.pos_to_index(to, true)?))
    }

    pub fn index_range_to_pos_range(&mut self, from: usize, to: usize) -> Result<(SplitPos, SplitPos)> {
        if from > to {
            return Err(DocError::invalid_argument("range start is after range end"));
        }
        Ok((self.find_node_pos(from)?, self.find_node_pos(to)?))
    }

    pub(crate) fn nodes_between(&self, from: NodeIdx, to: NodeIdx) -> SmallVec<[NodeIdx; 4]> {
        let mut out = SmallVec::new();
        let mut idx = from;
        while idx.exists() && idx != to {
            out.push(idx);
            idx = self.node(idx).next;
        }
        out
    }

    /// The contractual edit sequence: split at both ends, causally filter
    /// the blocks in between, emit per-run changes with pre-mutation
    /// indexes, insert the new block, tombstone and drop weights.
    pub fn edit(
        &mut self,
        range: (SplitPos, SplitPos),
        edited_at: TimeTicket,
        value: Option<V>,
        vv: Option<&VersionVector>,
    ) -> Result<EditOutcome<V>> {
        let mut delta = DocDelta::default();
        let (to_left, to_right) = self.find_node_with_split(range.1, edited_at, &mut delta)?;
        let (from_left, from_right) = self.find_node_with_split(range.0, edited_at, &mut delta)?;
        let candidates = self.nodes_between(from_right, to_right);

        let mut to_delete: SmallVec<[NodeIdx; 4]> = SmallVec::new();
        let mut bounds: SmallVec<[NodeIdx; 4]> = SmallVec::new();
        bounds.push(from_left);
        for &c in &candidates {
            let node = self.node(c);
            let client_lamport = match vv {
                Some(vv) => vv.get(node.id.created_at.actor()),
                None => u64::MAX,
            };
            if node.can_delete(edited_at, client_lamport) {
                to_delete.push(c);
            } else {
                bounds.push(c);
            }
        }
        bounds.push(to_right);

        // Maximal runs of deletable blocks sit between consecutive kept
        // boundaries. Indexes are taken before any weight drops.
        let mut runs: SmallVec<[(NodeIdx, NodeIdx); 2]> = SmallVec::new();
        for w in bounds.windows(2) {
            let (left, right) = (w[0], w[1]);
            if self.node(left).next != right {
                runs.push((left, right));
            }
        }
        let mut changes: Vec<ValueChange<V>> = Vec::new();
        for &(left, right) in &runs {
            let first = self.node(left).next;
            debug_assert!(first.exists());
            let from_idx = self.index.index_of(self.node(first).splay);
            let to_idx = if right.exists() {
                let last = self.node(right).prev;
                self.index.index_of(self.node(last).splay) + self.node(last).live_len()
            } else {
                self.index.total_weight()
            };
            if from_idx < to_idx {
                changes.push(ValueChange {
                    actor: edited_at.actor(),
                    from: from_idx,
                    to: to_idx,
                    value: None,
                });
            }
        }
        changes.reverse();

        let mut removed = Vec::with_capacity(to_delete.len());
        for &d in &to_delete {
            let newly = self.node(d).removed_at.is_none();
            self.node_mut(d).removed_at = Some(edited_at);
            if newly {
                let base = self.node(d).base_size();
                delta.live.dec_by(base);
                delta.gc.inc_by(base);
                delta.gc.inc_by(DataSize::new(0, TIME_TICKET_SIZE));
            }
            removed.push(RemovedBlock { id: self.node(d).id, value: self.node(d).value.clone() });
        }
        for &(left, right) in &runs {
            let right_splay = if right.exists() { self.node(right).splay } else { SplayIdx::NONE };
            let left_splay = self.node(left).splay;
            self.index.delete_range(left_splay, right_splay);
        }

        let mut caret = if to_right.exists() {
            SplitPos::new(self.node(to_right).id, 0)
        } else {
            SplitPos::new(self.node(to_left).id, self.node(to_left).value.content_len() as u32)
        };
        let mut inserted = None;
        // A block with this id already existing means the same change was
        // applied before; inserting again would fork the list.
        let fresh = self.by_id.get(&SplitNodeId::new(edited_at, 0)).is_none();
        if let (Some(value), true) = (value, fresh) {
            let before = SplitPos::new(
                self.node(from_left).id,
                self.node(from_left).value.content_len() as u32,
            );
            let insert_idx =
                self.index.index_of(self.node(from_left).splay) + self.node(from_left).live_len();
            let content_len = value.content_len();
            let change_value = value.clone();
            let new_id = SplitNodeId::new(edited_at, 0);
            let new_idx = self.insert_after(from_left, new_id, value, None);
            delta.live.inc_by(self.node(new_idx).base_size());
            match changes.last_mut() {
                Some(last) if last.from == insert_idx => last.value = Some(change_value),
                _ => changes.push(ValueChange {
                    actor: edited_at.actor(),
                    from: insert_idx,
                    to: insert_idx,
                    value: Some(change_value),
                }),
            }
            caret = SplitPos::new(new_id, content_len as u32);
            inserted = Some(InsertedBlock { id: new_id, content_len, before });
        }

        Ok(EditOutcome { caret, delta, changes, removed, inserted })
    }

    /// Unlinks a purged tombstone from the list, both indexes and the
    /// insertion chains. Returns the gc bytes released.
    pub fn purge(&mut self, id: SplitNodeId) -> Result<DataSize> {
        let idx = self
            .find_node(&id)
            .ok_or_else(|| DocError::invalid_argument("purge of an unknown block"))?;
        debug_assert!(self.node(idx).is_removed());
        let mut released = self.node(idx).base_size();
        released += DataSize::new(0, TIME_TICKET_SIZE);

        let prev = self.node(idx).prev;
        let next = self.node(idx).next;
        debug_assert!(prev.exists(), "the head block is never purged");
        self.nodes[prev.0].next = next;
        if next.exists() {
            self.nodes[next.0].prev = prev;
        }
        let ins_prev = self.node(idx).ins_prev;
        if ins_prev.exists() && !self.node(ins_prev).dead && self.node(ins_prev).ins_next == idx {
            self.nodes[ins_prev.0].ins_next = NodeIdx::NONE;
        }
        let ins_next = self.node(idx).ins_next;
        if ins_next.exists() && !self.node(ins_next).dead && self.node(ins_next).ins_prev == idx {
            self.nodes[ins_next.0].ins_prev = NodeIdx::NONE;
        }
        self.index.delete(self.node(idx).splay);
        self.by_id.remove(&id);

        let node = self.node_mut(idx);
        node.dead = true;
        node.value = V::default();
        node.prev = NodeIdx::NONE;
        node.next = NodeIdx::NONE;
        node.ins_prev = NodeIdx::NONE;
        node.ins_next = NodeIdx::NONE;
        Ok(released)
    }

    /// Blocks in document order, head excluded.
    pub(crate) fn iter(&self) -> SplitIter<'_, V> {
        SplitIter { list: self, idx: self.node(self.head).next }
    }

    pub fn live_size(&self) -> DataSize {
        let mut size = DataSize::default();
        for node in self.iter() {
            if !node.is_removed() {
                size += node.base_size();
            }
        }
        size
    }

    pub fn gc_size(&self) -> DataSize {
        let mut size = DataSize::default();
        for node in self.iter() {
            if node.is_removed() {
                size += node.base_size();
                size += DataSize::new(0, TIME_TICKET_SIZE);
            }
        }
        size
    }

    #[allow(unused)]
    pub fn check(&self) {
        let mut live = 0;
        let mut idx = self.head;
        let mut seen = 0;
        while idx.exists() {
            let node = self.node(idx);
            assert!(!node.dead);
            assert_eq!(self.by_id.get(&node.id), Some(idx));
            assert_eq!(self.index.value(node.splay), idx);
            assert_eq!(self.index.len_of(node.splay), node.live_len());
            live += node.live_len();
            seen += 1;
            if node.next.exists() {
                assert_eq!(self.node(node.next).prev, idx);
            }
            idx = node.next;
        }
        assert_eq!(live, self.index.total_weight());
        assert_eq!(seen, self.by_id.len());
    }
}

pub(crate) struct SplitIter<'a, V: SplitValue> {
    list: &'a RgaTreeSplit<V>,
    idx: NodeIdx,
}

impl<'a, V: SplitValue> Iterator for SplitIter<'a, V> {
    type Item = &'a SplitNode<V>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.idx.exists() {
            return None;
        }
        let node = self.list.node(self.idx);
        self.idx = node.next;
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{ACTOR_ID_SIZE, INITIAL_TIME_TICKET};

    #[derive(Debug, Clone, Default, PartialEq)]
    struct Chunk(String);

    impl SplitValue for Chunk {
        fn content_len(&self) -> usize {
            self.0.chars().count()
        }

        fn split_at(&mut self, offset: usize) -> Self {
            let byte = self.0.char_indices().nth(offset).map(|(b, _)| b).unwrap_or(self.0.len());
            Chunk(self.0.split_off(byte))
        }

        fn data_size(&self) -> DataSize {
            DataSize::new(self.0.len(), 0)
        }
    }

    fn actor(n: u8) -> ActorId {
        let mut bytes = [0u8; ACTOR_ID_SIZE];
        bytes[ACTOR_ID_SIZE - 1] = n;
        ActorId::from_bytes(bytes)
    }

    fn ticket(lamport: u64, delim: u32, a: u8) -> TimeTicket {
        TimeTicket::new(lamport, delim, actor(a))
    }

    fn content(list: &RgaTreeSplit<Chunk>) -> String {
        list.iter().filter(|n| !n.is_removed()).map(|n| n.value.0.clone()).collect()
    }

    fn head_pos() -> SplitPos {
        SplitPos::new(SplitNodeId::new(INITIAL_TIME_TICKET, 0), 0)
    }

    fn edit_at(
        list: &mut RgaTreeSplit<Chunk>,
        from: usize,
        to: usize,
        text: &str,
        at: TimeTicket,
    ) -> EditOutcome<Chunk> {
        let range = list.index_range_to_pos_range(from, to).unwrap();
        let value = if text.is_empty() { None } else { Some(Chunk(text.into())) };
        list.edit(range, at, value, None).unwrap()
    }

    #[test]
    fn insert_and_delete() {
        let mut list: RgaTreeSplit<Chunk> = RgaTreeSplit::new();
        edit_at(&mut list, 0, 0, "hello", ticket(1, 1, 1));
        assert_eq!(content(&list), "hello");
        assert_eq!(list.content_len(), 5);

        edit_at(&mut list, 5, 5, " world", ticket(2, 1, 1));
        assert_eq!(content(&list), "hello world");

        let out = edit_at(&mut list, 4, 7, "", ticket(3, 1, 1));
        assert_eq!(content(&list), "hellorld");
        assert_eq!(out.changes.len(), 1);
        assert_eq!((out.changes[0].from, out.changes[0].to), (4, 7));
        list.check();
    }

    #[test]
    fn replace_merges_into_one_change() {
        let mut list: RgaTreeSplit<Chunk> = RgaTreeSplit::new();
        edit_at(&mut list, 0, 0, "abcdef", ticket(1, 1, 1));
        let out = edit_at(&mut list, 2, 5, "XY", ticket(2, 1, 1));
        assert_eq!(content(&list), "abXYf");
        assert_eq!(out.changes.len(), 1);
        let change = &out.changes[0];
        assert_eq!((change.from, change.to), (2, 5));
        assert_eq!(change.value.as_ref().unwrap().0, "XY");
        list.check();
    }

    #[test]
    fn index_pos_round_trip() {
        let mut list: RgaTreeSplit<Chunk> = RgaTreeSplit::new();
        edit_at(&mut list, 0, 0, "abc", ticket(1, 1, 1));
        edit_at(&mut list, 1, 2, "", ticket(2, 1, 1)); // tombstone "b"
        edit_at(&mut list, 1, 1, "xy", ticket(3, 1, 1));
        assert_eq!(content(&list), "axyc");
        for i in 0..=list.content_len() {
            let pos = list.find_node_pos(i).unwrap();
            assert_eq!(list.pos_to_index(pos, false).unwrap(), i, "round trip at {}", i);
        }
        list.check();
    }

    #[test]
    fn concurrent_inserts_converge() {
        // Same-position inserts from two actors apply in either order and
        // agree: the later ticket takes the slot next to the anchor.
        let a_at = ticket(1, 1, 1);
        let b_at = ticket(1, 1, 2);

        let mut one: RgaTreeSplit<Chunk> = RgaTreeSplit::new();
        one.edit((head_pos(), head_pos()), a_at, Some(Chunk("a".into())), None).unwrap();
        let vv = VersionVector::new();
        one.edit((head_pos(), head_pos()), b_at, Some(Chunk("b".into())), Some(&vv)).unwrap();

        let mut two: RgaTreeSplit<Chunk> = RgaTreeSplit::new();
        two.edit((head_pos(), head_pos()), b_at, Some(Chunk("b".into())), None).unwrap();
        two.edit((head_pos(), head_pos()), a_at, Some(Chunk("a".into())), Some(&vv)).unwrap();

        assert_eq!(content(&one), content(&two));
        assert_eq!(content(&one), "ba");
        one.check();
        two.check();
    }

    #[test]
    fn unseen_blocks_survive_concurrent_delete() {
        // Remote delete with a version vector that has not seen a
        // concurrent insert keeps the insert.
        let mut list: RgaTreeSplit<Chunk> = RgaTreeSplit::new();
        edit_at(&mut list, 0, 0, "hello", ticket(1, 1, 1));
        edit_at(&mut list, 3, 3, "X", ticket(2, 1, 2));
        assert_eq!(content(&list), "helXlo");

        // Deleter saw lamport 1 from actor 1 and nothing from actor 2.
        let mut vv = VersionVector::new();
        vv.set(actor(1), 1);
        vv.set(actor(3), 2);
        let range = list.index_range_to_pos_range(1, 5).unwrap();
        list.edit(range, ticket(2, 1, 3), None, Some(&vv)).unwrap();
        assert_eq!(content(&list), "hXo");
        list.check();
    }

    #[test]
    fn double_delete_is_idempotent() {
        let mut list: RgaTreeSplit<Chunk> = RgaTreeSplit::new();
        edit_at(&mut list, 0, 0, "abc", ticket(1, 1, 1));
        let range = list.index_range_to_pos_range(0, 3).unwrap();
        let del_at = ticket(2, 1, 1);
        let first = list.edit(range, del_at, None, None).unwrap();
        assert_eq!(first.removed.len(), 1);
        // The same delete applied again finds nothing left to do.
        let again = list.edit(range, del_at, None, None).unwrap();
        assert!(again.removed.is_empty());
        assert!(again.changes.is_empty());
        assert_eq!(content(&list), "");
        list.check();
    }

    #[test]
    fn purge_unlinks_tombstones() {
        let mut list: RgaTreeSplit<Chunk> = RgaTreeSplit::new();
        edit_at(&mut list, 0, 0, "abc", ticket(1, 1, 1));
        let out = edit_at(&mut list, 1, 2, "", ticket(2, 1, 1));
        assert_eq!(out.removed.len(), 1);
        let id = out.removed[0].id;
        assert_eq!(list.gc_size(), DataSize::new(1, 2 * TIME_TICKET_SIZE));

        let released = list.purge(id).unwrap();
        assert_eq!(released, DataSize::new(1, 2 * TIME_TICKET_SIZE));
        assert_eq!(content(&list), "ac");
        assert_eq!(list.gc_size(), DataSize::default());
        list.check();

        for i in 0..=list.content_len() {
            let pos = list.find_node_pos(i).unwrap();
            assert_eq!(list.pos_to_index(pos, false).unwrap(), i);
        }
    }
}
