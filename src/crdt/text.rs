//! Rich text: the split list specialised to styled string blocks.

use std::collections::BTreeMap;

use serde_json::{Map as JsonMap, Value as JsonValue};
use smartstring::alias::String as SmartString;

use crate::crdt::rht::{Rht, RhtRemoveEffect, RhtSetEffect};
use crate::crdt::split_list::{
    RgaTreeSplit, SplitNodeId, SplitPos, SplitValue,
};
use crate::error::Result;
use crate::resource::{DataSize, DocDelta, DocSize};
use crate::time::{ActorId, TimeTicket, VersionVector, TIME_TICKET_SIZE};

pub type Attrs = BTreeMap<SmartString, SmartString>;
/// Style payload; `None` erases the attribute.
pub type StyleAttrs = BTreeMap<SmartString, Option<SmartString>>;

/// Byte offset of the n-th char boundary.
pub(crate) fn chars_to_bytes(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map(|(b, _)| b).unwrap_or(s.len())
}

/// Content of one text block: a string plus its attribute table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrdtTextValue {
    content: SmartString,
    attrs: Rht,
}

impl CrdtTextValue {
    pub fn new(content: &str, attrs: Option<&Attrs>, ticket: TimeTicket) -> CrdtTextValue {
        let mut value = CrdtTextValue { content: SmartString::from(content), attrs: Rht::new() };
        if let Some(attrs) = attrs {
            for (key, val) in attrs {
                value.attrs.set(key, val, ticket);
            }
        }
        value
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn attrs(&self) -> &Rht {
        &self.attrs
    }

    pub fn live_attrs(&self) -> Attrs {
        self.attrs
            .iter_live()
            .map(|(k, v)| (SmartString::from(k), SmartString::from(v)))
            .collect()
    }
}

impl SplitValue for CrdtTextValue {
    fn content_len(&self) -> usize {
        self.content.chars().count()
    }

    // Splitting clones the attribute table into the tail: both halves carry
    // the styles that covered the original block.
    fn split_at(&mut self, offset: usize) -> Self {
        let byte = chars_to_bytes(&self.content, offset);
        let tail = SmartString::from(&self.content[byte..]);
        self.content.truncate(byte);
        CrdtTextValue { content: tail, attrs: self.attrs.clone() }
    }

    fn data_size(&self) -> DataSize {
        let mut size = DataSize::new(self.content.len(), 0);
        size += self.attrs.data_size();
        size
    }
}

/// One user-visible edit produced while applying an Edit operation.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChange {
    pub actor: ActorId,
    pub from: usize,
    pub to: usize,
    pub content: SmartString,
    pub attrs: Option<Attrs>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StyleChange {
    pub actor: ActorId,
    pub from: usize,
    pub to: usize,
    pub attrs: StyleAttrs,
}

/// GC bookkeeping produced by a style pass.
#[derive(Debug, Clone)]
pub enum AttrGc {
    /// A live attribute node lost LWW and was detached.
    Detached { node: SplitNodeId, key: SmartString, value_len: usize, updated_at: TimeTicket },
    /// An attribute was tombstoned in place (register or refresh its pair).
    Removed { node: SplitNodeId, key: SmartString, value_len: usize },
    /// A pending tombstone was revived by a later set; its pair retires.
    Retired { node: SplitNodeId, key: SmartString },
}

/// Undo trail entries captured during edit/style.
#[derive(Debug, Clone)]
pub enum ReverseEdit {
    DeleteInserted { from: SplitPos, to: SplitPos },
    Restore { at: SplitPos, content: SmartString, attrs: Attrs },
}

#[derive(Debug, Clone)]
pub struct ReverseStyle {
    pub from: SplitPos,
    pub to: SplitPos,
    pub attrs: StyleAttrs,
}

#[derive(Debug)]
pub struct TextEditOutcome {
    pub caret: SplitPos,
    pub delta: DocDelta,
    pub changes: Vec<TextChange>,
    /// Tombstoned blocks awaiting GC, with their removal ticket.
    pub gc: Vec<(SplitNodeId, TimeTicket)>,
    pub reverse: Vec<ReverseEdit>,
}

#[derive(Debug)]
pub struct TextStyleOutcome {
    pub delta: DocDelta,
    pub changes: Vec<StyleChange>,
    pub gc: Vec<AttrGc>,
    pub reverse: Vec<ReverseStyle>,
}

#[derive(Debug, Clone, Default)]
pub struct CrdtText {
    rga: RgaTreeSplit<CrdtTextValue>,
}

impl CrdtText {
    pub fn new() -> CrdtText {
        CrdtText::default()
    }

    pub fn content_len(&self) -> usize {
        self.rga.content_len()
    }

    pub fn index_range_to_pos_range(&mut self, from: usize, to: usize) -> Result<(SplitPos, SplitPos)> {
        self.rga.index_range_to_pos_range(from, to)
    }

    pub fn indexes_from_range(&mut self, from: SplitPos, to: SplitPos) -> Result<(usize, usize)> {
        self.rga.indexes_from_range(from, to)
    }

    pub fn edit(
        &mut self,
        range: (SplitPos, SplitPos),
        content: &str,
        attrs: Option<&Attrs>,
        edited_at: TimeTicket,
        vv: Option<&VersionVector>,
    ) -> Result<TextEditOutcome> {
        let value = if content.is_empty() {
            None
        } else {
            Some(CrdtTextValue::new(content, attrs, edited_at))
        };
        let out = self.rga.edit(range, edited_at, value, vv)?;

        let changes = out
            .changes
            .into_iter()
            .map(|c| TextChange {
                actor: c.actor,
                from: c.from,
                to: c.to,
                content: c.value.as_ref().map(|v| v.content.clone()).unwrap_or_default(),
                attrs: c.value.is_some().then(|| attrs.cloned().unwrap_or_default()),
            })
            .collect();

        let mut reverse = Vec::new();
        if let Some(inserted) = &out.inserted {
            reverse.push(ReverseEdit::DeleteInserted {
                from: inserted.before,
                to: SplitPos::new(inserted.id, inserted.content_len as u32),
            });
        }
        let mut gc = Vec::with_capacity(out.removed.len());
        for block in &out.removed {
            gc.push((block.id, edited_at));
            reverse.push(ReverseEdit::Restore {
                at: SplitPos::new(block.id, 0),
                content: block.value.content.clone(),
                attrs: block.value.live_attrs(),
            });
        }

        Ok(TextEditOutcome { caret: out.caret, delta: out.delta, changes, gc, reverse })
    }

    pub fn set_style(
        &mut self,
        range: (SplitPos, SplitPos),
        attrs: &StyleAttrs,
        edited_at: TimeTicket,
        vv: Option<&VersionVector>,
    ) -> Result<TextStyleOutcome> {
        let mut delta = DocDelta::default();
        let (_, to_right) = self.rga.find_node_with_split(range.1, edited_at, &mut delta)?;
        let (_, from_right) = self.rga.find_node_with_split(range.0, edited_at, &mut delta)?;

        let mut targets = Vec::new();
        for idx in self.rga.nodes_between(from_right, to_right) {
            let node = self.rga.node(idx);
            let client_lamport = match vv {
                Some(vv) => vv.get(node.id.created_at.actor()),
                None => u64::MAX,
            };
            if node.can_style(edited_at, client_lamport) {
                targets.push(idx);
            }
        }

        let mut changes = Vec::new();
        let mut gc = Vec::new();
        let mut reverse = Vec::new();
        for idx in targets {
            if self.rga.node(idx).is_removed() {
                continue;
            }
            let node_id = self.rga.node(idx).id;
            let len = self.rga.node(idx).value.content_len();
            let pos_range = (SplitPos::new(node_id, 0), SplitPos::new(node_id, len as u32));
            let (from_idx, to_idx) = self.rga.indexes_from_range(pos_range.0, pos_range.1)?;

            let mut prev_attrs = StyleAttrs::new();
            for key in attrs.keys() {
                let prev = self.rga.node(idx).value.attrs.get(key).map(SmartString::from);
                prev_attrs.insert(key.clone(), prev);
            }
            reverse.push(ReverseStyle { from: pos_range.0, to: pos_range.1, attrs: prev_attrs });

            for (key, val) in attrs {
                let value = &mut self.rga.node_value_mut(idx).attrs;
                match val {
                    Some(val) => match value.set(key, val, edited_at) {
                        RhtSetEffect::Created => {
                            delta.live.inc_by(DataSize::new(val.len(), TIME_TICKET_SIZE));
                        }
                        RhtSetEffect::ReplacedLive { prev } => {
                            let prev_size = prev.data_size();
                            delta.live.dec_by(prev_size);
                            delta.gc.inc_by(prev_size);
                            delta.live.inc_by(DataSize::new(val.len(), TIME_TICKET_SIZE));
                            gc.push(AttrGc::Detached {
                                node: node_id,
                                key: key.clone(),
                                value_len: prev.value.len(),
                                updated_at: prev.updated_at,
                            });
                        }
                        RhtSetEffect::ReplacedTombstone { prev_value_len } => {
                            delta.gc.dec_by(DataSize::new(prev_value_len, TIME_TICKET_SIZE));
                            delta.live.inc_by(DataSize::new(val.len(), TIME_TICKET_SIZE));
                            gc.push(AttrGc::Retired { node: node_id, key: key.clone() });
                        }
                        RhtSetEffect::Ignored => {}
                    },
                    None => match value.remove(key, edited_at) {
                        RhtRemoveEffect::Tombstoned { value_len } => {
                            let size = DataSize::new(value_len, TIME_TICKET_SIZE);
                            delta.live.dec_by(size);
                            delta.gc.inc_by(size);
                            gc.push(AttrGc::Removed { node: node_id, key: key.clone(), value_len });
                        }
                        RhtRemoveEffect::Refreshed { value_len } => {
                            gc.push(AttrGc::Removed { node: node_id, key: key.clone(), value_len });
                        }
                        RhtRemoveEffect::Ignored => {}
                    },
                }
            }
            changes.push(StyleChange {
                actor: edited_at.actor(),
                from: from_idx,
                to: to_idx,
                attrs: attrs.clone(),
            });
        }

        Ok(TextStyleOutcome { delta, changes, gc, reverse })
    }

    /// Appends a pre-ticketed block; used when materialising a captured text
    /// subtree.
    pub(crate) fn append_block(
        &mut self,
        created_at: TimeTicket,
        content: &str,
        attrs: Option<&Attrs>,
    ) -> DocDelta {
        let tail = self.rga.last_node();
        let value = CrdtTextValue::new(content, attrs, created_at);
        let idx = self.rga.insert_after(tail, SplitNodeId::new(created_at, 0), value, None);
        let mut delta = DocDelta::default();
        delta.live.inc_by(self.rga.node(idx).value.data_size());
        delta.live.inc_by(DataSize::new(0, TIME_TICKET_SIZE));
        delta
    }

    pub fn purge_block(&mut self, id: SplitNodeId) -> Result<DataSize> {
        self.rga.purge(id)
    }

    /// Drops an attribute tombstone, if the removal ticket still matches.
    pub fn purge_attr(&mut self, node: SplitNodeId, key: &str, removed_at: TimeTicket) -> Option<DataSize> {
        let idx = self.rga.find_node(&node)?;
        let value = self.rga.node_value_mut(idx);
        value
            .attrs
            .purge_removed(key, removed_at)
            .map(|len| DataSize::new(len, TIME_TICKET_SIZE))
    }

    /// Live blocks with their styles, in order; used to capture a text
    /// subtree for the undo trail.
    pub fn live_blocks(&self) -> Vec<(SmartString, Attrs)> {
        self.rga
            .iter()
            .filter(|n| !n.is_removed())
            .map(|n| (SmartString::from(n.value.content()), n.value.live_attrs()))
            .collect()
    }

    pub fn to_string(&self) -> String {
        let mut out = String::new();
        for node in self.rga.iter() {
            if !node.is_removed() {
                out.push_str(node.value.content());
            }
        }
        out
    }

    /// Canonical JSON view: adjacent blocks carrying identical styles merge,
    /// so the internal segmentation never leaks into the rendered document.
    pub fn to_json(&self) -> JsonValue {
        let mut runs: Vec<(Attrs, String)> = Vec::new();
        for node in self.rga.iter() {
            if node.is_removed() {
                continue;
            }
            let attrs = node.value.live_attrs();
            match runs.last_mut() {
                Some((prev, content)) if *prev == attrs => content.push_str(node.value.content()),
                _ => runs.push((attrs, node.value.content().to_string())),
            }
        }
        let mut blocks = Vec::new();
        for (attrs, content) in runs {
            let mut block = JsonMap::new();
            if !attrs.is_empty() {
                let mut json_attrs = JsonMap::new();
                for (key, value) in &attrs {
                    json_attrs.insert(key.to_string(), JsonValue::String(value.to_string()));
                }
                block.insert("attrs".into(), JsonValue::Object(json_attrs));
            }
            block.insert("val".into(), JsonValue::String(content));
            blocks.push(JsonValue::Object(block));
        }
        JsonValue::Array(blocks)
    }

    /// Size of the live portion, excluding the owning element's own ticket.
    pub fn live_size(&self) -> DataSize {
        self.rga.live_size()
    }

    pub fn gc_size(&self) -> DataSize {
        self.rga.gc_size()
    }

    pub fn doc_size(&self) -> DocSize {
        DocSize { live: self.live_size(), gc: self.gc_size() }
    }

    #[allow(unused)]
    pub fn check(&self) {
        self.rga.check();
    }
}
