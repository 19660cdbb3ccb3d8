//! Typed operations over the CRDTs.
//!
//! Every operation addresses its parent by creation ticket and carries its
//! own `executed_at`. Executing an operation mutates the root, feeds the
//! size accountant and the GC pair map, and reports user-visible op infos
//! plus the reverse operations the undo stack keeps.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use smartstring::alias::String as SmartString;

use crate::change::ChangeContext;
use crate::crdt::array::CrdtArray;
use crate::crdt::element::{CrdtCounter, CrdtElement, CrdtValue, PrimitiveValue};
use crate::crdt::object::{CrdtObject, MemberSet};
use crate::crdt::root::{CrdtRoot, GcPair, GcTarget};
use crate::crdt::split_list::SplitPos;
use crate::crdt::text::{Attrs, CrdtText, ReverseEdit, StyleAttrs};
use crate::error::{DocError, Result};
use crate::resource::{DocDelta, SizeDelta};
use crate::time::{ActorId, TimeTicket, VersionVector, INITIAL_TIME_TICKET};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpSource {
    Local,
    Remote,
    UndoRedo,
}

/// A detached element payload. Seeds carry per-node creation tickets issued
/// when the operation was built; undo replay re-tickets them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementSeed {
    pub created_at: TimeTicket,
    pub kind: SeedKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SeedKind {
    Primitive(PrimitiveValue),
    Counter(i64),
    Object(Vec<(SmartString, ElementSeed)>),
    Array(Vec<ElementSeed>),
    Text(Vec<TextChunkSeed>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextChunkSeed {
    pub created_at: TimeTicket,
    pub content: SmartString,
    pub attrs: Attrs,
}

impl ElementSeed {
    pub fn primitive(value: PrimitiveValue, created_at: TimeTicket) -> ElementSeed {
        ElementSeed { created_at, kind: SeedKind::Primitive(value) }
    }

    pub fn counter(value: i64, created_at: TimeTicket) -> ElementSeed {
        ElementSeed { created_at, kind: SeedKind::Counter(value) }
    }

    pub fn object(created_at: TimeTicket) -> ElementSeed {
        ElementSeed { created_at, kind: SeedKind::Object(Vec::new()) }
    }

    pub fn array(created_at: TimeTicket) -> ElementSeed {
        ElementSeed { created_at, kind: SeedKind::Array(Vec::new()) }
    }

    pub fn text(created_at: TimeTicket) -> ElementSeed {
        ElementSeed { created_at, kind: SeedKind::Text(Vec::new()) }
    }

    /// Registers the seeded element (and its subtree) with the registry.
    /// Returns false when the ticket is already registered, which makes
    /// replays of the same change no-ops.
    pub(crate) fn materialize(
        &self,
        root: &mut CrdtRoot,
        parent: TimeTicket,
        key: &str,
    ) -> Result<bool> {
        if root.contains(self.created_at) {
            return Ok(false);
        }
        let value = match &self.kind {
            SeedKind::Primitive(p) => CrdtValue::Primitive(p.clone()),
            SeedKind::Counter(v) => CrdtValue::Counter(CrdtCounter::new(*v)),
            SeedKind::Object(_) => CrdtValue::Object(CrdtObject::new()),
            SeedKind::Array(_) => CrdtValue::Array(CrdtArray::new()),
            SeedKind::Text(chunks) => {
                let mut text = CrdtText::new();
                for chunk in chunks {
                    let attrs = (!chunk.attrs.is_empty()).then_some(&chunk.attrs);
                    text.append_block(chunk.created_at, &chunk.content, attrs);
                }
                CrdtValue::Text(text)
            }
        };
        root.register_element(CrdtElement::new(self.created_at, value), Some(parent), key);

        match &self.kind {
            SeedKind::Object(entries) => {
                for (child_key, child) in entries {
                    child.materialize(root, self.created_at, child_key)?;
                    root.object_mut(self.created_at)?.set(child_key, child.created_at);
                }
            }
            SeedKind::Array(entries) => {
                let mut prev = INITIAL_TIME_TICKET;
                for child in entries {
                    child.materialize(root, self.created_at, "")?;
                    root.array_mut(self.created_at)?.insert_after(
                        prev,
                        child.created_at,
                        child.created_at,
                    )?;
                    prev = child.created_at;
                }
            }
            _ => {}
        }
        Ok(true)
    }

    pub(crate) fn refresh(&mut self, ctx: &mut ChangeContext) {
        self.created_at = ctx.issue_time_ticket();
        match &mut self.kind {
            SeedKind::Object(entries) => {
                for (_, child) in entries {
                    child.refresh(ctx);
                }
            }
            SeedKind::Array(entries) => {
                for child in entries {
                    child.refresh(ctx);
                }
            }
            SeedKind::Text(chunks) => {
                for chunk in chunks {
                    chunk.created_at = ctx.issue_time_ticket();
                }
            }
            _ => {}
        }
    }

    fn set_actor(&mut self, from: ActorId, to: ActorId) {
        if self.created_at.actor() == from && self.created_at.lamport() > 0 {
            self.created_at = self.created_at.with_actor(to);
        }
        match &mut self.kind {
            SeedKind::Object(entries) => {
                for (_, child) in entries {
                    child.set_actor(from, to);
                }
            }
            SeedKind::Array(entries) => {
                for child in entries {
                    child.set_actor(from, to);
                }
            }
            SeedKind::Text(chunks) => {
                for chunk in chunks {
                    if chunk.created_at.actor() == from && chunk.created_at.lamport() > 0 {
                        chunk.created_at = chunk.created_at.with_actor(to);
                    }
                }
            }
            _ => {}
        }
    }

    /// Snapshots the live state of an element for the undo trail. Tickets
    /// are placeholders until `refresh` runs.
    pub(crate) fn capture(root: &CrdtRoot, ticket: TimeTicket) -> Result<ElementSeed> {
        let elem = root.element(ticket)?;
        let kind = match elem.value() {
            CrdtValue::Primitive(p) => SeedKind::Primitive(p.clone()),
            CrdtValue::Counter(c) => SeedKind::Counter(c.value()),
            CrdtValue::Object(obj) => {
                let mut entries = Vec::new();
                for (key, child) in obj.iter() {
                    if let Ok(child_elem) = root.element(child) {
                        if !child_elem.is_removed() {
                            entries.push((key.clone(), ElementSeed::capture(root, child)?));
                        }
                    }
                }
                SeedKind::Object(entries)
            }
            CrdtValue::Array(arr) => {
                let mut entries = Vec::new();
                for child in arr.iter_live() {
                    if let Ok(child_elem) = root.element(child) {
                        if !child_elem.is_removed() {
                            entries.push(ElementSeed::capture(root, child)?);
                        }
                    }
                }
                SeedKind::Array(entries)
            }
            CrdtValue::Text(text) => SeedKind::Text(
                text.live_blocks()
                    .into_iter()
                    .map(|(content, attrs)| TextChunkSeed {
                        created_at: INITIAL_TIME_TICKET,
                        content,
                        attrs,
                    })
                    .collect(),
            ),
        };
        Ok(ElementSeed { created_at: INITIAL_TIME_TICKET, kind })
    }
}

/// User-visible description of an applied operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OpInfo {
    pub path: String,
    pub detail: OpDetail,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OpDetail {
    Set { key: SmartString },
    Remove { key: SmartString },
    Add { index: usize },
    Move { index: usize },
    ArraySet { index: usize },
    Increase { value: i64 },
    Edit { from: usize, to: usize, content: SmartString },
    Style { from: usize, to: usize, attributes: StyleAttrs },
}

#[derive(Debug, Default)]
pub struct OpOutcome {
    pub op_infos: SmallVec<[OpInfo; 1]>,
    pub reverse_ops: Vec<Operation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    Set {
        parent_created_at: TimeTicket,
        key: SmartString,
        value: ElementSeed,
        executed_at: TimeTicket,
    },
    Remove {
        parent_created_at: TimeTicket,
        created_at: TimeTicket,
        executed_at: TimeTicket,
    },
    Increase {
        parent_created_at: TimeTicket,
        value: i64,
        executed_at: TimeTicket,
    },
    Edit {
        parent_created_at: TimeTicket,
        from: SplitPos,
        to: SplitPos,
        content: SmartString,
        attributes: Attrs,
        executed_at: TimeTicket,
    },
    Style {
        parent_created_at: TimeTicket,
        from: SplitPos,
        to: SplitPos,
        attributes: StyleAttrs,
        executed_at: TimeTicket,
    },
    Add {
        parent_created_at: TimeTicket,
        prev_created_at: TimeTicket,
        value: ElementSeed,
        executed_at: TimeTicket,
    },
    Move {
        parent_created_at: TimeTicket,
        prev_created_at: TimeTicket,
        created_at: TimeTicket,
        executed_at: TimeTicket,
    },
    ArraySet {
        parent_created_at: TimeTicket,
        created_at: TimeTicket,
        value: ElementSeed,
        executed_at: TimeTicket,
    },
}

fn route_to_gc(mut delta: DocDelta) -> DocDelta {
    delta.gc += delta.live;
    delta.live = SizeDelta::default();
    delta
}

impl Operation {
    pub fn executed_at(&self) -> TimeTicket {
        match self {
            Operation::Set { executed_at, .. }
            | Operation::Remove { executed_at, .. }
            | Operation::Increase { executed_at, .. }
            | Operation::Edit { executed_at, .. }
            | Operation::Style { executed_at, .. }
            | Operation::Add { executed_at, .. }
            | Operation::Move { executed_at, .. }
            | Operation::ArraySet { executed_at, .. } => *executed_at,
        }
    }

    pub fn parent_created_at(&self) -> TimeTicket {
        match self {
            Operation::Set { parent_created_at, .. }
            | Operation::Remove { parent_created_at, .. }
            | Operation::Increase { parent_created_at, .. }
            | Operation::Edit { parent_created_at, .. }
            | Operation::Style { parent_created_at, .. }
            | Operation::Add { parent_created_at, .. }
            | Operation::Move { parent_created_at, .. }
            | Operation::ArraySet { parent_created_at, .. } => *parent_created_at,
        }
    }

    /// The element whose lifetime bounds this operation.
    pub fn effected_created_at(&self) -> TimeTicket {
        match self {
            Operation::Set { value, .. }
            | Operation::Add { value, .. }
            | Operation::ArraySet { value, .. } => value.created_at,
            Operation::Remove { created_at, .. } | Operation::Move { created_at, .. } => {
                *created_at
            }
            _ => self.parent_created_at(),
        }
    }

    /// Re-stamps the operation with fresh tickets from an undo context.
    pub(crate) fn refresh(&mut self, ctx: &mut ChangeContext) {
        let ticket = ctx.issue_time_ticket();
        match self {
            Operation::Set { executed_at, value, .. }
            | Operation::Add { executed_at, value, .. }
            | Operation::ArraySet { executed_at, value, .. } => {
                *executed_at = ticket;
                value.refresh(ctx);
            }
            Operation::Remove { executed_at, .. }
            | Operation::Increase { executed_at, .. }
            | Operation::Edit { executed_at, .. }
            | Operation::Style { executed_at, .. }
            | Operation::Move { executed_at, .. } => *executed_at = ticket,
        }
    }

    /// Rewrites tickets minted by a detached client once an actor is
    /// assigned. Head references (lamport 0) are never rewritten.
    pub(crate) fn set_actor(&mut self, from: ActorId, to: ActorId) {
        fn rewrite(t: &mut TimeTicket, from: ActorId, to: ActorId) {
            if t.actor() == from && t.lamport() > 0 {
                *t = t.with_actor(to);
            }
        }
        fn rewrite_pos(p: &mut SplitPos, from: ActorId, to: ActorId) {
            if p.id.created_at.actor() == from && p.id.created_at.lamport() > 0 {
                p.id.created_at = p.id.created_at.with_actor(to);
            }
        }
        match self {
            Operation::Set { parent_created_at, value, executed_at, .. } => {
                rewrite(parent_created_at, from, to);
                rewrite(executed_at, from, to);
                value.set_actor(from, to);
            }
            Operation::Remove { parent_created_at, created_at, executed_at } => {
                rewrite(parent_created_at, from, to);
                rewrite(created_at, from, to);
                rewrite(executed_at, from, to);
            }
            Operation::Increase { parent_created_at, executed_at, .. } => {
                rewrite(parent_created_at, from, to);
                rewrite(executed_at, from, to);
            }
            Operation::Edit { parent_created_at, from: f, to: t, executed_at, .. } => {
                rewrite(parent_created_at, from, to);
                rewrite_pos(f, from, to);
                rewrite_pos(t, from, to);
                rewrite(executed_at, from, to);
            }
            Operation::Style { parent_created_at, from: f, to: t, executed_at, .. } => {
                rewrite(parent_created_at, from, to);
                rewrite_pos(f, from, to);
                rewrite_pos(t, from, to);
                rewrite(executed_at, from, to);
            }
            Operation::Add { parent_created_at, prev_created_at, value, executed_at } => {
                rewrite(parent_created_at, from, to);
                rewrite(prev_created_at, from, to);
                rewrite(executed_at, from, to);
                value.set_actor(from, to);
            }
            Operation::Move { parent_created_at, prev_created_at, created_at, executed_at } => {
                rewrite(parent_created_at, from, to);
                rewrite(prev_created_at, from, to);
                rewrite(created_at, from, to);
                rewrite(executed_at, from, to);
            }
            Operation::ArraySet { parent_created_at, created_at, value, executed_at } => {
                rewrite(parent_created_at, from, to);
                rewrite(created_at, from, to);
                rewrite(executed_at, from, to);
                value.set_actor(from, to);
            }
        }
    }

    pub fn execute(
        &self,
        root: &mut CrdtRoot,
        source: OpSource,
        vv: Option<&VersionVector>,
    ) -> Result<OpOutcome> {
        let want_reverse = source != OpSource::Remote;
        match self {
            Operation::Set { parent_created_at, key, value, executed_at } => {
                let path = root.create_path(*parent_created_at)?;
                let prev = root.object(*parent_created_at)?.get(key);
                let reverse = if want_reverse {
                    match prev {
                        Some(prev_ticket)
                            if root
                                .element(prev_ticket)
                                .map(|e| !e.is_removed())
                                .unwrap_or(false) =>
                        {
                            Some(Operation::Set {
                                parent_created_at: *parent_created_at,
                                key: key.clone(),
                                value: ElementSeed::capture(root, prev_ticket)?,
                                executed_at: *executed_at,
                            })
                        }
                        _ => Some(Operation::Remove {
                            parent_created_at: *parent_created_at,
                            created_at: value.created_at,
                            executed_at: *executed_at,
                        }),
                    }
                } else {
                    None
                };

                value.materialize(root, *parent_created_at, key)?;
                match root.object_mut(*parent_created_at)?.set(key, value.created_at) {
                    MemberSet::Inserted => {}
                    MemberSet::ReplacedOld { old } => {
                        root.remove_element(old, value.created_at);
                    }
                    MemberSet::NewLost { winner } => {
                        root.remove_element(value.created_at, winner);
                    }
                }
                let mut outcome = OpOutcome::default();
                outcome
                    .op_infos
                    .push(OpInfo { path, detail: OpDetail::Set { key: key.clone() } });
                outcome.reverse_ops.extend(reverse);
                Ok(outcome)
            }

            Operation::Remove { parent_created_at, created_at, executed_at } => {
                let path = root.create_path(*parent_created_at)?;
                let (detail, reverse) = match root.element(*parent_created_at)?.value() {
                    CrdtValue::Object(obj) => {
                        let key = obj.key_of(*created_at).cloned().ok_or_else(|| {
                            DocError::invalid_argument("element is not a member")
                        })?;
                        let reverse = if want_reverse {
                            Some(Operation::Set {
                                parent_created_at: *parent_created_at,
                                key: key.clone(),
                                value: ElementSeed::capture(root, *created_at)?,
                                executed_at: *executed_at,
                            })
                        } else {
                            None
                        };
                        (OpDetail::Remove { key }, reverse)
                    }
                    CrdtValue::Array(arr) => {
                        let prev = arr.prev_created(*created_at).ok_or_else(|| {
                            DocError::invalid_argument("element is not in the array")
                        })?;
                        let index = arr.iter_live().position(|t| t == *created_at).unwrap_or(0);
                        let reverse = if want_reverse {
                            Some(Operation::Add {
                                parent_created_at: *parent_created_at,
                                prev_created_at: prev,
                                value: ElementSeed::capture(root, *created_at)?,
                                executed_at: *executed_at,
                            })
                        } else {
                            None
                        };
                        (OpDetail::Remove { key: SmartString::from(index.to_string()) }, reverse)
                    }
                    _ => return Err(DocError::invalid_argument("parent cannot hold members")),
                };

                let mut outcome = OpOutcome::default();
                if root.remove_element(*created_at, *executed_at) {
                    outcome.op_infos.push(OpInfo { path, detail });
                    outcome.reverse_ops.extend(reverse);
                }
                Ok(outcome)
            }

            Operation::Increase { parent_created_at, value, .. } => {
                let path = root.create_path(*parent_created_at)?;
                root.counter_mut(*parent_created_at)?.increase(*value);
                let mut outcome = OpOutcome::default();
                outcome
                    .op_infos
                    .push(OpInfo { path, detail: OpDetail::Increase { value: *value } });
                if want_reverse {
                    outcome.reverse_ops.push(Operation::Increase {
                        parent_created_at: *parent_created_at,
                        value: -*value,
                        executed_at: self.executed_at(),
                    });
                }
                Ok(outcome)
            }

            Operation::Edit { parent_created_at, from, to, content, attributes, executed_at } => {
                let path = root.create_path(*parent_created_at)?;
                let elem_removed = root.element(*parent_created_at)?.is_removed();
                let attrs = (!attributes.is_empty()).then_some(attributes);
                let text = root.text_mut(*parent_created_at)?;
                let out = text.edit((*from, *to), content, attrs, *executed_at, vv)?;

                let delta = if elem_removed { route_to_gc(out.delta) } else { out.delta };
                root.acc(delta);
                for (id, removed_at) in out.gc {
                    root.register_gc_pair(GcPair {
                        target: GcTarget::SplitBlock { text: *parent_created_at, id },
                        removed_at,
                    });
                }

                let mut outcome = OpOutcome::default();
                for change in out.changes {
                    outcome.op_infos.push(OpInfo {
                        path: path.clone(),
                        detail: OpDetail::Edit {
                            from: change.from,
                            to: change.to,
                            content: change.content,
                        },
                    });
                }
                if want_reverse {
                    for entry in out.reverse {
                        outcome.reverse_ops.push(match entry {
                            ReverseEdit::DeleteInserted { from, to } => Operation::Edit {
                                parent_created_at: *parent_created_at,
                                from,
                                to,
                                content: SmartString::new(),
                                attributes: Attrs::new(),
                                executed_at: *executed_at,
                            },
                            ReverseEdit::Restore { at, content, attrs } => Operation::Edit {
                                parent_created_at: *parent_created_at,
                                from: at,
                                to: at,
                                content,
                                attributes: attrs,
                                executed_at: *executed_at,
                            },
                        });
                    }
                }
                Ok(outcome)
            }

            Operation::Style { parent_created_at, from, to, attributes, executed_at } => {
                let path = root.create_path(*parent_created_at)?;
                let elem_removed = root.element(*parent_created_at)?.is_removed();
                let text = root.text_mut(*parent_created_at)?;
                let out = text.set_style((*from, *to), attributes, *executed_at, vv)?;

                let delta = if elem_removed { route_to_gc(out.delta) } else { out.delta };
                root.acc(delta);
                root.register_attr_gc(*parent_created_at, out.gc, *executed_at);

                let mut outcome = OpOutcome::default();
                for change in out.changes {
                    outcome.op_infos.push(OpInfo {
                        path: path.clone(),
                        detail: OpDetail::Style {
                            from: change.from,
                            to: change.to,
                            attributes: change.attrs,
                        },
                    });
                }
                if want_reverse {
                    for entry in out.reverse {
                        outcome.reverse_ops.push(Operation::Style {
                            parent_created_at: *parent_created_at,
                            from: entry.from,
                            to: entry.to,
                            attributes: entry.attrs,
                            executed_at: *executed_at,
                        });
                    }
                }
                Ok(outcome)
            }

            Operation::Add { parent_created_at, prev_created_at, value, executed_at } => {
                let path = root.create_path(*parent_created_at)?;
                root.element(*parent_created_at)?
                    .as_array()
                    .ok_or_else(|| DocError::invalid_argument("element is not an array"))?;
                let mut outcome = OpOutcome::default();
                if value.materialize(root, *parent_created_at, "")? {
                    let index = root.array_mut(*parent_created_at)?.insert_after(
                        *prev_created_at,
                        value.created_at,
                        *executed_at,
                    )?;
                    outcome.op_infos.push(OpInfo { path, detail: OpDetail::Add { index } });
                    if want_reverse {
                        outcome.reverse_ops.push(Operation::Remove {
                            parent_created_at: *parent_created_at,
                            created_at: value.created_at,
                            executed_at: *executed_at,
                        });
                    }
                }
                Ok(outcome)
            }

            Operation::Move { parent_created_at, prev_created_at, created_at, executed_at } => {
                let path = root.create_path(*parent_created_at)?;
                let arr = root.array_mut(*parent_created_at)?;
                let old_prev = arr.prev_created(*created_at).ok_or_else(|| {
                    DocError::invalid_argument("element is not in the array")
                })?;
                let mut outcome = OpOutcome::default();
                if arr.move_after(*prev_created_at, *created_at, *executed_at)? {
                    let index =
                        root.array_mut(*parent_created_at)?.index_of(*created_at).unwrap_or(0);
                    root.element_mut(*created_at)?.set_moved_at(*executed_at);
                    outcome.op_infos.push(OpInfo { path, detail: OpDetail::Move { index } });
                    if want_reverse {
                        outcome.reverse_ops.push(Operation::Move {
                            parent_created_at: *parent_created_at,
                            prev_created_at: old_prev,
                            created_at: *created_at,
                            executed_at: *executed_at,
                        });
                    }
                }
                Ok(outcome)
            }

            Operation::ArraySet { parent_created_at, created_at, value, executed_at } => {
                let path = root.create_path(*parent_created_at)?;
                root.element(*parent_created_at)?
                    .as_array()
                    .ok_or_else(|| DocError::invalid_argument("element is not an array"))?;
                let reverse = if want_reverse {
                    Some(Operation::ArraySet {
                        parent_created_at: *parent_created_at,
                        created_at: value.created_at,
                        value: ElementSeed::capture(root, *created_at)?,
                        executed_at: *executed_at,
                    })
                } else {
                    None
                };

                let mut outcome = OpOutcome::default();
                if value.materialize(root, *parent_created_at, "")? {
                    let index = root.array_mut(*parent_created_at)?.insert_after(
                        *created_at,
                        value.created_at,
                        *executed_at,
                    )?;
                    root.remove_element(*created_at, *executed_at);
                    outcome.op_infos.push(OpInfo { path, detail: OpDetail::ArraySet { index } });
                    outcome.reverse_ops.extend(reverse);
                }
                Ok(outcome)
            }
        }
    }
}
