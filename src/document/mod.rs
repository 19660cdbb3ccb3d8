//! The document loop: local updates against a speculative clone, remote
//! change-pack intake, snapshots, undo/redo and event fan-out.

pub mod event;
pub mod presence;

use std::collections::BTreeSet;

use serde_json::Value as JsonValue;
use smartstring::alias::String as SmartString;
use tracing::{debug, trace};

use crate::change::{Change, ChangeContext, ChangeId, Checkpoint, ExecutionResult};
use crate::crdt::element::PrimitiveValue;
use crate::crdt::root::CrdtRoot;
use crate::error::{DocError, Result};
use crate::operation::{ElementSeed, OpSource, Operation};
use crate::protocol::{ChangePack, SchemaValidator, Snapshot, WatchDocumentResponse, WatchEvent};
use crate::resource::DocSize;
use crate::time::{ActorId, VersionVector, INITIAL_TIME_TICKET};

use event::{ChangeInfo, DocEvent, Subscriber, Topic};
use presence::{PartialPresence, Presence, PresenceChange, Presences};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocStatus {
    Detached,
    Attached,
    Removed,
}

pub struct DocumentOptions {
    /// Skip the GC phase of change-pack application.
    pub disable_gc: bool,
    /// Attach raw change metadata to change events for replay tooling.
    pub enable_devtools: bool,
    /// 0 means unlimited.
    pub max_size_limit: usize,
    pub schema_validator: Option<Box<dyn SchemaValidator>>,
}

impl Default for DocumentOptions {
    fn default() -> Self {
        DocumentOptions {
            disable_gc: false,
            enable_devtools: false,
            max_size_limit: 0,
            schema_validator: None,
        }
    }
}

impl std::fmt::Debug for DocumentOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentOptions")
            .field("disable_gc", &self.disable_gc)
            .field("enable_devtools", &self.enable_devtools)
            .field("max_size_limit", &self.max_size_limit)
            .field("schema_validator", &self.schema_validator.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
struct DocClone {
    root: CrdtRoot,
    presences: Presences,
}

#[derive(Debug)]
struct HistoryEntry {
    ops: Vec<Operation>,
    presence: Option<PartialPresence>,
}

#[derive(Debug, Default)]
struct History {
    undo: Vec<HistoryEntry>,
    redo: Vec<HistoryEntry>,
}

pub struct Document {
    key: SmartString,
    status: DocStatus,
    options: DocumentOptions,
    root: CrdtRoot,
    clone: Option<DocClone>,
    change_id: ChangeId,
    checkpoint: Checkpoint,
    local_changes: Vec<Change>,
    presences: Presences,
    online_clients: BTreeSet<ActorId>,
    history: History,
    is_updating: bool,
    subscribers: Vec<Subscriber>,
    next_subscriber_id: u64,
}

impl Document {
    pub fn new(key: &str) -> Document {
        Document::with_options(key, DocumentOptions::default())
    }

    pub fn with_options(key: &str, options: DocumentOptions) -> Document {
        Document {
            key: SmartString::from(key),
            status: DocStatus::Detached,
            options,
            root: CrdtRoot::new(),
            clone: None,
            change_id: ChangeId::initial(),
            checkpoint: Checkpoint::default(),
            local_changes: Vec::new(),
            presences: Presences::new(),
            online_clients: BTreeSet::new(),
            history: History::default(),
            is_updating: false,
            subscribers: Vec::new(),
            next_subscriber_id: 0,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn status(&self) -> DocStatus {
        self.status
    }

    pub fn actor(&self) -> ActorId {
        self.change_id.actor()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        self.checkpoint
    }

    pub fn change_id(&self) -> &ChangeId {
        &self.change_id
    }

    pub fn root(&self) -> &CrdtRoot {
        &self.root
    }

    pub fn doc_size(&self) -> DocSize {
        self.root.doc_size()
    }

    pub fn local_changes(&self) -> &[Change] {
        &self.local_changes
    }

    pub fn presences(&self) -> &Presences {
        &self.presences
    }

    pub fn my_presence(&self) -> Presence {
        self.presences.get(&self.actor()).cloned().unwrap_or_default()
    }

    pub fn online_clients(&self) -> &BTreeSet<ActorId> {
        &self.online_clients
    }

    pub fn to_json(&self) -> JsonValue {
        self.root.to_json()
    }

    pub fn to_sorted_json_string(&self) -> String {
        self.root.to_sorted_json_string()
    }

    pub fn can_undo(&self) -> bool {
        !self.history.undo.is_empty() && !self.is_updating
    }

    pub fn can_redo(&self) -> bool {
        !self.history.redo.is_empty() && !self.is_updating
    }

    /// Assigns the replica identity on attach. Unsynced changes made while
    /// detached are rewritten to the new actor.
    pub fn set_actor(&mut self, actor: ActorId) {
        for change in &mut self.local_changes {
            change.set_actor(actor);
        }
        self.change_id.set_actor(actor);
        self.clone = None;
    }

    pub fn apply_status(&mut self, status: DocStatus) {
        self.status = status;
        if status == DocStatus::Detached {
            self.clone = None;
        }
        self.publish(vec![DocEvent::StatusChanged { status }]);
    }

    pub fn subscribe(&mut self, topic: Topic, handler: Box<dyn FnMut(&DocEvent)>) -> u64 {
        let id = self.next_subscriber_id;
        self.next_subscriber_id += 1;
        self.subscribers.push(Subscriber { id, topic, handler });
        id
    }

    pub fn unsubscribe(&mut self, id: u64) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        self.subscribers.len() != before
    }

    /// Hands a payload to the transport via a local-broadcast event.
    pub fn broadcast(&mut self, topic: &str, payload: JsonValue) {
        self.publish(vec![DocEvent::LocalBroadcast { topic: SmartString::from(topic), payload }]);
    }

    /// Transport-level auth failures surface to subscribers as events.
    pub fn notify_auth_error(&mut self, reason: &str, method: &str) {
        self.publish(vec![DocEvent::AuthError {
            reason: SmartString::from(reason),
            method: SmartString::from(method),
        }]);
    }

    fn ensure_clone(&mut self) {
        if self.clone.is_none() {
            self.clone = Some(DocClone {
                root: self.root.clone(),
                presences: self.presences.clone(),
            });
        }
    }

    pub fn update<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Updater) -> Result<()>,
    {
        self.update_with_message(None, f)
    }

    /// The local change pipeline: mutate a speculative clone, validate,
    /// then replay the assembled change onto the authoritative root.
    pub fn update_with_message<F>(&mut self, message: Option<&str>, f: F) -> Result<()>
    where
        F: FnOnce(&mut Updater) -> Result<()>,
    {
        if self.status == DocStatus::Removed {
            return Err(DocError::DocumentRemoved);
        }
        self.ensure_clone();
        // Taking the clone means any early return below discards it, which
        // is exactly the fail-fast rollback contract.
        let mut clone = self.clone.take().expect("ensure_clone just ran");
        let actor = self.change_id.actor();
        let old_presence = clone.presences.get(&actor).cloned().unwrap_or_default();
        let mut ctx = ChangeContext::new(self.change_id.clone(), old_presence);
        ctx.set_message(message);

        self.is_updating = true;
        let result = {
            let mut updater = Updater {
                root: &mut clone.root,
                presences: &mut clone.presences,
                ctx: &mut ctx,
                actor,
            };
            f(&mut updater)
        };
        self.is_updating = false;
        result?;

        if !ctx.is_presence_only() {
            if let Some(validator) = &self.options.schema_validator {
                if let Err(messages) = validator.validate(&clone.root.to_json()) {
                    return Err(DocError::SchemaValidationFailed { messages });
                }
            }
        }
        if self.options.max_size_limit > 0 {
            let size = clone.root.doc_size().total();
            if size > self.options.max_size_limit {
                return Err(DocError::SizeExceedsLimit {
                    size,
                    limit: self.options.max_size_limit,
                });
            }
        }
        if !ctx.has_change() {
            self.clone = Some(clone);
            return Ok(());
        }

        let reverse_presence = ctx.take_reverse_presence();
        let next_id = ctx.next_change_id();
        let change = ctx.into_change();
        let ExecutionResult { op_infos, reverse_ops } =
            change.execute(&mut self.root, &mut self.presences, OpSource::Local)?;

        let raw_change = self.options.enable_devtools.then(|| change.clone());
        let change_message = change.message().map(SmartString::from);
        let presence_changed = change.presence_change().is_some();
        self.local_changes.push(change);

        if !reverse_ops.is_empty() || reverse_presence.is_some() {
            self.history.undo.push(HistoryEntry { ops: reverse_ops, presence: reverse_presence });
        }
        if !op_infos.is_empty() {
            self.history.redo.clear();
        }
        self.change_id = next_id;
        self.clone = Some(clone);

        let mut events = Vec::new();
        if !op_infos.is_empty() {
            events.push(DocEvent::LocalChange {
                info: ChangeInfo {
                    actor,
                    message: change_message,
                    operations: op_infos,
                    raw_change,
                },
            });
        }
        if presence_changed {
            let presence = self.presences.get(&actor).cloned().unwrap_or_default();
            events.push(DocEvent::PresenceChanged { actor, presence });
        }
        self.publish(events);
        Ok(())
    }

    /// What the transport pushes to the server: pending local changes under
    /// the current watermark.
    pub fn create_change_pack(&self) -> ChangePack {
        let mut pack =
            ChangePack::new(&self.key, self.checkpoint, self.local_changes.clone());
        pack.version_vector = self.change_id.version_vector().clone();
        pack
    }

    pub fn apply_change_pack(&mut self, pack: ChangePack) -> Result<()> {
        let had_snapshot = pack.snapshot.is_some();
        if let Some(snapshot) = pack.snapshot {
            let vv = pack
                .snapshot_version_vector
                .unwrap_or_else(|| pack.version_vector.clone());
            self.apply_snapshot(pack.checkpoint.server_seq, &vv, snapshot, pack.checkpoint.client_seq)?;
        } else {
            let change_count = pack.changes.len();
            for change in pack.changes {
                self.apply_change(change, OpSource::Remote)?;
            }
            let client_seq = pack.checkpoint.client_seq;
            self.local_changes.retain(|c| c.id().client_seq() > client_seq);
            trace!(changes = change_count, "applied change pack");
        }
        self.checkpoint = self.checkpoint.forward(&pack.checkpoint);
        if !had_snapshot {
            self.garbage_collect(&pack.version_vector);
        }
        if pack.is_removed {
            self.apply_status(DocStatus::Removed);
        }
        Ok(())
    }

    /// Applies one change to the clone and then the authoritative root,
    /// advancing the clocks and publishing the resulting events as one
    /// synchronous batch.
    pub fn apply_change(&mut self, change: Change, source: OpSource) -> Result<()> {
        self.ensure_clone();
        {
            let clone = self.clone.as_mut().expect("ensure_clone just ran");
            change.execute(&mut clone.root, &mut clone.presences, source)?;
        }
        let actor = change.id().actor();
        let had_presence = self.presences.contains_key(&actor);
        let online = self.online_clients.contains(&actor);

        self.change_id = self.change_id.sync_clocks(change.id());
        let ExecutionResult { op_infos, .. } =
            change.execute(&mut self.root, &mut self.presences, source)?;

        let mut events = Vec::new();
        match change.presence_change() {
            Some(PresenceChange::Put { presence }) => {
                if online {
                    if had_presence {
                        events.push(DocEvent::PresenceChanged {
                            actor,
                            presence: presence.clone(),
                        });
                    } else {
                        events.push(DocEvent::Watched { actor, presence: presence.clone() });
                    }
                }
            }
            Some(PresenceChange::Clear) => {
                if self.online_clients.remove(&actor) && had_presence {
                    events.push(DocEvent::Unwatched { actor });
                }
            }
            None => {}
        }
        if !op_infos.is_empty() {
            let raw_change = self.options.enable_devtools.then(|| change.clone());
            let info = ChangeInfo {
                actor,
                message: change.message().map(SmartString::from),
                operations: op_infos,
                raw_change,
            };
            events.push(match source {
                OpSource::Local => DocEvent::LocalChange { info },
                _ => DocEvent::RemoteChange { info },
            });
        }
        self.publish(events);
        Ok(())
    }

    /// Replaces the root with a decoded snapshot, raises the clock floor,
    /// drops the contaminated clone and replays surviving local changes.
    fn apply_snapshot(
        &mut self,
        server_seq: u64,
        vv: &VersionVector,
        snapshot: Snapshot,
        client_seq: u32,
    ) -> Result<()> {
        self.root = snapshot.root;
        self.presences = snapshot.presences;
        self.change_id = self.change_id.set_clocks(vv.max_lamport(), vv);
        self.clone = None;
        self.local_changes.retain(|c| c.id().client_seq() > client_seq);
        let survivors = std::mem::take(&mut self.local_changes);
        for change in &survivors {
            change.execute(&mut self.root, &mut self.presences, OpSource::Local)?;
        }
        self.local_changes = survivors;
        debug!(server_seq, replayed = self.local_changes.len(), "applied snapshot");
        self.publish(vec![DocEvent::Snapshot { server_seq }]);
        Ok(())
    }

    pub fn garbage_collect(&mut self, min_synced_vv: &VersionVector) -> usize {
        if self.options.disable_gc {
            return 0;
        }
        if let Some(clone) = &mut self.clone {
            clone.root.garbage_collect(min_synced_vv);
        }
        self.root.garbage_collect(min_synced_vv)
    }

    pub fn undo(&mut self) -> Result<()> {
        self.undo_redo(true)
    }

    pub fn redo(&mut self) -> Result<()> {
        self.undo_redo(false)
    }

    /// Replays a reverse-op trail under fresh tickets. Inverses land on the
    /// opposite stack; a replay with no visible effect is not propagated.
    fn undo_redo(&mut self, is_undo: bool) -> Result<()> {
        if self.is_updating {
            return Err(DocError::refused("undo/redo is not allowed during update"));
        }
        let popped = if is_undo { self.history.undo.pop() } else { self.history.redo.pop() };
        let entry = popped.ok_or_else(|| {
            DocError::refused(if is_undo { "nothing to undo" } else { "nothing to redo" })
        })?;

        self.ensure_clone();
        let mut clone = self.clone.take().expect("ensure_clone just ran");
        let actor = self.change_id.actor();
        let old_presence = clone.presences.get(&actor).cloned().unwrap_or_default();
        let mut ctx = ChangeContext::new(self.change_id.clone(), old_presence);

        for mut op in entry.ops {
            op.refresh(&mut ctx);
            ctx.push(op);
        }
        if let Some(partial) = entry.presence {
            let working = clone.presences.entry(actor).or_default();
            ctx.presence_restore(working, partial);
        }
        if !ctx.has_change() {
            self.clone = Some(clone);
            return Ok(());
        }

        let reverse_presence = ctx.take_reverse_presence();
        let next_id = ctx.next_change_id();
        let change = ctx.into_change();
        change.execute(&mut clone.root, &mut clone.presences, OpSource::UndoRedo)?;
        let ExecutionResult { op_infos, reverse_ops } =
            change.execute(&mut self.root, &mut self.presences, OpSource::UndoRedo)?;

        if !reverse_ops.is_empty() || reverse_presence.is_some() {
            let inverse = HistoryEntry { ops: reverse_ops, presence: reverse_presence };
            if is_undo {
                self.history.redo.push(inverse);
            } else {
                self.history.undo.push(inverse);
            }
        }
        if op_infos.is_empty() && change.presence_change().is_none() {
            self.clone = Some(clone);
            return Ok(());
        }

        let raw_change = self.options.enable_devtools.then(|| change.clone());
        let presence_changed = change.presence_change().is_some();
        self.local_changes.push(change);
        self.change_id = next_id;
        self.clone = Some(clone);

        let mut events = Vec::new();
        if !op_infos.is_empty() {
            events.push(DocEvent::LocalChange {
                info: ChangeInfo { actor, message: None, operations: op_infos, raw_change },
            });
        }
        if presence_changed {
            let presence = self.presences.get(&actor).cloned().unwrap_or_default();
            events.push(DocEvent::PresenceChanged { actor, presence });
        }
        self.publish(events);
        Ok(())
    }

    /// Watch-stream intake: online bookkeeping plus watched/unwatched and
    /// broadcast events.
    pub fn apply_watch_stream(&mut self, response: WatchDocumentResponse) {
        let mut events = Vec::new();
        match response {
            WatchDocumentResponse::Initialization { client_ids } => {
                self.online_clients = client_ids.into_iter().collect();
                let mut online = Presences::new();
                for actor in &self.online_clients {
                    if let Some(presence) = self.presences.get(actor) {
                        online.insert(*actor, presence.clone());
                    }
                }
                events.push(DocEvent::Initialized { presences: online });
            }
            WatchDocumentResponse::Event(WatchEvent::DocumentWatched { publisher }) => {
                self.online_clients.insert(publisher);
                // The watched event waits for a presence if none arrived yet;
                // it fires from applyChange once the Put shows up.
                if let Some(presence) = self.presences.get(&publisher) {
                    events.push(DocEvent::Watched {
                        actor: publisher,
                        presence: presence.clone(),
                    });
                }
            }
            WatchDocumentResponse::Event(WatchEvent::DocumentUnwatched { publisher }) => {
                let was_online = self.online_clients.remove(&publisher);
                if was_online && self.presences.contains_key(&publisher) {
                    events.push(DocEvent::Unwatched { actor: publisher });
                }
            }
            WatchDocumentResponse::Event(WatchEvent::DocumentBroadcast {
                publisher: _,
                topic,
                payload,
            }) => {
                let payload = serde_json::from_slice(&payload).unwrap_or(JsonValue::Null);
                events.push(DocEvent::Broadcast { topic, payload });
            }
        }
        self.publish(events);
    }

    /// Delivers one batch synchronously: state mutation always completes
    /// before subscribers observe it.
    fn publish(&mut self, events: Vec<DocEvent>) {
        if events.is_empty() || self.subscribers.is_empty() {
            return;
        }
        let my_actor = self.change_id.actor();
        let mut subscribers = std::mem::take(&mut self.subscribers);
        for event in &events {
            for sub in subscribers.iter_mut() {
                if sub.topic.matches(event, my_actor) {
                    (sub.handler)(event);
                }
            }
        }
        subscribers.extend(self.subscribers.drain(..));
        self.subscribers = subscribers;
    }
}

/// Handle to an object element inside a mutator.
#[derive(Debug, Clone, Copy)]
pub struct ObjRef(crate::time::TimeTicket);

#[derive(Debug, Clone, Copy)]
pub struct ArrRef(crate::time::TimeTicket);

#[derive(Debug, Clone, Copy)]
pub struct TextRef(crate::time::TimeTicket);

#[derive(Debug, Clone, Copy)]
pub struct CounterRef(crate::time::TimeTicket);

/// The mutator's view of the document: every write builds an operation,
/// executes it against the speculative clone and records it in the change
/// context.
pub struct Updater<'a> {
    root: &'a mut CrdtRoot,
    presences: &'a mut Presences,
    ctx: &'a mut ChangeContext,
    actor: ActorId,
}

impl Updater<'_> {
    pub fn root_object(&self) -> ObjRef {
        ObjRef(INITIAL_TIME_TICKET)
    }

    fn apply(&mut self, op: Operation) -> Result<()> {
        op.execute(self.root, OpSource::Local, None)?;
        self.ctx.push(op);
        Ok(())
    }

    fn member(&self, obj: ObjRef, key: &str) -> Result<crate::time::TimeTicket> {
        let ticket = self
            .root
            .object(obj.0)?
            .get(key)
            .ok_or_else(|| DocError::invalid_argument("no such key"))?;
        if self.root.element(ticket)?.is_removed() {
            return Err(DocError::invalid_argument("member was removed"));
        }
        Ok(ticket)
    }

    pub fn set(&mut self, obj: ObjRef, key: &str, value: PrimitiveValue) -> Result<()> {
        let created = self.ctx.issue_time_ticket();
        let executed = self.ctx.issue_time_ticket();
        self.apply(Operation::Set {
            parent_created_at: obj.0,
            key: SmartString::from(key),
            value: ElementSeed::primitive(value, created),
            executed_at: executed,
        })
    }

    pub fn set_object(&mut self, obj: ObjRef, key: &str) -> Result<ObjRef> {
        let created = self.ctx.issue_time_ticket();
        let executed = self.ctx.issue_time_ticket();
        self.apply(Operation::Set {
            parent_created_at: obj.0,
            key: SmartString::from(key),
            value: ElementSeed::object(created),
            executed_at: executed,
        })?;
        Ok(ObjRef(created))
    }

    pub fn set_array(&mut self, obj: ObjRef, key: &str) -> Result<ArrRef> {
        let created = self.ctx.issue_time_ticket();
        let executed = self.ctx.issue_time_ticket();
        self.apply(Operation::Set {
            parent_created_at: obj.0,
            key: SmartString::from(key),
            value: ElementSeed::array(created),
            executed_at: executed,
        })?;
        Ok(ArrRef(created))
    }

    pub fn set_text(&mut self, obj: ObjRef, key: &str) -> Result<TextRef> {
        let created = self.ctx.issue_time_ticket();
        let executed = self.ctx.issue_time_ticket();
        self.apply(Operation::Set {
            parent_created_at: obj.0,
            key: SmartString::from(key),
            value: ElementSeed::text(created),
            executed_at: executed,
        })?;
        Ok(TextRef(created))
    }

    pub fn set_counter(&mut self, obj: ObjRef, key: &str, value: i64) -> Result<CounterRef> {
        let created = self.ctx.issue_time_ticket();
        let executed = self.ctx.issue_time_ticket();
        self.apply(Operation::Set {
            parent_created_at: obj.0,
            key: SmartString::from(key),
            value: ElementSeed::counter(value, created),
            executed_at: executed,
        })?;
        Ok(CounterRef(created))
    }

    pub fn object(&self, obj: ObjRef, key: &str) -> Result<ObjRef> {
        let ticket = self.member(obj, key)?;
        self.root
            .element(ticket)?
            .as_object()
            .ok_or_else(|| DocError::invalid_argument("member is not an object"))?;
        Ok(ObjRef(ticket))
    }

    pub fn array(&self, obj: ObjRef, key: &str) -> Result<ArrRef> {
        let ticket = self.member(obj, key)?;
        self.root
            .element(ticket)?
            .as_array()
            .ok_or_else(|| DocError::invalid_argument("member is not an array"))?;
        Ok(ArrRef(ticket))
    }

    pub fn text(&self, obj: ObjRef, key: &str) -> Result<TextRef> {
        let ticket = self.member(obj, key)?;
        self.root
            .element(ticket)?
            .as_text()
            .ok_or_else(|| DocError::invalid_argument("member is not a text"))?;
        Ok(TextRef(ticket))
    }

    pub fn counter(&self, obj: ObjRef, key: &str) -> Result<CounterRef> {
        let ticket = self.member(obj, key)?;
        self.root
            .element(ticket)?
            .as_counter()
            .ok_or_else(|| DocError::invalid_argument("member is not a counter"))?;
        Ok(CounterRef(ticket))
    }

    pub fn remove(&mut self, obj: ObjRef, key: &str) -> Result<()> {
        let target = self.member(obj, key)?;
        let executed = self.ctx.issue_time_ticket();
        self.apply(Operation::Remove {
            parent_created_at: obj.0,
            created_at: target,
            executed_at: executed,
        })
    }

    pub fn edit(&mut self, text: TextRef, from: usize, to: usize, content: &str) -> Result<()> {
        self.edit_with_attrs(text, from, to, content, &[])
    }

    pub fn edit_with_attrs(
        &mut self,
        text: TextRef,
        from: usize,
        to: usize,
        content: &str,
        attrs: &[(&str, &str)],
    ) -> Result<()> {
        let range = self
            .root
            .text_mut(text.0)?
            .index_range_to_pos_range(from, to)?;
        let executed = self.ctx.issue_time_ticket();
        self.apply(Operation::Edit {
            parent_created_at: text.0,
            from: range.0,
            to: range.1,
            content: SmartString::from(content),
            attributes: attrs
                .iter()
                .map(|(k, v)| (SmartString::from(*k), SmartString::from(*v)))
                .collect(),
            executed_at: executed,
        })
    }

    pub fn style(
        &mut self,
        text: TextRef,
        from: usize,
        to: usize,
        attrs: &[(&str, &str)],
    ) -> Result<()> {
        let range = self
            .root
            .text_mut(text.0)?
            .index_range_to_pos_range(from, to)?;
        let executed = self.ctx.issue_time_ticket();
        self.apply(Operation::Style {
            parent_created_at: text.0,
            from: range.0,
            to: range.1,
            attributes: attrs
                .iter()
                .map(|(k, v)| (SmartString::from(*k), Some(SmartString::from(*v))))
                .collect(),
            executed_at: executed,
        })
    }

    pub fn increase(&mut self, counter: CounterRef, by: i64) -> Result<()> {
        let executed = self.ctx.issue_time_ticket();
        self.apply(Operation::Increase {
            parent_created_at: counter.0,
            value: by,
            executed_at: executed,
        })
    }

    pub fn push(&mut self, arr: ArrRef, value: PrimitiveValue) -> Result<()> {
        let prev = self.root.array_mut(arr.0)?.last_created();
        let created = self.ctx.issue_time_ticket();
        let executed = self.ctx.issue_time_ticket();
        self.apply(Operation::Add {
            parent_created_at: arr.0,
            prev_created_at: prev,
            value: ElementSeed::primitive(value, created),
            executed_at: executed,
        })
    }

    pub fn insert(&mut self, arr: ArrRef, index: usize, value: PrimitiveValue) -> Result<()> {
        let prev = if index == 0 {
            INITIAL_TIME_TICKET
        } else {
            self.root
                .array_mut(arr.0)?
                .get(index - 1)
                .ok_or_else(|| DocError::invalid_argument("array index out of range"))?
        };
        let created = self.ctx.issue_time_ticket();
        let executed = self.ctx.issue_time_ticket();
        self.apply(Operation::Add {
            parent_created_at: arr.0,
            prev_created_at: prev,
            value: ElementSeed::primitive(value, created),
            executed_at: executed,
        })
    }

    pub fn remove_at(&mut self, arr: ArrRef, index: usize) -> Result<()> {
        let target = self
            .root
            .array_mut(arr.0)?
            .get(index)
            .ok_or_else(|| DocError::invalid_argument("array index out of range"))?;
        let executed = self.ctx.issue_time_ticket();
        self.apply(Operation::Remove {
            parent_created_at: arr.0,
            created_at: target,
            executed_at: executed,
        })
    }

    /// Moves the element at `index` after the live element at `after`
    /// (`None` moves it to the front).
    pub fn move_after(&mut self, arr: ArrRef, index: usize, after: Option<usize>) -> Result<()> {
        let target = self
            .root
            .array_mut(arr.0)?
            .get(index)
            .ok_or_else(|| DocError::invalid_argument("array index out of range"))?;
        let prev = match after {
            None => INITIAL_TIME_TICKET,
            Some(i) => self
                .root
                .array_mut(arr.0)?
                .get(i)
                .ok_or_else(|| DocError::invalid_argument("array index out of range"))?,
        };
        let executed = self.ctx.issue_time_ticket();
        self.apply(Operation::Move {
            parent_created_at: arr.0,
            prev_created_at: prev,
            created_at: target,
            executed_at: executed,
        })
    }

    /// Replaces the value at `index`, keeping its list position.
    pub fn set_at(&mut self, arr: ArrRef, index: usize, value: PrimitiveValue) -> Result<()> {
        let target = self
            .root
            .array_mut(arr.0)?
            .get(index)
            .ok_or_else(|| DocError::invalid_argument("array index out of range"))?;
        let created = self.ctx.issue_time_ticket();
        let executed = self.ctx.issue_time_ticket();
        self.apply(Operation::ArraySet {
            parent_created_at: arr.0,
            created_at: target,
            value: ElementSeed::primitive(value, created),
            executed_at: executed,
        })
    }

    pub fn array_len(&mut self, arr: ArrRef) -> Result<usize> {
        Ok(self
            .root
            .element(arr.0)?
            .as_array()
            .ok_or_else(|| DocError::invalid_argument("element is not an array"))?
            .len())
    }

    pub fn text_content(&self, text: TextRef) -> Result<String> {
        Ok(self
            .root
            .element(text.0)?
            .as_text()
            .ok_or_else(|| DocError::invalid_argument("element is not a text"))?
            .to_string())
    }

    pub fn presence_set(&mut self, entries: &[(&str, JsonValue)]) {
        self.presence_update(entries, false);
    }

    /// Like `presence_set`, but the touched keys are captured for undo.
    pub fn presence_set_with_history(&mut self, entries: &[(&str, JsonValue)]) {
        self.presence_update(entries, true);
    }

    fn presence_update(&mut self, entries: &[(&str, JsonValue)], add_to_history: bool) {
        let partial: Presence = entries
            .iter()
            .map(|(k, v)| (SmartString::from(*k), v.clone()))
            .collect();
        let working = self.presences.entry(self.actor).or_default();
        self.ctx.presence_set(working, partial, add_to_history);
    }

    pub fn presence_clear(&mut self) {
        let working = self.presences.entry(self.actor).or_default();
        self.ctx.presence_clear(working);
    }
}
