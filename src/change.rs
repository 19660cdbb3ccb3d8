//! Changes: the unit of replication, and the context that assembles one.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use smartstring::alias::String as SmartString;

use crate::crdt::root::CrdtRoot;
use crate::document::presence::{PartialPresence, Presence, PresenceChange, Presences};
use crate::error::Result;
use crate::operation::{OpInfo, OpSource, Operation};
use crate::time::{ActorId, Lamport, TimeTicket, VersionVector};

pub const INITIAL_DELIMITER: u32 = 0;

/// Identifier of a change: client/server sequence numbers plus the clocks
/// the change was issued under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeId {
    client_seq: u32,
    server_seq: u64,
    lamport: Lamport,
    actor: ActorId,
    version_vector: VersionVector,
}

impl ChangeId {
    pub fn initial() -> ChangeId {
        ChangeId {
            client_seq: 0,
            server_seq: 0,
            lamport: 0,
            actor: ActorId::INITIAL,
            version_vector: VersionVector::new(),
        }
    }

    pub fn client_seq(&self) -> u32 {
        self.client_seq
    }

    pub fn lamport(&self) -> Lamport {
        self.lamport
    }

    pub fn actor(&self) -> ActorId {
        self.actor
    }

    pub fn version_vector(&self) -> &VersionVector {
        &self.version_vector
    }

    pub fn set_actor(&mut self, actor: ActorId) {
        let old = self.actor;
        if old != actor {
            let own = self.version_vector.get(old);
            if own > 0 {
                self.version_vector.unset(old);
                self.version_vector.set(actor, own);
            }
            self.actor = actor;
        }
    }

    /// Successor id. Presence-only changes keep both the lamport and the
    /// vector untouched; everything else advances the own entry.
    pub fn next(&self, exclude_clocks: bool) -> ChangeId {
        if exclude_clocks {
            return ChangeId { client_seq: self.client_seq + 1, ..self.clone() };
        }
        let lamport = self.lamport + 1;
        let mut version_vector = self.version_vector.clone();
        version_vector.set(self.actor, lamport);
        ChangeId {
            client_seq: self.client_seq + 1,
            server_seq: self.server_seq,
            lamport,
            actor: self.actor,
            version_vector,
        }
    }

    /// The only clock-advancement rule on remote receive: lamport jumps to
    /// max(self, other) + 1, the vector merges pointwise, and the own entry
    /// records the new lamport.
    pub fn sync_clocks(&self, other: &ChangeId) -> ChangeId {
        let lamport = self.lamport.max(other.lamport) + 1;
        let mut version_vector = self.version_vector.max(&other.version_vector);
        version_vector.set(self.actor, lamport);
        ChangeId {
            client_seq: self.client_seq,
            server_seq: self.server_seq,
            lamport,
            actor: self.actor,
            version_vector,
        }
    }

    /// Snapshot intake: raises the clock floor without consuming a lamport.
    pub fn set_clocks(&self, lamport: Lamport, vector: &VersionVector) -> ChangeId {
        let lamport = self.lamport.max(lamport);
        let mut version_vector = self.version_vector.max(vector);
        version_vector.set(self.actor, lamport);
        ChangeId {
            client_seq: self.client_seq,
            server_seq: self.server_seq,
            lamport,
            actor: self.actor,
            version_vector,
        }
    }

    pub fn create_time_ticket(&self, delimiter: u32) -> TimeTicket {
        TimeTicket::new(self.lamport, delimiter, self.actor)
    }
}

/// ⟨clientSeq, serverSeq⟩ watermark exchanged with the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub client_seq: u32,
    pub server_seq: u64,
}

impl Checkpoint {
    pub fn new(client_seq: u32, server_seq: u64) -> Checkpoint {
        Checkpoint { client_seq, server_seq }
    }

    /// Pointwise monotone advance; a stale peer checkpoint never rolls the
    /// watermark back.
    pub fn forward(&self, other: &Checkpoint) -> Checkpoint {
        Checkpoint {
            client_seq: self.client_seq.max(other.client_seq),
            server_seq: self.server_seq.max(other.server_seq),
        }
    }
}

#[derive(Debug)]
pub struct ExecutionResult {
    pub op_infos: Vec<OpInfo>,
    /// Inverses in reverse application order, ready for the undo stack.
    pub reverse_ops: Vec<Operation>,
}

/// A batch of operations sharing one ChangeId, plus an optional presence
/// delta and commit message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    id: ChangeId,
    message: Option<SmartString>,
    operations: SmallVec<[Operation; 2]>,
    presence_change: Option<PresenceChange>,
}

impl Change {
    pub fn new(
        id: ChangeId,
        message: Option<SmartString>,
        operations: SmallVec<[Operation; 2]>,
        presence_change: Option<PresenceChange>,
    ) -> Change {
        Change { id, message, operations, presence_change }
    }

    pub fn id(&self) -> &ChangeId {
        &self.id
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn presence_change(&self) -> Option<&PresenceChange> {
        self.presence_change.as_ref()
    }

    pub fn has_operations(&self) -> bool {
        !self.operations.is_empty()
    }

    pub fn is_presence_only(&self) -> bool {
        self.operations.is_empty() && self.presence_change.is_some()
    }

    /// Rewrites the change for a newly-assigned actor (attach of a document
    /// edited while detached).
    pub fn set_actor(&mut self, actor: ActorId) {
        let from = self.id.actor();
        if from == actor {
            return;
        }
        self.id.set_actor(actor);
        for op in &mut self.operations {
            op.set_actor(from, actor);
        }
    }

    /// Runs the operations in order, merges the presence delta, and returns
    /// the op infos plus the concatenated reverse trail.
    pub fn execute(
        &self,
        root: &mut CrdtRoot,
        presences: &mut Presences,
        source: OpSource,
    ) -> Result<ExecutionResult> {
        let vv = match source {
            OpSource::Remote => Some(&self.id.version_vector),
            _ => None,
        };
        let mut op_infos = Vec::new();
        let mut per_op_reverse = Vec::with_capacity(self.operations.len());
        for op in &self.operations {
            let outcome = op.execute(root, source, vv)?;
            op_infos.extend(outcome.op_infos);
            per_op_reverse.push(outcome.reverse_ops);
        }
        let mut reverse_ops = Vec::new();
        for revs in per_op_reverse.into_iter().rev() {
            reverse_ops.extend(revs);
        }
        if let Some(change) = &self.presence_change {
            match change {
                PresenceChange::Put { presence } => {
                    presences.insert(self.id.actor, presence.clone());
                }
                PresenceChange::Clear => {
                    presences.remove(&self.id.actor);
                }
            }
        }
        Ok(ExecutionResult { op_infos, reverse_ops })
    }
}

/// Assembles one local change: issues dense tickets, accumulates operations
/// and the presence delta, and captures what undo needs to restore presence.
#[derive(Debug)]
pub struct ChangeContext {
    prev_id: ChangeId,
    next_id: ChangeId,
    delimiter: u32,
    message: Option<SmartString>,
    operations: SmallVec<[Operation; 2]>,
    presence_change: Option<PresenceChange>,
    reverse_presence: Option<PartialPresence>,
    old_presence: Presence,
}

impl ChangeContext {
    pub fn new(prev_id: ChangeId, old_presence: Presence) -> ChangeContext {
        let next_id = prev_id.next(false);
        ChangeContext {
            prev_id,
            next_id,
            delimiter: INITIAL_DELIMITER,
            message: None,
            operations: SmallVec::new(),
            presence_change: None,
            reverse_presence: None,
            old_presence,
        }
    }

    /// Dense per-change ticket order: (lamport, delimiter) ascending.
    pub fn issue_time_ticket(&mut self) -> TimeTicket {
        self.delimiter += 1;
        self.next_id.create_time_ticket(self.delimiter)
    }

    pub fn push(&mut self, op: Operation) {
        self.operations.push(op);
    }

    pub fn set_message(&mut self, message: Option<&str>) {
        self.message = message.map(SmartString::from);
    }

    pub fn has_change(&self) -> bool {
        !self.operations.is_empty() || self.presence_change.is_some()
    }

    pub fn is_presence_only(&self) -> bool {
        self.operations.is_empty() && self.presence_change.is_some()
    }

    /// The document's next ChangeId once this change commits. Presence-only
    /// changes consume no lamport.
    pub fn next_change_id(&self) -> ChangeId {
        if self.is_presence_only() {
            self.prev_id.next(true)
        } else {
            self.next_id.clone()
        }
    }

    /// Merges a partial presence update into the working copy. With
    /// `add_to_history` the pre-update values of the touched keys are
    /// remembered for undo (first write per key wins).
    pub fn presence_set(
        &mut self,
        working: &mut Presence,
        partial: Presence,
        add_to_history: bool,
    ) {
        if add_to_history {
            let reverse = self.reverse_presence.get_or_insert_with(PartialPresence::new);
            for key in partial.keys() {
                if !reverse.contains_key(key) {
                    reverse.insert(key.clone(), self.old_presence.get(key).cloned());
                }
            }
        }
        for (key, value) in partial {
            working.insert(key, value);
        }
        self.presence_change = Some(PresenceChange::Put { presence: working.clone() });
    }

    /// Applies a reverse-presence entry captured by a prior change.
    pub fn presence_restore(&mut self, working: &mut Presence, partial: PartialPresence) {
        let reverse = self.reverse_presence.get_or_insert_with(PartialPresence::new);
        for key in partial.keys() {
            if !reverse.contains_key(key) {
                reverse.insert(key.clone(), self.old_presence.get(key).cloned());
            }
        }
        for (key, value) in partial {
            match value {
                Some(value) => {
                    working.insert(key, value);
                }
                None => {
                    working.remove(&key);
                }
            }
        }
        self.presence_change = Some(PresenceChange::Put { presence: working.clone() });
    }

    pub fn presence_clear(&mut self, working: &mut Presence) {
        working.clear();
        self.presence_change = Some(PresenceChange::Clear);
    }

    pub fn take_reverse_presence(&mut self) -> Option<PartialPresence> {
        self.reverse_presence.take()
    }

    pub fn into_change(self) -> Change {
        let id = self.next_change_id();
        Change {
            id,
            message: self.message,
            operations: self.operations,
            presence_change: self.presence_change,
        }
    }
}
