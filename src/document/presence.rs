//! Ephemeral per-actor presence (cursors, selections). Not persisted by the
//! CRDT; replicated through presence changes piggybacking on the change
//! stream.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use smartstring::alias::String as SmartString;

use crate::time::ActorId;

pub type Presence = BTreeMap<SmartString, JsonValue>;

/// Keys to restore on undo: `None` erases a key that did not exist before.
pub type PartialPresence = BTreeMap<SmartString, Option<JsonValue>>;

pub type Presences = BTreeMap<ActorId, Presence>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceChange {
    Put { presence: Presence },
    Clear,
}
