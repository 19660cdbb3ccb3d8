//! External interfaces: the shapes exchanged with the wire codec, the watch
//! stream and the schema validator. The binary codec itself lives outside
//! the core; everything here is the decoded form.

use serde_json::Value as JsonValue;
use smartstring::alias::String as SmartString;

use crate::change::{Change, Checkpoint};
use crate::crdt::root::CrdtRoot;
use crate::document::presence::Presences;
use crate::time::{ActorId, VersionVector};

/// A decoded snapshot: the replacement root plus the presences in effect
/// when the server cut it.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub root: CrdtRoot,
    pub presences: Presences,
}

/// One round of server → client state transfer.
#[derive(Debug, Clone)]
pub struct ChangePack {
    pub doc_key: SmartString,
    pub checkpoint: Checkpoint,
    pub is_removed: bool,
    pub snapshot: Option<Snapshot>,
    /// Clock floor accompanying a snapshot.
    pub snapshot_version_vector: Option<VersionVector>,
    pub changes: Vec<Change>,
    /// Minimum synced vector driving garbage collection.
    pub version_vector: VersionVector,
}

impl ChangePack {
    pub fn new(doc_key: &str, checkpoint: Checkpoint, changes: Vec<Change>) -> ChangePack {
        ChangePack {
            doc_key: SmartString::from(doc_key),
            checkpoint,
            is_removed: false,
            snapshot: None,
            snapshot_version_vector: None,
            changes,
            version_vector: VersionVector::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum WatchDocumentResponse {
    Initialization { client_ids: Vec<ActorId> },
    Event(WatchEvent),
}

#[derive(Debug, Clone)]
pub enum WatchEvent {
    DocumentWatched { publisher: ActorId },
    DocumentUnwatched { publisher: ActorId },
    DocumentBroadcast { publisher: ActorId, topic: SmartString, payload: Vec<u8> },
}

/// Validates the document's JSON after a mutation; failures abort the
/// update and roll the clone back.
pub trait SchemaValidator {
    fn validate(&self, root: &JsonValue) -> Result<(), Vec<SmartString>>;
}

/// Rule-list validator for simple "path must have type" schemas.
pub struct RuleBasedValidator {
    pub rules: Vec<SchemaRule>,
}

pub struct SchemaRule {
    /// `$.a.b` style path.
    pub path: SmartString,
    pub expected: JsonType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonType {
    Null,
    Boolean,
    Number,
    String,
    Array,
    Object,
}

fn lookup<'a>(root: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut cur = root;
    for segment in path.split('.').skip(1) {
        cur = match cur {
            JsonValue::Object(map) => map.get(segment)?,
            JsonValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

impl SchemaValidator for RuleBasedValidator {
    fn validate(&self, root: &JsonValue) -> Result<(), Vec<SmartString>> {
        let mut messages = Vec::new();
        for rule in &self.rules {
            let ok = match lookup(root, &rule.path) {
                Some(value) => match rule.expected {
                    JsonType::Null => value.is_null(),
                    JsonType::Boolean => value.is_boolean(),
                    JsonType::Number => value.is_number(),
                    JsonType::String => value.is_string(),
                    JsonType::Array => value.is_array(),
                    JsonType::Object => value.is_object(),
                },
                None => false,
            };
            if !ok {
                messages.push(SmartString::from(format!(
                    "expected {:?} at {}",
                    rule.expected, rule.path
                )));
            }
        }
        if messages.is_empty() {
            Ok(())
        } else {
            Err(messages)
        }
    }
}
