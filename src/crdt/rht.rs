//! Replicated hash table: a last-writer-wins map with tombstones.
//!
//! Used for text attributes. Winners are decided by ticket; a replaced live
//! node is detached and handed to the caller for GC registration, while a
//! removed node stays in the map as a tombstone until purged.

use std::collections::BTreeMap;

use serde_json::{Map as JsonMap, Value as JsonValue};
use smartstring::alias::String as SmartString;

use crate::resource::DataSize;
use crate::time::{TimeTicket, TIME_TICKET_SIZE};

#[derive(Debug, Clone, PartialEq)]
pub struct RhtNode {
    pub value: SmartString,
    pub updated_at: TimeTicket,
    pub removed_at: Option<TimeTicket>,
}

impl RhtNode {
    pub fn is_removed(&self) -> bool {
        self.removed_at.is_some()
    }

    pub fn data_size(&self) -> DataSize {
        DataSize::new(self.value.len(), TIME_TICKET_SIZE)
    }
}

/// Result of an LWW `set`.
#[derive(Debug, PartialEq)]
pub enum RhtSetEffect {
    Created,
    /// A live node lost; it is detached and belongs to the GC pair map now.
    ReplacedLive { prev: RhtNode },
    /// A tombstone lost; its pending GC pair must be retired by the caller.
    ReplacedTombstone { prev_value_len: usize },
    /// The incoming ticket lost.
    Ignored,
}

/// Result of an LWW `remove`.
#[derive(Debug, PartialEq)]
pub enum RhtRemoveEffect {
    /// live → tombstone.
    Tombstoned { value_len: usize },
    /// An existing tombstone's tickets advanced; same size, new removal
    /// ticket.
    Refreshed { value_len: usize },
    Ignored,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rht {
    nodes: BTreeMap<SmartString, RhtNode>,
}

impl Rht {
    pub fn new() -> Rht {
        Rht::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        match self.nodes.get(key) {
            Some(node) if !node.is_removed() => Some(node.value.as_str()),
            _ => None,
        }
    }

    pub fn set(&mut self, key: &str, value: &str, ticket: TimeTicket) -> RhtSetEffect {
        match self.nodes.get_mut(key) {
            None => {
                self.nodes.insert(
                    SmartString::from(key),
                    RhtNode { value: SmartString::from(value), updated_at: ticket, removed_at: None },
                );
                RhtSetEffect::Created
            }
            Some(node) if ticket.after(node.updated_at) => {
                let prev = std::mem::replace(
                    node,
                    RhtNode { value: SmartString::from(value), updated_at: ticket, removed_at: None },
                );
                if prev.is_removed() {
                    RhtSetEffect::ReplacedTombstone { prev_value_len: prev.value.len() }
                } else {
                    RhtSetEffect::ReplacedLive { prev }
                }
            }
            Some(_) => RhtSetEffect::Ignored,
        }
    }

    pub fn remove(&mut self, key: &str, ticket: TimeTicket) -> RhtRemoveEffect {
        match self.nodes.get_mut(key) {
            Some(node) if ticket.after(node.updated_at) => {
                let was_removed = node.is_removed();
                node.updated_at = ticket;
                node.removed_at = Some(ticket);
                if was_removed {
                    RhtRemoveEffect::Refreshed { value_len: node.value.len() }
                } else {
                    RhtRemoveEffect::Tombstoned { value_len: node.value.len() }
                }
            }
            _ => RhtRemoveEffect::Ignored,
        }
    }

    /// Drops a tombstone, but only when it still carries the removal ticket
    /// the GC pair was registered under (a later `set` may have revived the
    /// key).
    pub fn purge_removed(&mut self, key: &str, removed_at: TimeTicket) -> Option<usize> {
        match self.nodes.get(key) {
            Some(node) if node.removed_at == Some(removed_at) => {
                let len = node.value.len();
                self.nodes.remove(key);
                Some(len)
            }
            _ => None,
        }
    }

    pub fn live_len(&self) -> usize {
        self.nodes.values().filter(|n| !n.is_removed()).count()
    }

    pub fn is_live_empty(&self) -> bool {
        self.live_len() == 0
    }

    /// Size of the live entries only; tombstones are accounted through the
    /// GC pair map.
    pub fn data_size(&self) -> DataSize {
        let mut size = DataSize::default();
        for node in self.nodes.values() {
            if !node.is_removed() {
                size += node.data_size();
            }
        }
        size
    }

    pub fn tombstone_size(&self) -> DataSize {
        let mut size = DataSize::default();
        for node in self.nodes.values() {
            if node.is_removed() {
                size += node.data_size();
            }
        }
        size
    }

    pub fn iter_live(&self) -> impl Iterator<Item = (&str, &str)> {
        self.nodes
            .iter()
            .filter(|(_, n)| !n.is_removed())
            .map(|(k, n)| (k.as_str(), n.value.as_str()))
    }

    pub fn to_json(&self) -> JsonValue {
        let mut map = JsonMap::new();
        for (key, value) in self.iter_live() {
            map.insert(key.to_string(), JsonValue::String(value.to_string()));
        }
        JsonValue::Object(map)
    }
}
