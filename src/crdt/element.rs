//! The element variant set and its shared capability surface.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use smartstring::alias::String as SmartString;

use crate::crdt::array::CrdtArray;
use crate::crdt::object::CrdtObject;
use crate::crdt::text::CrdtText;
use crate::resource::DataSize;
use crate::time::{TimeTicket, TIME_TICKET_SIZE};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PrimitiveValue {
    Null,
    Bool(bool),
    Integer(i64),
    Double(f64),
    Str(SmartString),
    Bytes(Vec<u8>),
}

impl PrimitiveValue {
    pub fn data_size(&self) -> usize {
        match self {
            PrimitiveValue::Null => 0,
            PrimitiveValue::Bool(_) => 1,
            PrimitiveValue::Integer(_) | PrimitiveValue::Double(_) => 8,
            PrimitiveValue::Str(s) => s.len(),
            PrimitiveValue::Bytes(b) => b.len(),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            PrimitiveValue::Null => JsonValue::Null,
            PrimitiveValue::Bool(b) => JsonValue::Bool(*b),
            PrimitiveValue::Integer(i) => JsonValue::from(*i),
            PrimitiveValue::Double(d) => {
                serde_json::Number::from_f64(*d).map(JsonValue::Number).unwrap_or(JsonValue::Null)
            }
            PrimitiveValue::Str(s) => JsonValue::String(s.to_string()),
            PrimitiveValue::Bytes(b) => {
                let mut hex = String::with_capacity(b.len() * 2);
                for byte in b {
                    hex.push_str(&format!("{:02x}", byte));
                }
                JsonValue::String(hex)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CrdtCounter {
    value: i64,
}

impl CrdtCounter {
    pub fn new(value: i64) -> CrdtCounter {
        CrdtCounter { value }
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn increase(&mut self, by: i64) -> i64 {
        self.value = self.value.wrapping_add(by);
        self.value
    }
}

#[derive(Debug, Clone)]
pub enum CrdtValue {
    Object(CrdtObject),
    Array(CrdtArray),
    Text(CrdtText),
    Counter(CrdtCounter),
    Primitive(PrimitiveValue),
}

impl CrdtValue {
    pub fn kind_name(&self) -> &'static str {
        match self {
            CrdtValue::Object(_) => "object",
            CrdtValue::Array(_) => "array",
            CrdtValue::Text(_) => "text",
            CrdtValue::Counter(_) => "counter",
            CrdtValue::Primitive(_) => "primitive",
        }
    }
}

/// One registered element. Identity is the creation ticket.
#[derive(Debug, Clone)]
pub struct CrdtElement {
    created_at: TimeTicket,
    moved_at: Option<TimeTicket>,
    removed_at: Option<TimeTicket>,
    value: CrdtValue,
}

impl CrdtElement {
    pub fn new(created_at: TimeTicket, value: CrdtValue) -> CrdtElement {
        CrdtElement { created_at, moved_at: None, removed_at: None, value }
    }

    pub fn created_at(&self) -> TimeTicket {
        self.created_at
    }

    pub fn moved_at(&self) -> Option<TimeTicket> {
        self.moved_at
    }

    pub fn set_moved_at(&mut self, ticket: TimeTicket) {
        self.moved_at = Some(ticket);
    }

    pub fn removed_at(&self) -> Option<TimeTicket> {
        self.removed_at
    }

    pub fn is_removed(&self) -> bool {
        self.removed_at.is_some()
    }

    fn positioned_at(&self) -> TimeTicket {
        self.moved_at.unwrap_or(self.created_at)
    }

    /// Tombstones the element: the removal must be after both its position
    /// and any prior removal.
    pub fn remove(&mut self, ticket: TimeTicket) -> bool {
        if ticket.after(self.positioned_at())
            && self.removed_at.map_or(true, |r| ticket.after(r))
        {
            self.removed_at = Some(ticket);
            true
        } else {
            false
        }
    }

    pub fn value(&self) -> &CrdtValue {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut CrdtValue {
        &mut self.value
    }

    pub fn as_object(&self) -> Option<&CrdtObject> {
        match &self.value {
            CrdtValue::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut CrdtObject> {
        match &mut self.value {
            CrdtValue::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&CrdtArray> {
        match &self.value {
            CrdtValue::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_array_mut(&mut self) -> Option<&mut CrdtArray> {
        match &mut self.value {
            CrdtValue::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&CrdtText> {
        match &self.value {
            CrdtValue::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_text_mut(&mut self) -> Option<&mut CrdtText> {
        match &mut self.value {
            CrdtValue::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_counter(&self) -> Option<&CrdtCounter> {
        match &self.value {
            CrdtValue::Counter(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_counter_mut(&mut self) -> Option<&mut CrdtCounter> {
        match &mut self.value {
            CrdtValue::Counter(c) => Some(c),
            _ => None,
        }
    }

    /// Live byte contribution: own ticket, leaf data, and the live part of a
    /// text body. Container children are separate registry entries.
    pub fn live_size(&self) -> DataSize {
        let mut size = DataSize::new(0, TIME_TICKET_SIZE);
        match &self.value {
            CrdtValue::Primitive(p) => size.data += p.data_size(),
            CrdtValue::Counter(_) => size.data += 8,
            CrdtValue::Text(t) => size += t.live_size(),
            CrdtValue::Object(_) | CrdtValue::Array(_) => {}
        }
        size
    }

    /// Tombstone bytes held inside the element (text blocks and in-place
    /// attribute tombstones).
    pub fn gc_size(&self) -> DataSize {
        match &self.value {
            CrdtValue::Text(t) => t.gc_size(),
            _ => DataSize::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{ActorId, INITIAL_TIME_TICKET};

    fn ticket(lamport: u64) -> TimeTicket {
        TimeTicket::new(lamport, 0, ActorId::INITIAL)
    }

    #[test]
    fn removal_is_gated_by_tickets() {
        let mut elem =
            CrdtElement::new(ticket(5), CrdtValue::Primitive(PrimitiveValue::Integer(1)));
        assert!(!elem.remove(ticket(4))); // concurrent earlier removal loses
        assert!(elem.remove(ticket(6)));
        assert!(!elem.remove(ticket(6))); // same ticket is a no-op
        assert!(elem.remove(ticket(7))); // later removal advances the tombstone
        assert_eq!(elem.removed_at(), Some(ticket(7)));
    }

    #[test]
    fn root_object_sizes() {
        let root = CrdtElement::new(INITIAL_TIME_TICKET, CrdtValue::Object(CrdtObject::new()));
        assert_eq!(root.live_size(), DataSize::new(0, TIME_TICKET_SIZE));
        assert_eq!(root.gc_size(), DataSize::default());
    }
}
