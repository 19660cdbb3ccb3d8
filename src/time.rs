//! Logical clocks: actors, time tickets and version vectors.
//!
//! A ticket totally orders every operation ever produced; the order is
//! (lamport, actor, delimiter). Version vectors carry the per-actor lamport
//! floor used for causal gating and the GC threshold.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub type Lamport = u64;

pub const ACTOR_ID_SIZE: usize = 16;

/// Byte cost of one ticket in the metadata accountant: lamport + delimiter +
/// actor.
pub const TIME_TICKET_SIZE: usize = 8 + 4 + ACTOR_ID_SIZE;

/// A replica identity. `ActorId::INITIAL` means "unassigned" and is used
/// while a document is detached.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ActorId([u8; ACTOR_ID_SIZE]);

impl ActorId {
    pub const INITIAL: ActorId = ActorId([0; ACTOR_ID_SIZE]);
    pub const MAX: ActorId = ActorId([0xff; ACTOR_ID_SIZE]);

    pub fn from_bytes(bytes: [u8; ACTOR_ID_SIZE]) -> ActorId {
        ActorId(bytes)
    }

    pub fn random() -> ActorId {
        ActorId(*uuid::Uuid::new_v4().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; ACTOR_ID_SIZE] {
        &self.0
    }

    pub fn is_initial(&self) -> bool {
        *self == ActorId::INITIAL
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(ACTOR_ID_SIZE * 2);
        for b in &self.0 {
            s.push_str(&format!("{:02x}", b));
        }
        s
    }

    pub fn from_hex(hex: &str) -> Option<ActorId> {
        if hex.len() != ACTOR_ID_SIZE * 2 {
            return None;
        }
        let mut bytes = [0u8; ACTOR_ID_SIZE];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let s = std::str::from_utf8(chunk).ok()?;
            bytes[i] = u8::from_str_radix(s, 16).ok()?;
        }
        Some(ActorId(bytes))
    }
}

impl Display for ActorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Debug for ActorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // The leading 4 bytes are enough to tell actors apart in test output.
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

impl Serialize for ActorId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ActorId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HexVisitor;
        impl Visitor<'_> for HexVisitor {
            type Value = ActorId;
            fn expecting(&self, f: &mut Formatter) -> std::fmt::Result {
                f.write_str("a 32-character hex actor id")
            }
            fn visit_str<E: de::Error>(self, v: &str) -> Result<ActorId, E> {
                ActorId::from_hex(v).ok_or_else(|| E::custom("malformed actor id"))
            }
        }
        deserializer.deserialize_str(HexVisitor)
    }
}

/// An immutable ⟨lamport, delimiter, actor⟩ triple naming one operation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeTicket {
    lamport: Lamport,
    delimiter: u32,
    actor: ActorId,
}

/// The minimum ticket. The root object is created at this ticket, and it
/// anchors every split-list head node.
pub const INITIAL_TIME_TICKET: TimeTicket = TimeTicket {
    lamport: 0,
    delimiter: 0,
    actor: ActorId::INITIAL,
};

/// Sentinel upper bound; compares after every real ticket.
pub const MAX_TIME_TICKET: TimeTicket = TimeTicket {
    lamport: u64::MAX,
    delimiter: u32::MAX,
    actor: ActorId::MAX,
};

impl TimeTicket {
    pub fn new(lamport: Lamport, delimiter: u32, actor: ActorId) -> TimeTicket {
        TimeTicket { lamport, delimiter, actor }
    }

    pub fn lamport(&self) -> Lamport {
        self.lamport
    }

    pub fn delimiter(&self) -> u32 {
        self.delimiter
    }

    pub fn actor(&self) -> ActorId {
        self.actor
    }

    pub fn after(&self, other: TimeTicket) -> bool {
        *self > other
    }

    pub fn with_actor(&self, actor: ActorId) -> TimeTicket {
        TimeTicket { actor, ..*self }
    }

    pub fn to_id_string(&self) -> String {
        format!("{}:{}:{}", self.lamport, self.actor.to_hex(), self.delimiter)
    }
}

impl Ord for TimeTicket {
    fn cmp(&self, other: &Self) -> Ordering {
        self.lamport
            .cmp(&other.lamport)
            .then_with(|| self.actor.cmp(&other.actor))
            .then_with(|| self.delimiter.cmp(&other.delimiter))
    }
}

impl PartialOrd for TimeTicket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Debug for TimeTicket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{:?}:{}", self.lamport, self.actor, self.delimiter)
    }
}

/// Per-actor lamport floor. Missing entries read as 0.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct VersionVector {
    entries: BTreeMap<ActorId, Lamport>,
}

impl VersionVector {
    pub fn new() -> VersionVector {
        VersionVector::default()
    }

    pub fn get(&self, actor: ActorId) -> Lamport {
        self.entries.get(&actor).copied().unwrap_or(0)
    }

    pub fn set(&mut self, actor: ActorId, value: Lamport) {
        self.entries.insert(actor, value);
    }

    pub fn unset(&mut self, actor: ActorId) {
        self.entries.remove(&actor);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_lamport(&self) -> Lamport {
        self.entries.values().copied().max().unwrap_or(0)
    }

    /// Pointwise max over the union of keys.
    pub fn max(&self, other: &VersionVector) -> VersionVector {
        let mut out = self.clone();
        for (&actor, &lamport) in &other.entries {
            let e = out.entries.entry(actor).or_insert(0);
            if lamport > *e {
                *e = lamport;
            }
        }
        out
    }

    /// Pointwise min over the union of keys; an actor missing from either
    /// side floors to 0. The min across live participants is the GC safety
    /// threshold.
    pub fn min(&self, other: &VersionVector) -> VersionVector {
        let mut out = VersionVector::new();
        for (&actor, &lamport) in &self.entries {
            out.set(actor, lamport.min(other.get(actor)));
        }
        for (&actor, _) in &other.entries {
            if !self.entries.contains_key(&actor) {
                out.set(actor, 0);
            }
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = (ActorId, Lamport)> + '_ {
        self.entries.iter().map(|(&a, &l)| (a, l))
    }
}

impl Debug for VersionVector {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

impl Serialize for VersionVector {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (actor, lamport) in &self.entries {
            map.serialize_entry(&actor.to_hex(), lamport)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for VersionVector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, Lamport>::deserialize(deserializer)?;
        let mut vv = VersionVector::new();
        for (hex, lamport) in raw {
            let actor =
                ActorId::from_hex(&hex).ok_or_else(|| de::Error::custom("malformed actor id"))?;
            vv.set(actor, lamport);
        }
        Ok(vv)
    }
}
