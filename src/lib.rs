//! Client-side core of a CRDT collaborative document engine.
//!
//! Many clients concurrently edit a shared hierarchical document (objects,
//! arrays, counters, rich text) while offline or online, and converge
//! deterministically once changes are exchanged. The heart of the crate is
//! the block-based split list backing rich text, the logical-clock layer
//! gating causality and garbage collection, and the document loop that
//! turns user mutations into replicated changes with an undo trail.
//!
//! The wire codec, transport and server are external collaborators; their
//! decoded shapes live in [`protocol`].

pub mod change;
pub mod crdt;
pub mod document;
pub mod error;
pub mod operation;
pub mod protocol;
pub mod resource;
pub mod time;

mod index;

pub use change::{Change, ChangeContext, ChangeId, Checkpoint};
pub use crdt::element::PrimitiveValue;
pub use crdt::root::CrdtRoot;
pub use crdt::split_list::{SplitNodeId, SplitPos};
pub use crdt::text::{Attrs, StyleAttrs};
pub use document::event::{ChangeInfo, DocEvent, Topic};
pub use document::presence::{Presence, PresenceChange, Presences};
pub use document::{ArrRef, CounterRef, DocStatus, Document, DocumentOptions, ObjRef, TextRef, Updater};
pub use error::{DocError, Result};
pub use operation::{ElementSeed, OpDetail, OpInfo, OpSource, Operation};
pub use protocol::{ChangePack, SchemaValidator, Snapshot, WatchDocumentResponse, WatchEvent};
pub use resource::{DataSize, DocSize};
pub use time::{ActorId, Lamport, TimeTicket, VersionVector, ACTOR_ID_SIZE, TIME_TICKET_SIZE};
