//! Document events and the subscribe surface.
//!
//! Everything a document does is published as a synchronous batch of events;
//! per-topic subscribers are filters over that one stream.

use serde_json::Value as JsonValue;
use smartstring::alias::String as SmartString;

use crate::change::Change;
use crate::document::presence::{Presence, Presences};
use crate::document::DocStatus;
use crate::operation::OpInfo;
use crate::time::ActorId;

/// Payload of a change event.
#[derive(Debug, Clone)]
pub struct ChangeInfo {
    pub actor: ActorId,
    pub message: Option<SmartString>,
    pub operations: Vec<OpInfo>,
    /// Raw change metadata, attached when devtools are enabled.
    pub raw_change: Option<Change>,
}

#[derive(Debug, Clone)]
pub enum DocEvent {
    StatusChanged { status: DocStatus },
    Snapshot { server_seq: u64 },
    LocalChange { info: ChangeInfo },
    RemoteChange { info: ChangeInfo },
    Initialized { presences: Presences },
    Watched { actor: ActorId, presence: Presence },
    Unwatched { actor: ActorId },
    PresenceChanged { actor: ActorId, presence: Presence },
    Broadcast { topic: SmartString, payload: JsonValue },
    LocalBroadcast { topic: SmartString, payload: JsonValue },
    AuthError { reason: SmartString, method: SmartString },
}

/// Topic selectors. `Path` filters change events by JSON-path prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    Default,
    Presence,
    MyPresence,
    Others,
    Connection,
    Status,
    Sync,
    Broadcast,
    LocalBroadcast,
    AuthError,
    All,
    Path(String),
}

fn path_matches(op_path: &str, selector: &str) -> bool {
    op_path == selector
        || op_path
            .strip_prefix(selector)
            .map(|rest| rest.starts_with('.'))
            .unwrap_or(false)
}

impl Topic {
    pub fn matches(&self, event: &DocEvent, my_actor: ActorId) -> bool {
        match self {
            Topic::All => true,
            Topic::Default => matches!(
                event,
                DocEvent::LocalChange { .. } | DocEvent::RemoteChange { .. } | DocEvent::Snapshot { .. }
            ),
            Topic::Presence => matches!(
                event,
                DocEvent::Initialized { .. }
                    | DocEvent::Watched { .. }
                    | DocEvent::Unwatched { .. }
                    | DocEvent::PresenceChanged { .. }
            ),
            Topic::MyPresence => match event {
                DocEvent::Initialized { .. } => true,
                DocEvent::PresenceChanged { actor, .. } => *actor == my_actor,
                _ => false,
            },
            Topic::Others => match event {
                DocEvent::Watched { actor, .. }
                | DocEvent::Unwatched { actor }
                | DocEvent::PresenceChanged { actor, .. } => *actor != my_actor,
                _ => false,
            },
            // Connection and sync-condition events originate in the
            // transport client; the core publishes nothing under them.
            Topic::Connection | Topic::Sync => false,
            Topic::Status => matches!(event, DocEvent::StatusChanged { .. }),
            Topic::Broadcast => matches!(event, DocEvent::Broadcast { .. }),
            Topic::LocalBroadcast => matches!(event, DocEvent::LocalBroadcast { .. }),
            Topic::AuthError => matches!(event, DocEvent::AuthError { .. }),
            Topic::Path(selector) => match event {
                DocEvent::LocalChange { info } | DocEvent::RemoteChange { info } => {
                    info.operations.iter().any(|op| path_matches(&op.path, selector))
                }
                _ => false,
            },
        }
    }
}

pub(crate) struct Subscriber {
    pub id: u64,
    pub topic: Topic,
    pub handler: Box<dyn FnMut(&DocEvent)>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber").field("id", &self.id).field("topic", &self.topic).finish()
    }
}
