use std::error::Error;
use std::fmt::{Display, Formatter};

use smartstring::alias::String as SmartString;

/// Errors surfaced by the document core. Transport-level failures are wrapped
/// into `AuthError` by the caller before they reach subscribers.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum DocError {
    /// Write attempted after the document transitioned to Removed.
    DocumentRemoved,
    /// Bad path, unknown element ticket, wrong element kind, or an index
    /// outside the document.
    InvalidArgument(SmartString),
    /// The mutated document violated one or more schema rules.
    SchemaValidationFailed { messages: Vec<SmartString> },
    /// live + gc size exceeded the configured limit.
    SizeExceedsLimit { size: usize, limit: usize },
    /// Undo/redo refused: empty stack or called from inside a mutator.
    Refused(SmartString),
    AuthError { reason: SmartString, method: SmartString },
}

impl DocError {
    pub fn invalid_argument(msg: impl AsRef<str>) -> DocError {
        DocError::InvalidArgument(SmartString::from(msg.as_ref()))
    }

    pub(crate) fn refused(msg: impl AsRef<str>) -> DocError {
        DocError::Refused(SmartString::from(msg.as_ref()))
    }
}

impl Display for DocError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DocError::DocumentRemoved => f.write_str("document was removed"),
            DocError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            DocError::SchemaValidationFailed { messages } => {
                write!(f, "schema validation failed: {}", messages.join("; "))
            }
            DocError::SizeExceedsLimit { size, limit } => {
                write!(f, "document size {} exceeds limit {}", size, limit)
            }
            DocError::Refused(msg) => write!(f, "refused: {}", msg),
            DocError::AuthError { reason, method } => {
                write!(f, "auth error in {}: {}", method, reason)
            }
        }
    }
}

impl Error for DocError {}

pub type Result<T> = std::result::Result<T, DocError>;
