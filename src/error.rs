use crate::protocol::ResultCode;
use crate::state::SessionState;
use crate::types::PropertyId;
use thiserror::Error;

/// Result type for ComfoConnect operations
pub type Result<T> = std::result::Result<T, ComfoError>;

/// Errors that can occur when talking to a ComfoConnect gateway
#[derive(Error, Debug)]
pub enum ComfoError {
    /// Could not open the TCP link to the unit
    #[error("Connect error: {0}")]
    Connect(String),

    /// The unit rejected the PIN
    #[error("Authentication failed: unit answered {0}")]
    Authentication(ResultCode),

    /// Request deadline elapsed before a response arrived
    #[error("Request timeout")]
    Timeout,

    /// A sequence number was reused while still unresolved
    #[error("Duplicate sequence number: {0}")]
    DuplicateSequence(u16),

    /// Malformed frame
    #[error("Decode error: {0}")]
    Decode(String),

    /// Session was torn down while the request was pending
    #[error("Request cancelled")]
    Cancelled,

    /// Connection was closed unexpectedly
    #[error("Connection closed")]
    ConnectionClosed,

    /// The unit answered with a non-OK result code
    #[error("Request rejected by unit: {0}")]
    Rejected(ResultCode),

    /// Session is not authenticated and the client is configured to fail fast
    #[error("Session not authenticated (state: {0:?})")]
    NotAuthenticated(SessionState),

    /// Reconnect ceiling exceeded, session is permanently down
    #[error("Session failed: {0}")]
    SessionFailed(String),

    /// Transition rejected by the session state machine
    #[error("Invalid state transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    /// Property is not in the static registry
    #[error("Unknown property: {0}")]
    UnknownProperty(String),

    /// Value does not match the declared kind of the property
    #[error("Invalid value for {property}: {reason}")]
    InvalidValue {
        property: PropertyId,
        reason: String,
    },

    /// Reading a property failed
    #[error("Failed to read {property}: {source}")]
    Read {
        property: PropertyId,
        #[source]
        source: Box<ComfoError>,
    },

    /// Writing a property failed
    #[error("Failed to write {property}: {source}")]
    Write {
        property: PropertyId,
        #[source]
        source: Box<ComfoError>,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ComfoError {
    /// Whether retrying the same operation may succeed without user action
    pub fn is_retryable(&self) -> bool {
        match self {
            ComfoError::Connect(_)
            | ComfoError::Timeout
            | ComfoError::ConnectionClosed
            | ComfoError::Cancelled
            | ComfoError::Io(_) => true,
            ComfoError::Read { source, .. } | ComfoError::Write { source, .. } => {
                source.is_retryable()
            }
            _ => false,
        }
    }

    pub(crate) fn read(property: PropertyId, source: ComfoError) -> Self {
        ComfoError::Read {
            property,
            source: Box::new(source),
        }
    }

    pub(crate) fn write(property: PropertyId, source: ComfoError) -> Self {
        ComfoError::Write {
            property,
            source: Box::new(source),
        }
    }
}
