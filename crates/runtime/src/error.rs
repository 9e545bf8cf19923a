//! Error types for the enginelink runtime.

use enginelink_protocol::ErrorPayload;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the enginelink runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// The engine executable does not exist on disk. The bundled variant
    /// suggests reinstalling; the explicit variant does not.
    #[error(
        "Failed to launch {name} because executable doesn't exist at {}{}",
        path.display(),
        if *bundled { "\nTry re-installing the engine package" } else { "" }
    )]
    ExecutableNotFound {
        name: String,
        path: PathBuf,
        bundled: bool,
    },

    /// Failed to launch the engine process.
    #[error("Failed to launch engine: {0}")]
    LaunchFailed(String),

    /// The known nondeterministic dynamic-loader race during engine startup.
    /// Recoverable by exactly one retry.
    #[error("Engine startup hit a loader race: {0}")]
    StartupRace(String),

    /// Transport-level error (framing, stream I/O).
    #[error("Transport error: {0}")]
    TransportError(String),

    /// Protocol-level error (malformed or unexpected messages).
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// A node with this identifier is already registered on the connection.
    #[error("Duplicate guid: {0}")]
    DuplicateGuid(String),

    /// A method with this name is already registered on the node type.
    #[error("Duplicate method {type_name}.{method}")]
    DuplicateMethod { type_name: String, method: String },

    /// The addressed node is unknown or disposed.
    #[error("Target {guid} has been closed or does not exist")]
    TargetClosed { guid: String },

    /// The addressed node does not expose this method.
    #[error("Unknown method {type_name}.{method}")]
    UnknownMethod { type_name: String, method: String },

    /// A deadline elapsed.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// An invocation was explicitly aborted.
    #[error("Aborted: {0}")]
    Aborted(String),

    /// Channel closed unexpectedly.
    #[error("Channel closed unexpectedly")]
    ChannelClosed,

    /// Remote error with full context, as carried by a failure envelope.
    #[error("{name}: {message}")]
    Remote {
        name: String,
        message: String,
        stack: Option<String>,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns true if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Remote { name, .. } => name == "TimeoutError",
            _ => false,
        }
    }

    /// Returns true if this is a target closed error.
    pub fn is_target_closed(&self) -> bool {
        match self {
            Error::TargetClosed { .. } => true,
            Error::Remote { name, .. } => name == "TargetClosedError",
            _ => false,
        }
    }

    /// Returns true if this is the recoverable startup race.
    pub fn is_startup_race(&self) -> bool {
        matches!(self, Error::StartupRace(_))
    }

    /// Converts this error into the structured payload carried by a failure
    /// envelope.
    pub fn wire_payload(&self) -> ErrorPayload {
        if let Error::Remote {
            name,
            message,
            stack,
        } = self
        {
            return ErrorPayload {
                message: message.clone(),
                name: Some(name.clone()),
                stack: stack.clone(),
            };
        }

        // Timeout/abort messages travel without the Display prefix.
        let (name, message) = match self {
            Error::Timeout(message) => ("TimeoutError", message.clone()),
            Error::TargetClosed { .. } => ("TargetClosedError", self.to_string()),
            Error::Aborted(message) => ("AbortedError", message.clone()),
            _ => ("Error", self.to_string()),
        };
        ErrorPayload {
            message,
            name: Some(name.to_string()),
            stack: None,
        }
    }
}

/// Converts an [`ErrorPayload`] from the wire into [`Error::Remote`].
pub fn parse_wire_error(error: ErrorPayload) -> Error {
    Error::Remote {
        name: error.name.unwrap_or_else(|| "Error".to_string()),
        message: error.message,
        stack: error.stack,
    }
}
