//! Error types for the daemon, its drivers and its clients.
//!
//! `LabError` is the single error type flowing through the port arbiter, the
//! instrument capabilities and the request protocol. Every variant maps onto a
//! stable *kind* string (see [`LabError::kind`]) which is what travels over the
//! wire inside an [`ErrorReply`], so clients can branch on the category of a
//! failure without parsing messages.
//!
//! ## Error Hierarchy
//!
//! - **`Connectivity`**: a port could not be opened, the instrument is not open,
//!   or the device did not answer.
//! - **`ProtocolParse`**: a reply did not match the expected grammar.
//! - **`Timeout`**: a query, send or receive deadline was exceeded.
//! - **`UnknownDevice`** / **`UnknownRequestType`**: lookups that missed.
//! - **`Config`** / **`Configuration`**: file parsing errors from `figment` and
//!   semantic validation errors respectively.
//! - **`Remote`**: an error reply received from the daemon by a client.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, LabError>;

#[derive(Error, Debug)]
pub enum LabError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connectivity error: {0}")]
    Connectivity(String),

    #[error("Protocol parse error: {0}")]
    ProtocolParse(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Unknown request type: {0}")]
    UnknownRequestType(String),

    /// Raised by instruments that refuse to be used at all.
    #[error("{0}")]
    Unavailable(String),

    #[error("A sequence is already running")]
    SequenceBusy,

    #[error("Experiment error: {0}")]
    Experiment(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{message}")]
    Remote { kind: String, message: String },
}

impl LabError {
    /// Stable category name carried in error replies.
    pub fn kind(&self) -> &str {
        match self {
            LabError::Config(_) | LabError::Configuration(_) => "ConfigurationError",
            LabError::Io(_) => "IoError",
            LabError::Serialization(_) => "SerializationError",
            LabError::Connectivity(_) => "ConnectivityError",
            LabError::ProtocolParse(_) => "ProtocolParseError",
            LabError::Timeout(_) => "TimeoutError",
            LabError::UnknownDevice(_) => "UnknownDeviceError",
            LabError::UnknownRequestType(_) => "UnknownRequestTypeError",
            LabError::Unavailable(_) => "Unavailable",
            LabError::SequenceBusy => "SequenceBusyError",
            LabError::Experiment(_) => "ExperimentError",
            LabError::FeatureNotEnabled(_) => "FeatureNotEnabled",
            LabError::Internal(_) => "InternalError",
            LabError::Remote { kind, .. } => kind,
        }
    }
}

/// Structured error as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub kind: String,
    pub message: String,
}

impl From<&LabError> for ErrorReply {
    fn from(err: &LabError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<ErrorReply> for LabError {
    fn from(reply: ErrorReply) -> Self {
        LabError::Remote {
            kind: reply.kind,
            message: reply.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_keeps_bare_message() {
        let err = LabError::Unavailable("Unavailable device".into());
        assert_eq!(err.kind(), "Unavailable");
        assert_eq!(err.to_string(), "Unavailable device");
    }

    #[test]
    fn error_reply_round_trips_kind() {
        let err = LabError::Timeout("query :MDL?;".into());
        let reply = ErrorReply::from(&err);
        assert_eq!(reply.kind, "TimeoutError");

        let remote: LabError = reply.into();
        assert_eq!(remote.kind(), "TimeoutError");
        assert!(remote.to_string().contains(":MDL?;"));
    }

    #[test]
    fn io_errors_convert_with_question_mark() {
        fn open_missing() -> AppResult<()> {
            std::fs::File::open("/definitely/not/here")?;
            Ok(())
        }
        let err = open_missing().unwrap_err();
        assert_eq!(err.kind(), "IoError");
    }
}
