//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering wire-level failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize a message.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize a message.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// Message arrived from the wrong side of the connection.
    #[error("unexpected {tag} message from {from}")]
    WrongDirection {
        /// Wire tag of the offending message.
        tag: &'static str,
        /// Side the message came from.
        from: &'static str,
    },

    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),
}

/// Terminal dimensions outside the accepted range.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("invalid dimensions: {cols}x{rows} (both must be between 1 and 65535)")]
pub struct InvalidDimensions {
    /// Requested columns as received.
    pub cols: i64,
    /// Requested rows as received.
    pub rows: i64,
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            _ => ProtocolError::ConnectionClosed(err.to_string()),
        }
    }
}
