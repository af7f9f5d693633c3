//! Per-connection relay between a transport and a shell session.
//!
//! The [`RelayHandler`] drives the connection state machine, the output pump
//! moves process output to the client, and the resize debouncer collapses
//! bursts of resize requests into one pty resize.

pub mod debounce;
pub mod handler;
pub mod pump;

use protocol::{Message, ProtocolError};

use crate::session::SessionError;

pub use debounce::ResizeDebouncer;
pub use handler::{RelayHandler, RelayOptions, RelayOutcome, RelayState};
pub use pump::PumpExit;

/// Errors surfaced while relaying a connection.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Session-related error.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Wire-level error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The transport failed or went away.
    #[error("transport error: {0}")]
    Transport(String),
}

impl RelayError {
    /// Text shown to the user in an `error` message.
    pub fn notice(&self) -> String {
        match self {
            RelayError::Session(SessionError::SpawnFailed(reason)) => {
                format!("failed to start shell: {reason}")
            }
            RelayError::Session(SessionError::LimitReached(max)) => {
                format!("server is at capacity ({max} sessions), try again later")
            }
            RelayError::Session(SessionError::Cancelled(_)) => {
                "session was closed before it started".to_string()
            }
            other => other.to_string(),
        }
    }

    /// Builds the `error` message sent to the client.
    pub fn to_message(&self) -> Message {
        Message::error(self.notice())
    }
}
