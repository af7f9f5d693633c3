//! Session management module.
//!
//! This module provides PTY spawning and the per-connection session registry.
//! Sessions are created on demand, written to, resized, and terminated when
//! their connection goes away.

pub mod pty;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use pty::{
    ConnectionId, OutputStream, ProcessSession, PtySession, PtySpawner, SessionError,
    SessionFactory, SessionInfo, SessionState, ShellCommand, DEFAULT_OUTPUT_CAPACITY,
};
pub use registry::SessionRegistry;
