//! # PtyRelay Daemon Library
//!
//! This crate provides the server side of PtyRelay: it serves interactive
//! shells running on pseudo-terminals to browser terminal emulators over
//! websockets.
//!
//! ## Overview
//!
//! - **PTY Sessions**: One shell per client connection, spawned on demand
//! - **Session Registry**: At most one live session per connection, with reaping
//! - **Relay Handler**: Per-connection state machine translating messages into
//!   process input, resizes and output
//! - **Websocket Transport**: JSON text frames with heartbeat pings
//!
//! ## Architecture
//!
//! ```text
//!  browser ──ws──▶ Websocket Adapter ──TransportEvent──▶ Relay Handler
//!                         ▲                                  │
//!                         │ Message                          │ get_or_create / remove
//!                         │                                  ▼
//!                    Output Pump ◀──── output chunks ── Session Registry ── PtySession
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, RelayServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut server = RelayServer::new(config)?;
//!     let addr = server.start().await?;
//!     println!("listening on ws://{addr}");
//!
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY sessions and the session registry
//! - [`relay`]: Connection handler, output pump and resize debouncing
//! - [`network`]: Transport channels and the websocket adapter
//! - [`orchestrator`]: Server lifecycle and connection accept loop

pub mod config;
pub mod network;
pub mod orchestrator;
pub mod relay;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::Config;

// Re-export session types for convenience
pub use session::{
    ConnectionId, ProcessSession, PtySession, PtySpawner, SessionError, SessionFactory,
    SessionInfo, SessionRegistry, SessionState, ShellCommand,
};

// Re-export relay types for convenience
pub use relay::{RelayError, RelayHandler, RelayOptions, RelayOutcome, RelayState};

// Re-export network types for convenience
pub use network::{transport_pair, AdapterEndpoint, RelayEndpoint, TransportEvent, WebSocketOptions};

// Re-export orchestrator types for convenience
pub use orchestrator::{RelayServer, ServerEvent, ServerState};
