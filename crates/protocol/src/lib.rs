//! # PtyRelay Protocol Library
//!
//! Wire definitions shared by the relay daemon and its tests.
//!
//! ## Overview
//!
//! - **Message Definitions**: the tagged JSON messages exchanged with the
//!   browser terminal (`start-session`, `resize`, `stdin`, `stdout`, ...)
//! - **Dimensions**: validated terminal sizes
//! - **Text Handling**: UTF-8 boundary splitting for byte streams sent as strings
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Dimensions, Message};
//!
//! let msg = Message::start_session(Dimensions::new(80, 24).unwrap());
//! let json = msg.to_json().unwrap();
//! assert_eq!(json, r#"{"type":"start-session","cols":80,"rows":24}"#);
//!
//! let parsed = Message::from_json(&json).unwrap();
//! assert_eq!(parsed, msg);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Protocol message definitions
//! - [`text`]: UTF-8 chunk boundary handling
//! - [`error`]: Error types

pub mod error;
pub mod messages;
pub mod text;

pub use error::{InvalidDimensions, ProtocolError, Result};
pub use messages::{Dimensions, Direction, Message, DEFAULT_COLS, DEFAULT_ROWS};
pub use text::Utf8Chunker;
