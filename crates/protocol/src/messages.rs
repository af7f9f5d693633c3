//! Protocol message definitions for PtyRelay.
//!
//! Every message is a JSON object tagged by a kebab-case `type` field, e.g.
//! `{"type":"start-session","cols":80,"rows":24}`. Each tag travels in exactly
//! one direction; see [`Message::direction`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{InvalidDimensions, ProtocolError, Result};

/// Default terminal width used when a client supplies no usable size.
pub const DEFAULT_COLS: u16 = 80;

/// Default terminal height used when a client supplies no usable size.
pub const DEFAULT_ROWS: u16 = 24;

/// Validated terminal dimensions.
///
/// Both values are strictly positive. The only way to build one from
/// untrusted input is [`Dimensions::new`], so a `Dimensions` value never
/// carries a degenerate size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dimensions {
    cols: u16,
    rows: u16,
}

impl Dimensions {
    /// Validates wire integers into dimensions.
    pub fn new(cols: i64, rows: i64) -> std::result::Result<Self, InvalidDimensions> {
        let valid = |v: i64| v > 0 && v <= i64::from(u16::MAX);
        if !valid(cols) || !valid(rows) {
            return Err(InvalidDimensions { cols, rows });
        }
        Ok(Self {
            cols: cols as u16,
            rows: rows as u16,
        })
    }

    /// Terminal width in columns.
    pub fn cols(&self) -> u16 {
        self.cols
    }

    /// Terminal height in rows.
    pub fn rows(&self) -> u16 {
        self.rows
    }
}

impl Default for Dimensions {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Which side of the connection sends a given message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Browser terminal to relay.
    ClientToServer,
    /// Relay to browser terminal.
    ServerToClient,
}

impl Direction {
    fn label(self) -> &'static str {
        match self {
            Direction::ClientToServer => "client",
            Direction::ServerToClient => "server",
        }
    }
}

/// Top-level wire message.
///
/// Size fields are plain integers on the wire so that a bad size from the
/// client still parses and can be rejected by [`Dimensions::new`] instead of
/// failing the whole frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// Request a shell session with the client's initial size.
    StartSession { cols: i64, rows: i64 },
    /// Terminal size changed on the client.
    Resize { cols: i64, rows: i64 },
    /// Keystrokes from the client.
    Stdin { data: String },
    /// Client is going away.
    Disconnect,
    /// The shell is up and accepting input.
    Ready,
    /// Shell output.
    Stdout {
        #[serde(with = "text_bytes")]
        data: Vec<u8>,
    },
    /// User-visible notice about a failure on the server.
    Error { message: String },
    /// The shell exited on its own.
    Exit { code: Option<i32> },
}

impl Message {
    /// Builds a `start-session` request.
    pub fn start_session(dims: Dimensions) -> Self {
        Message::StartSession {
            cols: i64::from(dims.cols()),
            rows: i64::from(dims.rows()),
        }
    }

    /// Builds a `resize` request.
    pub fn resize(dims: Dimensions) -> Self {
        Message::Resize {
            cols: i64::from(dims.cols()),
            rows: i64::from(dims.rows()),
        }
    }

    /// Builds a `stdin` message.
    pub fn stdin(data: impl Into<String>) -> Self {
        Message::Stdin { data: data.into() }
    }

    /// Builds a `stdout` message.
    pub fn stdout(data: impl Into<Vec<u8>>) -> Self {
        Message::Stdout { data: data.into() }
    }

    /// Builds an `error` notice.
    pub fn error(message: impl Into<String>) -> Self {
        Message::Error {
            message: message.into(),
        }
    }

    /// Returns the wire tag of this message.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::StartSession { .. } => "start-session",
            Message::Resize { .. } => "resize",
            Message::Stdin { .. } => "stdin",
            Message::Disconnect => "disconnect",
            Message::Ready => "ready",
            Message::Stdout { .. } => "stdout",
            Message::Error { .. } => "error",
            Message::Exit { .. } => "exit",
        }
    }

    /// Returns the fixed direction of this message's tag.
    pub fn direction(&self) -> Direction {
        match self {
            Message::StartSession { .. }
            | Message::Resize { .. }
            | Message::Stdin { .. }
            | Message::Disconnect => Direction::ClientToServer,
            Message::Ready
            | Message::Stdout { .. }
            | Message::Error { .. }
            | Message::Exit { .. } => Direction::ServerToClient,
        }
    }

    /// Fails with [`ProtocolError::WrongDirection`] unless this message
    /// is allowed to arrive from `from`.
    pub fn expect_from(&self, from: Direction) -> Result<()> {
        if self.direction() == from {
            Ok(())
        } else {
            Err(ProtocolError::WrongDirection {
                tag: self.tag(),
                from: from.label(),
            })
        }
    }

    /// Serializes the message to a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Bytes carried as a JSON string.
///
/// Invalid UTF-8 is replaced with U+FFFD on the way out; callers that care
/// about multibyte sequences split across chunks should pass output through
/// [`crate::text::Utf8Chunker`] first.
mod text_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        String::deserialize(deserializer).map(String::into_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn to_value(msg: &Message) -> serde_json::Value {
        serde_json::from_str(&msg.to_json().unwrap()).unwrap()
    }

    #[test]
    fn test_dimensions_valid() {
        let dims = Dimensions::new(80, 24).unwrap();
        assert_eq!(dims.cols(), 80);
        assert_eq!(dims.rows(), 24);
        assert_eq!(dims.to_string(), "80x24");
    }

    #[test]
    fn test_dimensions_rejects_zero_and_negative() {
        assert_eq!(
            Dimensions::new(0, 24),
            Err(InvalidDimensions { cols: 0, rows: 24 })
        );
        assert!(Dimensions::new(80, 0).is_err());
        assert!(Dimensions::new(-1, 24).is_err());
        assert!(Dimensions::new(80, -5).is_err());
    }

    #[test]
    fn test_dimensions_rejects_oversized() {
        assert!(Dimensions::new(65_535, 1).is_ok());
        assert!(Dimensions::new(65_536, 24).is_err());
    }

    #[test]
    fn test_dimensions_default() {
        let dims = Dimensions::default();
        assert_eq!((dims.cols(), dims.rows()), (DEFAULT_COLS, DEFAULT_ROWS));
    }

    #[test]
    fn test_start_session_wire_format() {
        let msg = Message::start_session(Dimensions::new(80, 24).unwrap());
        assert_eq!(
            to_value(&msg),
            json!({"type": "start-session", "cols": 80, "rows": 24})
        );
    }

    #[test]
    fn test_unit_variants_wire_format() {
        assert_eq!(to_value(&Message::Ready), json!({"type": "ready"}));
        assert_eq!(to_value(&Message::Disconnect), json!({"type": "disconnect"}));
    }

    #[test]
    fn test_ready_accepts_empty_payload_fields() {
        let msg = Message::from_json(r#"{"type":"ready","extra":{}}"#).unwrap();
        assert_eq!(msg, Message::Ready);
    }

    #[test]
    fn test_stdout_serialized_as_string() {
        let msg = Message::stdout(b"total 0\r\n".to_vec());
        assert_eq!(
            to_value(&msg),
            json!({"type": "stdout", "data": "total 0\r\n"})
        );
    }

    #[test]
    fn test_stdout_invalid_utf8_is_replaced() {
        let msg = Message::stdout(vec![b'a', 0xFF, b'b']);
        assert_eq!(
            to_value(&msg),
            json!({"type": "stdout", "data": "a\u{FFFD}b"})
        );
    }

    #[test]
    fn test_parse_client_messages() {
        assert_eq!(
            Message::from_json(r#"{"type":"resize","cols":100,"rows":30}"#).unwrap(),
            Message::Resize { cols: 100, rows: 30 }
        );
        assert_eq!(
            Message::from_json(r#"{"type":"stdin","data":"ls\n"}"#).unwrap(),
            Message::stdin("ls\n")
        );
    }

    #[test]
    fn test_negative_size_still_parses() {
        let msg = Message::from_json(r#"{"type":"resize","cols":-1,"rows":0}"#).unwrap();
        assert_eq!(msg, Message::Resize { cols: -1, rows: 0 });
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = Message::from_json(r#"{"type":"shutdown"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_exit_with_null_code() {
        let msg = Message::from_json(r#"{"type":"exit","code":null}"#).unwrap();
        assert_eq!(msg, Message::Exit { code: None });
    }

    #[test]
    fn test_direction_is_fixed_per_tag() {
        assert_eq!(Message::stdin("x").direction(), Direction::ClientToServer);
        assert_eq!(Message::Disconnect.direction(), Direction::ClientToServer);
        assert_eq!(Message::Ready.direction(), Direction::ServerToClient);
        assert_eq!(Message::error("boom").direction(), Direction::ServerToClient);
    }

    #[test]
    fn test_expect_from_rejects_wrong_direction() {
        let msg = Message::stdout(b"x".to_vec());
        assert!(msg.expect_from(Direction::ServerToClient).is_ok());
        let err = msg.expect_from(Direction::ClientToServer).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::WrongDirection {
                tag: "stdout",
                from: "client"
            }
        ));
    }
}
