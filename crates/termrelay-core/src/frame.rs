//! JSON frames exchanged over the terminal WebSocket.
//!
//! Wire format: one JSON object per WebSocket message, tagged by `type`.
//! Timestamps are metadata only; wire order is authoritative.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Every `type` value this protocol version understands.
const FRAME_TYPES: &[&str] = &[
    "connect",
    "input",
    "output",
    "resize",
    "disconnect",
    "error",
    "ping",
    "pong",
];

/// Emitted if serialization ever fails; keeps `encode` total.
const ENCODE_FALLBACK: &str =
    r#"{"type":"error","code":"internal","message":"frame encoding failed"}"#;

/// Errors produced while decoding an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("unknown frame type: {0}")]
    UnknownFrameType(String),
}

/// Opaque session identifier (UUID v4 on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// What backs a session's terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionType {
    LocalShell,
    Ssh,
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionType::LocalShell => f.write_str("local-shell"),
            SessionType::Ssh => f.write_str("ssh"),
        }
    }
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub rows: u16,
    pub cols: u16,
}

impl TerminalSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    /// Both dimensions must be non-zero.
    pub fn is_valid(&self) -> bool {
        self.rows > 0 && self.cols > 0
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// Stable error codes carried by `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    MalformedFrame,
    UnknownFrameType,
    SpawnFailed,
    AlreadyBound,
    SessionNotFound,
    PtyReadFailure,
    WriteBackpressureTimeout,
    Unauthorized,
    NotAttached,
    IdleTimeout,
    CapacityExceeded,
    RateLimited,
    Internal,
    /// A code sent by a newer peer.
    #[serde(other)]
    Unknown,
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Client → server: open a fresh session or resume one by id.
    /// Server → client: acknowledgment carrying the assigned `session_id`.
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        session_type: SessionType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ssh_profile_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
    },
    /// Client keystrokes.
    Input {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        data: String,
    },
    /// Terminal output.
    Output {
        session_id: SessionId,
        data: String,
        timestamp: DateTime<Utc>,
    },
    Resize {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        data: TerminalSize,
    },
    Disconnect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        #[serde(default)]
        reason: String,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
    Ping,
    Pong,
}

impl Frame {
    /// Build an `output` frame stamped with the current time.
    pub fn output(session_id: SessionId, data: impl Into<String>) -> Self {
        Frame::Output {
            session_id,
            data: data.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Frame::Error {
            code,
            message: message.into(),
        }
    }

    pub fn disconnect(session_id: Option<SessionId>, reason: impl Into<String>) -> Self {
        Frame::Disconnect {
            session_id,
            reason: reason.into(),
        }
    }

    /// The wire `type` tag of this frame.
    pub fn frame_type(&self) -> &'static str {
        match self {
            Frame::Connect { .. } => "connect",
            Frame::Input { .. } => "input",
            Frame::Output { .. } => "output",
            Frame::Resize { .. } => "resize",
            Frame::Disconnect { .. } => "disconnect",
            Frame::Error { .. } => "error",
            Frame::Ping => "ping",
            Frame::Pong => "pong",
        }
    }

    /// Semantic checks serde cannot express.
    fn validate(&self) -> Result<(), DecodeError> {
        match self {
            Frame::Resize { data, .. } if !data.is_valid() => Err(DecodeError::MalformedFrame(
                format!("resize requires rows > 0 and cols > 0, got {}x{}", data.rows, data.cols),
            )),
            Frame::Connect {
                session_type: SessionType::Ssh,
                ssh_profile_id: None,
                ..
            } => Err(DecodeError::MalformedFrame("ssh connect requires ssh_profile_id".into())),
            Frame::Connect { rows: Some(0), .. } | Frame::Connect { cols: Some(0), .. } => {
                Err(DecodeError::MalformedFrame("connect size must be non-zero".into()))
            }
            _ => Ok(()),
        }
    }
}

/// Decode a text WebSocket message into a frame.
pub fn decode(raw: &str) -> Result<Frame, DecodeError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| DecodeError::MalformedFrame(format!("invalid JSON: {e}")))?;
    decode_value(value)
}

/// Decode a binary WebSocket message (UTF-8 JSON) into a frame.
pub fn decode_bytes(raw: &[u8]) -> Result<Frame, DecodeError> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| DecodeError::MalformedFrame(format!("invalid JSON: {e}")))?;
    decode_value(value)
}

fn decode_value(value: Value) -> Result<Frame, DecodeError> {
    let frame_type = match value.get("type") {
        Some(Value::String(t)) => t.clone(),
        Some(_) => return Err(DecodeError::MalformedFrame("`type` must be a string".into())),
        None => return Err(DecodeError::MalformedFrame("missing `type`".into())),
    };

    if !FRAME_TYPES.contains(&frame_type.as_str()) {
        return Err(DecodeError::UnknownFrameType(frame_type));
    }

    let frame: Frame = serde_json::from_value(value)
        .map_err(|e| DecodeError::MalformedFrame(format!("{frame_type}: {e}")))?;
    frame.validate()?;
    Ok(frame)
}

/// Encode a frame as a JSON text message.
pub fn encode(frame: &Frame) -> String {
    serde_json::to_string(frame).unwrap_or_else(|_| ENCODE_FALLBACK.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_connect() {
        let frame = decode(r#"{"type":"connect","session_type":"local-shell"}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Connect {
                session_id: None,
                session_type: SessionType::LocalShell,
                ssh_profile_id: None,
                rows: None,
                cols: None,
            }
        );
    }

    #[test]
    fn resume_connect_with_ssh_profile() {
        let id = SessionId::new();
        let raw = format!(
            r#"{{"type":"connect","session_id":"{id}","session_type":"ssh","ssh_profile_id":"prod-box","rows":40,"cols":120}}"#
        );
        match decode(&raw).unwrap() {
            Frame::Connect {
                session_id,
                session_type,
                ssh_profile_id,
                rows,
                cols,
            } => {
                assert_eq!(session_id, Some(id));
                assert_eq!(session_type, SessionType::Ssh);
                assert_eq!(ssh_profile_id.as_deref(), Some("prod-box"));
                assert_eq!((rows, cols), (Some(40), Some(120)));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn ssh_connect_without_profile_is_malformed() {
        let err = decode(r#"{"type":"connect","session_type":"ssh"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedFrame(_)));
    }

    #[test]
    fn connect_with_zero_dimension_is_malformed() {
        for raw in [
            r#"{"type":"connect","session_type":"local-shell","rows":0,"cols":80}"#,
            r#"{"type":"connect","session_type":"local-shell","rows":24,"cols":0}"#,
        ] {
            assert!(matches!(decode(raw), Err(DecodeError::MalformedFrame(_))));
        }
        assert!(decode(r#"{"type":"connect","session_type":"local-shell","rows":24,"cols":80}"#).is_ok());
    }

    #[test]
    fn resize_without_session_id() {
        let frame = decode(r#"{"type":"resize","data":{"rows":40,"cols":100}}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Resize {
                session_id: None,
                data: TerminalSize::new(40, 100),
            }
        );
    }

    #[test]
    fn resize_with_zero_dimension_is_malformed() {
        let err = decode(r#"{"type":"resize","data":{"rows":0,"cols":100}}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedFrame(_)));
    }

    #[test]
    fn resize_with_negative_dimension_is_malformed() {
        let err = decode(r#"{"type":"resize","data":{"rows":-3,"cols":100}}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedFrame(_)));
    }

    #[test]
    fn bare_disconnect_has_empty_reason() {
        let frame = decode(r#"{"type":"disconnect"}"#).unwrap();
        assert_eq!(frame, Frame::disconnect(None, ""));
    }

    #[test]
    fn unknown_type_is_reported_not_malformed() {
        let err = decode(r#"{"type":"telemetry","fps":60}"#).unwrap_err();
        assert_eq!(err, DecodeError::UnknownFrameType("telemetry".into()));
    }

    #[test]
    fn input_missing_data_is_malformed() {
        let err = decode(r#"{"type":"input"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedFrame(_)));
    }

    #[test]
    fn input_with_wrong_data_type_is_malformed() {
        let err = decode(r#"{"type":"input","data":42}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedFrame(_)));
    }

    #[test]
    fn invalid_json_and_missing_type() {
        assert!(matches!(
            decode("{not json").unwrap_err(),
            DecodeError::MalformedFrame(_)
        ));
        assert!(matches!(
            decode(r#"{"data":"ls"}"#).unwrap_err(),
            DecodeError::MalformedFrame(_)
        ));
        assert!(matches!(
            decode(r#"{"type":7}"#).unwrap_err(),
            DecodeError::MalformedFrame(_)
        ));
    }

    #[test]
    fn binary_messages_decode_like_text() {
        let frame = decode_bytes(br#"{"type":"ping"}"#).unwrap();
        assert_eq!(frame, Frame::Ping);
    }

    #[test]
    fn output_carries_rfc3339_timestamp() {
        let id = SessionId::new();
        let json = encode(&Frame::output(id, "$ "));
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "output");
        assert_eq!(value["session_id"], id.to_string());
        assert_eq!(value["data"], "$ ");
        let ts = value["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(ts).is_ok());
    }

    #[test]
    fn error_frame_wire_shape() {
        let json = encode(&Frame::error(ErrorCode::AlreadyBound, "busy"));
        assert_eq!(
            json,
            r#"{"type":"error","code":"already_bound","message":"busy"}"#
        );
    }

    #[test]
    fn unknown_error_code_from_peer() {
        let frame = decode(r#"{"type":"error","code":"quota_exceeded","message":"x"}"#).unwrap();
        assert_eq!(frame, Frame::error(ErrorCode::Unknown, "x"));
    }

    #[test]
    fn ping_pong_have_no_payload() {
        assert_eq!(encode(&Frame::Ping), r#"{"type":"ping"}"#);
        assert_eq!(encode(&Frame::Pong), r#"{"type":"pong"}"#);
    }

    #[test]
    fn connect_ack_omits_absent_fields() {
        let id = SessionId::new();
        let json = encode(&Frame::Connect {
            session_id: Some(id),
            session_type: SessionType::LocalShell,
            ssh_profile_id: None,
            rows: None,
            cols: None,
        });
        assert_eq!(
            json,
            format!(r#"{{"type":"connect","session_id":"{id}","session_type":"local-shell"}}"#)
        );
    }
}
