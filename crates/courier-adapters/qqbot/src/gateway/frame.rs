//! QQ gateway wire format.
//!
//! Every frame is a JSON object `{op, d, s?, t?}`:
//!
//! | op | Name | Direction |
//! |----|------|-----------|
//! | 0 | Dispatch | server → client |
//! | 1 | Heartbeat | both |
//! | 2 | Identify | client → server |
//! | 6 | Resume | client → server |
//! | 7 | Reconnect | server → client |
//! | 9 | Invalid Session | server → client |
//! | 10 | Hello | server → client |
//! | 11 | Heartbeat ACK | server → client |

use std::ops::BitOr;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use courier_core::ProtocolError;

/// Gateway operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Dispatch,
    Heartbeat,
    Identify,
    Resume,
    Reconnect,
    InvalidSession,
    Hello,
    HeartbeatAck,
}

impl OpCode {
    /// Wire value.
    pub fn code(self) -> u8 {
        match self {
            Self::Dispatch => 0,
            Self::Heartbeat => 1,
            Self::Identify => 2,
            Self::Resume => 6,
            Self::Reconnect => 7,
            Self::InvalidSession => 9,
            Self::Hello => 10,
            Self::HeartbeatAck => 11,
        }
    }

    /// Parses a wire value.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Dispatch,
            1 => Self::Heartbeat,
            2 => Self::Identify,
            6 => Self::Resume,
            7 => Self::Reconnect,
            9 => Self::InvalidSession,
            10 => Self::Hello,
            11 => Self::HeartbeatAck,
            _ => return None,
        })
    }
}

/// Gateway intent bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Intents(u32);

impl Intents {
    pub const GUILDS: Self = Self(1 << 0);
    pub const GUILD_MEMBERS: Self = Self(1 << 1);
    pub const DIRECT_MESSAGE: Self = Self(1 << 12);
    pub const GROUP_AND_C2C: Self = Self(1 << 25);
    pub const PUBLIC_GUILD_MESSAGES: Self = Self(1 << 30);

    /// No intents.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for Intents {
    /// Public guild @-messages, guild DMs, group and C2C messages.
    fn default() -> Self {
        Self::PUBLIC_GUILD_MESSAGES | Self::DIRECT_MESSAGE | Self::GROUP_AND_C2C
    }
}

impl BitOr for Intents {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A gateway frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Operation code.
    pub op: u8,
    /// Payload.
    #[serde(default)]
    pub d: Value,
    /// Sequence number of dispatch frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    /// Event tag of dispatch frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl Frame {
    fn new(op: OpCode, d: Value) -> Self {
        Self {
            op: op.code(),
            d,
            s: None,
            t: None,
        }
    }

    /// Parses a text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Returns the operation code, if known.
    pub fn opcode(&self) -> Option<OpCode> {
        OpCode::from_code(self.op)
    }

    /// Heartbeat carrying the last sequence number seen.
    pub fn heartbeat(last_sequence: Option<u64>) -> Self {
        Self::new(OpCode::Heartbeat, json!(last_sequence))
    }

    /// Identify with a fresh session.
    pub fn identify(token: &str, intents: Intents) -> Self {
        Self::new(
            OpCode::Identify,
            json!({
                "token": format!("QQBot {token}"),
                "intents": intents.bits(),
                "shard": [0, 1],
                "properties": {
                    "$os": std::env::consts::OS,
                    "$browser": "courier",
                    "$device": "courier",
                },
            }),
        )
    }

    /// Resume an existing session.
    pub fn resume(token: &str, session_id: &str, seq: u64) -> Self {
        Self::new(
            OpCode::Resume,
            json!({
                "token": format!("QQBot {token}"),
                "session_id": session_id,
                "seq": seq,
            }),
        )
    }

    /// Heartbeat interval announced by a Hello frame.
    pub fn heartbeat_interval_ms(&self) -> Option<u64> {
        self.d.get("heartbeat_interval").and_then(Value::as_u64)
    }

    /// Serializes the frame.
    pub fn to_text(&self) -> String {
        // A struct of JSON values always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// How the gateway reacts to a close code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Credentials were refused.
    AuthRejected,
    /// Reconnect with a fresh identify.
    InvalidateSession,
    /// Reconnect, resuming if possible.
    Reconnect,
}

/// Classifies a close code.
pub fn close_action(code: u16) -> CloseAction {
    match code {
        4004 | 4914 | 4915 => CloseAction::AuthRejected,
        4006 | 4007 | 4009 => CloseAction::InvalidateSession,
        _ => CloseAction::Reconnect,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identify_shape() {
        let frame = Frame::identify("abc", Intents::default());
        let value: Value = serde_json::from_str(&frame.to_text()).unwrap();
        assert_eq!(value["op"], 2);
        assert_eq!(value["d"]["token"], "QQBot abc");
        assert_eq!(value["d"]["intents"], 1_107_300_352u32);
        assert_eq!(value["d"]["shard"], json!([0, 1]));
        assert!(value.get("s").is_none());
    }

    #[test]
    fn test_heartbeat_payload() {
        assert_eq!(Frame::heartbeat(None).to_text(), r#"{"op":1,"d":null}"#);
        assert_eq!(Frame::heartbeat(Some(42)).to_text(), r#"{"op":1,"d":42}"#);
    }

    #[test]
    fn test_parse_dispatch() {
        let frame = Frame::parse(r#"{"op":0,"s":3,"t":"READY","d":{"session_id":"x"}}"#).unwrap();
        assert_eq!(frame.opcode(), Some(OpCode::Dispatch));
        assert_eq!(frame.s, Some(3));
        assert_eq!(frame.t.as_deref(), Some("READY"));

        let hello = Frame::parse(r#"{"op":10,"d":{"heartbeat_interval":41250}}"#).unwrap();
        assert_eq!(hello.heartbeat_interval_ms(), Some(41250));

        assert!(Frame::parse("not json").is_err());
        assert_eq!(Frame::parse(r#"{"op":42}"#).unwrap().opcode(), None);
    }

    #[test]
    fn test_close_codes() {
        assert_eq!(close_action(4004), CloseAction::AuthRejected);
        assert_eq!(close_action(4915), CloseAction::AuthRejected);
        assert_eq!(close_action(4009), CloseAction::InvalidateSession);
        assert_eq!(close_action(1000), CloseAction::Reconnect);
    }
}
