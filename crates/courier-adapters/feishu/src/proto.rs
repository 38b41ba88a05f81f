//! Protobuf frames of the Feishu long connection.
//!
//! Field numbers follow the `pbbp2.Frame` message of the official SDKs. The
//! server only ever sends binary frames.
//!
//! | method | Meaning | `type` header |
//! |--------|---------|---------------|
//! | 0 | control | `ping`, `pong` |
//! | 1 | data | `event`, `card` |

use std::time::Duration;

use prost::Message as _;
use serde::Deserialize;
use serde_json::json;

use courier_core::ProtocolError;

/// Control frame method.
pub const METHOD_CONTROL: i32 = 0;
/// Data frame method.
pub const METHOD_DATA: i32 = 1;

/// Header naming the frame type.
pub const HEADER_TYPE: &str = "type";
/// Header carrying the message id, shared by all fragments.
pub const HEADER_MESSAGE_ID: &str = "message_id";
/// Total fragment count.
pub const HEADER_SUM: &str = "sum";
/// Zero-based fragment index.
pub const HEADER_SEQ: &str = "seq";
/// Handling time reported in acks, in milliseconds.
pub const HEADER_BIZ_RT: &str = "biz_rt";

/// Frame header.
#[derive(Clone, PartialEq, Eq, prost::Message)]
pub struct Header {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

impl Header {
    fn new(key: &str, value: impl Into<String>) -> Self {
        Self {
            key: key.to_string(),
            value: value.into(),
        }
    }
}

/// Long-connection frame.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Frame {
    #[prost(uint64, tag = "1")]
    pub seq_id: u64,
    #[prost(uint64, tag = "2")]
    pub log_id: u64,
    #[prost(int32, tag = "3")]
    pub service: i32,
    #[prost(int32, tag = "4")]
    pub method: i32,
    #[prost(message, repeated, tag = "5")]
    pub headers: Vec<Header>,
    #[prost(string, optional, tag = "6")]
    pub payload_encoding: Option<String>,
    #[prost(string, optional, tag = "7")]
    pub payload_type: Option<String>,
    #[prost(bytes = "vec", optional, tag = "8")]
    pub payload: Option<Vec<u8>>,
    #[prost(string, optional, tag = "9")]
    pub log_id_new: Option<String>,
}

impl Frame {
    /// Decodes a binary frame.
    pub fn decode_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Self::decode(data).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Encodes the frame.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Client ping for the given service.
    pub fn ping(service: i32) -> Self {
        Self {
            service,
            method: METHOD_CONTROL,
            headers: vec![Header::new(HEADER_TYPE, "ping")],
            ..Default::default()
        }
    }

    /// Looks up a header value.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.key == key)
            .map(|h| h.value.as_str())
    }

    /// Value of the `type` header, or the empty string.
    pub fn frame_type(&self) -> &str {
        self.header(HEADER_TYPE).unwrap_or_default()
    }

    /// Returns true for control frames.
    pub fn is_control(&self) -> bool {
        self.method == METHOD_CONTROL
    }

    /// Builds the acknowledgement of a data frame: the same frame with a
    /// `{"code":200}` payload and the handling time header.
    pub fn ack(&self, handled_in: Duration) -> Self {
        let mut ack = self.clone();
        ack.headers
            .push(Header::new(HEADER_BIZ_RT, handled_in.as_millis().to_string()));
        ack.payload = Some(json!({"code": 200}).to_string().into_bytes());
        ack
    }
}

/// Settings pushed by the server in `pong` payloads and endpoint responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientConfig {
    /// Seconds between pings.
    #[serde(default)]
    pub ping_interval: Option<u64>,
    /// Reconnect attempts the server suggests; informational.
    #[serde(default)]
    pub reconnect_count: Option<i64>,
    /// Seconds between reconnects the server suggests; informational.
    #[serde(default)]
    pub reconnect_interval: Option<u64>,
}

impl ClientConfig {
    /// Ping interval, if set and positive.
    pub fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}
