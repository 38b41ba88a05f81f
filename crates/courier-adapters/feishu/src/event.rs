//! Decoding of Feishu event payloads.
//!
//! Data frames carry a JSON event envelope (schema 2.0):
//!
//! ```text
//! { "schema": "2.0",
//!   "header": { "event_id", "event_type", "create_time", ... },
//!   "event":  { "sender": {...}, "message": {...} } }
//! ```
//!
//! Only `im.message.receive_v1` from human senders becomes a
//! [`FeishuMessageEvent`]; everything else decodes to `None`.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use courier_core::{ChatType, InboundMessage, MediaRef, MessageContent, ProtocolError};

/// Event type of received messages.
pub const MESSAGE_RECEIVE: &str = "im.message.receive_v1";

/// A received Feishu message.
#[derive(Debug, Clone, PartialEq)]
pub struct FeishuMessageEvent {
    /// `om_…` message id.
    pub message_id: String,
    /// `oc_…` chat id, also the reply address.
    pub chat_id: String,
    /// Direct (`p2p`) or group.
    pub chat_type: ChatType,
    /// Sender open id.
    pub sender_id: String,
    /// Original `message_type`.
    pub message_type: String,
    /// Decoded content.
    pub content: MessageContent,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Mentions, in the order of their placeholders.
    pub mentions: Vec<Mention>,
    /// Thread root, if the message is a reply.
    pub root_id: Option<String>,
    /// Original event envelope.
    pub raw: Value,
}

/// A mention inside a message.
///
/// Text content refers to it through the `@_user_N` placeholder in `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mention {
    /// Placeholder in the text.
    pub key: String,
    /// Open id of the mentioned user or bot.
    pub open_id: Option<String>,
    /// Display name.
    pub name: String,
}

impl FeishuMessageEvent {
    /// Whether the bot was mentioned.
    ///
    /// When the bot's own open id is unknown any mention counts.
    pub fn mentions_bot(&self, bot_open_id: Option<&str>) -> bool {
        match bot_open_id {
            Some(id) => self.mentions.iter().any(|m| m.open_id.as_deref() == Some(id)),
            None => !self.mentions.is_empty(),
        }
    }

    /// Converts into the platform-agnostic envelope.
    ///
    /// Mention placeholders in the text become `@name`, except the bot's own,
    /// which is removed.
    pub fn into_inbound(mut self, channel: &str, bot_open_id: Option<&str>) -> InboundMessage {
        let mentioned = self.chat_type == ChatType::Direct || self.mentions_bot(bot_open_id);
        if let Some(text) = self.content.text.take() {
            let text = render_mentions(&text, &self.mentions, bot_open_id);
            self.content.text = (!text.is_empty()).then_some(text);
        }
        InboundMessage {
            id: self.message_id,
            channel: channel.to_string(),
            sender_id: self.sender_id,
            sender_name: None,
            chat_id: self.chat_id,
            chat_type: self.chat_type,
            content: self.content,
            timestamp: self.timestamp,
            mentioned,
            raw: self.raw,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawSenderId {
    open_id: Option<String>,
    user_id: Option<String>,
    union_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSender {
    #[serde(default)]
    sender_id: RawSenderId,
    #[serde(default)]
    sender_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMention {
    key: String,
    #[serde(default)]
    id: RawSenderId,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    message_id: String,
    chat_id: String,
    #[serde(default)]
    chat_type: String,
    message_type: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    create_time: Option<String>,
    #[serde(default)]
    root_id: Option<String>,
    #[serde(default)]
    mentions: Vec<RawMention>,
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    sender: RawSender,
    message: RawMessage,
}

/// Unwraps the event envelope from a data frame payload.
///
/// Besides the bare envelope, some gateways wrap it as
/// `{"type": "event", "data": "<envelope JSON>"}`.
pub fn envelope(payload: &[u8]) -> Result<Value, ProtocolError> {
    let value: Value = serde_json::from_slice(payload)?;
    if value.get("header").is_some() {
        return Ok(value);
    }
    match value.get("data") {
        Some(Value::String(inner)) => Ok(serde_json::from_str(inner)?),
        Some(inner) if inner.get("header").is_some() => Ok(inner.clone()),
        _ => Err(ProtocolError::Unexpected("payload has no event header".into())),
    }
}

/// Event type of an envelope.
pub fn event_type(envelope: &Value) -> Option<&str> {
    envelope.pointer("/header/event_type").and_then(Value::as_str)
}

/// Decodes an envelope.
///
/// Returns `None` for other event types and for messages sent by apps.
pub fn decode(envelope: &Value) -> Option<Result<FeishuMessageEvent, ProtocolError>> {
    if event_type(envelope)? != MESSAGE_RECEIVE {
        return None;
    }
    let raw: RawEvent = match envelope.get("event").cloned().map(serde_json::from_value) {
        Some(Ok(raw)) => raw,
        Some(Err(e)) => return Some(Err(e.into())),
        None => return Some(Err(ProtocolError::Malformed("missing event".into()))),
    };
    if raw.sender.sender_type.as_deref().is_some_and(|t| t != "user") {
        debug!(message_id = %raw.message.message_id, "Ignoring message sent by an app");
        return None;
    }
    Some(build(raw, envelope))
}

fn build(raw: RawEvent, envelope: &Value) -> Result<FeishuMessageEvent, ProtocolError> {
    let RawEvent { sender, message } = raw;
    let sender_id = sender
        .sender_id
        .open_id
        .or(sender.sender_id.user_id)
        .or(sender.sender_id.union_id)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ProtocolError::Malformed("missing sender id".into()))?;

    let chat_type = match message.chat_type.as_str() {
        "group" => ChatType::Group,
        _ => ChatType::Direct,
    };
    let body: Value = if message.content.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&message.content)?
    };
    let content = parse_content(&message.message_type, &body);

    Ok(FeishuMessageEvent {
        message_id: message.message_id,
        chat_id: message.chat_id,
        chat_type,
        sender_id,
        message_type: message.message_type,
        content,
        timestamp: parse_millis(message.create_time.as_deref()),
        mentions: message
            .mentions
            .into_iter()
            .map(|m| Mention {
                key: m.key,
                open_id: m.id.open_id,
                name: m.name,
            })
            .collect(),
        root_id: message.root_id.filter(|id| !id.is_empty()),
        raw: envelope.clone(),
    })
}

fn str_field<'a>(body: &'a Value, key: &str) -> Option<&'a str> {
    body.get(key).and_then(Value::as_str)
}

fn parse_content(message_type: &str, body: &Value) -> MessageContent {
    let mut content = MessageContent::default();
    match message_type {
        "text" => content.text = str_field(body, "text").map(str::to_string),
        "image" => {
            if let Some(key) = str_field(body, "image_key") {
                content.images.push(MediaRef::new(key).with_mime("image"));
            }
        }
        "file" => {
            if let Some(key) = str_field(body, "file_key") {
                let mut media = MediaRef::new(key);
                if let Some(name) = str_field(body, "file_name") {
                    media = media.with_name(name);
                }
                content.files.push(media);
            }
        }
        "audio" => {
            content.audio = str_field(body, "file_key").map(|key| MediaRef::new(key).with_mime("audio"));
        }
        "media" => {
            content.video = str_field(body, "file_key").map(|key| {
                let media = MediaRef::new(key).with_mime("video");
                match str_field(body, "file_name") {
                    Some(name) => media.with_name(name),
                    None => media,
                }
            });
        }
        "post" => parse_post(body, &mut content),
        other => debug!(message_type = other, "Unsupported message type"),
    }
    content
}

/// Rich text: `{title, content: [[{tag, ...}]]}`, optionally under a locale key.
fn parse_post(body: &Value, content: &mut MessageContent) {
    let post = if body.get("content").is_some() {
        body
    } else {
        match body.as_object().and_then(|locales| locales.values().next()) {
            Some(post) => post,
            None => return,
        }
    };

    let mut lines = Vec::new();
    if let Some(title) = str_field(post, "title").filter(|t| !t.is_empty()) {
        lines.push(title.to_string());
    }
    for paragraph in post["content"].as_array().into_iter().flatten() {
        let mut line = String::new();
        for element in paragraph.as_array().into_iter().flatten() {
            match str_field(element, "tag") {
                Some("text" | "a") => line.push_str(str_field(element, "text").unwrap_or_default()),
                Some("at") => {
                    if let Some(key) = str_field(element, "user_id") {
                        line.push_str(key);
                    }
                }
                Some("img") => {
                    if let Some(key) = str_field(element, "image_key") {
                        content.images.push(MediaRef::new(key).with_mime("image"));
                    }
                }
                _ => {}
            }
        }
        if !line.is_empty() {
            lines.push(line);
        }
    }
    if !lines.is_empty() {
        content.text = Some(lines.join("\n"));
    }
}

fn render_mentions(text: &str, mentions: &[Mention], bot_open_id: Option<&str>) -> String {
    let mut text = text.to_string();
    for mention in mentions {
        let is_bot = bot_open_id.is_some() && mention.open_id.as_deref() == bot_open_id;
        let replacement = if is_bot || mention.name.is_empty() {
            String::new()
        } else {
            format!("@{}", mention.name)
        };
        text = text.replace(&mention.key, &replacement);
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn parse_millis(value: Option<&str>) -> DateTime<Utc> {
    value
        .and_then(|v| v.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

// =============================================================================
// Deduplication
// =============================================================================

/// Default time a message id is remembered.
pub const DEDUP_TTL: Duration = Duration::from_secs(30 * 60);
/// Default number of ids remembered.
pub const DEDUP_CAPACITY: usize = 5000;

/// Remembers recently seen message ids so redeliveries are dropped.
#[derive(Debug)]
pub struct Deduplicator {
    ttl: Duration,
    capacity: usize,
    seen: Mutex<HashMap<String, Instant>>,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEDUP_TTL, DEDUP_CAPACITY)
    }
}

impl Deduplicator {
    /// Creates a deduplicator.
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Records `id` and returns true if it was not seen within the TTL.
    pub fn first_seen(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock();

        if let Some(at) = seen.get(id)
            && now.duration_since(*at) < self.ttl
        {
            return false;
        }
        if seen.len() >= self.capacity {
            seen.retain(|_, at| now.duration_since(*at) < self.ttl);
        }
        if seen.len() >= self.capacity {
            // Still full: forget the oldest entry.
            if let Some(oldest) = seen
                .iter()
                .min_by_key(|(_, at)| **at)
                .map(|(id, _)| id.clone())
            {
                seen.remove(&oldest);
            }
        }
        seen.insert(id.to_string(), now);
        true
    }

    /// Number of remembered ids.
    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    /// Returns true if nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope_for(message: Value) -> Value {
        json!({
            "schema": "2.0",
            "header": {"event_id": "ev1", "event_type": MESSAGE_RECEIVE, "create_time": "1714550400000"},
            "event": {
                "sender": {"sender_id": {"open_id": "ou_user"}, "sender_type": "user"},
                "message": message
            }
        })
    }

    #[test]
    fn test_decode_group_text_with_mention() {
        let envelope = envelope_for(json!({
            "message_id": "om_1",
            "chat_id": "oc_group",
            "chat_type": "group",
            "message_type": "text",
            "content": r#"{"text":"@_user_1 hello @_user_2"}"#,
            "create_time": "1714550400000",
            "mentions": [
                {"key": "@_user_1", "id": {"open_id": "ou_bot"}, "name": "Courier"},
                {"key": "@_user_2", "id": {"open_id": "ou_bob"}, "name": "Bob"}
            ]
        }));
        let event = decode(&envelope).unwrap().unwrap();
        assert_eq!(event.chat_type, ChatType::Group);
        assert_eq!(event.content.text.as_deref(), Some("@_user_1 hello @_user_2"));
        assert_eq!(event.timestamp.timestamp_millis(), 1_714_550_400_000);
        assert!(event.mentions_bot(Some("ou_bot")));
        assert!(!event.mentions_bot(Some("ou_other")));

        let inbound = event.into_inbound("feishu", Some("ou_bot"));
        assert_eq!(inbound.chat_id, "oc_group");
        assert_eq!(inbound.sender_id, "ou_user");
        assert_eq!(inbound.text(), "hello @Bob");
        assert!(inbound.mentioned);
    }

    #[test]
    fn test_decode_image_and_post() {
        let image = decode(&envelope_for(json!({
            "message_id": "om_2",
            "chat_id": "oc_p2p",
            "chat_type": "p2p",
            "message_type": "image",
            "content": r#"{"image_key":"img_v2_1"}"#
        })))
        .unwrap()
        .unwrap();
        assert_eq!(image.content.images[0].source, "img_v2_1");
        assert!(image.content.text.is_none());
        assert!(image.into_inbound("feishu", None).mentioned);

        let post = decode(&envelope_for(json!({
            "message_id": "om_3",
            "chat_id": "oc_p2p",
            "chat_type": "p2p",
            "message_type": "post",
            "content": json!({
                "title": "Report",
                "content": [[{"tag": "text", "text": "line one"}], [{"tag": "img", "image_key": "img_2"}]]
            }).to_string()
        })))
        .unwrap()
        .unwrap();
        assert_eq!(post.content.text.as_deref(), Some("Report\nline one"));
        assert_eq!(post.content.images.len(), 1);
    }

    #[test]
    fn test_ignores_other_events_and_app_senders() {
        assert!(decode(&json!({"header": {"event_type": "im.message.message_read_v1"}})).is_none());

        let mut from_app = envelope_for(json!({
            "message_id": "om_4", "chat_id": "oc_1", "message_type": "text", "content": "{\"text\":\"x\"}"
        }));
        from_app["event"]["sender"]["sender_type"] = json!("app");
        assert!(decode(&from_app).is_none());

        let broken = json!({"header": {"event_type": MESSAGE_RECEIVE}, "event": {"sender": {}}});
        assert!(decode(&broken).unwrap().is_err());
    }

    #[test]
    fn test_envelope_unwrapping() {
        let bare = envelope(br#"{"header":{"event_type":"x"}}"#).unwrap();
        assert_eq!(event_type(&bare), Some("x"));

        let wrapped = json!({"type": "event", "data": r#"{"header":{"event_type":"y"}}"#}).to_string();
        assert_eq!(event_type(&envelope(wrapped.as_bytes()).unwrap()), Some("y"));

        assert!(envelope(b"{}").is_err());
        assert!(envelope(b"nope").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_ttl() {
        let dedup = Deduplicator::default();
        assert!(dedup.first_seen("om_1"));
        assert!(!dedup.first_seen("om_1"));

        tokio::time::advance(DEDUP_TTL + Duration::from_secs(1)).await;
        assert!(dedup.first_seen("om_1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_capacity() {
        let dedup = Deduplicator::new(DEDUP_TTL, 2);
        assert!(dedup.first_seen("a"));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(dedup.first_seen("b"));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(dedup.first_seen("c"));
        assert_eq!(dedup.len(), 2);
        // "a" was the oldest and got evicted.
        assert!(dedup.first_seen("a"));
        assert!(!dedup.first_seen("c"));
    }
}
