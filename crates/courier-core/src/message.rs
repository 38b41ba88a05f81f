//! Platform-agnostic message envelopes.
//!
//! Adapters normalize every platform event into an [`InboundMessage`] and
//! accept [`OutboundContent`] for sending. A [`SendResult`] is produced for
//! each outbound call and never carries a panic or an `Err` past the adapter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of conversation a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    /// One-to-one conversation with the bot.
    Direct,
    /// Multi-user group chat.
    Group,
    /// Channel inside a guild/community.
    Channel,
}

impl std::fmt::Display for ChatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Group => write!(f, "group"),
            Self::Channel => write!(f, "channel"),
        }
    }
}

/// Reference to a media object, either a URL or a platform file key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    /// URL or platform-specific key.
    pub source: String,
    /// Original file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// MIME type if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    /// Size in bytes if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl MediaRef {
    /// Creates a media reference from a URL or key.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            name: None,
            mime: None,
            size: None,
        }
    }

    /// Sets the file name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the MIME type.
    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    /// Returns true if the source is an http(s) URL.
    pub fn is_url(&self) -> bool {
        self.source.starts_with("http://") || self.source.starts_with("https://")
    }
}

/// Content carried by an inbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    /// Plain text with mention markers removed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Attached images.
    #[serde(default)]
    pub images: Vec<MediaRef>,
    /// Attached generic files.
    #[serde(default)]
    pub files: Vec<MediaRef>,
    /// Voice/audio attachment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<MediaRef>,
    /// Video attachment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<MediaRef>,
}

impl MessageContent {
    /// Creates text-only content.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    /// Returns true if there is neither text nor any attachment.
    pub fn is_empty(&self) -> bool {
        self.text.as_deref().is_none_or(str::is_empty)
            && self.images.is_empty()
            && self.files.is_empty()
            && self.audio.is_none()
            && self.video.is_none()
    }

    /// Sorts an attachment into the right bucket based on its MIME type.
    pub fn push_attachment(&mut self, media: MediaRef) {
        let mime = media.mime.clone().unwrap_or_default();
        if mime.starts_with("image/") {
            self.images.push(media);
        } else if mime.starts_with("audio/") || mime == "voice" {
            self.audio = Some(media);
        } else if mime.starts_with("video/") {
            self.video = Some(media);
        } else {
            self.files.push(media);
        }
    }
}

/// A normalized inbound message.
///
/// `chat_id` is the reply address understood by the originating adapter's
/// `send_message`, so answering in the same conversation never needs
/// platform knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Platform message id.
    pub id: String,
    /// Channel (adapter) id that received the message.
    pub channel: String,
    /// Platform id of the sender.
    pub sender_id: String,
    /// Display name of the sender, if the platform sent one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// Reply address of the conversation.
    pub chat_id: String,
    /// Conversation kind.
    pub chat_type: ChatType,
    /// Message content.
    pub content: MessageContent,
    /// Time the platform created the message.
    pub timestamp: DateTime<Utc>,
    /// Whether the bot was mentioned.
    #[serde(default)]
    pub mentioned: bool,
    /// Untouched platform payload.
    #[serde(default)]
    pub raw: Value,
}

impl InboundMessage {
    /// Returns the text content or an empty string.
    pub fn text(&self) -> &str {
        self.content.text.as_deref().unwrap_or("")
    }

    /// Returns true for one-to-one conversations.
    pub fn is_direct(&self) -> bool {
        self.chat_type == ChatType::Direct
    }
}

/// Content to send through an adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundContent {
    /// Text body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Image to attach.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<MediaRef>,
}

impl OutboundContent {
    /// Creates a text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            image: None,
        }
    }

    /// Creates an image message.
    pub fn image(image: MediaRef) -> Self {
        Self {
            text: None,
            image: Some(image),
        }
    }

    /// Adds a caption/text to the message.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Returns true if there is nothing to send.
    pub fn is_empty(&self) -> bool {
        self.text.as_deref().is_none_or(str::is_empty) && self.image.is_none()
    }
}

/// Extra options for an outbound send.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendOptions {
    /// Platform message id being replied to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl SendOptions {
    /// Options replying to the given message.
    pub fn reply_to(message_id: impl Into<String>) -> Self {
        Self {
            reply_to: Some(message_id.into()),
        }
    }
}

/// Outcome of an outbound send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResult {
    /// Whether the platform accepted the message.
    pub success: bool,
    /// Platform id of the sent message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendResult {
    /// A successful send.
    pub fn ok(message_id: Option<String>) -> Self {
        Self {
            success: true,
            message_id,
            error: None,
        }
    }

    /// A failed send.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            message_id: None,
            error: Some(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_attachment_sorts_by_mime() {
        let mut content = MessageContent::default();
        content.push_attachment(MediaRef::new("https://a/1.png").with_mime("image/png"));
        content.push_attachment(MediaRef::new("https://a/2.silk").with_mime("voice"));
        content.push_attachment(MediaRef::new("https://a/3.mp4").with_mime("video/mp4"));
        content.push_attachment(MediaRef::new("https://a/4.pdf"));

        assert_eq!(content.images.len(), 1);
        assert!(content.audio.is_some());
        assert!(content.video.is_some());
        assert_eq!(content.files.len(), 1);
        assert!(!content.is_empty());
    }

    #[test]
    fn test_send_result_serialization_skips_absent_fields() {
        let json = serde_json::to_value(SendResult::failed("not running")).unwrap();
        assert_eq!(json, serde_json::json!({"success": false, "error": "not running"}));
    }

    #[test]
    fn test_outbound_empty() {
        assert!(OutboundContent::default().is_empty());
        assert!(OutboundContent::text("").is_empty());
        assert!(!OutboundContent::image(MediaRef::new("k")).is_empty());
    }
}
