//! Decoding of QQ dispatch events into message events.
//!
//! | Tag | Kind | Chat id | Sender id |
//! |-----|------|---------|-----------|
//! | `C2C_MESSAGE_CREATE` | [`QqMessageKind::C2c`] | `author.user_openid` | `author.user_openid` |
//! | `GROUP_AT_MESSAGE_CREATE` | [`QqMessageKind::Group`] | `group_openid` | `author.member_openid` |
//! | `AT_MESSAGE_CREATE` | [`QqMessageKind::Guild`] | `channel_id` | `author.id` |
//! | `DIRECT_MESSAGE_CREATE` | [`QqMessageKind::Dm`] | `guild_id` | `author.id` |

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use courier_core::{ChatType, InboundMessage, MediaRef, MessageContent, ProtocolError};

static MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<@!?\w+>").expect("mention pattern is a valid regex"));

/// Conversation kind of a QQ message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QqMessageKind {
    /// Private chat with a user.
    C2c,
    /// Group chat, bot @-mentioned.
    Group,
    /// Guild text channel, bot @-mentioned.
    Guild,
    /// Guild direct message.
    Dm,
}

impl QqMessageKind {
    /// Event tag that carries this kind.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "C2C_MESSAGE_CREATE" => Some(Self::C2c),
            "GROUP_AT_MESSAGE_CREATE" => Some(Self::Group),
            "AT_MESSAGE_CREATE" => Some(Self::Guild),
            "DIRECT_MESSAGE_CREATE" => Some(Self::Dm),
            _ => None,
        }
    }

    /// Prefix of the reply address.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::C2c => "c2c",
            Self::Group => "group",
            Self::Guild => "channel",
            Self::Dm => "dm",
        }
    }

    /// Platform-agnostic chat type.
    pub fn chat_type(self) -> ChatType {
        match self {
            Self::C2c | Self::Dm => ChatType::Direct,
            Self::Group => ChatType::Group,
            Self::Guild => ChatType::Channel,
        }
    }
}

/// Attachment of a QQ message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QqAttachment {
    /// MIME type or a QQ kind such as `voice`.
    #[serde(default)]
    pub content_type: Option<String>,
    /// Original file name.
    #[serde(default)]
    pub filename: Option<String>,
    /// Size in bytes.
    #[serde(default)]
    pub size: Option<u64>,
    /// Download URL.
    pub url: String,
}

impl QqAttachment {
    fn into_media(self) -> MediaRef {
        let url = if self.url.starts_with("//") {
            format!("https:{}", self.url)
        } else if self.url.contains("://") {
            self.url
        } else {
            format!("https://{}", self.url)
        };
        MediaRef {
            source: url,
            name: self.filename,
            mime: self.content_type,
            size: self.size,
        }
    }
}

/// A decoded QQ message event.
#[derive(Debug, Clone, PartialEq)]
pub struct QqMessageEvent {
    /// Conversation kind.
    pub kind: QqMessageKind,
    /// Message id, used as `msg_id` for passive replies.
    pub id: String,
    /// Sender id.
    pub sender_id: String,
    /// Sender display name.
    pub sender_name: Option<String>,
    /// Conversation id without prefix.
    pub chat_id: String,
    /// Guild of guild and DM messages.
    pub guild_id: Option<String>,
    /// Text with mention markers removed.
    pub content: String,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Attachments with absolute URLs.
    pub attachments: Vec<MediaRef>,
    /// Whether the bot was @-mentioned.
    pub mentioned: bool,
    /// Original payload.
    pub raw: Value,
}

impl QqMessageEvent {
    /// Address to pass to `send_message` to answer this message.
    pub fn reply_address(&self) -> String {
        format!("{}:{}", self.kind.prefix(), self.chat_id)
    }

    /// Converts into the platform-agnostic envelope.
    pub fn into_inbound(self, channel: &str) -> InboundMessage {
        let chat_id = self.reply_address();
        let mut content = MessageContent::default();
        if !self.content.is_empty() {
            content.text = Some(self.content);
        }
        for media in self.attachments {
            content.push_attachment(media);
        }

        InboundMessage {
            id: self.id,
            channel: channel.to_string(),
            sender_id: self.sender_id,
            sender_name: self.sender_name,
            chat_id,
            chat_type: self.kind.chat_type(),
            content,
            timestamp: self.timestamp,
            mentioned: self.mentioned,
            raw: self.raw,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawAuthor {
    id: Option<String>,
    user_openid: Option<String>,
    member_openid: Option<String>,
    username: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawMember {
    nick: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    id: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    author: RawAuthor,
    #[serde(default)]
    member: Option<RawMember>,
    #[serde(default)]
    group_openid: Option<String>,
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(default)]
    guild_id: Option<String>,
    #[serde(default)]
    attachments: Vec<QqAttachment>,
}

/// Removes `<@id>` / `<@!id>` markers and trims the result.
pub fn strip_mentions(text: &str) -> String {
    MENTION.replace_all(text, "").trim().to_string()
}

fn parse_timestamp(value: Option<&str>) -> DateTime<Utc> {
    match value.map(DateTime::parse_from_rfc3339) {
        Some(Ok(ts)) => ts.with_timezone(&Utc),
        Some(Err(e)) => {
            debug!(error = %e, "Unparseable message timestamp, using receive time");
            Utc::now()
        }
        None => Utc::now(),
    }
}

fn required(field: Option<String>, name: &str) -> Result<String, ProtocolError> {
    field
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ProtocolError::Malformed(format!("missing {name}")))
}

/// Decodes a dispatch payload.
///
/// Returns `None` for tags that are not message events.
pub fn decode(tag: &str, data: &Value) -> Option<Result<QqMessageEvent, ProtocolError>> {
    let kind = QqMessageKind::from_tag(tag)?;
    Some(decode_message(kind, data))
}

fn decode_message(kind: QqMessageKind, data: &Value) -> Result<QqMessageEvent, ProtocolError> {
    let raw: RawMessage = serde_json::from_value(data.clone())?;
    let nick = raw.member.and_then(|m| m.nick);

    let (sender_id, sender_name, chat_id) = match kind {
        QqMessageKind::C2c => {
            let openid = required(raw.author.user_openid.or(raw.author.id), "author.user_openid")?;
            (openid.clone(), None, openid)
        }
        QqMessageKind::Group => (
            required(raw.author.member_openid.or(raw.author.id), "author.member_openid")?,
            None,
            required(raw.group_openid, "group_openid")?,
        ),
        QqMessageKind::Guild => (
            required(raw.author.id, "author.id")?,
            nick.or(raw.author.username),
            required(raw.channel_id, "channel_id")?,
        ),
        QqMessageKind::Dm => (
            required(raw.author.id, "author.id")?,
            nick.or(raw.author.username),
            required(raw.guild_id.clone(), "guild_id")?,
        ),
    };

    Ok(QqMessageEvent {
        kind,
        id: raw.id,
        sender_id,
        sender_name,
        chat_id,
        guild_id: raw.guild_id,
        content: strip_mentions(&raw.content),
        timestamp: parse_timestamp(raw.timestamp.as_deref()),
        attachments: raw.attachments.into_iter().map(QqAttachment::into_media).collect(),
        mentioned: matches!(kind, QqMessageKind::Group | QqMessageKind::Guild),
        raw: data.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mention_pattern() {
        let pattern = LazyLock::force(&MENTION);
        assert!(pattern.is_match("<@!123>"));
        assert!(pattern.is_match("<@abc_DEF>"));
        assert!(!pattern.is_match("<@ 1>"));
        assert_eq!(strip_mentions("  <@!bot> hello <@u1>  "), "hello");
        assert_eq!(strip_mentions("no mention"), "no mention");
    }

    #[test]
    fn test_decode_c2c() {
        let data = json!({
            "id": "ROBOT1.0_abc",
            "content": " hello ",
            "timestamp": "2024-05-01T12:00:00+08:00",
            "author": {"user_openid": "E4F4AEA33253A2797FB897C50B81D7ED"}
        });
        let event = decode("C2C_MESSAGE_CREATE", &data).unwrap().unwrap();
        assert_eq!(event.kind, QqMessageKind::C2c);
        assert_eq!(event.sender_id, "E4F4AEA33253A2797FB897C50B81D7ED");
        assert_eq!(event.reply_address(), "c2c:E4F4AEA33253A2797FB897C50B81D7ED");
        assert_eq!(event.content, "hello");
        assert_eq!(event.timestamp.to_rfc3339(), "2024-05-01T04:00:00+00:00");
        assert!(!event.mentioned);
    }

    #[test]
    fn test_decode_group_strips_mention() {
        let data = json!({
            "id": "g1",
            "content": "<@!1234> ping",
            "timestamp": "2024-05-01T12:00:00+08:00",
            "group_openid": "GROUP1",
            "author": {"member_openid": "MEMBER1"},
            "attachments": [{
                "content_type": "image/png",
                "filename": "a.png",
                "size": 1024,
                "url": "multimedia.nt.qq.com.cn/download?id=1"
            }]
        });
        let event = decode("GROUP_AT_MESSAGE_CREATE", &data).unwrap().unwrap();
        assert_eq!(event.sender_id, "MEMBER1");
        assert_eq!(event.chat_id, "GROUP1");
        assert_eq!(event.content, "ping");
        assert!(event.mentioned);
        assert_eq!(
            event.attachments[0].source,
            "https://multimedia.nt.qq.com.cn/download?id=1"
        );

        let inbound = event.into_inbound("qqbot");
        assert_eq!(inbound.chat_id, "group:GROUP1");
        assert_eq!(inbound.chat_type, ChatType::Group);
        assert_eq!(inbound.content.images.len(), 1);
        assert_eq!(inbound.text(), "ping");
    }

    #[test]
    fn test_decode_guild_and_dm() {
        let data = json!({
            "id": "c1",
            "content": "<@bot> hi there",
            "timestamp": "2024-05-01T12:00:00+08:00",
            "channel_id": "CH1",
            "guild_id": "GU1",
            "author": {"id": "U1", "username": "alice"},
            "member": {"nick": "Alice"}
        });
        let guild = decode("AT_MESSAGE_CREATE", &data).unwrap().unwrap();
        assert_eq!(guild.reply_address(), "channel:CH1");
        assert_eq!(guild.sender_name.as_deref(), Some("Alice"));
        assert_eq!(guild.guild_id.as_deref(), Some("GU1"));
        assert_eq!(guild.content, "hi there");

        let dm = decode("DIRECT_MESSAGE_CREATE", &data).unwrap().unwrap();
        assert_eq!(dm.reply_address(), "dm:GU1");
        assert_eq!(dm.kind.chat_type(), ChatType::Direct);
    }

    #[test]
    fn test_unknown_tag_and_malformed_payload() {
        assert!(decode("GUILD_CREATE", &json!({})).is_none());
        let err = decode("GROUP_AT_MESSAGE_CREATE", &json!({"id": "x", "author": {}}))
            .unwrap()
            .unwrap_err();
        assert!(err.to_string().contains("member_openid"));
    }
}
