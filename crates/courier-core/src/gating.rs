//! Access control applied to inbound messages before fan-out.
//!
//! Direct and group conversations are governed separately. Channel (guild)
//! messages follow the group policy, keyed by their reply address.

use serde::{Deserialize, Serialize};

use crate::config::{ChannelConfig, ConfigField, ConfigSchema};
use crate::message::{ChatType, InboundMessage};

/// Who may reach the bot in a conversation kind.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    /// Everyone.
    #[default]
    Open,
    /// Only entries on the matching allowlist.
    Allowlist,
    /// Nobody.
    Disabled,
}

/// Access policy of a channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AccessPolicy {
    /// Policy for direct messages.
    pub dm_policy: Policy,
    /// Policy for group and channel messages.
    pub group_policy: Policy,
    /// Sender ids allowed to DM the bot.
    pub allow_from: Vec<String>,
    /// Group/chat ids the bot answers in.
    pub group_allow_from: Vec<String>,
    /// Drop group messages that do not mention the bot.
    pub require_mention: bool,
}

impl AccessPolicy {
    /// Reads the policy fields out of a channel configuration.
    ///
    /// Missing fields fall back to their defaults.
    pub fn from_config(config: &ChannelConfig) -> Result<Self, serde_json::Error> {
        config.parse()
    }

    /// Appends the policy fields to a config schema.
    pub fn extend_schema(schema: ConfigSchema) -> ConfigSchema {
        const POLICIES: &[&str] = &["open", "allowlist", "disabled"];
        schema
            .field(
                ConfigField::enumeration("dm_policy", "Who may message the bot directly", POLICIES)
                    .default_value("open"),
            )
            .field(
                ConfigField::enumeration("group_policy", "Which groups the bot answers in", POLICIES)
                    .default_value("open"),
            )
            .field(ConfigField::string_list(
                "allow_from",
                "Sender ids allowed by the DM allowlist (supports *)",
            ))
            .field(ConfigField::string_list(
                "group_allow_from",
                "Chat ids allowed by the group allowlist (supports *)",
            ))
            .field(
                ConfigField::boolean("require_mention", "Only answer group messages that mention the bot")
                    .default_value(false),
            )
    }

    /// Returns true if the message may be delivered to subscribers.
    pub fn admits(&self, message: &InboundMessage) -> bool {
        match message.chat_type {
            ChatType::Direct => match self.dm_policy {
                Policy::Open => true,
                Policy::Allowlist => is_listed(&message.sender_id, &self.allow_from),
                Policy::Disabled => false,
            },
            ChatType::Group | ChatType::Channel => {
                let allowed = match self.group_policy {
                    Policy::Open => true,
                    Policy::Allowlist => is_listed(&message.chat_id, &self.group_allow_from),
                    Policy::Disabled => false,
                };
                allowed && (!self.require_mention || message.mentioned)
            }
        }
    }
}

/// Checks an id against a list of patterns.
///
/// Matching is case-insensitive and supports `*` wildcards. An empty list
/// matches nothing.
pub fn is_listed(id: &str, patterns: &[String]) -> bool {
    let id = id.to_lowercase();
    patterns.iter().any(|pattern| {
        let pattern = pattern.to_lowercase();
        if pattern.contains('*') {
            glob_match(&pattern, &id)
        } else {
            pattern == id
        }
    })
}

/// `*` matches any run of characters.
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    let (first, rest) = match parts.split_first() {
        Some(split) => split,
        None => return text.is_empty(),
    };
    if !text.starts_with(first) {
        return false;
    }

    let mut pos = first.len();
    let last_index = rest.len().saturating_sub(1);
    for (i, part) in rest.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == last_index {
            return text.len() >= pos + part.len() && text[pos..].ends_with(part);
        }
        match text[pos..].find(part) {
            Some(idx) => pos += idx + part.len(),
            None => return false,
        }
    }
    // Pattern ends with `*`, or has no wildcard at all.
    !rest.is_empty() || pos == text.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(chat_type: ChatType, sender: &str, chat: &str, mentioned: bool) -> InboundMessage {
        InboundMessage {
            id: "m1".into(),
            channel: "test".into(),
            sender_id: sender.into(),
            sender_name: None,
            chat_id: chat.into(),
            chat_type,
            content: Default::default(),
            timestamp: Utc::now(),
            mentioned,
            raw: Default::default(),
        }
    }

    #[test]
    fn test_glob_patterns() {
        let list = vec!["admin_*".to_string()];
        assert!(is_listed("ADMIN_alice", &list));
        assert!(!is_listed("user_bob", &list));

        let list = vec!["*@example.com".to_string()];
        assert!(is_listed("user@example.com", &list));
        assert!(!is_listed("user@other.com", &list));

        let list = vec!["group:*_ops".to_string()];
        assert!(is_listed("group:core_ops", &list));
        assert!(!is_listed("group:core_ops2", &list));

        assert!(!is_listed("anyone", &[]));
    }

    #[test]
    fn test_default_policy_admits_everything() {
        let policy = AccessPolicy::default();
        assert!(policy.admits(&message(ChatType::Direct, "u1", "c2c:u1", false)));
        assert!(policy.admits(&message(ChatType::Group, "u1", "group:g1", false)));
    }

    #[test]
    fn test_dm_allowlist() {
        let policy = AccessPolicy {
            dm_policy: Policy::Allowlist,
            allow_from: vec!["u1".into()],
            ..Default::default()
        };
        assert!(policy.admits(&message(ChatType::Direct, "u1", "c2c:u1", false)));
        assert!(!policy.admits(&message(ChatType::Direct, "u2", "c2c:u2", false)));
        // Group traffic is governed separately.
        assert!(policy.admits(&message(ChatType::Group, "u2", "group:g1", false)));
    }

    #[test]
    fn test_group_mention_and_disabled() {
        let policy = AccessPolicy {
            require_mention: true,
            ..Default::default()
        };
        assert!(!policy.admits(&message(ChatType::Group, "u1", "group:g1", false)));
        assert!(policy.admits(&message(ChatType::Channel, "u1", "channel:c1", true)));

        let policy = AccessPolicy {
            group_policy: Policy::Disabled,
            ..Default::default()
        };
        assert!(!policy.admits(&message(ChatType::Group, "u1", "group:g1", true)));
    }

    #[test]
    fn test_from_config() {
        let config = ChannelConfig::new()
            .with("app_id", "ignored")
            .with("dm_policy", "disabled")
            .with("group_allow_from", serde_json::json!(["group:*"]));
        let policy = AccessPolicy::from_config(&config).unwrap();
        assert_eq!(policy.dm_policy, Policy::Disabled);
        assert_eq!(policy.group_policy, Policy::Open);
        assert_eq!(policy.group_allow_from, vec!["group:*".to_string()]);
    }
}
