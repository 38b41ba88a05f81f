//! Configuration of the QQ Bot channel.
//!
//! # Example Configuration
//!
//! ```yaml
//! channels:
//!   qqbot:
//!     enabled: true
//!     app_id: "102000000"
//!     client_secret: ${QQBOT_SECRET}
//!     sandbox: false
//!     intents: [public_guild_messages, direct_message, group_and_c2c]
//!     dm_policy: open
//!     group_policy: allowlist
//!     group_allow_from: ["group:*"]
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use courier_core::{AccessPolicy, ConfigField, ConfigSchema};

use crate::gateway::Intents;

/// Token endpoint of the QQ open platform.
pub const TOKEN_URL: &str = "https://bots.qq.com/app/getAppAccessToken";
/// Production API base.
pub const API_BASE_URL: &str = "https://api.sgroup.qq.com";
/// Sandbox API base.
pub const SANDBOX_API_BASE_URL: &str = "https://sandbox.api.sgroup.qq.com";

/// Named gateway intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentName {
    /// Guild create/update/delete.
    Guilds,
    /// Guild member changes.
    GuildMembers,
    /// Guild direct messages.
    DirectMessage,
    /// Group @-messages and C2C messages.
    GroupAndC2c,
    /// Public guild @-messages.
    PublicGuildMessages,
}

impl IntentName {
    fn bits(self) -> Intents {
        match self {
            Self::Guilds => Intents::GUILDS,
            Self::GuildMembers => Intents::GUILD_MEMBERS,
            Self::DirectMessage => Intents::DIRECT_MESSAGE,
            Self::GroupAndC2c => Intents::GROUP_AND_C2C,
            Self::PublicGuildMessages => Intents::PUBLIC_GUILD_MESSAGES,
        }
    }
}

/// QQ Bot channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QqBotConfig {
    /// Bot application id.
    pub app_id: String,

    /// Bot application secret.
    pub client_secret: String,

    /// Use the sandbox API.
    pub sandbox: bool,

    /// Subscribed intents; empty means the default set.
    pub intents: Vec<IntentName>,

    /// Overrides the API base URL.
    pub api_base_url: Option<String>,

    /// Overrides the token endpoint.
    pub token_url: Option<String>,

    /// HTTP request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Seconds to wait for the gateway handshake to complete.
    pub handshake_timeout_secs: u64,
}

impl Default for QqBotConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            client_secret: String::new(),
            sandbox: false,
            intents: Vec::new(),
            api_base_url: None,
            token_url: None,
            request_timeout_secs: 30,
            handshake_timeout_secs: 30,
        }
    }
}

impl QqBotConfig {
    /// Returns the API base URL in effect.
    pub fn api_base_url(&self) -> &str {
        match &self.api_base_url {
            Some(url) => url,
            None if self.sandbox => SANDBOX_API_BASE_URL,
            None => API_BASE_URL,
        }
    }

    /// Returns the token endpoint in effect.
    pub fn token_url(&self) -> &str {
        self.token_url.as_deref().unwrap_or(TOKEN_URL)
    }

    /// Returns the intents bitmask.
    pub fn intents(&self) -> Intents {
        if self.intents.is_empty() {
            return Intents::default();
        }
        self.intents
            .iter()
            .fold(Intents::empty(), |acc, name| acc | name.bits())
    }

    /// Returns the request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Returns the handshake timeout.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Configuration schema of the channel.
    pub fn schema() -> ConfigSchema {
        let schema = ConfigSchema::new()
            .field(ConfigField::string("app_id", "Bot application id").required())
            .field(
                ConfigField::string("client_secret", "Bot application secret")
                    .required()
                    .secret(),
            )
            .field(ConfigField::boolean("sandbox", "Use the sandbox API").default_value(false))
            .field(ConfigField::string_list(
                "intents",
                "Gateway intents (guilds, guild_members, direct_message, group_and_c2c, public_guild_messages)",
            ))
            .field(ConfigField::string("api_base_url", "Override the API base URL"))
            .field(ConfigField::string("token_url", "Override the token endpoint"))
            .field(
                ConfigField::integer("request_timeout_secs", "HTTP request timeout")
                    .default_value(30),
            )
            .field(
                ConfigField::integer("handshake_timeout_secs", "Gateway handshake timeout")
                    .default_value(30),
            );
        AccessPolicy::extend_schema(schema)
    }
}
