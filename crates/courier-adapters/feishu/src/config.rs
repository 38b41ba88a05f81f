//! Configuration of the Feishu/Lark channel.
//!
//! # Example Configuration
//!
//! ```yaml
//! channels:
//!   feishu:
//!     app_id: cli_a1b2c3
//!     app_secret: ${FEISHU_APP_SECRET}
//!     domain: lark
//!     group_policy: open
//!     require_mention: true
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use courier_core::{AccessPolicy, ConfigField, ConfigSchema};

/// Which deployment of the open platform to talk to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    /// `open.feishu.cn` (mainland China).
    #[default]
    Feishu,
    /// `open.larksuite.com` (international).
    Lark,
}

impl Domain {
    /// Scheme and host of the deployment.
    pub fn origin(self) -> &'static str {
        match self {
            Self::Feishu => "https://open.feishu.cn",
            Self::Lark => "https://open.larksuite.com",
        }
    }
}

/// Feishu channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeishuConfig {
    /// App id (`cli_…`).
    pub app_id: String,

    /// App secret.
    pub app_secret: String,

    /// Feishu or Lark.
    pub domain: Domain,

    /// Overrides the deployment origin, e.g. for a proxy.
    pub base_url: Option<String>,

    /// HTTP request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Seconds between pings when the server does not say otherwise.
    pub ping_interval_secs: u64,
}

impl Default for FeishuConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            app_secret: String::new(),
            domain: Domain::Feishu,
            base_url: None,
            request_timeout_secs: 30,
            ping_interval_secs: 120,
        }
    }
}

impl FeishuConfig {
    /// Origin in effect, without trailing slash.
    pub fn origin(&self) -> &str {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/'),
            None => self.domain.origin(),
        }
    }

    /// Base of the REST API.
    pub fn api_base_url(&self) -> String {
        format!("{}/open-apis", self.origin())
    }

    /// Long-connection endpoint lookup URL.
    pub fn ws_endpoint_url(&self) -> String {
        format!("{}/callback/ws/endpoint", self.origin())
    }

    /// Returns the request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Returns the default ping interval.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }

    /// Configuration schema of the channel.
    pub fn schema() -> ConfigSchema {
        let schema = ConfigSchema::new()
            .field(ConfigField::string("app_id", "App id (cli_...)").required())
            .field(ConfigField::string("app_secret", "App secret").required().secret())
            .field(
                ConfigField::enumeration("domain", "Open platform deployment", &["feishu", "lark"])
                    .default_value("feishu"),
            )
            .field(ConfigField::string("base_url", "Override the platform origin"))
            .field(
                ConfigField::integer("request_timeout_secs", "HTTP request timeout")
                    .default_value(30),
            )
            .field(
                ConfigField::integer("ping_interval_secs", "Ping interval until the server sets one")
                    .default_value(120),
            );
        AccessPolicy::extend_schema(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lark_domain() {
        let config: FeishuConfig = serde_yaml::from_str(
            r#"
app_id: cli_a
app_secret: s
domain: lark
"#,
        )
        .unwrap();
        assert_eq!(config.api_base_url(), "https://open.larksuite.com/open-apis");
        assert_eq!(
            config.ws_endpoint_url(),
            "https://open.larksuite.com/callback/ws/endpoint"
        );
        assert_eq!(config.ping_interval(), Duration::from_secs(120));
    }

    #[test]
    fn test_base_url_override() {
        let config = FeishuConfig {
            base_url: Some("http://127.0.0.1:9000/".into()),
            ..Default::default()
        };
        assert_eq!(config.api_base_url(), "http://127.0.0.1:9000/open-apis");
    }

    #[test]
    fn test_schema_rejects_unknown_domain() {
        let config = courier_core::ChannelConfig::new()
            .with("app_id", "cli_a")
            .with("app_secret", "s")
            .with("domain", "slack");
        let issues = FeishuConfig::schema().validate(&config);
        assert_eq!(issues, vec!["domain must be one of [feishu, lark]"]);
    }
}
