//! QQ open platform REST client.
//!
//! # Target Addressing
//!
//! | Target | Endpoint |
//! |--------|----------|
//! | `c2c:<openid>` / `user:<openid>` / `<openid>` | `POST /v2/users/{openid}/messages` |
//! | `group:<group_openid>` | `POST /v2/groups/{group_openid}/messages` |
//! | `channel:<channel_id>` | `POST /channels/{channel_id}/messages` |
//! | `dm:<guild_id>` | `POST /dms/{guild_id}/messages` |
//!
//! Replies carry the inbound message id as `msg_id` plus an increasing
//! `msg_seq`; without `msg_id` the platform treats the message as active push.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use courier_core::{ApiError, ApiResult, AuthError, ChannelError, ChannelResult, OutboundContent, SendOptions};
use courier_transport::http::{build_http_client, post_credentials};
use courier_transport::{ApiClient, AuthScheme, IssuedToken, TokenCache, TokenFetcher};

use crate::config::QqBotConfig;
use crate::gateway::GatewayCredentials;

// =============================================================================
// Token Exchange
// =============================================================================

/// Exchanges app credentials for an access token.
#[derive(Debug, Clone)]
pub struct QqTokenFetcher {
    http: Client,
    url: String,
    app_id: String,
    client_secret: String,
}

impl QqTokenFetcher {
    /// Creates a fetcher for the given token endpoint.
    pub fn new(http: Client, url: impl Into<String>, app_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            app_id: app_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

/// `expires_in` arrives as a string or a number.
fn parse_expires_in(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[async_trait]
impl TokenFetcher for QqTokenFetcher {
    async fn fetch_token(&self) -> Result<IssuedToken, AuthError> {
        let body = json!({
            "appId": self.app_id,
            "clientSecret": self.client_secret,
        });
        let response = post_credentials(&self.http, &self.url, &body).await?;

        let token = response
            .get("access_token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::Exchange("response has no access_token".into()))?;
        let expires_in = parse_expires_in(response.get("expires_in")).unwrap_or(7200);
        debug!(expires_in, "Obtained QQ access token");

        Ok(IssuedToken {
            token: token.to_string(),
            expires_in: Duration::from_secs(expires_in),
        })
    }
}

// =============================================================================
// Addressing
// =============================================================================

/// Resolved destination of an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Private chat by user openid.
    C2c(String),
    /// Group by group openid.
    Group(String),
    /// Guild text channel.
    Channel(String),
    /// Guild direct message session.
    Dm(String),
}

impl Target {
    /// Parses a target address; a bare id is a C2C openid.
    pub fn parse(target: &str) -> ApiResult<Self> {
        let target = target.trim();
        let (kind, id) = match target.split_once(':') {
            Some((prefix, id)) => (prefix, id.trim()),
            None => ("c2c", target),
        };
        if id.is_empty() {
            return Err(ApiError::InvalidTarget(target.to_string()));
        }
        let id = id.to_string();
        match kind {
            "c2c" | "user" => Ok(Self::C2c(id)),
            "group" => Ok(Self::Group(id)),
            "channel" => Ok(Self::Channel(id)),
            "dm" => Ok(Self::Dm(id)),
            _ => Err(ApiError::InvalidTarget(target.to_string())),
        }
    }
}

/// Rich media type for uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Voice,
    File,
}

impl MediaKind {
    fn file_type(self) -> u8 {
        match self {
            Self::Image => 1,
            Self::Video => 2,
            Self::Voice => 3,
            Self::File => 4,
        }
    }
}

/// Recipient scope of a media upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaScope {
    /// `/v2/users/{id}`.
    User,
    /// `/v2/groups/{id}`.
    Group,
}

impl MediaScope {
    fn path(self, id: &str) -> String {
        match self {
            Self::User => format!("/v2/users/{id}"),
            Self::Group => format!("/v2/groups/{id}"),
        }
    }
}

/// Bot identity returned by `GET /users/@me`.
#[derive(Debug, Clone, Deserialize)]
pub struct BotInfo {
    /// Bot user id.
    pub id: String,
    /// Bot user name.
    #[serde(default)]
    pub username: String,
}

// =============================================================================
// API Client
// =============================================================================

/// REST client of one QQ bot.
#[derive(Debug)]
pub struct QqApiClient {
    api: ApiClient,
    msg_seq: AtomicU32,
}

impl QqApiClient {
    /// Builds a client from the channel configuration.
    pub fn new(config: &QqBotConfig) -> ChannelResult<Self> {
        let http = build_http_client(config.request_timeout())
            .map_err(|e| ChannelError::other(format!("failed to build HTTP client: {e}")))?;
        let fetcher = QqTokenFetcher::new(
            http.clone(),
            config.token_url(),
            config.app_id.clone(),
            config.client_secret.clone(),
        );
        let api = ApiClient::new(http, config.api_base_url(), TokenCache::new(fetcher), AuthScheme::QqBot);
        Ok(Self::with_api(api))
    }

    /// Wraps a preconfigured API client.
    pub fn with_api(api: ApiClient) -> Self {
        Self {
            api,
            msg_seq: AtomicU32::new(1),
        }
    }

    /// The underlying authenticated client.
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    fn next_seq(&self) -> u32 {
        self.msg_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Fetches the gateway WebSocket URL.
    pub async fn gateway_url(&self) -> ApiResult<String> {
        let body = self.api.get("/gateway").await?;
        body.get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ApiError::Decode {
                path: "/gateway".into(),
                reason: "missing url".into(),
            })
    }

    /// Fetches the bot identity.
    pub async fn get_me(&self) -> ApiResult<BotInfo> {
        let body = self.api.get("/users/@me").await?;
        serde_json::from_value(body).map_err(|e| ApiError::Decode {
            path: "/users/@me".into(),
            reason: e.to_string(),
        })
    }

    fn text_body(&self, text: &str, reply_to: Option<&str>) -> Value {
        let mut body = json!({
            "content": text,
            "msg_type": 0,
            "msg_seq": self.next_seq(),
        });
        if let Some(msg_id) = reply_to {
            body["msg_id"] = json!(msg_id);
        }
        body
    }

    /// Sends text to a user.
    pub async fn send_c2c_message(&self, openid: &str, text: &str, reply_to: Option<&str>) -> ApiResult<Option<String>> {
        let body = self.text_body(text, reply_to);
        let response = self.api.post(&format!("/v2/users/{openid}/messages"), &body).await?;
        Ok(message_id(&response))
    }

    /// Sends text to a group.
    pub async fn send_group_message(&self, group_openid: &str, text: &str, reply_to: Option<&str>) -> ApiResult<Option<String>> {
        let body = self.text_body(text, reply_to);
        let response = self
            .api
            .post(&format!("/v2/groups/{group_openid}/messages"), &body)
            .await?;
        Ok(message_id(&response))
    }

    fn guild_body(text: Option<&str>, image: Option<&str>, reply_to: Option<&str>) -> Value {
        let mut body = json!({});
        if let Some(text) = text {
            body["content"] = json!(text);
        }
        if let Some(image) = image {
            body["image"] = json!(image);
        }
        if let Some(msg_id) = reply_to {
            body["msg_id"] = json!(msg_id);
        }
        body
    }

    /// Sends to a guild text channel; `image` is a public URL.
    pub async fn send_channel_message(
        &self,
        channel_id: &str,
        text: Option<&str>,
        image: Option<&str>,
        reply_to: Option<&str>,
    ) -> ApiResult<Option<String>> {
        let body = Self::guild_body(text, image, reply_to);
        let response = self
            .api
            .post(&format!("/channels/{channel_id}/messages"), &body)
            .await?;
        Ok(message_id(&response))
    }

    /// Sends a guild direct message.
    pub async fn send_dm_message(
        &self,
        guild_id: &str,
        text: Option<&str>,
        image: Option<&str>,
        reply_to: Option<&str>,
    ) -> ApiResult<Option<String>> {
        let body = Self::guild_body(text, image, reply_to);
        let response = self.api.post(&format!("/dms/{guild_id}/messages"), &body).await?;
        Ok(message_id(&response))
    }

    /// Registers a media URL for a user or group; returns the `file_info`.
    pub async fn upload_media(&self, scope: MediaScope, id: &str, kind: MediaKind, url: &str) -> ApiResult<String> {
        let path = format!("{}/files", scope.path(id));
        let body = json!({
            "file_type": kind.file_type(),
            "url": url,
            "srv_send_msg": false,
        });
        let response = self.api.post(&path, &body).await?;
        response
            .get("file_info")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ApiError::Decode {
                path,
                reason: "missing file_info".into(),
            })
    }

    /// Sends an uploaded media item (`msg_type` 7).
    pub async fn send_media_message(
        &self,
        scope: MediaScope,
        id: &str,
        file_info: &str,
        text: Option<&str>,
        reply_to: Option<&str>,
    ) -> ApiResult<Option<String>> {
        let mut body = json!({
            "msg_type": 7,
            "media": {"file_info": file_info},
            "msg_seq": self.next_seq(),
        });
        if let Some(text) = text {
            body["content"] = json!(text);
        }
        if let Some(msg_id) = reply_to {
            body["msg_id"] = json!(msg_id);
        }
        let response = self
            .api
            .post(&format!("{}/messages", scope.path(id)), &body)
            .await?;
        Ok(message_id(&response))
    }

    /// Sends outbound content to a resolved target.
    pub async fn send(&self, target: &Target, content: &OutboundContent, options: &SendOptions) -> ApiResult<Option<String>> {
        let text = content.text.as_deref().filter(|t| !t.is_empty());
        let reply_to = options.reply_to.as_deref();

        let image_url = match &content.image {
            Some(image) if image.is_url() => Some(image.source.as_str()),
            Some(image) => {
                return Err(ApiError::Unsupported(format!(
                    "QQ images must be public URLs, got '{}'",
                    image.source
                )));
            }
            None => None,
        };

        match (target, image_url) {
            (Target::C2c(id), None) => self.send_c2c_message(id, text.unwrap_or_default(), reply_to).await,
            (Target::Group(id), None) => self.send_group_message(id, text.unwrap_or_default(), reply_to).await,
            (Target::C2c(id), Some(url)) => {
                let info = self.upload_media(MediaScope::User, id, MediaKind::Image, url).await?;
                self.send_media_message(MediaScope::User, id, &info, text, reply_to).await
            }
            (Target::Group(id), Some(url)) => {
                let info = self.upload_media(MediaScope::Group, id, MediaKind::Image, url).await?;
                self.send_media_message(MediaScope::Group, id, &info, text, reply_to).await
            }
            (Target::Channel(id), image) => self.send_channel_message(id, text, image, reply_to).await,
            (Target::Dm(id), image) => self.send_dm_message(id, text, image, reply_to).await,
        }
    }
}

fn message_id(response: &Value) -> Option<String> {
    response.get("id").and_then(Value::as_str).map(str::to_string)
}

#[async_trait]
impl GatewayCredentials for QqApiClient {
    async fn access_token(&self) -> Result<String, AuthError> {
        self.api.access_token().await
    }

    async fn gateway_url(&self) -> ApiResult<String> {
        QqApiClient::gateway_url(self).await
    }

    fn invalidate_token(&self) {
        self.api.tokens().clear();
    }
}
