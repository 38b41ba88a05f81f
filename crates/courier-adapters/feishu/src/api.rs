//! Feishu/Lark open platform REST client.
//!
//! All calls except the token exchange and the long-connection endpoint
//! lookup carry `Authorization: Bearer <tenant_access_token>`. Responses are
//! wrapped in `{code, msg, data}`; a non-zero `code` becomes
//! [`ApiError::Platform`], and codes `99991661`/`99991663` also clear the
//! token cache.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use courier_core::{ApiError, ApiResult, AuthError, ChannelError, ChannelResult, MediaRef, OutboundContent, SendOptions};
use courier_transport::http::{build_http_client, platform_error, post_credentials};
use courier_transport::{ApiClient, AuthScheme, IssuedToken, TokenCache, TokenFetcher};

use crate::config::FeishuConfig;
use crate::proto::ClientConfig;

/// Platform codes meaning the tenant token is missing or invalid.
pub const TOKEN_INVALID_CODES: &[i64] = &[99991661, 99991663];

// =============================================================================
// Token Exchange
// =============================================================================

/// Exchanges app credentials for a tenant access token.
#[derive(Debug, Clone)]
pub struct FeishuTokenFetcher {
    http: Client,
    url: String,
    app_id: String,
    app_secret: String,
}

impl FeishuTokenFetcher {
    /// Creates a fetcher posting to `url`.
    pub fn new(http: Client, url: impl Into<String>, app_id: impl Into<String>, app_secret: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
            app_id: app_id.into(),
            app_secret: app_secret.into(),
        }
    }
}

#[async_trait]
impl TokenFetcher for FeishuTokenFetcher {
    async fn fetch_token(&self) -> Result<IssuedToken, AuthError> {
        let body = json!({
            "app_id": self.app_id,
            "app_secret": self.app_secret,
        });
        let response = post_credentials(&self.http, &self.url, &body).await?;
        let token = response
            .get("tenant_access_token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::Exchange("response has no tenant_access_token".into()))?;
        let expire = response.get("expire").and_then(Value::as_u64).unwrap_or(7200);
        debug!(expire, "Obtained Feishu tenant access token");
        Ok(IssuedToken {
            token: token.to_string(),
            expires_in: Duration::from_secs(expire),
        })
    }
}

// =============================================================================
// Addressing
// =============================================================================

/// Recipient of an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveTarget {
    /// `receive_id_type` query value.
    pub id_type: &'static str,
    /// The id itself.
    pub id: String,
}

impl ReceiveTarget {
    /// Parses `chat:<id>`, `user:<open_id>`, `union:<id>` or a bare id whose
    /// prefix (`oc_`, `ou_`, `on_`) names its type. Other bare ids are chats.
    pub fn parse(target: &str) -> ApiResult<Self> {
        let target = target.trim();
        let (id_type, id) = match target.split_once(':') {
            Some(("chat", id)) => ("chat_id", id),
            Some(("user" | "open_id", id)) => ("open_id", id),
            Some(("union" | "union_id", id)) => ("union_id", id),
            Some(("email", id)) => ("email", id),
            Some(_) => return Err(ApiError::InvalidTarget(target.to_string())),
            None if target.starts_with("ou_") => ("open_id", target),
            None if target.starts_with("on_") => ("union_id", target),
            None => ("chat_id", target),
        };
        let id = id.trim();
        if id.is_empty() {
            return Err(ApiError::InvalidTarget(target.to_string()));
        }
        Ok(Self {
            id_type,
            id: id.to_string(),
        })
    }
}

/// Long-connection endpoint handed out by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsEndpoint {
    /// `wss://` URL including the connection query.
    pub url: String,
    /// `service_id` query value, echoed in pings.
    pub service_id: i32,
    /// Server-side settings.
    pub client_config: ClientConfig,
}

/// Bot identity returned by `GET /bot/v3/info`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BotInfo {
    /// Bot open id, used to detect mentions.
    #[serde(default)]
    pub open_id: String,
    /// App name.
    #[serde(default)]
    pub app_name: String,
}

// =============================================================================
// API Client
// =============================================================================

/// REST client of one Feishu app.
#[derive(Debug)]
pub struct FeishuApiClient {
    api: ApiClient,
    endpoint_url: String,
    app_id: String,
    app_secret: String,
}

impl FeishuApiClient {
    /// Builds a client from the channel configuration.
    pub fn new(config: &FeishuConfig) -> ChannelResult<Self> {
        let http = build_http_client(config.request_timeout())
            .map_err(|e| ChannelError::other(format!("failed to build HTTP client: {e}")))?;
        let base = config.api_base_url();
        let fetcher = FeishuTokenFetcher::new(
            http.clone(),
            format!("{base}/auth/v3/tenant_access_token/internal"),
            config.app_id.clone(),
            config.app_secret.clone(),
        );
        let api = ApiClient::new(http, base, TokenCache::new(fetcher), AuthScheme::Bearer)
            .with_auth_codes(TOKEN_INVALID_CODES);
        Ok(Self {
            api,
            endpoint_url: config.ws_endpoint_url(),
            app_id: config.app_id.clone(),
            app_secret: config.app_secret.clone(),
        })
    }

    /// The underlying authenticated client.
    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    /// Fetches the long-connection endpoint with the app credentials.
    pub async fn ws_endpoint(&self) -> ApiResult<WsEndpoint> {
        let path = "/callback/ws/endpoint";
        let body = json!({
            "AppID": self.app_id,
            "AppSecret": self.app_secret,
        });
        let response = self
            .api
            .http()
            .post(&self.endpoint_url)
            .header("locale", "zh")
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::Request {
                path: path.into(),
                reason: e.to_string(),
            })?;
        let status = response.status();
        let value: Value = response.json().await.map_err(|e| ApiError::Decode {
            path: path.into(),
            reason: e.to_string(),
        })?;
        if let Some((code, message)) = platform_error(&value) {
            return Err(ApiError::Platform {
                path: path.into(),
                code,
                message,
            });
        }
        if !status.is_success() {
            return Err(ApiError::Status {
                path: path.into(),
                status: status.as_u16(),
                body: value.to_string(),
            });
        }
        parse_endpoint(&value["data"]).ok_or_else(|| ApiError::Decode {
            path: path.into(),
            reason: "missing URL".into(),
        })
    }

    /// Fetches the bot identity.
    pub async fn bot_info(&self) -> ApiResult<BotInfo> {
        let body = self.api.get("/bot/v3/info").await?;
        serde_json::from_value(body["bot"].clone()).map_err(|e| ApiError::Decode {
            path: "/bot/v3/info".into(),
            reason: e.to_string(),
        })
    }

    async fn create_message(&self, target: &ReceiveTarget, msg_type: &str, content: Value) -> ApiResult<Option<String>> {
        let path = format!("/im/v1/messages?receive_id_type={}", target.id_type);
        let body = json!({
            "receive_id": target.id,
            "msg_type": msg_type,
            "content": content.to_string(),
        });
        let response = self.api.post(&path, &body).await?;
        Ok(message_id(&response))
    }

    async fn reply_message(&self, parent_id: &str, msg_type: &str, content: Value) -> ApiResult<Option<String>> {
        let body = json!({
            "msg_type": msg_type,
            "content": content.to_string(),
        });
        let response = self
            .api
            .post(&format!("/im/v1/messages/{parent_id}/reply"), &body)
            .await?;
        Ok(message_id(&response))
    }

    /// Sends a text message.
    pub async fn send_text(&self, target: &ReceiveTarget, text: &str) -> ApiResult<Option<String>> {
        self.create_message(target, "text", json!({"text": text})).await
    }

    /// Replies to a message with text.
    pub async fn reply_text(&self, message_id: &str, text: &str) -> ApiResult<Option<String>> {
        self.reply_message(message_id, "text", json!({"text": text})).await
    }

    /// Uploads image bytes and returns the `image_key`.
    pub async fn upload_image(&self, bytes: Vec<u8>, file_name: &str) -> ApiResult<String> {
        let path = "/im/v1/images";
        let form = Form::new()
            .text("image_type", "message")
            .part("image", Part::bytes(bytes).file_name(file_name.to_string()));
        let response = self.api.post_multipart(path, form).await?;
        response
            .pointer("/data/image_key")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ApiError::Decode {
                path: path.into(),
                reason: "missing image_key".into(),
            })
    }

    /// Sends an uploaded image.
    pub async fn send_image(&self, target: &ReceiveTarget, image_key: &str) -> ApiResult<Option<String>> {
        self.create_message(target, "image", json!({"image_key": image_key})).await
    }

    /// Replies to a message with an uploaded image.
    pub async fn reply_image(&self, message_id: &str, image_key: &str) -> ApiResult<Option<String>> {
        self.reply_message(message_id, "image", json!({"image_key": image_key})).await
    }

    /// Resolves an image reference to an `image_key`, uploading if needed.
    ///
    /// `img_…` keys pass through; URLs are downloaded and local paths read.
    pub async fn resolve_image(&self, image: &MediaRef) -> ApiResult<String> {
        if image.source.starts_with("img_") {
            return Ok(image.source.clone());
        }
        let name = image
            .name
            .clone()
            .unwrap_or_else(|| file_name(&image.source));

        let bytes = if image.is_url() {
            let response = self
                .api
                .http()
                .get(&image.source)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| ApiError::Request {
                    path: image.source.clone(),
                    reason: e.to_string(),
                })?;
            response
                .bytes()
                .await
                .map_err(|e| ApiError::Request {
                    path: image.source.clone(),
                    reason: e.to_string(),
                })?
                .to_vec()
        } else {
            tokio::fs::read(&image.source).await.map_err(|e| ApiError::Request {
                path: image.source.clone(),
                reason: e.to_string(),
            })?
        };
        self.upload_image(bytes, &name).await
    }

    /// Sends outbound content. Text and image go out as separate messages,
    /// text first.
    pub async fn send(&self, target: &ReceiveTarget, content: &OutboundContent, options: &SendOptions) -> ApiResult<Option<String>> {
        let reply_to = options.reply_to.as_deref();
        let mut last_id = None;

        if let Some(text) = content.text.as_deref().filter(|t| !t.is_empty()) {
            last_id = match reply_to {
                Some(id) => self.reply_text(id, text).await?,
                None => self.send_text(target, text).await?,
            };
        }
        if let Some(image) = &content.image {
            let key = self.resolve_image(image).await?;
            last_id = match reply_to {
                Some(id) => self.reply_image(id, &key).await?,
                None => self.send_image(target, &key).await?,
            };
        }
        Ok(last_id)
    }
}

fn message_id(response: &Value) -> Option<String> {
    response
        .pointer("/data/message_id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn file_name(source: &str) -> String {
    source
        .rsplit(['/', '\\'])
        .next()
        .and_then(|s| s.split('?').next())
        .filter(|s| !s.is_empty())
        .unwrap_or("image")
        .to_string()
}

fn parse_endpoint(data: &Value) -> Option<WsEndpoint> {
    let url = data
        .get("URL")
        .or_else(|| data.get("url"))
        .and_then(Value::as_str)?
        .to_string();
    let service_id = Url::parse(&url)
        .ok()
        .and_then(|u| {
            u.query_pairs()
                .find(|(k, _)| k == "service_id")
                .and_then(|(_, v)| v.parse().ok())
        })
        .unwrap_or(0);
    let client_config = data
        .get("ClientConfig")
        .and_then(|c| serde_json::from_value(c.clone()).ok())
        .unwrap_or_default();
    Some(WsEndpoint {
        url,
        service_id,
        client_config,
    })
}
