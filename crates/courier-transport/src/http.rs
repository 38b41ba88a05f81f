//! Authenticated HTTP client for platform REST APIs.
//!
//! [`ApiClient`] is stateless per call: every request resolves a token from
//! its [`TokenCache`], attaches the platform authorization header and maps the
//! response into JSON or an [`ApiError`]. There are no retries at this layer.
//!
//! Both supported platforms report failures as a JSON body carrying a
//! non-zero `code` plus `message` (QQ) or `msg` (Feishu). Such bodies become
//! [`ApiError::Platform`] regardless of the HTTP status. When the status is
//! 401 or the code is one of the client's auth codes, the token cache is
//! cleared so the next call exchanges credentials again.

use std::time::Duration;

use reqwest::header::AUTHORIZATION;
use reqwest::{Client, ClientBuilder, Method, Response, StatusCode};
use serde_json::Value;
use tracing::{trace, warn};

use courier_core::{ApiError, ApiResult, AuthError};

use crate::token::TokenCache;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const MAX_ERROR_BODY: usize = 512;

/// How the token is presented in the `Authorization` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// `QQBot <token>`.
    QqBot,
    /// `Bearer <token>`.
    Bearer,
}

impl AuthScheme {
    /// Formats the header value for a token.
    pub fn header_value(self, token: &str) -> String {
        match self {
            Self::QqBot => format!("QQBot {token}"),
            Self::Bearer => format!("Bearer {token}"),
        }
    }
}

/// Builds a `reqwest` client with the given timeout.
pub fn build_http_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    ClientBuilder::new().timeout(timeout).build()
}

/// Extracts a platform error `(code, message)` from a response body.
///
/// A body with `"code": 0` is a success envelope.
pub fn platform_error(body: &Value) -> Option<(i64, String)> {
    let code = body.get("code")?.as_i64()?;
    if code == 0 {
        return None;
    }
    let message = body
        .get("message")
        .or_else(|| body.get("msg"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Some((code, message))
}

fn truncate(text: &str) -> String {
    if text.len() <= MAX_ERROR_BODY {
        text.to_string()
    } else {
        let mut end = MAX_ERROR_BODY;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    }
}

/// Posts credentials to a token endpoint without authorization.
///
/// Transport failures become [`AuthError::Exchange`]; refusals (HTTP 4xx or a
/// platform error body) become [`AuthError::Rejected`].
pub async fn post_credentials(client: &Client, url: &str, body: &Value) -> Result<Value, AuthError> {
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| AuthError::Exchange(e.to_string()))?;
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| AuthError::Exchange(e.to_string()))?;
    let value: Option<Value> = serde_json::from_str(&text).ok();

    if let Some((code, message)) = value.as_ref().and_then(platform_error) {
        return Err(AuthError::rejected(code, message));
    }
    if status.is_client_error() {
        return Err(AuthError::rejected(i64::from(status.as_u16()), truncate(&text)));
    }
    if !status.is_success() {
        return Err(AuthError::Exchange(format!("HTTP {}: {}", status.as_u16(), truncate(&text))));
    }
    value.ok_or_else(|| AuthError::Exchange(format!("invalid JSON from token endpoint: {}", truncate(&text))))
}

// =============================================================================
// API Client
// =============================================================================

/// Authenticated JSON client bound to one platform base URL.
#[derive(Debug)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    tokens: TokenCache,
    scheme: AuthScheme,
    auth_codes: Vec<i64>,
}

impl ApiClient {
    /// Creates a client.
    ///
    /// `base_url` must not end with a slash; paths start with one.
    pub fn new(http: Client, base_url: impl Into<String>, tokens: TokenCache, scheme: AuthScheme) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            tokens,
            scheme,
            auth_codes: Vec::new(),
        }
    }

    /// Platform error codes that mean the token is no longer valid.
    pub fn with_auth_codes(mut self, codes: &[i64]) -> Self {
        self.auth_codes = codes.to_vec();
        self
    }

    /// Returns the underlying HTTP client.
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the token cache.
    pub fn tokens(&self) -> &TokenCache {
        &self.tokens
    }

    /// Returns a valid access token.
    pub async fn access_token(&self) -> Result<String, AuthError> {
        self.tokens.get_token().await
    }

    /// Issues an authenticated JSON request.
    pub async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> ApiResult<Value> {
        let token = self.tokens.get_token().await?;
        let url = format!("{}{}", self.base_url, path);
        trace!(%method, %url, "API request");

        let mut request = self
            .http
            .request(method, &url)
            .header(AUTHORIZATION, self.scheme.header_value(&token));
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|e| ApiError::Request {
            path: path.to_string(),
            reason: e.to_string(),
        })?;

        self.handle_response(path, response).await
    }

    /// Issues an authenticated `GET`.
    pub async fn get(&self, path: &str) -> ApiResult<Value> {
        self.request(Method::GET, path, None).await
    }

    /// Issues an authenticated `POST` with a JSON body.
    pub async fn post(&self, path: &str, body: &Value) -> ApiResult<Value> {
        self.request(Method::POST, path, Some(body)).await
    }

    /// Issues an authenticated multipart `POST`.
    pub async fn post_multipart(&self, path: &str, form: reqwest::multipart::Form) -> ApiResult<Value> {
        let token = self.tokens.get_token().await?;
        let url = format!("{}{}", self.base_url, path);
        trace!(%url, "API multipart request");

        let response = self
            .http
            .post(&url)
            .header(AUTHORIZATION, self.scheme.header_value(&token))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ApiError::Request {
                path: path.to_string(),
                reason: e.to_string(),
            })?;

        self.handle_response(path, response).await
    }

    async fn handle_response(&self, path: &str, response: Response) -> ApiResult<Value> {
        let status = response.status();
        let text = response.text().await.map_err(|e| ApiError::Request {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        let value: Option<Value> = if text.trim().is_empty() {
            Some(Value::Null)
        } else {
            serde_json::from_str(&text).ok()
        };

        if let Some((code, message)) = value.as_ref().and_then(platform_error) {
            if status == StatusCode::UNAUTHORIZED || self.auth_codes.contains(&code) {
                warn!(path, code, "Access token rejected, clearing cache");
                self.tokens.clear();
            }
            return Err(ApiError::Platform {
                path: path.to_string(),
                code,
                message,
            });
        }

        if !status.is_success() {
            if status == StatusCode::UNAUTHORIZED {
                warn!(path, "Access token rejected, clearing cache");
                self.tokens.clear();
            }
            return Err(ApiError::Status {
                path: path.to_string(),
                status: status.as_u16(),
                body: truncate(&text),
            });
        }

        value.ok_or_else(|| ApiError::Decode {
            path: path.to_string(),
            reason: format!("invalid JSON: {}", truncate(&text)),
        })
    }
}
