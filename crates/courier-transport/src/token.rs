//! Access token memoization.
//!
//! A [`TokenCache`] wraps a [`TokenFetcher`] (the platform credential
//! exchange) and hands out the cached token until it is about to expire.
//!
//! ```text
//! get_token ──► fresh? ──yes──► cached token
//!                 │no
//!                 ▼
//!          refresh lock ──► fresh now? ──yes──► cached token (another caller refreshed)
//!                               │no
//!                               ▼
//!                        fetcher.fetch_token()
//! ```
//!
//! Callers that arrive while a refresh is in flight wait on the refresh lock
//! and then pick up the token the first caller stored, so concurrent callers
//! trigger a single exchange.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use courier_core::AuthError;

/// Tokens are refreshed this long before the server-side expiry.
/// Capped at half the token lifetime.
pub const DEFAULT_REFRESH_SKEW: Duration = Duration::from_secs(5 * 60);

/// A token as issued by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    /// The access token.
    pub token: String,
    /// Lifetime reported by the server.
    pub expires_in: Duration,
}

/// Performs the credential exchange of one platform.
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    /// Exchanges the configured credentials for a new token.
    async fn fetch_token(&self) -> Result<IssuedToken, AuthError>;
}

#[derive(Debug)]
struct CachedToken {
    token: String,
    refresh_at: Instant,
}

/// Memoized access token with early refresh.
pub struct TokenCache {
    fetcher: Box<dyn TokenFetcher>,
    refresh_skew: Duration,
    entry: Mutex<Option<CachedToken>>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl TokenCache {
    /// Creates an empty cache.
    pub fn new(fetcher: impl TokenFetcher + 'static) -> Self {
        Self {
            fetcher: Box::new(fetcher),
            refresh_skew: DEFAULT_REFRESH_SKEW,
            entry: Mutex::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Overrides the refresh skew.
    pub fn with_refresh_skew(mut self, skew: Duration) -> Self {
        self.refresh_skew = skew;
        self
    }

    fn fresh(&self) -> Option<String> {
        let now = Instant::now();
        self.entry
            .lock()
            .as_ref()
            .filter(|entry| now < entry.refresh_at)
            .map(|entry| entry.token.clone())
    }

    /// Returns a valid token, exchanging credentials if needed.
    pub async fn get_token(&self) -> Result<String, AuthError> {
        if let Some(token) = self.fresh() {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;
        if let Some(token) = self.fresh() {
            return Ok(token);
        }

        debug!("Refreshing access token");
        let issued = self.fetcher.fetch_token().await?;
        let skew = self.refresh_skew.min(issued.expires_in / 2);
        *self.entry.lock() = Some(CachedToken {
            token: issued.token.clone(),
            refresh_at: Instant::now() + issued.expires_in - skew,
        });
        info!(expires_in = issued.expires_in.as_secs(), "Access token refreshed");

        Ok(issued.token)
    }

    /// Drops the cached token so the next call refreshes.
    pub fn clear(&self) {
        if self.entry.lock().take().is_some() {
            debug!("Access token invalidated");
        }
    }

    /// Returns true if a token is cached, fresh or not.
    pub fn is_cached(&self) -> bool {
        self.entry.lock().is_some()
    }
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("refresh_skew", &self.refresh_skew)
            .field("cached", &self.is_cached())
            .finish()
    }
}
