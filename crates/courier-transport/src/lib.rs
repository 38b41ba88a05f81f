//! # Courier Transport
//!
//! Network plumbing shared by the platform adapters.
//!
//! ## Features
//!
//! - `http-client` (default): authenticated REST client ([`http::ApiClient`])
//! - `ws-client` (default): WebSocket connect helper ([`websocket::connect`])
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │  Adapter Layer       │  (QQ Bot, Feishu)
//! ├──────────────────────┤
//! │  courier-transport   │  <- This crate
//! │  TokenCache          │
//! │  ApiClient           │
//! │  Backoff             │
//! ├──────────────────────┤
//! │  Network (HTTP/WS)   │
//! └──────────────────────┘
//! ```
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`TokenCache`] | Memoized access token with early refresh and coalescing |
//! | [`http::ApiClient`] | JSON requests with the platform authorization header |
//! | [`BackoffSchedule`] | Reconnect delays indexed by attempt |
//! | [`websocket`] | Socket aliases, connect with timeout, close-code mapping |

pub mod backoff;
pub mod token;

#[cfg(feature = "http-client")]
pub mod http;

#[cfg(feature = "ws-client")]
pub mod websocket;

pub use backoff::{Backoff, BackoffSchedule};
pub use token::{DEFAULT_REFRESH_SKEW, IssuedToken, TokenCache, TokenFetcher};

#[cfg(feature = "http-client")]
pub use http::{ApiClient, AuthScheme};
