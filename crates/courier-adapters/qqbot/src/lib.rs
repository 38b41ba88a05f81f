//! # Courier Channel for QQ Bot
//!
//! Connects Courier to the QQ open platform: guild channels, guild direct
//! messages, groups and C2C (private) chats.
//!
//! ## Overview
//!
//! - [`api`]: REST client (token exchange, messages, media upload)
//! - [`gateway`]: WebSocket gateway state machine with heartbeat, resume and
//!   reconnect backoff
//! - [`event`]: decoding of dispatch events into [`QqMessageEvent`]
//! - [`driver`]: the [`ChannelDriver`](courier_core::ChannelDriver) tying it
//!   together
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use courier_adapter_qqbot::qqbot_channel;
//! use courier_core::prelude::*;
//!
//! let channel = qqbot_channel();
//! channel.on_message(handler_fn(|msg| async move {
//!     println!("{}: {}", msg.chat_id, msg.text());
//!     Ok(())
//! }));
//! channel
//!     .initialize(
//!         ChannelConfig::new()
//!             .with("app_id", "102000000")
//!             .with("client_secret", "secret"),
//!     )
//!     .await?;
//! channel.start().await?;
//! ```
//!
//! ## Reply Addresses
//!
//! Inbound `chat_id` values are prefixed with the conversation kind
//! (`c2c:`, `group:`, `channel:`, `dm:`), so passing `chat_id` straight back
//! to `send_message` answers in the same conversation.

pub mod api;
pub mod config;
pub mod driver;
pub mod event;
pub mod gateway;

use std::sync::Arc;

use courier_core::{BoxedAdapter, Channel};

pub use api::{QqApiClient, Target};
pub use config::QqBotConfig;
pub use driver::{CHANNEL_ID, QqBotDriver};
pub use event::{QqMessageEvent, QqMessageKind};
pub use gateway::{GatewayClient, GatewayEvent, GatewayState, Intents};

/// A QQ Bot channel.
pub type QqBotChannel = Channel<QqBotDriver>;

/// Creates a QQ Bot channel ready for registration.
pub fn qqbot_channel() -> BoxedAdapter {
    Arc::new(QqBotChannel::new(QqBotDriver::new()))
}
