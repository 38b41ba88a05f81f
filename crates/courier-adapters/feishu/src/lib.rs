//! # Courier Channel for Feishu/Lark
//!
//! Receives events over the open platform's long connection (no public
//! callback URL needed) and sends through the IM REST API.
//!
//! ## Overview
//!
//! | Module | Role |
//! |--------|------|
//! | [`api`] | tenant token exchange, messages, image upload, endpoint lookup |
//! | [`proto`] | protobuf frames of the long connection |
//! | [`connection`] | ping, ack, fragment reassembly and reconnects |
//! | [`event`] | `im.message.receive_v1` decoding and redelivery filtering |
//! | [`driver`] | the [`ChannelDriver`](courier_core::ChannelDriver) |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use courier_adapter_feishu::feishu_channel;
//! use courier_core::prelude::*;
//!
//! let channel = feishu_channel();
//! channel
//!     .initialize(
//!         ChannelConfig::new()
//!             .with("app_id", "cli_a1b2c3")
//!             .with("app_secret", "secret")
//!             .with("domain", "lark"),
//!     )
//!     .await?;
//! channel.start().await?;
//! ```
//!
//! ## Targets
//!
//! `send_message` accepts `oc_…` chat ids (the inbound `chat_id`), `ou_…`
//! open ids, or an explicit `chat:`, `user:`, `union:` or `email:` prefix.

pub mod api;
pub mod config;
pub mod connection;
pub mod driver;
pub mod event;
pub mod proto;

use std::sync::Arc;

use courier_core::{BoxedAdapter, Channel};

pub use api::{FeishuApiClient, ReceiveTarget};
pub use config::{Domain, FeishuConfig};
pub use connection::{ConnectionEvent, ConnectionState, LongConnection};
pub use driver::{CHANNEL_ID, FeishuDriver};
pub use event::FeishuMessageEvent;

/// A Feishu channel.
pub type FeishuChannel = Channel<FeishuDriver>;

/// Creates a Feishu channel ready for registration.
pub fn feishu_channel() -> BoxedAdapter {
    Arc::new(FeishuChannel::new(FeishuDriver::new()))
}
