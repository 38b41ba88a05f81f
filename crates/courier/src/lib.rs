//! # Courier
//!
//! A multi-channel chat-bot gateway: one uniform lifecycle and message
//! envelope over QQ Bot and Feishu/Lark.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌──────────────────┐     ┌───────────────┐
//! │ QQ gateway   │────▶│                  │────▶│ subscriber    │
//! │ (WebSocket)  │     │  ChannelManager  │     │               │
//! ├──────────────┤     │  (registry,      │────▶│ subscriber    │
//! │ Feishu long  │────▶│   fan-out)       │     │               │
//! │ connection   │     │                  │◀────│ send_message  │
//! └──────────────┘     └──────────────────┘     └───────────────┘
//! ```
//!
//! - **Core**: message envelope, adapter contract, access policy
//! - **Transport**: token cache, authenticated HTTP, reconnect backoff
//! - **Adapters**: one crate per platform
//! - **Runtime**: config loading, logging, channel manager, signals
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use courier::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = CourierRuntime::new();
//!     runtime.register_adapter(qqbot_channel());
//!     runtime.register_adapter(feishu_channel());
//!
//!     let manager = runtime.manager().clone();
//!     runtime.on_message(handler_fn(move |msg| {
//!         let manager = manager.clone();
//!         async move {
//!             let reply = OutboundContent::text(msg.text());
//!             manager
//!                 .send_message(&msg.channel, &msg.chat_id, &reply, &SendOptions::reply_to(&msg.id))
//!                 .await;
//!             Ok(())
//!         }
//!     }));
//!
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `qqbot`: QQ Bot channel (default)
//! - `feishu`: Feishu/Lark channel (default)
//! - `toml-config` / `yaml-config`: config file formats
//! - `json-log`: JSON log lines

pub use courier_core as core;
pub use courier_runtime as runtime;
pub use courier_transport as transport;

#[cfg(feature = "feishu")]
pub use courier_adapter_feishu as feishu;
#[cfg(feature = "qqbot")]
pub use courier_adapter_qqbot as qqbot;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use courier::prelude::*;
/// ```
pub mod prelude {
    // Runtime - main entry point
    pub use courier_runtime::{ChannelManager, CourierRuntime, RuntimeError, RuntimeResult};

    // Channel model
    pub use courier_core::prelude::*;

    // Channels
    #[cfg(feature = "feishu")]
    pub use courier_adapter_feishu::{FeishuChannel, feishu_channel};
    #[cfg(feature = "qqbot")]
    pub use courier_adapter_qqbot::{QqBotChannel, qqbot_channel};
}
