//! # Courier Core
//!
//! The channel model of the Courier chat-bot gateway.
//!
//! This crate defines what every messaging platform integration looks like to
//! the rest of the application, independent of any wire protocol:
//!
//! - **Messages**: normalized envelopes ([`InboundMessage`], [`OutboundContent`], [`SendResult`])
//! - **Adapter contract**: the object-safe [`ChannelAdapter`] trait
//! - **Lifecycle helper**: [`ChannelDriver`] hooks composed into [`Channel`]
//! - **Access control**: DM/group policies and allowlists ([`AccessPolicy`])
//! - **Configuration**: per-channel maps and their schema ([`ChannelConfig`], [`ConfigSchema`])
//! - **Errors**: one enum per failure class ([`ChannelError`] and friends)
//!
//! ## Message Flow
//!
//! ```text
//! ┌──────────┐     ┌─────────────┐     ┌────────────┐     ┌────────────┐
//! │ platform │────▶│   driver    │────▶│  Channel   │────▶│ subscriber │
//! │  socket  │     │ (normalize) │     │ (policy)   │────▶│ subscriber │
//! └──────────┘     └─────────────┘     └────────────┘     └────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use courier_core::prelude::*;
//!
//! let channel: BoxedAdapter = Arc::new(Channel::new(MyDriver::default()));
//! channel.initialize(ChannelConfig::new().with("token", "...")).await?;
//! channel.on_message(handler_fn(|msg| async move {
//!     tracing::info!("{} said {}", msg.sender_id, msg.text());
//!     Ok(())
//! }));
//! channel.start().await?;
//! ```

pub mod adapter;
pub mod channel;
pub mod config;
pub mod error;
pub mod gating;
pub mod message;
pub mod status;

pub use adapter::{BoxedAdapter, ChannelAdapter, MessageHandler, handler_fn};
pub use channel::{Channel, ChannelContext, ChannelDriver, ChannelState};
pub use config::{ChannelConfig, ConfigField, ConfigSchema, FieldKind};
pub use error::{
    ApiError, ApiResult, AuthError, ChannelError, ChannelResult, ConfigValidationError,
    ConnectionError, HandlerError, ProtocolError,
};
pub use gating::{AccessPolicy, Policy, is_listed};
pub use message::{
    ChatType, InboundMessage, MediaRef, MessageContent, OutboundContent, SendOptions, SendResult,
};
pub use status::{ChannelMeta, ChannelStatus, MessageCounts};

pub use futures::future::BoxFuture;

/// Prelude for common imports.
pub mod prelude {
    pub use super::adapter::{BoxedAdapter, ChannelAdapter, MessageHandler, handler_fn};
    pub use super::channel::{Channel, ChannelContext, ChannelDriver};
    pub use super::config::{ChannelConfig, ConfigSchema};
    pub use super::error::{ChannelError, ChannelResult, HandlerError};
    pub use super::message::{
        ChatType, InboundMessage, MediaRef, OutboundContent, SendOptions, SendResult,
    };
    pub use super::status::{ChannelMeta, ChannelStatus};
}
