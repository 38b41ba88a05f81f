//! The channel adapter contract.
//!
//! Every platform integration is exposed to the rest of the application as a
//! [`ChannelAdapter`]. The contract is identical across platforms:
//!
//! | Operation | Behaviour |
//! |-----------|-----------|
//! | `initialize` | validate and store the config, no network I/O |
//! | `start` | open the platform connection |
//! | `stop` | tear everything down, idempotent |
//! | `send_message` | deliver outbound content, never fails with `Err` |
//! | `on_message` | subscribe to admitted inbound messages |
//! | `status` | snapshot of the runtime status |
//!
//! Platform code usually does not implement this trait directly. It
//! implements the smaller [`ChannelDriver`](crate::channel::ChannelDriver)
//! and wraps it in [`Channel`](crate::channel::Channel), which supplies the
//! lifecycle rules above.
//!
//! # Example
//!
//! ```rust,ignore
//! let adapter: BoxedAdapter = Arc::new(Channel::new(QqBotDriver::new()));
//! adapter.initialize(config).await?;
//! adapter.on_message(handler_fn(|msg| async move {
//!     println!("{}: {}", msg.sender_id, msg.text());
//!     Ok(())
//! }));
//! adapter.start().await?;
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::config::{ChannelConfig, ConfigSchema};
use crate::error::{ChannelResult, ConfigValidationError, HandlerError};
use crate::message::{InboundMessage, OutboundContent, SendOptions, SendResult};
use crate::status::{ChannelMeta, ChannelStatus};

// =============================================================================
// Message Handlers
// =============================================================================

/// Subscriber callback for inbound messages.
///
/// Each subscriber receives its own clone of the message.
pub type MessageHandler =
    Arc<dyn Fn(InboundMessage) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Wraps an async closure into a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

// =============================================================================
// Adapter Trait
// =============================================================================

/// Uniform capability contract of a messaging channel.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Returns the channel identity.
    fn meta(&self) -> &ChannelMeta;

    /// Validates and stores the configuration.
    ///
    /// Fails with [`ConfigValidationError`] listing every issue before any
    /// network call is made.
    async fn initialize(&self, config: ChannelConfig) -> ChannelResult<()>;

    /// Starts the channel. A no-op if it is already running.
    async fn start(&self) -> ChannelResult<()>;

    /// Stops the channel. A no-op if it is not running.
    async fn stop(&self) -> ChannelResult<()>;

    /// Sends content to a platform address.
    async fn send_message(
        &self,
        target: &str,
        content: &OutboundContent,
        options: &SendOptions,
    ) -> SendResult;

    /// Registers a subscriber for inbound messages.
    fn on_message(&self, handler: MessageHandler);

    /// Returns a copy of the current status.
    fn status(&self) -> ChannelStatus;

    /// Describes the accepted configuration.
    fn config_schema(&self) -> ConfigSchema;

    /// Validates a configuration without storing it.
    fn validate_config(&self, config: &ChannelConfig) -> Result<(), ConfigValidationError>;
}

/// A shared adapter trait object.
pub type BoxedAdapter = Arc<dyn ChannelAdapter>;
