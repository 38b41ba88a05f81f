//! Courier Runtime - orchestration layer for the Courier gateway.
//!
//! This crate provides:
//! - Channel registry and bulk lifecycle ([`ChannelManager`])
//! - Layered configuration loading ([`ConfigLoader`], [`ConfigProvider`])
//! - Logging configuration ([`LoggingBuilder`])
//! - Process runtime with signal handling ([`CourierRuntime`])
//!
//! ```ignore
//! use courier_runtime::CourierRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = CourierRuntime::new();
//!
//!     runtime.register_adapter(courier_adapter_qqbot::qqbot_channel());
//!     runtime.on_message(handler_fn(|msg| async move {
//!         tracing::info!(channel = %msg.channel, "{}", msg.text());
//!         Ok(())
//!     }));
//!
//!     // Run until Ctrl+C
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! `courier.toml` (or `courier.yaml` with the `yaml-config` feature) holds a
//! `[logging]` section and one `[channels.<id>]` table per channel. Any key
//! can be overridden from the environment, e.g.
//! `COURIER_CHANNELS__QQBOT__CLIENT_SECRET=...`.

pub mod config;
pub mod error;
pub mod logging;
pub mod manager;
pub mod runtime;

// Re-exports
pub use config::{
    ConfigError, ConfigLoader, ConfigProvider, ConfigResult, CourierConfig, LoggingConfig, Profile,
};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, SpanEvents};
pub use manager::{BulkReport, ChannelManager, ChannelSnapshot, StatusSnapshot};
pub use runtime::{CourierRuntime, RuntimeBuilder};

// Re-export tracing for use by other crates
pub use tracing;
pub use tracing_subscriber;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
