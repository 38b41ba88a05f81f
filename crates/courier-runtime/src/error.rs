//! Runtime error types.

use thiserror::Error;

use courier_core::ChannelError;

use crate::config::ConfigError;

/// Errors that can occur during runtime operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No adapter is registered under the id.
    #[error("Channel not registered: {0}")]
    ChannelNotFound(String),

    /// The config provider has no entry for the channel.
    #[error("No configuration for channel: {0}")]
    ChannelNotConfigured(String),

    /// The channel is configured but disabled.
    #[error("Channel is disabled: {0}")]
    ChannelDisabled(String),

    /// A channel operation failed.
    #[error("Channel '{channel}' failed: {source}")]
    Channel {
        /// Channel id.
        channel: String,
        /// Underlying error.
        #[source]
        source: ChannelError,
    },

    /// Waiting for a shutdown signal failed.
    #[error("Failed to listen for shutdown signals: {0}")]
    Signal(#[from] std::io::Error),
}

impl RuntimeError {
    /// Wraps a channel error with the channel id.
    pub fn channel(channel: impl Into<String>, source: ChannelError) -> Self {
        Self::Channel {
            channel: channel.into(),
            source,
        }
    }
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
