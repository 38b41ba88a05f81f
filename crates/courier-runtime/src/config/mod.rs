//! Configuration module for the Courier runtime.
//!
//! Loads a [`CourierConfig`] (logging settings plus one [`ChannelConfig`]
//! per channel) from files and the environment, and exposes the channel
//! part through the [`ConfigProvider`] trait.
//!
//! [`ChannelConfig`]: courier_core::ChannelConfig

pub mod error;
pub mod loader;
pub mod provider;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile, load_config, load_config_from_file};
pub use provider::ConfigProvider;
pub use schema::{
    CourierConfig, LogFormat, LogLevel, LogOutput, LogRotation, LoggingConfig, SpanEventConfig,
};
pub use validation::{validate_channel_id, validate_config};
