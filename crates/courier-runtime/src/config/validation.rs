//! Configuration validation utilities.

use super::error::{ConfigError, ConfigResult};
use super::schema::{CourierConfig, LogOutput, LoggingConfig};

/// Validates the entire configuration.
///
/// Only checks what the runtime owns; channel settings are validated by
/// their adapters at `initialize` time.
pub fn validate_config(config: &CourierConfig) -> ConfigResult<()> {
    validate_logging_config(&config.logging)?;
    for id in config.channels.keys() {
        validate_channel_id(id)?;
    }
    Ok(())
}

/// Validates logging configuration.
fn validate_logging_config(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::validation(
            "logging.file_path is required when logging.output is \"file\"",
        ));
    }
    for module in logging.filters.keys() {
        if module.is_empty() || module.contains(char::is_whitespace) || module.contains('=') {
            return Err(ConfigError::validation(format!(
                "Invalid logging filter target: '{module}'"
            )));
        }
    }
    Ok(())
}

/// Channel ids double as config keys and status keys.
pub fn validate_channel_id(id: &str) -> ConfigResult<()> {
    if id.trim().is_empty() || id.contains(char::is_whitespace) {
        return Err(ConfigError::InvalidChannelId(id.to_string()));
    }
    Ok(())
}
