//! Process runtime.
//!
//! [`CourierRuntime`] ties configuration, logging and the
//! [`ChannelManager`] together and runs until a shutdown signal arrives.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use courier_runtime::CourierRuntime;
//!
//! // Auto-loads courier.toml from the current directory
//! let runtime = CourierRuntime::new();
//!
//! // Custom configuration path
//! let runtime = CourierRuntime::builder()
//!     .config_file("config/courier.toml")
//!     .profile("production")
//!     .build()?;
//!
//! runtime.register_adapter(qqbot_channel());
//! runtime.run().await?;
//! ```

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::signal;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

use courier_core::{BoxedAdapter, MessageHandler};

use crate::config::{ConfigLoader, ConfigResult, CourierConfig};
use crate::error::RuntimeResult;
use crate::logging;
use crate::manager::{BulkReport, ChannelManager};

/// The Courier process runtime.
pub struct CourierRuntime {
    config: Arc<CourierConfig>,
    manager: Arc<ChannelManager>,
    running: AtomicBool,
    _log_guard: Option<WorkerGuard>,
}

impl CourierRuntime {
    /// Creates a runtime from `courier.toml` in the current directory.
    ///
    /// Falls back to the default configuration if loading fails.
    pub fn new() -> Self {
        let config = ConfigLoader::new()
            .with_current_dir()
            .load()
            .unwrap_or_else(|e| {
                eprintln!("Warning: Failed to load config ({e}), using defaults");
                CourierConfig::default()
            });
        Self::from_config(config)
    }

    /// Creates a runtime builder for custom configuration.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Creates a runtime from loaded configuration.
    ///
    /// Installs the global log subscriber unless one is already installed.
    pub fn from_config(config: CourierConfig) -> Self {
        let log_guard = logging::init_from_config(&config.logging);
        let config = Arc::new(config);

        info!(
            log_level = %config.logging.level,
            channels = config.channels.len(),
            "Runtime initialized from configuration"
        );

        Self {
            manager: Arc::new(ChannelManager::with_provider(config.clone())),
            config,
            running: AtomicBool::new(false),
            _log_guard: log_guard,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CourierConfig {
        &self.config
    }

    /// Returns the channel manager.
    pub fn manager(&self) -> &Arc<ChannelManager> {
        &self.manager
    }

    /// Registers an adapter with the manager.
    pub fn register_adapter(&self, adapter: BoxedAdapter) {
        self.manager.register_adapter(adapter);
    }

    /// Subscribes to inbound messages of every channel.
    pub fn on_message(&self, handler: MessageHandler) {
        self.manager.on_message(handler);
    }

    /// Returns whether the runtime is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Starts every enabled channel.
    ///
    /// Returns `None` if the runtime was already running.
    pub async fn start(&self) -> Option<BulkReport> {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("Runtime is already running");
            return None;
        }
        info!("Starting Courier runtime");
        Some(self.manager.start_all().await)
    }

    /// Stops every running channel.
    pub async fn stop(&self) -> Option<BulkReport> {
        if !self.running.swap(false, Ordering::AcqRel) {
            warn!("Runtime is not running");
            return None;
        }
        info!("Stopping Courier runtime");
        let report = self.manager.stop_all().await;
        info!("Runtime stopped");
        Some(report)
    }

    /// Runs until Ctrl+C or SIGTERM.
    pub async fn run(&self) -> RuntimeResult<()> {
        self.start().await;
        info!("Courier runtime is now running. Press Ctrl+C to stop.");

        let signal = wait_for_shutdown().await;
        self.stop().await;
        signal
    }

    /// Runs until `shutdown` completes.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: std::future::Future<Output = ()>,
    {
        self.start().await;
        shutdown.await;
        self.stop().await;
        Ok(())
    }
}

impl Default for CourierRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CourierRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CourierRuntime")
            .field("manager", &self.manager)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Waits for Ctrl+C or, on unix, SIGTERM.
async fn wait_for_shutdown() -> RuntimeResult<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;

        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down");
    }

    Ok(())
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Builder for creating a [`CourierRuntime`] with custom configuration.
pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
}

impl RuntimeBuilder {
    /// Creates a builder searching the current directory.
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new().with_current_dir(),
        }
    }

    /// Sets a specific configuration file to load.
    pub fn config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    /// Sets the configuration profile.
    pub fn profile(mut self, profile: impl AsRef<str>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    /// Adds a search path for configuration files.
    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    /// Also searches the user config directory.
    pub fn with_user_config_dir(mut self) -> Self {
        self.config_loader = self.config_loader.with_user_config_dir();
        self
    }

    /// Disables loading environment variables.
    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    /// Merges additional configuration programmatically.
    pub fn merge(mut self, config: CourierConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    /// Loads the configuration and builds the runtime.
    pub fn build(self) -> ConfigResult<CourierRuntime> {
        let config = self.config_loader.load()?;
        Ok(CourierRuntime::from_config(config))
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::ChannelConfig;

    fn runtime() -> CourierRuntime {
        let config = CourierConfig::default()
            .with_channel("feishu", ChannelConfig::new().enabled(false));
        CourierRuntime::builder()
            .without_env()
            .merge(config)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_builder_merges_config() {
        let runtime = runtime();
        assert!(!runtime.config().channels["feishu"].enabled);
        assert!(runtime.manager().channel_ids().is_empty());
    }

    #[tokio::test]
    async fn test_start_stop_are_idempotent() {
        let runtime = runtime();

        assert!(runtime.start().await.is_some());
        assert!(runtime.is_running());
        assert!(runtime.start().await.is_none());

        let report = runtime.stop().await.unwrap();
        assert!(report.is_success());
        assert!(runtime.stop().await.is_none());
    }

    #[tokio::test]
    async fn test_run_until_shutdown_future() {
        let runtime = runtime();
        runtime.run_until(async {}).await.unwrap();
        assert!(!runtime.is_running());
    }
}
