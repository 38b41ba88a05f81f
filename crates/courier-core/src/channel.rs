//! Shared channel lifecycle.
//!
//! Platforms implement [`ChannelDriver`]: how to connect, disconnect and send.
//! [`Channel`] composes a driver with a [`ChannelState`] and implements
//! [`ChannelAdapter`] on top of it, so lifecycle rules, status bookkeeping,
//! access control and subscriber fan-out behave the same on every platform.
//!
//! # Architecture
//!
//! ```text
//! ChannelManager ──► Channel<D> ──► D: ChannelDriver ──► platform
//!                        │                 │
//!                   ChannelState ◄── ChannelContext (one per run)
//!                        │
//!                   subscribers
//! ```
//!
//! # Runs
//!
//! Each successful `start` opens a new *run*, identified by an epoch number.
//! The driver receives a [`ChannelContext`] bound to that epoch and reports
//! connection changes and inbound messages through it. Once the run ends the
//! context becomes inert: whatever a lingering task reports after `stop` is
//! discarded.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::adapter::{ChannelAdapter, MessageHandler};
use crate::config::{ChannelConfig, ConfigSchema};
use crate::error::{ApiResult, ChannelError, ChannelResult, ConfigValidationError};
use crate::gating::AccessPolicy;
use crate::message::{InboundMessage, OutboundContent, SendOptions, SendResult};
use crate::status::{ChannelMeta, ChannelStatus};

// =============================================================================
// Driver Trait
// =============================================================================

/// Platform-specific half of a channel.
#[async_trait]
pub trait ChannelDriver: Send + Sync + 'static {
    /// Returns the channel identity.
    fn meta(&self) -> &ChannelMeta;

    /// Describes the accepted configuration.
    fn config_schema(&self) -> ConfigSchema;

    /// Checks that the schema cannot express, such as cross-field rules.
    fn validate_config(&self, _config: &ChannelConfig) -> Vec<String> {
        Vec::new()
    }

    /// Access policy for a configuration.
    fn access_policy(&self, config: &ChannelConfig) -> AccessPolicy {
        AccessPolicy::from_config(config).unwrap_or_else(|e| {
            warn!(channel = %self.meta().id, error = %e, "Invalid access policy, using defaults");
            AccessPolicy::default()
        })
    }

    /// Connects to the platform.
    ///
    /// Returning `Ok` means the channel is running; background reconnects may
    /// still be in progress. The context is valid until the run ends. Leftovers
    /// of an earlier run whose `stop` never completed must be released first.
    async fn start(&self, ctx: ChannelContext, config: &ChannelConfig) -> ChannelResult<()>;

    /// Disconnects and releases every background task. Must be idempotent,
    /// and must not wait on the task delivering messages, since a message
    /// handler may stop its own channel.
    async fn stop(&self) -> ChannelResult<()>;

    /// Sends content and returns the platform message id.
    async fn send(
        &self,
        target: &str,
        content: &OutboundContent,
        options: &SendOptions,
    ) -> ApiResult<Option<String>>;
}

// =============================================================================
// Channel State
// =============================================================================

/// Status, subscribers and run bookkeeping of one channel.
pub struct ChannelState {
    channel: String,
    status: RwLock<ChannelStatus>,
    subscribers: RwLock<Vec<MessageHandler>>,
    policy: RwLock<AccessPolicy>,
    epoch: AtomicU64,
}

impl ChannelState {
    /// Creates state for the given channel id.
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            status: RwLock::new(ChannelStatus::default()),
            subscribers: RwLock::new(Vec::new()),
            policy: RwLock::new(AccessPolicy::default()),
            epoch: AtomicU64::new(0),
        }
    }

    /// Returns the channel id.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Returns a copy of the status.
    pub fn status(&self) -> ChannelStatus {
        self.status.read().clone()
    }

    /// Returns true if the channel is running.
    pub fn is_running(&self) -> bool {
        self.status.read().running
    }

    /// Adds a subscriber.
    pub fn subscribe(&self, handler: MessageHandler) {
        self.subscribers.write().push(handler);
    }

    /// Returns the number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Opens a new run and returns its context.
    fn begin_run(self: &Arc<Self>, policy: AccessPolicy) -> ChannelContext {
        *self.policy.write() = policy;
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        ChannelContext {
            state: Arc::clone(self),
            epoch,
        }
    }

    /// Invalidates the context of the current run.
    fn end_run(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    async fn fan_out(&self, message: InboundMessage) {
        self.status.write().message_counts.inbound += 1;

        let subscribers = self.subscribers.read().clone();
        for (index, handler) in subscribers.iter().enumerate() {
            let invoked = std::panic::catch_unwind(AssertUnwindSafe(|| handler(message.clone())));
            let outcome = match invoked {
                Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
                Err(panic) => Err(panic),
            };
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(channel = %self.channel, subscriber = index, error = %e, "Message handler failed");
                }
                Err(_) => {
                    error!(channel = %self.channel, subscriber = index, "Message handler panicked");
                }
            }
        }
    }
}

impl std::fmt::Debug for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelState")
            .field("channel", &self.channel)
            .field("status", &*self.status.read())
            .field("subscribers", &self.subscriber_count())
            .field("epoch", &self.current_epoch())
            .finish()
    }
}

// =============================================================================
// Channel Context
// =============================================================================

/// Handle a driver uses to report back during one run.
#[derive(Clone, Debug)]
pub struct ChannelContext {
    state: Arc<ChannelState>,
    epoch: u64,
}

impl ChannelContext {
    /// Returns the channel id.
    pub fn channel(&self) -> &str {
        self.state.channel()
    }

    /// Returns true while the run this context belongs to is active.
    pub fn is_current(&self) -> bool {
        self.state.current_epoch() == self.epoch
    }

    /// Records a connection state change.
    pub fn set_connected(&self, connected: bool) {
        if !self.is_current() {
            return;
        }
        let mut status = self.state.status.write();
        status.connected = connected;
        if connected {
            status.last_connected_at = Some(Utc::now());
        }
    }

    /// Records the latest fatal or reconnect-triggering condition.
    pub fn record_error(&self, error: impl std::fmt::Display) {
        if !self.is_current() {
            return;
        }
        self.state.status.write().last_error = Some(error.to_string());
    }

    /// Delivers an inbound message to every subscriber in registration order.
    ///
    /// Returns false if the message was discarded, either because the run has
    /// ended or because the access policy rejected it.
    pub async fn dispatch(&self, message: InboundMessage) -> bool {
        if !self.is_current() {
            debug!(channel = %self.channel(), id = %message.id, "Discarding message from a finished run");
            return false;
        }
        if !self.state.policy.read().admits(&message) {
            debug!(
                channel = %self.channel(),
                sender = %message.sender_id,
                chat = %message.chat_id,
                "Message rejected by access policy"
            );
            return false;
        }
        self.state.fan_out(message).await;
        true
    }
}

// =============================================================================
// Channel
// =============================================================================

/// A driver wrapped with the shared lifecycle rules.
pub struct Channel<D: ChannelDriver> {
    driver: Arc<D>,
    state: Arc<ChannelState>,
    config: RwLock<Option<ChannelConfig>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl<D: ChannelDriver> Channel<D> {
    /// Wraps a driver.
    pub fn new(driver: D) -> Self {
        let state = Arc::new(ChannelState::new(driver.meta().id.clone()));
        Self {
            driver: Arc::new(driver),
            state,
            config: RwLock::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the driver.
    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    /// Returns the shared state.
    pub fn state(&self) -> &Arc<ChannelState> {
        &self.state
    }

    fn id(&self) -> &str {
        &self.driver.meta().id
    }

    fn collect_issues(&self, config: &ChannelConfig) -> Vec<String> {
        let issues = self.driver.config_schema().validate(config);
        if !issues.is_empty() {
            return issues;
        }
        self.driver.validate_config(config)
    }
}

#[async_trait]
impl<D: ChannelDriver> ChannelAdapter for Channel<D> {
    fn meta(&self) -> &ChannelMeta {
        self.driver.meta()
    }

    async fn initialize(&self, config: ChannelConfig) -> ChannelResult<()> {
        self.validate_config(&config)?;
        *self.config.write() = Some(config);
        debug!(channel = %self.id(), "Channel initialized");
        Ok(())
    }

    async fn start(&self) -> ChannelResult<()> {
        let _guard = self.lifecycle.lock().await;

        if self.state.is_running() {
            warn!(channel = %self.id(), "Channel is already running");
            return Ok(());
        }
        let config = self
            .config
            .read()
            .clone()
            .ok_or_else(|| ChannelError::NotInitialized(self.id().to_string()))?;

        let ctx = self.state.begin_run(self.driver.access_policy(&config));
        self.state.status.write().last_error = None;
        info!(channel = %self.id(), "Starting channel");

        match self.driver.start(ctx, &config).await {
            Ok(()) => {
                self.state.status.write().running = true;
                info!(channel = %self.id(), "Channel started");
                Ok(())
            }
            Err(e) => {
                self.state.end_run();
                if let Err(stop_err) = self.driver.stop().await {
                    debug!(channel = %self.id(), error = %stop_err, "Cleanup after failed start failed");
                }
                let mut status = self.state.status.write();
                status.connected = false;
                status.last_error = Some(e.to_string());
                drop(status);
                error!(channel = %self.id(), error = %e, "Channel failed to start");
                Err(e)
            }
        }
    }

    async fn stop(&self) -> ChannelResult<()> {
        let _guard = self.lifecycle.lock().await;

        if !self.state.is_running() {
            debug!(channel = %self.id(), "Channel is not running");
            return Ok(());
        }

        // Status first: the run is over even if this future is dropped while
        // the driver tears down.
        self.state.end_run();
        {
            let mut status = self.state.status.write();
            status.running = false;
            status.connected = false;
        }

        let result = self.driver.stop().await;
        if let Err(e) = &result {
            self.state.status.write().last_error = Some(e.to_string());
            warn!(channel = %self.id(), error = %e, "Channel stopped with error");
        } else {
            info!(channel = %self.id(), "Channel stopped");
        }
        result
    }

    async fn send_message(
        &self,
        target: &str,
        content: &OutboundContent,
        options: &SendOptions,
    ) -> SendResult {
        if !self.state.is_running() {
            return SendResult::failed(format!("channel '{}' is not running", self.id()));
        }
        if content.is_empty() {
            return SendResult::failed("message content is empty");
        }

        let sent = AssertUnwindSafe(self.driver.send(target, content, options))
            .catch_unwind()
            .await;
        match sent {
            Ok(Ok(message_id)) => {
                self.state.status.write().message_counts.outbound += 1;
                SendResult::ok(message_id)
            }
            Ok(Err(e)) => {
                warn!(channel = %self.id(), to = %target, error = %e, "Send failed");
                SendResult::failed(e.to_string())
            }
            Err(_) => {
                error!(channel = %self.id(), to = %target, "Send panicked");
                SendResult::failed("send panicked")
            }
        }
    }

    fn on_message(&self, handler: MessageHandler) {
        self.state.subscribe(handler);
    }

    fn status(&self) -> ChannelStatus {
        self.state.status()
    }

    fn config_schema(&self) -> ConfigSchema {
        self.driver.config_schema()
    }

    fn validate_config(&self, config: &ChannelConfig) -> Result<(), ConfigValidationError> {
        let issues = self.collect_issues(config);
        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigValidationError::new(self.id(), issues))
        }
    }
}
