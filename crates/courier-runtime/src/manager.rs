//! Channel registry and orchestration.
//!
//! The [`ChannelManager`] owns every registered adapter and is the single
//! place the rest of the process talks to:
//!
//! | Operation | Behaviour |
//! |-----------|-----------|
//! | `register_adapter` | last registration for an id wins, the replaced one is stopped |
//! | `on_message` | process-wide subscription across all channels |
//! | `start_channel` / `stop_channel` | one channel, errors returned |
//! | `start_all` / `stop_all` | every channel concurrently, failures counted |
//! | `send_message` | routes to the adapter, never fails with `Err` |
//! | `status` | snapshot of every adapter, no network I/O |
//!
//! ```text
//!  adapter A ──┐                      ┌──► subscriber 1
//!  adapter B ──┼──► ChannelManager ───┼──► subscriber 2
//!  adapter C ──┘     (fan-out)        └──► subscriber 3
//! ```

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use courier_core::{
    BoxedAdapter, ChannelMeta, HandlerError, InboundMessage, MessageCounts, MessageHandler,
    OutboundContent, SendOptions, SendResult, handler_fn,
};

use crate::config::ConfigProvider;
use crate::error::{RuntimeError, RuntimeResult};

// =============================================================================
// Reports and Snapshots
// =============================================================================

/// Outcome of a bulk start or stop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkReport {
    /// Channels the operation succeeded for.
    pub succeeded: Vec<String>,
    /// Channels that failed, with the error.
    pub failed: Vec<(String, String)>,
    /// Channels left untouched (disabled, unconfigured or not running).
    pub skipped: Vec<String>,
}

impl BulkReport {
    /// Returns true if no channel failed.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

impl std::fmt::Display for BulkReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} skipped",
            self.succeeded.len(),
            self.failed.len(),
            self.skipped.len()
        )
    }
}

/// Status of one channel within a [`StatusSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSnapshot {
    pub running: bool,
    pub connected: bool,
    pub last_error: Option<String>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub message_count: MessageCounts,
    pub meta: ChannelMeta,
}

/// Status of every registered channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    /// At least one channel is running.
    pub running: bool,
    pub channels: BTreeMap<String, ChannelSnapshot>,
}

enum Outcome {
    Done,
    Skipped,
    Failed(String),
}

// =============================================================================
// ChannelManager
// =============================================================================

/// Registry of channel adapters.
pub struct ChannelManager {
    provider: Arc<dyn ConfigProvider>,
    adapters: RwLock<BTreeMap<String, BoxedAdapter>>,
    subscribers: Arc<RwLock<Vec<MessageHandler>>>,
    /// Registration generation per id; only the current one forwards.
    generations: Arc<RwLock<HashMap<String, u64>>>,
    next_generation: AtomicU64,
}

impl ChannelManager {
    /// Creates an empty manager reading channel config from `provider`.
    pub fn new(provider: impl ConfigProvider + 'static) -> Self {
        Self::with_provider(Arc::new(provider))
    }

    /// Creates an empty manager sharing an existing provider.
    pub fn with_provider(provider: Arc<dyn ConfigProvider>) -> Self {
        Self {
            provider,
            adapters: RwLock::new(BTreeMap::new()),
            subscribers: Arc::new(RwLock::new(Vec::new())),
            generations: Arc::new(RwLock::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Registers an adapter under its meta id.
    ///
    /// A previous adapter with the same id is replaced: its messages no longer
    /// reach subscribers, and if it is running it is stopped in the
    /// background. Registering the same instance again changes nothing.
    pub fn register_adapter(&self, adapter: BoxedAdapter) {
        let id = adapter.meta().id.clone();
        if let Some(current) = self.adapter(&id)
            && Arc::ptr_eq(&current, &adapter)
        {
            debug!(channel = %id, "Channel already registered");
            return;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.generations.write().insert(id.clone(), generation);
        adapter.on_message(self.forwarder(id.clone(), generation));

        let replaced = self.adapters.write().insert(id.clone(), adapter);
        match replaced {
            Some(old) => {
                warn!(channel = %id, "Replacing already registered channel");
                Self::retire(id, old);
            }
            None => debug!(channel = %id, "Registered channel"),
        }
    }

    fn retire(id: String, adapter: BoxedAdapter) {
        if !adapter.status().running {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match adapter.stop().await {
                        Ok(()) => info!(channel = %id, "Stopped replaced channel"),
                        Err(e) => warn!(channel = %id, error = %e, "Failed to stop replaced channel"),
                    }
                });
            }
            Err(_) => warn!(channel = %id, "Replaced channel is still running, no runtime to stop it"),
        }
    }

    /// Returns the adapter registered under `id`.
    pub fn adapter(&self, id: &str) -> Option<BoxedAdapter> {
        self.adapters.read().get(id).cloned()
    }

    /// Ids of every registered adapter, sorted.
    pub fn channel_ids(&self) -> Vec<String> {
        self.adapters.read().keys().cloned().collect()
    }

    /// Subscribes to inbound messages of every channel.
    pub fn on_message(&self, handler: MessageHandler) {
        self.subscribers.write().push(handler);
    }

    fn forwarder(&self, channel: String, generation: u64) -> MessageHandler {
        let subscribers = Arc::clone(&self.subscribers);
        let generations = Arc::clone(&self.generations);
        handler_fn(move |message: InboundMessage| {
            let subscribers = if generations.read().get(&channel) == Some(&generation) {
                subscribers.read().clone()
            } else {
                debug!(channel = %channel, id = %message.id, "Dropping message from a replaced adapter");
                Vec::new()
            };
            let channel = channel.clone();
            async move {
                for (index, handler) in subscribers.iter().enumerate() {
                    let invoked =
                        std::panic::catch_unwind(AssertUnwindSafe(|| handler(message.clone())));
                    let outcome = match invoked {
                        Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
                        Err(panic) => Err(panic),
                    };
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            warn!(channel = %channel, subscriber = index, error = %e, "Subscriber failed");
                        }
                        Err(_) => {
                            error!(channel = %channel, subscriber = index, "Subscriber panicked");
                        }
                    }
                }
                Ok::<(), HandlerError>(())
            }
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Initializes and starts one channel from its configuration.
    pub async fn start_channel(&self, id: &str) -> RuntimeResult<()> {
        let adapter = self
            .adapter(id)
            .ok_or_else(|| RuntimeError::ChannelNotFound(id.to_string()))?;
        let config = self
            .provider
            .channel_config(id)
            .ok_or_else(|| RuntimeError::ChannelNotConfigured(id.to_string()))?;
        if !config.enabled {
            return Err(RuntimeError::ChannelDisabled(id.to_string()));
        }

        adapter
            .initialize(config)
            .await
            .map_err(|e| RuntimeError::channel(id, e))?;
        adapter
            .start()
            .await
            .map_err(|e| RuntimeError::channel(id, e))
    }

    /// Stops one channel.
    pub async fn stop_channel(&self, id: &str) -> RuntimeResult<()> {
        let adapter = self
            .adapter(id)
            .ok_or_else(|| RuntimeError::ChannelNotFound(id.to_string()))?;
        adapter
            .stop()
            .await
            .map_err(|e| RuntimeError::channel(id, e))
    }

    /// Starts every registered channel that is configured and enabled.
    ///
    /// Channels start concurrently; one failing does not affect the others.
    pub async fn start_all(&self) -> BulkReport {
        for id in self.provider.channel_ids() {
            if !self.adapters.read().contains_key(&id) {
                warn!(channel = %id, "Channel is configured but no adapter is registered");
            }
        }

        let ids = self.channel_ids();
        let outcomes = join_all(ids.into_iter().map(|id| async move {
            let outcome = match self.start_channel(&id).await {
                Ok(()) => Outcome::Done,
                Err(RuntimeError::ChannelNotConfigured(_)) => {
                    debug!(channel = %id, "No configuration, skipping");
                    Outcome::Skipped
                }
                Err(RuntimeError::ChannelDisabled(_)) => {
                    info!(channel = %id, "Channel disabled, skipping");
                    Outcome::Skipped
                }
                Err(e) => {
                    error!(channel = %id, error = %e, "Failed to start channel");
                    Outcome::Failed(e.to_string())
                }
            };
            (id, outcome)
        }))
        .await;

        let report = Self::collect(outcomes);
        info!(report = %report, "Started channels");
        report
    }

    /// Stops every running channel concurrently.
    pub async fn stop_all(&self) -> BulkReport {
        let adapters: Vec<(String, BoxedAdapter)> = self
            .adapters
            .read()
            .iter()
            .map(|(id, adapter)| (id.clone(), Arc::clone(adapter)))
            .collect();

        let outcomes = join_all(adapters.into_iter().map(|(id, adapter)| async move {
            if !adapter.status().running {
                return (id, Outcome::Skipped);
            }
            let outcome = match adapter.stop().await {
                Ok(()) => Outcome::Done,
                Err(e) => {
                    error!(channel = %id, error = %e, "Failed to stop channel");
                    Outcome::Failed(e.to_string())
                }
            };
            (id, outcome)
        }))
        .await;

        let report = Self::collect(outcomes);
        info!(report = %report, "Stopped channels");
        report
    }

    fn collect(outcomes: Vec<(String, Outcome)>) -> BulkReport {
        let mut report = BulkReport::default();
        for (id, outcome) in outcomes {
            match outcome {
                Outcome::Done => report.succeeded.push(id),
                Outcome::Skipped => report.skipped.push(id),
                Outcome::Failed(e) => report.failed.push((id, e)),
            }
        }
        report
    }

    // =========================================================================
    // Messaging and Status
    // =========================================================================

    /// Sends content through a channel.
    pub async fn send_message(
        &self,
        channel: &str,
        target: &str,
        content: &OutboundContent,
        options: &SendOptions,
    ) -> SendResult {
        match self.adapter(channel) {
            Some(adapter) => adapter.send_message(target, content, options).await,
            None => SendResult::failed(format!("channel '{channel}' is not registered")),
        }
    }

    /// Returns the status of every registered channel.
    pub fn status(&self) -> StatusSnapshot {
        let channels: BTreeMap<String, ChannelSnapshot> = self
            .adapters
            .read()
            .iter()
            .map(|(id, adapter)| {
                let status = adapter.status();
                let snapshot = ChannelSnapshot {
                    running: status.running,
                    connected: status.connected,
                    last_error: status.last_error,
                    last_connected_at: status.last_connected_at,
                    message_count: status.message_counts,
                    meta: adapter.meta().clone(),
                };
                (id.clone(), snapshot)
            })
            .collect();

        StatusSnapshot {
            running: channels.values().any(|c| c.running),
            channels,
        }
    }

    /// [`status`](Self::status) as a JSON value.
    pub fn status_json(&self) -> serde_json::Value {
        serde_json::to_value(self.status()).unwrap_or_default()
    }
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("channels", &self.channel_ids())
            .field("subscribers", &self.subscribers.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use courier_core::{
        ApiResult, AuthError, Channel, ChannelAdapter, ChannelConfig, ChannelContext, ChannelDriver,
        ChannelResult, ChatType, ConfigSchema, MessageContent,
    };

    struct FakeDriver {
        meta: ChannelMeta,
        fail_start: bool,
        ctx: parking_lot::Mutex<Option<ChannelContext>>,
    }

    impl FakeDriver {
        fn new(id: &str) -> Self {
            Self {
                meta: ChannelMeta::new(id, id, "Fake channel", "0.1.0"),
                fail_start: false,
                ctx: parking_lot::Mutex::new(None),
            }
        }

        fn failing(id: &str) -> Self {
            Self {
                fail_start: true,
                ..Self::new(id)
            }
        }
    }

    #[async_trait]
    impl ChannelDriver for FakeDriver {
        fn meta(&self) -> &ChannelMeta {
            &self.meta
        }

        fn config_schema(&self) -> ConfigSchema {
            ConfigSchema::new()
        }

        async fn start(&self, ctx: ChannelContext, _config: &ChannelConfig) -> ChannelResult<()> {
            if self.fail_start {
                return Err(AuthError::rejected(401, "bad secret").into());
            }
            ctx.set_connected(true);
            *self.ctx.lock() = Some(ctx);
            Ok(())
        }

        async fn stop(&self) -> ChannelResult<()> {
            self.ctx.lock().take();
            Ok(())
        }

        async fn send(
            &self,
            _target: &str,
            _content: &OutboundContent,
            _options: &SendOptions,
        ) -> ApiResult<Option<String>> {
            Ok(Some(format!("{}-1", self.meta.id)))
        }
    }

    fn message(channel: &str) -> InboundMessage {
        InboundMessage {
            id: "m1".into(),
            channel: channel.into(),
            sender_id: "u1".into(),
            sender_name: None,
            chat_id: "c2c:u1".into(),
            chat_type: ChatType::Direct,
            content: MessageContent::text("hello"),
            timestamp: Utc::now(),
            mentioned: true,
            raw: Default::default(),
        }
    }

    fn provider() -> HashMap<String, ChannelConfig> {
        let mut map = HashMap::new();
        map.insert("alpha".to_string(), ChannelConfig::new());
        map.insert("beta".to_string(), ChannelConfig::new().enabled(false));
        map.insert("broken".to_string(), ChannelConfig::new());
        map
    }

    fn manager() -> (ChannelManager, Arc<Channel<FakeDriver>>) {
        let manager = ChannelManager::new(provider());
        let alpha = Arc::new(Channel::new(FakeDriver::new("alpha")));
        manager.register_adapter(alpha.clone());
        manager.register_adapter(Arc::new(Channel::new(FakeDriver::new("beta"))));
        manager.register_adapter(Arc::new(Channel::new(FakeDriver::failing("broken"))));
        manager.register_adapter(Arc::new(Channel::new(FakeDriver::new("gamma"))));
        (manager, alpha)
    }

    #[tokio::test]
    async fn test_start_all_settles_every_channel() {
        let (manager, _) = manager();

        let report = manager.start_all().await;
        assert_eq!(report.succeeded, vec!["alpha"]);
        assert_eq!(report.skipped, vec!["beta", "gamma"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "broken");
        assert!(!report.is_success());

        let status = manager.status();
        assert!(status.running);
        assert!(status.channels["alpha"].running);
        assert!(status.channels["broken"].last_error.is_some());

        let report = manager.stop_all().await;
        assert_eq!(report.succeeded, vec!["alpha"]);
        assert_eq!(report.skipped.len(), 3);
        assert!(!manager.status().running);
    }

    #[tokio::test]
    async fn test_start_channel_errors() {
        let (manager, _) = manager();

        assert!(matches!(
            manager.start_channel("beta").await,
            Err(RuntimeError::ChannelDisabled(_))
        ));
        assert!(matches!(
            manager.start_channel("gamma").await,
            Err(RuntimeError::ChannelNotConfigured(_))
        ));
        assert!(matches!(
            manager.start_channel("slack").await,
            Err(RuntimeError::ChannelNotFound(_))
        ));
        assert!(matches!(
            manager.start_channel("broken").await,
            Err(RuntimeError::Channel { .. })
        ));
        assert!(manager.start_channel("alpha").await.is_ok());
        assert!(manager.stop_channel("alpha").await.is_ok());
    }

    #[tokio::test]
    async fn test_fan_out_to_process_subscribers() {
        let (manager, alpha) = manager();
        let received = Arc::new(AtomicUsize::new(0));

        manager.on_message(handler_fn(|_msg| async {
            Err::<(), HandlerError>("subscriber down".into())
        }));
        let counter = Arc::clone(&received);
        manager.on_message(handler_fn(move |msg| {
            let counter = Arc::clone(&counter);
            async move {
                assert_eq!(msg.text(), "hello");
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));

        manager.start_channel("alpha").await.unwrap();
        let ctx = alpha.driver().ctx.lock().clone().unwrap();
        assert!(ctx.dispatch(message("alpha")).await);

        assert_eq!(received.load(Ordering::SeqCst), 1);
        assert_eq!(manager.status().channels["alpha"].message_count.inbound, 1);
    }

    #[tokio::test]
    async fn test_send_message_routing() {
        let (manager, _) = manager();
        let content = OutboundContent::text("hi");

        let result = manager
            .send_message("slack", "c2c:u1", &content, &SendOptions::default())
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("slack"));

        let result = manager
            .send_message("alpha", "c2c:u1", &content, &SendOptions::default())
            .await;
        assert!(!result.success);

        manager.start_channel("alpha").await.unwrap();
        let result = manager
            .send_message("alpha", "c2c:u1", &content, &SendOptions::default())
            .await;
        assert!(result.success);
        assert_eq!(result.message_id.as_deref(), Some("alpha-1"));
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let (manager, alpha) = manager();
        let replacement = Arc::new(Channel::new(FakeDriver::new("alpha")));
        manager.register_adapter(replacement.clone());

        manager.start_channel("alpha").await.unwrap();
        assert!(replacement.status().running);
        assert!(!alpha.status().running);
        assert_eq!(manager.channel_ids().len(), 4);
    }

    fn counting_subscriber(manager: &ChannelManager) -> Arc<AtomicUsize> {
        let received = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&received);
        manager.on_message(handler_fn(move |_msg| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));
        received
    }

    #[tokio::test]
    async fn test_registering_same_adapter_twice_delivers_once() {
        let (manager, alpha) = manager();
        manager.register_adapter(alpha.clone());
        manager.register_adapter(alpha.clone());
        assert_eq!(alpha.state().subscriber_count(), 1);

        let received = counting_subscriber(&manager);
        manager.start_channel("alpha").await.unwrap();
        let ctx = alpha.driver().ctx.lock().clone().unwrap();
        assert!(ctx.dispatch(message("alpha")).await);
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_replaced_adapter_is_detached_and_stopped() {
        let (manager, alpha) = manager();
        let received = counting_subscriber(&manager);
        manager.start_channel("alpha").await.unwrap();
        let old_ctx = alpha.driver().ctx.lock().clone().unwrap();

        let replacement = Arc::new(Channel::new(FakeDriver::new("alpha")));
        manager.register_adapter(replacement.clone());

        // The background stop has not run yet; the old adapter is already cut off.
        assert!(old_ctx.dispatch(message("alpha")).await);
        assert_eq!(received.load(Ordering::SeqCst), 0);

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while alpha.status().running {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(manager.stop_all().await.succeeded.is_empty());

        manager.start_channel("alpha").await.unwrap();
        let ctx = replacement.driver().ctx.lock().clone().unwrap();
        assert!(ctx.dispatch(message("alpha")).await);
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_status_json_shape() {
        let (manager, _) = manager();
        manager.start_channel("alpha").await.unwrap();

        let json = manager.status_json();
        assert_eq!(json["running"], true);
        let alpha = &json["channels"]["alpha"];
        assert_eq!(alpha["connected"], true);
        assert!(alpha["last_error"].is_null());
        assert!(alpha["last_connected_at"].is_string());
        assert_eq!(alpha["message_count"]["outbound"], 0);
        assert_eq!(alpha["meta"]["id"], "alpha");
    }
}
