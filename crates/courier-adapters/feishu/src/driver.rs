//! Feishu channel driver.
//!
//! `start` first asks for the bot identity, which both checks the app
//! credentials and yields the open id used for mention detection, then opens
//! a [`LongConnection`] and pumps its events into the run's
//! [`ChannelContext`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use courier_core::{
    ApiError, ApiResult, ChannelConfig, ChannelContext, ChannelDriver, ChannelMeta, ChannelResult, ConfigSchema,
    ConfigValidationError, OutboundContent, SendOptions,
};
use courier_transport::BackoffSchedule;

use crate::api::{FeishuApiClient, ReceiveTarget};
use crate::config::FeishuConfig;
use crate::connection::{ConnectionEvent, ConnectionOptions, LongConnection};

/// Channel id of the Feishu adapter.
pub const CHANNEL_ID: &str = "feishu";

struct Running {
    api: Arc<FeishuApiClient>,
    connection: LongConnection,
    pump: JoinHandle<()>,
}

impl Running {
    async fn shutdown(self) {
        self.connection.stop().await;
        // Stopped from a message handler: this is the pump itself.
        if tokio::task::try_id() == Some(self.pump.id()) {
            debug!(channel = CHANNEL_ID, "Stopped from the event pump");
            return;
        }
        if let Err(e) = self.pump.await {
            warn!(channel = CHANNEL_ID, error = %e, "Event pump panicked");
        }
    }
}

/// Feishu implementation of [`ChannelDriver`].
pub struct FeishuDriver {
    meta: ChannelMeta,
    backoff: BackoffSchedule,
    running: Mutex<Option<Running>>,
}

impl Default for FeishuDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl FeishuDriver {
    /// Creates a driver with the default reconnect schedule.
    pub fn new() -> Self {
        Self {
            meta: ChannelMeta::new(
                CHANNEL_ID,
                "Feishu",
                "Feishu/Lark bot over the event long connection",
                env!("CARGO_PKG_VERSION"),
            ),
            backoff: BackoffSchedule::default(),
            running: Mutex::new(None),
        }
    }

    /// Overrides the reconnect schedule.
    pub fn with_backoff(mut self, backoff: BackoffSchedule) -> Self {
        self.backoff = backoff;
        self
    }

    fn parse_config(&self, config: &ChannelConfig) -> ChannelResult<FeishuConfig> {
        config
            .parse()
            .map_err(|e| ConfigValidationError::new(CHANNEL_ID, vec![e.to_string()]).into())
    }
}

async fn pump(ctx: ChannelContext, bot_open_id: Option<String>, mut events: mpsc::Receiver<ConnectionEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Connected => ctx.set_connected(true),
            ConnectionEvent::Message(message) => {
                let inbound = message.into_inbound(ctx.channel(), bot_open_id.as_deref());
                ctx.dispatch(inbound).await;
            }
            ConnectionEvent::Disconnected { reason, .. } => {
                ctx.set_connected(false);
                ctx.record_error(reason);
            }
            ConnectionEvent::Error(error) => ctx.record_error(error),
        }
    }
    if ctx.is_current() {
        warn!(channel = %ctx.channel(), "Long connection event stream ended unexpectedly");
        ctx.set_connected(false);
        ctx.record_error("long connection task ended");
    }
    debug!(channel = %ctx.channel(), "Event pump finished");
}

#[async_trait]
impl ChannelDriver for FeishuDriver {
    fn meta(&self) -> &ChannelMeta {
        &self.meta
    }

    fn config_schema(&self) -> ConfigSchema {
        FeishuConfig::schema()
    }

    fn validate_config(&self, config: &ChannelConfig) -> Vec<String> {
        match config.parse::<FeishuConfig>() {
            Ok(parsed) => {
                let mut issues = Vec::new();
                if parsed.request_timeout_secs == 0 {
                    issues.push("request_timeout_secs must be greater than zero".to_string());
                }
                if let Some(url) = &parsed.base_url
                    && !(url.starts_with("http://") || url.starts_with("https://"))
                {
                    issues.push(format!("base_url must be an http(s) URL, got '{url}'"));
                }
                issues
            }
            Err(e) => vec![e.to_string()],
        }
    }

    async fn start(&self, ctx: ChannelContext, config: &ChannelConfig) -> ChannelResult<()> {
        let mut running = self.running.lock().await;
        if let Some(stale) = running.take() {
            warn!(channel = CHANNEL_ID, "Releasing a run that was never stopped");
            stale.shutdown().await;
        }

        let config = self.parse_config(config)?;
        let api = Arc::new(FeishuApiClient::new(&config)?);

        let bot = api.bot_info().await?;
        let bot_open_id = Some(bot.open_id.clone()).filter(|id| !id.is_empty());
        info!(
            channel = CHANNEL_ID,
            app_id = %config.app_id,
            bot = %bot.app_name,
            domain = ?config.domain,
            "Starting Feishu long connection"
        );

        let connection = LongConnection::new(
            api.clone(),
            ConnectionOptions {
                backoff: self.backoff.clone(),
                connect_timeout: config.request_timeout(),
                ping_interval: config.ping_interval(),
                ..Default::default()
            },
        );
        let events = connection.start().await?;
        let pump = tokio::spawn(pump(ctx, bot_open_id, events));
        *running = Some(Running { api, connection, pump });
        Ok(())
    }

    async fn stop(&self) -> ChannelResult<()> {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            running.shutdown().await;
        }
        Ok(())
    }

    async fn send(&self, target: &str, content: &OutboundContent, options: &SendOptions) -> ApiResult<Option<String>> {
        let target = ReceiveTarget::parse(target)?;
        let api = match self.running.lock().await.as_ref() {
            Some(running) => running.api.clone(),
            None => return Err(ApiError::Unsupported("driver is not running".into())),
        };
        api.send(&target, content, options).await
    }
}
