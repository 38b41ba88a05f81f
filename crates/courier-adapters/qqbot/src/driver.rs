//! QQ Bot channel driver.
//!
//! Each run builds a [`QqApiClient`] and a fresh [`GatewayClient`], then
//! spawns a pump task that turns gateway events into status updates and
//! inbound messages on the run's [`ChannelContext`].

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

use crate::api::{QqApiClient, Target};
use crate::config::QqBotConfig;
use crate::gateway::{GatewayClient, GatewayEvent, GatewayOptions};

/// Channel id of the QQ Bot adapter.
pub const CHANNEL_ID: &str = "qqbot";

struct Running {
    api: Arc<QqApiClient>,
    gateway: GatewayClient,
    pump: JoinHandle<()>,
}

impl Running {
    async fn shutdown(self) {
        self.gateway.stop().await;
        // A handler stopping its own channel runs on the pump; joining it
        // would wait forever. The context is already inert, so let it drain.
        if tokio::task::try_id() == Some(self.pump.id()) {
            debug!(channel = CHANNEL_ID, "Stopped from the event pump");
            return;
        }
        // The gateway dropped its sender, so the pump drains and exits.
        if let Err(e) = self.pump.await {
            warn!(channel = CHANNEL_ID, error = %e, "Event pump panicked");
        }
    }
}

/// QQ Bot implementation of [`ChannelDriver`].
pub struct QqBotDriver {
    meta: ChannelMeta,
    backoff: BackoffSchedule,
    running: Mutex<Option<Running>>,
}

impl Default for QqBotDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl QqBotDriver {
    /// Creates a driver with the default reconnect schedule.
    pub fn new() -> Self {
        Self {
            meta: ChannelMeta::new(
                CHANNEL_ID,
                "QQ Bot",
                "QQ open platform bot (guilds, groups, C2C)",
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

    fn parse_config(&self, config: &ChannelConfig) -> ChannelResult<QqBotConfig> {
        config
            .parse()
            .map_err(|e| ConfigValidationError::new(CHANNEL_ID, vec![e.to_string()]).into())
    }
}

async fn pump(ctx: ChannelContext, mut events: mpsc::Receiver<GatewayEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            GatewayEvent::Ready { session_id, username } => {
                debug!(channel = %ctx.channel(), %session_id, ?username, "Connected");
                ctx.set_connected(true);
            }
            GatewayEvent::Resumed => ctx.set_connected(true),
            GatewayEvent::Message(message) => {
                let inbound = message.into_inbound(ctx.channel());
                ctx.dispatch(inbound).await;
            }
            GatewayEvent::Disconnected { reason, .. } => {
                ctx.set_connected(false);
                ctx.record_error(reason);
            }
            GatewayEvent::Error(error) => ctx.record_error(error),
        }
    }
    if ctx.is_current() {
        warn!(channel = %ctx.channel(), "Gateway event stream ended unexpectedly");
        ctx.set_connected(false);
        ctx.record_error("gateway task ended");
    }
    debug!(channel = %ctx.channel(), "Event pump finished");
}

#[async_trait]
impl ChannelDriver for QqBotDriver {
    fn meta(&self) -> &ChannelMeta {
        &self.meta
    }

    fn config_schema(&self) -> ConfigSchema {
        QqBotConfig::schema()
    }

    fn validate_config(&self, config: &ChannelConfig) -> Vec<String> {
        match config.parse::<QqBotConfig>() {
            Ok(parsed) if parsed.request_timeout_secs == 0 => {
                vec!["request_timeout_secs must be greater than zero".into()]
            }
            Ok(_) => Vec::new(),
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
        let api = Arc::new(QqApiClient::new(&config)?);
        let gateway = GatewayClient::new(
            api.clone(),
            GatewayOptions {
                intents: config.intents(),
                backoff: self.backoff.clone(),
                handshake_timeout: config.handshake_timeout(),
                ..Default::default()
            },
        );

        info!(channel = CHANNEL_ID, app_id = %config.app_id, sandbox = config.sandbox, "Starting QQ gateway");
        let events = gateway.start().await?;
        let pump = tokio::spawn(pump(ctx, events));
        *running = Some(Running { api, gateway, pump });
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
        let target = Target::parse(target)?;
        let api = match self.running.lock().await.as_ref() {
            Some(running) => running.api.clone(),
            None => return Err(ApiError::Unsupported("driver is not running".into())),
        };
        api.send(&target, content, options).await
    }
}
