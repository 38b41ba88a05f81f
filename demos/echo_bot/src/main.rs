//! Echo Bot
//!
//! Connects every channel configured in `courier.toml` and answers each
//! inbound message in the conversation it came from.
//!
//! # Commands
//!
//! | Input | Reply |
//! |-------|-------|
//! | `/ping` | `Pong!` |
//! | `/status` | channel status as JSON |
//! | anything else | the same text, prefixed with `--prefix` |
//!
//! # Usage
//!
//! ```bash
//! cargo run --package echo-bot -- --config courier.toml --profile development
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use courier::prelude::*;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "echo-bot", about = "Echo inbound messages back on every channel")]
struct Cli {
    /// Config file; `courier.toml` in the working directory by default.
    #[arg(short, long, env = "COURIER_CONFIG")]
    config: Option<PathBuf>,

    /// Config profile, layered over the base file.
    #[arg(short, long, env = "COURIER_PROFILE")]
    profile: Option<String>,

    /// Text put in front of every echoed message.
    #[arg(long, default_value = "")]
    prefix: String,
}

fn reply_for(text: &str, prefix: &str, manager: &ChannelManager) -> Option<String> {
    match text.trim() {
        "" => None,
        "/ping" => Some("Pong!".to_string()),
        "/status" => serde_json::to_string_pretty(&manager.status_json()).ok(),
        other => Some(format!("{prefix}{other}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut builder = CourierRuntime::builder();
    if let Some(path) = &cli.config {
        builder = builder.config_file(path);
    }
    if let Some(profile) = &cli.profile {
        builder = builder.profile(profile);
    }
    let runtime = builder.build().context("Failed to load configuration")?;

    runtime.register_adapter(qqbot_channel());
    runtime.register_adapter(feishu_channel());

    let manager = Arc::clone(runtime.manager());
    let prefix = Arc::new(cli.prefix);
    runtime.on_message(handler_fn(move |msg: InboundMessage| {
        let manager = Arc::clone(&manager);
        let prefix = Arc::clone(&prefix);
        async move {
            info!(
                channel = %msg.channel,
                chat = %msg.chat_id,
                sender = %msg.sender_id,
                "{}",
                msg.text()
            );

            let Some(reply) = reply_for(msg.text(), &prefix, &manager) else {
                return Ok(());
            };
            let result = manager
                .send_message(
                    &msg.channel,
                    &msg.chat_id,
                    &OutboundContent::text(reply),
                    &SendOptions::reply_to(&msg.id),
                )
                .await;
            if !result.success {
                warn!(channel = %msg.channel, error = ?result.error, "Failed to send echo reply");
            }
            Ok(())
        }
    }));

    runtime.run().await?;
    Ok(())
}
