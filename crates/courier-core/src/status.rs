//! Channel identity and runtime status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable identity of a channel implementation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMeta {
    /// Unique channel id (also the config key).
    pub id: String,
    /// Name shown to humans.
    pub display_name: String,
    /// One-line description.
    pub description: String,
    /// Implementation version.
    pub version: String,
}

impl ChannelMeta {
    /// Creates channel metadata.
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        description: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            description: description.into(),
            version: version.into(),
        }
    }
}

/// Inbound and outbound message counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCounts {
    /// Messages delivered to subscribers.
    pub inbound: u64,
    /// Messages accepted by the platform.
    pub outbound: u64,
}

/// Runtime status of a channel.
///
/// Always handed out as a copy; the owning channel is the only writer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatus {
    /// `start` succeeded and `stop` has not been called since.
    pub running: bool,
    /// A realtime connection is established and ready.
    pub connected: bool,
    /// Last time the channel became connected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Most recent fatal or reconnect-triggering condition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Message counters.
    pub message_counts: MessageCounts,
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match (self.running, self.connected) {
            (true, true) => "connected",
            (true, false) => "reconnecting",
            (false, _) => "stopped",
        };
        write!(
            f,
            "{} (in: {}, out: {})",
            state, self.message_counts.inbound, self.message_counts.outbound
        )
    }
}
