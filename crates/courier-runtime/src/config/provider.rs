//! Source of per-channel configuration.

use std::collections::{BTreeMap, HashMap};

use courier_core::ChannelConfig;

use super::schema::CourierConfig;

/// Supplies channel configuration to the
/// [`ChannelManager`](crate::manager::ChannelManager).
pub trait ConfigProvider: Send + Sync {
    /// Ids of every configured channel, enabled or not.
    fn channel_ids(&self) -> Vec<String>;

    /// Configuration of one channel.
    fn channel_config(&self, id: &str) -> Option<ChannelConfig>;
}

impl ConfigProvider for CourierConfig {
    fn channel_ids(&self) -> Vec<String> {
        self.channels.channel_ids()
    }

    fn channel_config(&self, id: &str) -> Option<ChannelConfig> {
        self.channels.channel_config(id)
    }
}

impl ConfigProvider for BTreeMap<String, ChannelConfig> {
    fn channel_ids(&self) -> Vec<String> {
        self.keys().cloned().collect()
    }

    fn channel_config(&self, id: &str) -> Option<ChannelConfig> {
        self.get(id).cloned()
    }
}

impl ConfigProvider for HashMap<String, ChannelConfig> {
    fn channel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn channel_config(&self, id: &str) -> Option<ChannelConfig> {
        self.get(id).cloned()
    }
}
