//! Tunables for the whole stack. Every field has a default so a partial TOML table deserializes.

use std::time::Duration;

use serde::Deserialize;

use crate::chunk::{Watermarks, DEFAULT_CHUNK_SIZE, DEFAULT_HIGH_WATER};
use crate::protocol::IceConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// STUN/TURN URLs handed to the direct transport.
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<String>,
    /// Max bytes per data-channel chunk (default 32 KiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Buffered bytes above which sending pauses (default 8 MiB).
    #[serde(default = "default_high_water")]
    pub high_water_mark: usize,
    /// Buffered bytes below which sending resumes (default: half of high).
    #[serde(default)]
    pub low_water_mark: Option<usize>,
    /// Debounce for non-immediate signals, milliseconds (default 16).
    #[serde(default = "default_signal_batch_ms")]
    pub signal_batch_ms: u64,
    /// Queued signals above which the batch flushes early (default 10).
    #[serde(default = "default_signal_batch_threshold")]
    pub signal_batch_threshold: usize,
    /// Replication batch window, milliseconds (default 50).
    #[serde(default = "default_sync_delay_ms")]
    pub sync_delay_ms: u64,
    /// Request timeout, seconds; 0 waits forever (default 30).
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
    /// Relay keepalive interval, seconds (default 60).
    #[serde(default = "default_keepalive_secs")]
    pub relay_keepalive_secs: u64,
    /// Delay before reconnecting a dropped relay, seconds (default 30).
    #[serde(default = "default_reconnect_secs")]
    pub relay_reconnect_secs: u64,
}

fn default_ice_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun.cloudflare.com:3478".to_string(),
    ]
}
fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_high_water() -> usize {
    DEFAULT_HIGH_WATER
}
fn default_signal_batch_ms() -> u64 {
    16
}
fn default_signal_batch_threshold() -> usize {
    10
}
fn default_sync_delay_ms() -> u64 {
    50
}
fn default_rpc_timeout_secs() -> u64 {
    30
}
fn default_keepalive_secs() -> u64 {
    60
}
fn default_reconnect_secs() -> u64 {
    30
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            chunk_size: default_chunk_size(),
            high_water_mark: default_high_water(),
            low_water_mark: None,
            signal_batch_ms: default_signal_batch_ms(),
            signal_batch_threshold: default_signal_batch_threshold(),
            sync_delay_ms: default_sync_delay_ms(),
            rpc_timeout_secs: default_rpc_timeout_secs(),
            relay_keepalive_secs: default_keepalive_secs(),
            relay_reconnect_secs: default_reconnect_secs(),
        }
    }
}

impl Config {
    pub fn ice_config(&self) -> IceConfig {
        IceConfig::from_urls(&self.ice_servers)
    }

    pub fn watermarks(&self) -> Watermarks {
        match self.low_water_mark {
            Some(low) => Watermarks::with_low(self.high_water_mark, low),
            None => Watermarks::new(self.high_water_mark),
        }
    }

    pub fn signal_batch_delay(&self) -> Duration {
        Duration::from_millis(self.signal_batch_ms)
    }

    pub fn sync_delay(&self) -> Duration {
        Duration::from_millis(self.sync_delay_ms)
    }

    /// `None` when timeouts are disabled.
    pub fn rpc_timeout(&self) -> Option<Duration> {
        (self.rpc_timeout_secs > 0).then(|| Duration::from_secs(self.rpc_timeout_secs))
    }

    pub fn relay_keepalive(&self) -> Duration {
        Duration::from_secs(self.relay_keepalive_secs)
    }

    pub fn relay_reconnect(&self) -> Duration {
        Duration::from_secs(self.relay_reconnect_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = Config::default();
        assert_eq!(c.chunk_size, 32 * 1024);
        assert_eq!(c.watermarks().high, 8 * 1024 * 1024);
        assert_eq!(c.watermarks().low, 4 * 1024 * 1024);
        assert_eq!(c.signal_batch_delay(), Duration::from_millis(16));
        assert_eq!(c.rpc_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(c.ice_config().ice_servers.len(), 2);
    }

    #[test]
    fn zero_timeout_disables() {
        let c = Config {
            rpc_timeout_secs: 0,
            ..Config::default()
        };
        assert_eq!(c.rpc_timeout(), None);
    }

    #[test]
    fn explicit_low_water_mark() {
        let c = Config {
            high_water_mark: 1000,
            low_water_mark: Some(100),
            ..Config::default()
        };
        assert_eq!(c.watermarks().low, 100);
    }
}
