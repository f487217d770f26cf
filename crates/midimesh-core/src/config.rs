//! Runtime configuration for a mesh node.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use midimesh_net::{ReliableConfig, ReorderConfig, UdpConfig};

/// Persisted settings for the transports and the rule store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// UDP port for the real-time transport; 0 lets the OS pick.
    pub udp_port: u16,
    /// Real-time ring capacity; rounded up to a power of two.
    pub ring_capacity: usize,
    /// Base ACK timeout for the reliable path, in milliseconds.
    pub reliable_timeout_ms: u64,
    /// Retries before a reliable send fails.
    pub reliable_max_retries: u32,
    /// Additional wait per retry already taken, in milliseconds.
    pub reliable_retry_backoff_ms: u64,
    /// Sequence gap beyond which preceding packets count as lost.
    pub reorder_max_gap: u16,
    /// Age forcing a buffered packet past the gap, in milliseconds.
    pub reorder_timeout_ms: u64,
    /// Deliver duplicate sequences instead of dropping them.
    pub allow_duplicates: bool,
    /// Apply in-order delivery to the reliable receive path.
    pub ordered_delivery: bool,
    /// Where forwarding rules are persisted; `None` disables persistence.
    pub rules_path: Option<PathBuf>,
}

impl Default for MeshConfig {
    fn default() -> Self {
        MeshConfig {
            udp_port: 0,
            ring_capacity: midimesh_rt::DEFAULT_RING_CAPACITY,
            reliable_timeout_ms: 100,
            reliable_max_retries: 3,
            reliable_retry_backoff_ms: 50,
            reorder_max_gap: 64,
            reorder_timeout_ms: 200,
            allow_duplicates: false,
            ordered_delivery: true,
            rules_path: None,
        }
    }
}

impl MeshConfig {
    /// Transport config for the UDP worker.
    pub fn udp_config(&self) -> UdpConfig {
        UdpConfig {
            bind_port: self.udp_port,
            ..UdpConfig::default()
        }
    }

    /// Config for the reliable layer.
    pub fn reliable_config(&self) -> ReliableConfig {
        ReliableConfig {
            timeout_ms: self.reliable_timeout_ms,
            max_retries: self.reliable_max_retries,
            retry_backoff_ms: self.reliable_retry_backoff_ms,
            ..ReliableConfig::default()
        }
    }

    /// Config for receive-side reordering.
    pub fn reorder_config(&self) -> ReorderConfig {
        ReorderConfig {
            max_sequence_gap: self.reorder_max_gap,
            delivery_timeout: Duration::from_millis(self.reorder_timeout_ms),
            allow_duplicates: self.allow_duplicates,
            ..ReorderConfig::default()
        }
    }
}

fn settings_path() -> Option<PathBuf> {
    let mut base = dirs::config_dir()?;
    base.push("MidiMesh");
    if !base.exists() {
        let _ = fs::create_dir_all(&base);
    }
    base.push("mesh.json");
    Some(base)
}

/// Load settings from disk. Returns defaults if loading fails.
pub fn load() -> MeshConfig {
    let Some(path) = settings_path() else {
        return MeshConfig::default();
    };
    match fs::read_to_string(&path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
        Err(_) => MeshConfig::default(),
    }
}

/// Save settings to disk.
pub fn save(config: &MeshConfig) {
    let Some(path) = settings_path() else {
        return;
    };
    if let Ok(json) = serde_json::to_string_pretty(config) {
        if let Err(err) = fs::write(&path, json) {
            tracing::warn!(?err, "failed to write mesh settings");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_protocol_constants() {
        let config = MeshConfig::default();
        assert_eq!(config.reliable_timeout_ms, 100);
        assert_eq!(config.reliable_max_retries, 3);
        assert_eq!(config.reliable_retry_backoff_ms, 50);
        assert_eq!(config.ring_capacity, 2048);
        assert!(config.ordered_delivery);
    }

    #[test]
    fn json_roundtrip() {
        let mut config = MeshConfig::default();
        config.udp_port = 5104;
        config.rules_path = Some(PathBuf::from("/tmp/rules.json"));
        let json = serde_json::to_string(&config).unwrap();
        let restored: MeshConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.udp_port, 5104);
        assert_eq!(restored.rules_path, Some(PathBuf::from("/tmp/rules.json")));
    }

    #[test]
    fn conversions_carry_the_tuning() {
        let mut config = MeshConfig::default();
        config.reorder_max_gap = 8;
        config.reorder_timeout_ms = 50;
        let reorder = config.reorder_config();
        assert_eq!(reorder.max_sequence_gap, 8);
        assert_eq!(reorder.delivery_timeout, Duration::from_millis(50));
    }
}
