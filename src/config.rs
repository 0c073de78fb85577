//! Node configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::PeerId;

/// Default pre-shared network key. Deployments are expected to override
/// this; it is exactly 16 bytes so it maps onto the cipher key unchanged.
pub const DEFAULT_NETWORK_KEY: &[u8; 16] = b"DisasterMeshNet!";

/// Radio duty cycle for scanning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanMode {
    /// Continuous scanning; drains the battery fastest.
    Aggressive,
    Balanced,
    /// Long idle windows between scans.
    Conservative,
}

impl ScanMode {
    /// How often the scan is restarted (some radio stacks silently stop
    /// reporting advertisements on long-running scans).
    pub fn restart_interval(self) -> Duration {
        match self {
            ScanMode::Aggressive => Duration::from_secs(10),
            ScanMode::Balanced => Duration::from_secs(30),
            ScanMode::Conservative => Duration::from_secs(60),
        }
    }
}

/// Every tunable the node honors, with the network defaults.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Pre-shared symmetric key; truncated or zero-padded to 16 bytes.
    pub network_key: Vec<u8>,
    /// Node identifier. `None` generates a random id at start.
    pub self_id: Option<PeerId>,
    /// Display name carried in the discovery advertisement.
    pub display_name: String,
    /// Hop budget for originated messages.
    pub initial_ttl: u8,
    /// Interval between outgoing advertisements.
    pub advertise_period: Duration,
    pub scan_mode: ScanMode,
    /// Duplicate cache capacity.
    pub dedup_capacity: usize,
    /// Duplicate cache entry lifetime.
    pub dedup_ttl: Duration,
    /// Replay-guard window around the local clock.
    pub timestamp_tolerance: Duration,
    /// How long an unseen peer stays in the table.
    pub peer_liveness_window: Duration,
    /// Store-and-forward retry cadence.
    pub queue_retry_interval: Duration,
    /// Store-and-forward attempt ceiling.
    pub queue_max_attempts: u32,
    /// Store-and-forward total lifetime per datagram.
    pub queue_message_expiry: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            network_key: DEFAULT_NETWORK_KEY.to_vec(),
            self_id: None,
            display_name: String::from("mesh-node"),
            initial_ttl: 5,
            advertise_period: Duration::from_millis(1000),
            scan_mode: ScanMode::Balanced,
            dedup_capacity: 500,
            dedup_ttl: Duration::from_millis(300_000),
            timestamp_tolerance: Duration::from_millis(300_000),
            peer_liveness_window: Duration::from_millis(30_000),
            queue_retry_interval: Duration::from_millis(30_000),
            queue_max_attempts: 20,
            queue_message_expiry: Duration::from_millis(3_600_000),
        }
    }
}

impl MeshConfig {
    /// Configuration with a fixed id, as used by tests and simulations.
    pub fn with_id(id: PeerId) -> Self {
        Self {
            self_id: Some(id),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_network_parameters() {
        let config = MeshConfig::default();
        assert_eq!(config.initial_ttl, 5);
        assert_eq!(config.dedup_capacity, 500);
        assert_eq!(config.dedup_ttl, Duration::from_secs(300));
        assert_eq!(config.timestamp_tolerance, Duration::from_secs(300));
        assert_eq!(config.peer_liveness_window, Duration::from_secs(30));
        assert_eq!(config.queue_retry_interval, Duration::from_secs(30));
        assert_eq!(config.queue_max_attempts, 20);
        assert_eq!(config.queue_message_expiry, Duration::from_secs(3600));
        assert_eq!(config.network_key.len(), 16);
    }
}
