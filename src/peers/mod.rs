//! Peer table: live neighbors discovered through radio advertisements.

use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::protocol::PeerId;

/// Node status byte carried in the discovery advertisement. Surfaced to
/// observers; routing does not act on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PeerStatus {
    Active = 0x01,
    LowBattery = 0x02,
    HighLoad = 0x03,
}

impl PeerStatus {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(Self::Active),
            0x02 => Some(Self::LowBattery),
            0x03 => Some(Self::HighLoad),
            _ => None,
        }
    }
}

/// One live neighbor. Created on first advertisement, refreshed on every
/// sighting, evicted when unseen past the liveness window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: PeerId,
    pub name: String,
    /// Latest signal strength in dBm, last-write-wins.
    pub rssi: i16,
    pub first_seen: SystemTime,
    pub last_seen: SystemTime,
    pub status: PeerStatus,
    pub protocol_version: u8,
}

pub struct PeerTable {
    peers: DashMap<PeerId, PeerRecord>,
    liveness_window: Duration,
}

impl PeerTable {
    pub fn new(liveness_window: Duration) -> Self {
        Self {
            peers: DashMap::new(),
            liveness_window,
        }
    }

    /// Upsert a sighting. Returns `true` when the peer is newly discovered,
    /// so callers can emit the discovery event exactly once per edge
    /// transition.
    pub fn observe(
        &self,
        id: PeerId,
        name: &str,
        rssi: i16,
        status: PeerStatus,
        protocol_version: u8,
        now: SystemTime,
    ) -> bool {
        match self.peers.get_mut(&id) {
            Some(mut record) => {
                record.name = name.to_string();
                record.rssi = rssi;
                record.status = status;
                record.protocol_version = protocol_version;
                record.last_seen = now;
                false
            }
            None => {
                self.peers.insert(
                    id,
                    PeerRecord {
                        id,
                        name: name.to_string(),
                        rssi,
                        first_seen: now,
                        last_seen: now,
                        status,
                        protocol_version,
                    },
                );
                true
            }
        }
    }

    /// All live peers, ordered by id for a stable listing.
    pub fn list(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<_> = self.peers.iter().map(|e| e.value().clone()).collect();
        peers.sort_by_key(|p| p.id);
        peers
    }

    pub fn find(&self, id: PeerId) -> Option<PeerRecord> {
        self.peers.get(&id).map(|e| e.value().clone())
    }

    pub fn forget(&self, id: PeerId) -> Option<PeerRecord> {
        self.peers.remove(&id).map(|(_, record)| record)
    }

    /// Evict peers unseen past the liveness window; returns the evicted set
    /// so loss events fire once per transition.
    pub fn sweep(&self, now: SystemTime) -> Vec<PeerRecord> {
        let window = self.liveness_window;
        let stale: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|e| {
                now.duration_since(e.value().last_seen)
                    .map(|age| age > window)
                    .unwrap_or(false)
            })
            .map(|e| *e.key())
            .collect();

        stale
            .into_iter()
            .filter_map(|id| self.peers.remove(&id).map(|(_, record)| record))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&self) {
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn table() -> PeerTable {
        PeerTable::new(Duration::from_secs(30))
    }

    const ID: [u8; 6] = [1, 2, 3, 4, 5, 6];

    #[test]
    fn first_observation_is_a_discovery() {
        let table = table();
        let id = PeerId::new(ID);
        assert!(table.observe(id, "anya", -60, PeerStatus::Active, 1, at(0)));
        assert!(!table.observe(id, "anya", -55, PeerStatus::Active, 1, at(5)));

        let record = table.find(id).unwrap();
        assert_eq!(record.rssi, -55);
        assert_eq!(record.first_seen, at(0));
        assert_eq!(record.last_seen, at(5));
    }

    #[test]
    fn sweep_evicts_only_stale_peers() {
        let table = table();
        let old = PeerId::new([1; 6]);
        let fresh = PeerId::new([2; 6]);
        table.observe(old, "old", -70, PeerStatus::Active, 1, at(0));
        table.observe(fresh, "fresh", -70, PeerStatus::Active, 1, at(25));

        let evicted = table.sweep(at(31));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, old);
        assert!(table.find(old).is_none());
        assert!(table.find(fresh).is_some());
    }

    #[test]
    fn peer_seen_exactly_at_window_survives() {
        let table = table();
        let id = PeerId::new(ID);
        table.observe(id, "edge", -70, PeerStatus::Active, 1, at(0));
        assert!(table.sweep(at(30)).is_empty());
    }

    #[test]
    fn reappearing_peer_is_discovered_again() {
        let table = table();
        let id = PeerId::new(ID);
        assert!(table.observe(id, "gone", -70, PeerStatus::LowBattery, 1, at(0)));
        table.sweep(at(60));
        assert!(table.observe(id, "back", -70, PeerStatus::Active, 1, at(61)));
    }

    #[test]
    fn listing_is_ordered_by_id() {
        let table = table();
        table.observe(PeerId::new([9; 6]), "z", -70, PeerStatus::Active, 1, at(0));
        table.observe(PeerId::new([1; 6]), "a", -70, PeerStatus::Active, 1, at(0));
        let ids: Vec<_> = table.list().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![PeerId::new([1; 6]), PeerId::new([9; 6])]);
    }
}
