//! Durable-store collaborator.
//!
//! The node records its activity into five retention-bounded tables:
//! messages, peers, routing cache, forward queue, statistics. This
//! implementation keeps them in memory behind async locks; a deployment
//! that needs persistence across restarts swaps in a database-backed store
//! with the same operations.

use std::collections::VecDeque;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::peers::PeerStatus;
use crate::protocol::{PacketKind, PeerId};
use crate::queue::QueueEntry;

/// Messages are kept 30 days, peers 7 days after last contact,
/// statistics 90 days.
pub const MESSAGE_RETENTION_DAYS: i64 = 30;
pub const PEER_RETENTION_DAYS: i64 = 7;
pub const STATISTIC_RETENTION_DAYS: i64 = 90;

/// Hard cap on the message table so a chatty mesh cannot exhaust memory.
const MAX_MESSAGES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub kind: PacketKind,
    /// Counterpart node: originator for received messages, recipient hex
    /// (or "broadcast") for sent ones.
    pub peer: String,
    pub content: Option<String>,
    pub hops: u8,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub status: DeliveryStatus,
    /// Whether the upstream bridge has synced this row.
    pub synced: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPeer {
    pub id: PeerId,
    pub rssi: i16,
    pub last_seen: DateTime<Utc>,
    pub status: PeerStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingAction {
    Delivered,
    Relayed,
    Dropped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingCacheRow {
    pub digest: String,
    pub action: RoutingAction,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedRow {
    pub id: Uuid,
    pub bytes: Vec<u8>,
    pub retry_count: u32,
    pub next_attempt: DateTime<Utc>,
    pub priority: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatRow {
    pub kind: String,
    pub value: f64,
    pub at: DateTime<Utc>,
    pub metadata: Value,
}

#[derive(Default)]
pub struct MeshStore {
    messages: RwLock<VecDeque<StoredMessage>>,
    peers: RwLock<Vec<StoredPeer>>,
    routing: RwLock<Vec<RoutingCacheRow>>,
    forward_queue: RwLock<Vec<QueuedRow>>,
    statistics: RwLock<Vec<StatRow>>,
}

impl MeshStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_message(&self, message: StoredMessage) {
        let mut messages = self.messages.write().await;
        if messages.iter().any(|m| m.id == message.id) {
            return;
        }
        messages.push_back(message);
        while messages.len() > MAX_MESSAGES {
            messages.pop_front();
        }
    }

    pub async fn update_message_status(&self, id: Uuid, status: DeliveryStatus) {
        let mut messages = self.messages.write().await;
        if let Some(message) = messages.iter_mut().find(|m| m.id == id) {
            message.status = status;
            if status == DeliveryStatus::Delivered {
                message.delivered_at = Some(Utc::now());
            }
        }
    }

    pub async fn messages(&self, limit: usize) -> Vec<StoredMessage> {
        let messages = self.messages.read().await;
        messages.iter().rev().take(limit).cloned().collect()
    }

    pub async fn record_peer_sighting(&self, id: PeerId, rssi: i16, status: PeerStatus) {
        let mut peers = self.peers.write().await;
        match peers.iter_mut().find(|p| p.id == id) {
            Some(row) => {
                row.rssi = rssi;
                row.status = status;
                row.last_seen = Utc::now();
            }
            None => peers.push(StoredPeer {
                id,
                rssi,
                last_seen: Utc::now(),
                status,
            }),
        }
    }

    pub async fn record_routing_action(&self, digest: &str, action: RoutingAction) {
        let mut routing = self.routing.write().await;
        let now = Utc::now();
        match routing.iter_mut().find(|r| r.digest == digest) {
            Some(row) => {
                row.action = action;
                row.last_seen = now;
            }
            None => routing.push(RoutingCacheRow {
                digest: digest.to_string(),
                action,
                first_seen: now,
                last_seen: now,
            }),
        }
    }

    /// Mirror the live forward queue; called after every drain/sweep pass.
    pub async fn sync_forward_queue(&self, entries: &[QueueEntry]) {
        let rows = entries
            .iter()
            .map(|e| QueuedRow {
                id: e.message_id,
                bytes: e.bytes.clone(),
                retry_count: e.attempts,
                next_attempt: DateTime::<Utc>::from(e.next_attempt),
                priority: e.priority,
            })
            .collect();
        *self.forward_queue.write().await = rows;
    }

    pub async fn record_stat(&self, kind: &str, value: f64, metadata: Value) {
        self.statistics.write().await.push(StatRow {
            kind: kind.to_string(),
            value,
            at: Utc::now(),
            metadata,
        });
    }

    /// Apply the retention policy to every table.
    pub async fn prune(&self) {
        let now = Utc::now();

        let message_cutoff = now - ChronoDuration::days(MESSAGE_RETENTION_DAYS);
        self.messages
            .write()
            .await
            .retain(|m| m.created_at >= message_cutoff);

        let peer_cutoff = now - ChronoDuration::days(PEER_RETENTION_DAYS);
        self.peers.write().await.retain(|p| p.last_seen >= peer_cutoff);
        self.routing
            .write()
            .await
            .retain(|r| r.last_seen >= peer_cutoff);

        let stat_cutoff = now - ChronoDuration::days(STATISTIC_RETENTION_DAYS);
        self.statistics.write().await.retain(|s| s.at >= stat_cutoff);
    }

    pub async fn snapshot(&self) -> Value {
        json!({
            "messages": self.messages.read().await.len(),
            "peers": self.peers.read().await.len(),
            "routing_cache": self.routing.read().await.len(),
            "forward_queue": self.forward_queue.read().await.len(),
            "statistics": self.statistics.read().await.len(),
        })
    }
}
