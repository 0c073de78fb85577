//! Routing counters.
//!
//! Every silent drop increments a reason-specific counter so field debugging
//! can tell a checksum storm from a replay attempt without a packet capture.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Value};

use super::engine::DropReason;

#[derive(Default)]
pub struct RoutingMetrics {
    ingested: AtomicU64,
    delivered: AtomicU64,
    relayed: AtomicU64,
    acks_emitted: AtomicU64,
    originated: AtomicU64,

    drop_malformed: AtomicU64,
    drop_bad_checksum: AtomicU64,
    drop_stale_timestamp: AtomicU64,
    drop_duplicate: AtomicU64,
    drop_decrypt_failed: AtomicU64,
    drop_malformed_record: AtomicU64,
    drop_ttl_exhausted: AtomicU64,
    drop_not_for_us: AtomicU64,
}

impl RoutingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_ingest(&self) {
        self.ingested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relay(&self) {
        self.relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ack_emitted(&self) {
        self.acks_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_originated(&self) {
        self.originated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::Malformed => &self.drop_malformed,
            DropReason::BadChecksum => &self.drop_bad_checksum,
            DropReason::StaleTimestamp => &self.drop_stale_timestamp,
            DropReason::Duplicate => &self.drop_duplicate,
            DropReason::DecryptFailed => &self.drop_decrypt_failed,
            DropReason::MalformedRecord => &self.drop_malformed_record,
            DropReason::TtlExhausted => &self.drop_ttl_exhausted,
            DropReason::NotForUs => &self.drop_not_for_us,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn relayed(&self) -> u64 {
        self.relayed.load(Ordering::Relaxed)
    }

    pub fn drops_for(&self, reason: DropReason) -> u64 {
        match reason {
            DropReason::Malformed => self.drop_malformed.load(Ordering::Relaxed),
            DropReason::BadChecksum => self.drop_bad_checksum.load(Ordering::Relaxed),
            DropReason::StaleTimestamp => self.drop_stale_timestamp.load(Ordering::Relaxed),
            DropReason::Duplicate => self.drop_duplicate.load(Ordering::Relaxed),
            DropReason::DecryptFailed => self.drop_decrypt_failed.load(Ordering::Relaxed),
            DropReason::MalformedRecord => self.drop_malformed_record.load(Ordering::Relaxed),
            DropReason::TtlExhausted => self.drop_ttl_exhausted.load(Ordering::Relaxed),
            DropReason::NotForUs => self.drop_not_for_us.load(Ordering::Relaxed),
        }
    }

    /// JSON snapshot for statistics endpoints.
    pub fn snapshot(&self) -> Value {
        json!({
            "ingested": self.ingested.load(Ordering::Relaxed),
            "delivered": self.delivered.load(Ordering::Relaxed),
            "relayed": self.relayed.load(Ordering::Relaxed),
            "acks_emitted": self.acks_emitted.load(Ordering::Relaxed),
            "originated": self.originated.load(Ordering::Relaxed),
            "drops": {
                "malformed": self.drop_malformed.load(Ordering::Relaxed),
                "bad_checksum": self.drop_bad_checksum.load(Ordering::Relaxed),
                "stale_timestamp": self.drop_stale_timestamp.load(Ordering::Relaxed),
                "duplicate": self.drop_duplicate.load(Ordering::Relaxed),
                "decrypt_failed": self.drop_decrypt_failed.load(Ordering::Relaxed),
                "malformed_record": self.drop_malformed_record.load(Ordering::Relaxed),
                "ttl_exhausted": self.drop_ttl_exhausted.load(Ordering::Relaxed),
                "not_for_us": self.drop_not_for_us.load(Ordering::Relaxed),
            },
        })
    }
}
