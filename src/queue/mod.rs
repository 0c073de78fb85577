//! Store-and-forward queue.
//!
//! Outbound datagrams that find no reachable peer wait here and are retried
//! on a fixed cadence. Entries carry the full encoded datagram so the
//! routing decisions made at origination are preserved exactly. An entry
//! dies when it is handed back for transmission, when its attempt counter
//! reaches the ceiling, or when the datagram itself outlives the expiry.

use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use uuid::Uuid;

/// A buffered datagram plus its retry bookkeeping.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub message_id: Uuid,
    /// Complete wire image, ready for broadcast.
    pub bytes: Vec<u8>,
    /// The originator's wall clock, for expiry accounting.
    pub originated_at: SystemTime,
    pub priority: u8,
    /// Whether the embedder is owed a `MessageSent` callback for this entry.
    pub notify: bool,
    pub attempts: u32,
    pub next_attempt: SystemTime,
}

pub struct ForwardQueue {
    entries: Mutex<Vec<QueueEntry>>,
    retry_interval: Duration,
    max_attempts: u32,
    expiry: Duration,
}

impl ForwardQueue {
    pub fn new(retry_interval: Duration, max_attempts: u32, expiry: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            retry_interval,
            max_attempts,
            expiry,
        }
    }

    /// Buffer a datagram. Returns `false` when the datagram is already
    /// older than the expiry window and was rejected outright.
    pub fn enqueue(
        &self,
        message_id: Uuid,
        bytes: Vec<u8>,
        originated_at: SystemTime,
        priority: u8,
        notify: bool,
        now: SystemTime,
    ) -> bool {
        if self.is_expired(originated_at, now) {
            return false;
        }
        let entry = QueueEntry {
            message_id,
            bytes,
            originated_at,
            priority,
            notify,
            attempts: 0,
            next_attempt: now + self.retry_interval,
        };
        self.entries.lock().expect("forward queue poisoned").push(entry);
        true
    }

    /// Remove and return the entries due for a retry. Produces nothing when
    /// no peers are reachable; the deadline is left untouched so the next
    /// pass picks the entries up again.
    pub fn drain(&self, now: SystemTime, has_peers: bool) -> Vec<QueueEntry> {
        if !has_peers {
            return Vec::new();
        }
        let mut entries = self.entries.lock().expect("forward queue poisoned");
        let mut due = Vec::new();
        let mut i = 0;
        while i < entries.len() {
            if entries[i].next_attempt <= now {
                due.push(entries.remove(i));
            } else {
                i += 1;
            }
        }
        due
    }

    /// Put a drained-but-failed entry back with its counter bumped and the
    /// deadline pushed out by one retry interval.
    pub fn requeue(&self, mut entry: QueueEntry, now: SystemTime) {
        entry.attempts += 1;
        entry.next_attempt = now + self.retry_interval;
        self.entries.lock().expect("forward queue poisoned").push(entry);
    }

    /// Drop expired and over-retried entries; the caller owes each returned
    /// entry its failure callback.
    pub fn sweep(&self, now: SystemTime) -> Vec<QueueEntry> {
        let mut entries = self.entries.lock().expect("forward queue poisoned");
        let max_attempts = self.max_attempts;
        let mut discarded = Vec::new();
        let mut i = 0;
        while i < entries.len() {
            let dead = entries[i].attempts >= max_attempts
                || self.is_expired(entries[i].originated_at, now);
            if dead {
                discarded.push(entries.remove(i));
            } else {
                i += 1;
            }
        }
        discarded
    }

    /// Copy of the current entries, for mirroring into the durable store.
    pub fn snapshot(&self) -> Vec<QueueEntry> {
        self.entries.lock().expect("forward queue poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("forward queue poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().expect("forward queue poisoned").clear();
    }

    fn is_expired(&self, originated_at: SystemTime, now: SystemTime) -> bool {
        now.duration_since(originated_at)
            .map(|age| age > self.expiry)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn queue() -> ForwardQueue {
        ForwardQueue::new(Duration::from_secs(30), 20, Duration::from_secs(3600))
    }

    fn push(queue: &ForwardQueue, now: SystemTime) -> Uuid {
        let id = Uuid::new_v4();
        assert!(queue.enqueue(id, vec![1, 2, 3], now, 5, true, now));
        id
    }

    #[test]
    fn drain_without_peers_produces_nothing() {
        let queue = queue();
        push(&queue, at(0));
        assert!(queue.drain(at(1000), false).is_empty());
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn drain_respects_the_retry_deadline() {
        let queue = queue();
        let id = push(&queue, at(0));

        assert!(queue.drain(at(29), true).is_empty());
        let due = queue.drain(at(30), true);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].message_id, id);
        assert!(queue.is_empty());
    }

    #[test]
    fn requeue_bumps_attempts_and_deadline() {
        let queue = queue();
        push(&queue, at(0));

        let entry = queue.drain(at(30), true).pop().unwrap();
        queue.requeue(entry, at(30));

        assert!(queue.drain(at(59), true).is_empty());
        let entry = queue.drain(at(60), true).pop().unwrap();
        assert_eq!(entry.attempts, 1);
    }

    #[test]
    fn sweep_discards_over_retried_entries() {
        let queue = queue();
        push(&queue, at(0));

        let mut now = at(0);
        for _ in 0..20 {
            now += Duration::from_secs(30);
            let entry = queue.drain(now, true).pop().unwrap();
            queue.requeue(entry, now);
        }
        let discarded = queue.sweep(now);
        assert_eq!(discarded.len(), 1);
        assert_eq!(discarded[0].attempts, 20);
        assert!(queue.is_empty());
    }

    #[test]
    fn sweep_discards_expired_entries() {
        let queue = queue();
        push(&queue, at(0));
        assert!(queue.sweep(at(3600)).is_empty());
        let discarded = queue.sweep(at(3601));
        assert_eq!(discarded.len(), 1);
    }

    #[test]
    fn enqueue_rejects_datagrams_past_expiry() {
        let queue = queue();
        assert!(!queue.enqueue(Uuid::new_v4(), vec![0], at(0), 5, true, at(3601)));
        assert!(queue.is_empty());
    }
}
