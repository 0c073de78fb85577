//! Routing engine: the per-datagram decision function.
//!
//! `ingest` is bounded-work and never blocks on I/O. Its only side effects
//! are the duplicate cache and the counters; the node controller dispatches
//! the resulting deliveries, relays and acknowledgments.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, trace};
use uuid::Uuid;

use crate::error::PacketError;
use crate::protocol::{
    InnerRecord, Location, MeshPacket, PacketKind, PayloadCipher, PeerId,
};

use super::dedup::DuplicateCache;
use super::metrics::RoutingMetrics;

/// Why a datagram was silently discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Header could not be parsed (truncation, bad version, unknown kind,
    /// impossible field combination).
    Malformed,
    BadChecksum,
    /// Outside the replay-guard window.
    StaleTimestamp,
    Duplicate,
    DecryptFailed,
    MalformedRecord,
    /// Would have been relayed, but its hop budget is spent.
    TtlExhausted,
    /// Addressed to someone else and not relayable.
    NotForUs,
}

/// Terminal outcome of one ingest pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Deliver,
    Relay,
    DeliverAndRelay,
    Drop(DropReason),
}

impl Decision {
    pub fn delivers(self) -> bool {
        matches!(self, Self::Deliver | Self::DeliverAndRelay)
    }

    pub fn relays(self) -> bool {
        matches!(self, Self::Relay | Self::DeliverAndRelay)
    }
}

/// Everything one ingest pass produced. `relay` and `ack` are fully encoded
/// datagrams ready for the outbound path.
#[derive(Debug)]
pub struct Ingest {
    pub decision: Decision,
    /// The decoded datagram, when the header survived parsing.
    pub packet: Option<MeshPacket>,
    /// The decrypted record, when delivery or relay happened.
    pub record: Option<InnerRecord>,
    /// Fresh relay copy: kind RELAY, hop+1, ttl−1, same id and sender.
    pub relay: Option<MeshPacket>,
    /// Acknowledgment for a direct message addressed to us.
    pub ack: Option<MeshPacket>,
}

impl Ingest {
    fn drop(reason: DropReason, packet: Option<MeshPacket>) -> Self {
        Self {
            decision: Decision::Drop(reason),
            packet,
            record: None,
            relay: None,
            ack: None,
        }
    }
}

pub struct RoutingEngine {
    local_id: PeerId,
    local_hex: String,
    cipher: PayloadCipher,
    dedup: Arc<DuplicateCache>,
    metrics: Arc<RoutingMetrics>,
    initial_ttl: u8,
    timestamp_tolerance: Duration,
}

impl RoutingEngine {
    pub fn new(
        local_id: PeerId,
        cipher: PayloadCipher,
        dedup: Arc<DuplicateCache>,
        metrics: Arc<RoutingMetrics>,
        initial_ttl: u8,
        timestamp_tolerance: Duration,
    ) -> Self {
        Self {
            local_id,
            local_hex: local_id.to_hex(),
            cipher,
            dedup,
            metrics,
            initial_ttl,
            timestamp_tolerance,
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Run one received datagram through the ingest protocol.
    pub fn ingest(&self, bytes: &[u8], now: SystemTime) -> Ingest {
        self.metrics.record_ingest();

        // 1. Header and checksum.
        let packet = match MeshPacket::decode(bytes) {
            Ok(packet) => packet,
            Err(err) => {
                let reason = match err {
                    PacketError::BadChecksum => DropReason::BadChecksum,
                    _ => DropReason::Malformed,
                };
                trace!("drop ({err}) on {} byte datagram", bytes.len());
                self.metrics.record_drop(reason);
                return Ingest::drop(reason, None);
            }
        };

        // 2. Replay guard: reject datagrams outside the freshness window.
        if !self.is_fresh(packet.timestamp, now) {
            debug!("drop stale datagram {} (ts {})", packet.id, packet.timestamp);
            self.metrics.record_drop(DropReason::StaleTimestamp);
            return Ingest::drop(DropReason::StaleTimestamp, Some(packet));
        }

        // 3. Duplicate suppression. The key is marked before decryption so
        //    a copy that fails to decrypt still burns the key.
        if self.dedup.mark_and_check(&packet.dedup_key(), now) {
            trace!("drop duplicate {}", packet.id);
            self.metrics.record_drop(DropReason::Duplicate);
            return Ingest::drop(DropReason::Duplicate, Some(packet));
        }

        // 4–5. Decrypt and validate the record.
        let record = match self.cipher.decrypt_record(&packet.payload, &packet.id) {
            Ok(record) => record,
            Err(err) => {
                let reason = match err {
                    PacketError::DecryptFailed => DropReason::DecryptFailed,
                    _ => DropReason::MalformedRecord,
                };
                debug!("drop {} ({err})", packet.id);
                self.metrics.record_drop(reason);
                return Ingest::drop(reason, Some(packet));
            }
        };

        // 6. Addressing.
        let for_me = record.recipient() == self.local_hex;
        let broadcast = record.is_broadcast();
        let deliver = for_me || broadcast;

        // 7. A direct message delivered here is acknowledged to the node
        //    that originated it (the header sender survives relaying).
        let ack = if deliver && for_me && matches!(record, InnerRecord::Direct { .. }) {
            match self.originate_ack(packet.sender, packet.id, now) {
                Ok(ack) => Some(ack),
                Err(err) => {
                    debug!("failed to build ack for {}: {err}", packet.id);
                    None
                }
            }
        } else {
            None
        };

        // 8. Relay policy, on the header kind of the arriving copy.
        let relay_kind = packet.kind == PacketKind::Sos
            || broadcast
            || (packet.kind == PacketKind::Direct && !for_me);
        let should_relay = packet.ttl > 0 && relay_kind;

        let relay = if should_relay {
            match self.relay_copy(&packet, &record) {
                Ok(copy) => Some(copy),
                Err(err) => {
                    debug!("failed to build relay copy of {}: {err}", packet.id);
                    None
                }
            }
        } else {
            None
        };

        let decision = match (deliver, relay.is_some()) {
            (true, true) => Decision::DeliverAndRelay,
            (true, false) => Decision::Deliver,
            (false, true) => Decision::Relay,
            (false, false) => {
                let reason = if relay_kind && packet.ttl == 0 {
                    DropReason::TtlExhausted
                } else {
                    DropReason::NotForUs
                };
                self.metrics.record_drop(reason);
                return Ingest::drop(reason, Some(packet));
            }
        };

        if decision.delivers() {
            self.metrics.record_delivery();
        }
        if decision.relays() {
            self.metrics.record_relay();
        }
        if ack.is_some() {
            self.metrics.record_ack_emitted();
        }

        Ingest {
            decision,
            packet: Some(packet),
            record: Some(record),
            relay,
            ack,
        }
    }

    /// Construct the relay copy. The message id is preserved, so the IV,
    /// the ciphertext and the network-wide duplicate key all survive the
    /// re-encode.
    fn relay_copy(
        &self,
        packet: &MeshPacket,
        record: &InnerRecord,
    ) -> Result<MeshPacket, PacketError> {
        let payload = self.cipher.encrypt_record(record, &packet.id)?;
        Ok(MeshPacket::new(
            PacketKind::Relay,
            packet.id,
            packet.hop_count + 1,
            packet.ttl - 1,
            packet.timestamp,
            packet.sender,
            payload,
        ))
    }

    /// Originate an SOS broadcast.
    pub fn originate_sos(
        &self,
        content: &str,
        location: Location,
        sos_type: &str,
        now: SystemTime,
    ) -> Result<MeshPacket, PacketError> {
        let timestamp = unix_seconds(now);
        let record = InnerRecord::Sos {
            sender: self.local_hex.clone(),
            recipient: crate::protocol::BROADCAST_RECIPIENT.to_string(),
            content: content.to_string(),
            location,
            priority: 5,
            timestamp: timestamp as u64,
            sos_type: sos_type.to_string(),
        };
        self.originate(PacketKind::Sos, record, now)
    }

    /// Originate a direct message to one peer.
    pub fn originate_direct(
        &self,
        recipient: PeerId,
        content: &str,
        now: SystemTime,
    ) -> Result<MeshPacket, PacketError> {
        let timestamp = unix_seconds(now);
        let record = InnerRecord::Direct {
            sender: self.local_hex.clone(),
            recipient: recipient.to_hex(),
            content: content.to_string(),
            priority: 3,
            timestamp: timestamp as u64,
        };
        self.originate(PacketKind::Direct, record, now)
    }

    /// Originate an acknowledgment for a delivered direct message.
    pub fn originate_ack(
        &self,
        recipient: PeerId,
        original_id: Uuid,
        now: SystemTime,
    ) -> Result<MeshPacket, PacketError> {
        let timestamp = unix_seconds(now);
        let record = InnerRecord::Ack {
            sender: self.local_hex.clone(),
            recipient: recipient.to_hex(),
            original_message_id: original_id.to_string(),
            priority: 2,
            timestamp: timestamp as u64,
        };
        self.originate(PacketKind::Ack, record, now)
    }

    fn originate(
        &self,
        kind: PacketKind,
        record: InnerRecord,
        now: SystemTime,
    ) -> Result<MeshPacket, PacketError> {
        let id = Uuid::new_v4();
        let payload = self.cipher.encrypt_record(&record, &id)?;
        let packet = MeshPacket::new(
            kind,
            id,
            0,
            self.initial_ttl,
            unix_seconds(now),
            self.local_id,
            payload,
        );
        // Mark our own key before emission so the echo from a neighbor
        // cannot loop back as a delivery.
        self.dedup.mark_and_check(&packet.dedup_key(), now);
        self.metrics.record_originated();
        Ok(packet)
    }

    fn is_fresh(&self, timestamp: u32, now: SystemTime) -> bool {
        let now_ms = now
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_millis() as i128;
        let ts_ms = (timestamp as i128) * 1000;
        let tolerance_ms = self.timestamp_tolerance.as_millis() as i128;
        (now_ms - ts_ms).abs() <= tolerance_ms
    }
}

fn unix_seconds(now: SystemTime) -> u32 {
    now.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"DisasterMeshNet!";

    fn engine_for(id: [u8; 6]) -> RoutingEngine {
        RoutingEngine::new(
            PeerId::new(id),
            PayloadCipher::new(KEY),
            Arc::new(DuplicateCache::new(500, Duration::from_secs(300))),
            Arc::new(RoutingMetrics::new()),
            5,
            Duration::from_secs(300),
        )
    }

    fn now_at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    const T0: u64 = 1_700_000_000;

    fn location() -> Location {
        Location { lat: 1.0, lng: 2.0 }
    }

    #[test]
    fn sos_is_delivered_and_relayed() {
        let alice = engine_for([0xA; 6]);
        let bob = engine_for([0xB; 6]);
        let now = now_at(T0);

        let sos = alice.originate_sos("help", location(), "medical", now).unwrap();
        let out = bob.ingest(&sos.encode().unwrap(), now);

        assert_eq!(out.decision, Decision::DeliverAndRelay);
        let relay = out.relay.unwrap();
        assert_eq!(relay.kind, PacketKind::Relay);
        assert_eq!(relay.hop_count, 1);
        assert_eq!(relay.ttl, 4);
        assert_eq!(relay.id, sos.id);
        assert_eq!(relay.sender, sos.sender);
        assert_eq!(relay.payload, sos.payload);
        assert!(out.ack.is_none());
    }

    #[test]
    fn second_ingest_of_same_datagram_is_dropped() {
        let alice = engine_for([0xA; 6]);
        let bob = engine_for([0xB; 6]);
        let now = now_at(T0);

        let sos = alice.originate_sos("help", location(), "fire", now).unwrap();
        let bytes = sos.encode().unwrap();

        assert_eq!(bob.ingest(&bytes, now).decision, Decision::DeliverAndRelay);
        assert_eq!(
            bob.ingest(&bytes, now).decision,
            Decision::Drop(DropReason::Duplicate)
        );
    }

    #[test]
    fn relay_copy_of_same_message_is_also_a_duplicate() {
        let alice = engine_for([0xA; 6]);
        let bob = engine_for([0xB; 6]);
        let carol = engine_for([0xC; 6]);
        let now = now_at(T0);

        let sos = alice.originate_sos("help", location(), "fire", now).unwrap();
        let relayed = bob
            .ingest(&sos.encode().unwrap(), now)
            .relay
            .unwrap()
            .encode()
            .unwrap();

        // Carol hears Bob's relay first, then Alice's original.
        assert_eq!(
            carol.ingest(&relayed, now).decision,
            Decision::DeliverAndRelay
        );
        assert_eq!(
            carol.ingest(&sos.encode().unwrap(), now).decision,
            Decision::Drop(DropReason::Duplicate)
        );
    }

    #[test]
    fn direct_for_me_delivers_and_acks_without_relaying() {
        let alice = engine_for([0xA; 6]);
        let bob = engine_for([0xB; 6]);
        let now = now_at(T0);

        let direct = alice
            .originate_direct(PeerId::new([0xB; 6]), "hello", now)
            .unwrap();
        let out = bob.ingest(&direct.encode().unwrap(), now);

        assert_eq!(out.decision, Decision::Deliver);
        let ack = out.ack.expect("direct delivery must enqueue an ack");
        assert_eq!(ack.kind, PacketKind::Ack);
        assert_eq!(ack.sender, PeerId::new([0xB; 6]));
        assert_eq!(ack.ttl, 5);
        match bob.cipher.decrypt_record(&ack.payload, &ack.id).unwrap() {
            InnerRecord::Ack {
                recipient,
                original_message_id,
                priority,
                ..
            } => {
                assert_eq!(recipient, PeerId::new([0xA; 6]).to_hex());
                assert_eq!(original_message_id, direct.id.to_string());
                assert_eq!(priority, 2);
            }
            other => panic!("expected ack record, got {other:?}"),
        }
    }

    #[test]
    fn direct_for_someone_else_relays_without_delivery() {
        let alice = engine_for([0xA; 6]);
        let bob = engine_for([0xB; 6]);
        let now = now_at(T0);

        let direct = alice
            .originate_direct(PeerId::new([0xC; 6]), "psst", now)
            .unwrap();
        let out = bob.ingest(&direct.encode().unwrap(), now);

        assert_eq!(out.decision, Decision::Relay);
        assert!(out.ack.is_none());
    }

    #[test]
    fn direct_delivered_via_relay_still_acks_the_originator() {
        let alice = engine_for([0xA; 6]);
        let bob = engine_for([0xB; 6]);
        let carol = engine_for([0xC; 6]);
        let now = now_at(T0);

        let direct = alice
            .originate_direct(PeerId::new([0xC; 6]), "via bob", now)
            .unwrap();
        let relayed = bob
            .ingest(&direct.encode().unwrap(), now)
            .relay
            .unwrap()
            .encode()
            .unwrap();

        let out = carol.ingest(&relayed, now);
        assert_eq!(out.decision, Decision::Deliver);
        let ack = out.ack.expect("relayed direct still needs an ack");
        match carol.cipher.decrypt_record(&ack.payload, &ack.id).unwrap() {
            InnerRecord::Ack { recipient, .. } => {
                assert_eq!(recipient, PeerId::new([0xA; 6]).to_hex());
            }
            other => panic!("expected ack record, got {other:?}"),
        }
    }

    #[test]
    fn ack_for_someone_else_is_not_relayed() {
        let alice = engine_for([0xA; 6]);
        let bob = engine_for([0xB; 6]);
        let now = now_at(T0);

        let ack = alice
            .originate_ack(PeerId::new([0xC; 6]), Uuid::new_v4(), now)
            .unwrap();
        assert_eq!(
            bob.ingest(&ack.encode().unwrap(), now).decision,
            Decision::Drop(DropReason::NotForUs)
        );
    }

    #[test]
    fn ttl_zero_is_delivered_but_never_relayed() {
        let alice = engine_for([0xA; 6]);
        let bob = engine_for([0xB; 6]);
        let now = now_at(T0);

        let mut sos = alice.originate_sos("last hop", location(), "fire", now).unwrap();
        sos.ttl = 0;
        let out = bob.ingest(&sos.encode().unwrap(), now);
        assert_eq!(out.decision, Decision::Deliver);
        assert!(out.relay.is_none());
    }

    #[test]
    fn ttl_one_relays_a_copy_with_ttl_zero() {
        let alice = engine_for([0xA; 6]);
        let bob = engine_for([0xB; 6]);
        let now = now_at(T0);

        let mut sos = alice.originate_sos("edge", location(), "fire", now).unwrap();
        sos.ttl = 1;
        let out = bob.ingest(&sos.encode().unwrap(), now);
        assert_eq!(out.decision, Decision::DeliverAndRelay);
        assert_eq!(out.relay.unwrap().ttl, 0);
    }

    #[test]
    fn ttl_exhausted_direct_for_someone_else_counts_as_ttl_drop() {
        let alice = engine_for([0xA; 6]);
        let bob = engine_for([0xB; 6]);
        let now = now_at(T0);

        let mut direct = alice
            .originate_direct(PeerId::new([0xC; 6]), "stuck", now)
            .unwrap();
        direct.ttl = 0;
        assert_eq!(
            bob.ingest(&direct.encode().unwrap(), now).decision,
            Decision::Drop(DropReason::TtlExhausted)
        );
    }

    #[test]
    fn timestamp_at_tolerance_edge_is_accepted_beyond_is_dropped() {
        let alice = engine_for([0xA; 6]);
        let bob = engine_for([0xB; 6]);
        let origin = now_at(T0);

        let sos = alice.originate_sos("old", location(), "fire", origin).unwrap();
        let bytes = sos.encode().unwrap();

        let edge = origin + Duration::from_secs(300);
        assert_eq!(bob.ingest(&bytes, edge).decision, Decision::DeliverAndRelay);

        let carol = engine_for([0xC; 6]);
        let beyond = edge + Duration::from_millis(1);
        assert_eq!(
            carol.ingest(&bytes, beyond).decision,
            Decision::Drop(DropReason::StaleTimestamp)
        );
    }

    #[test]
    fn replayed_old_datagram_is_dropped_before_the_cache() {
        let alice = engine_for([0xA; 6]);
        let bob = engine_for([0xB; 6]);
        let origin = now_at(T0);

        let sos = alice.originate_sos("replay", location(), "fire", origin).unwrap();
        let replay_time = origin + Duration::from_secs(600);
        assert_eq!(
            bob.ingest(&sos.encode().unwrap(), replay_time).decision,
            Decision::Drop(DropReason::StaleTimestamp)
        );
        assert!(bob.dedup.is_empty());
    }

    #[test]
    fn wrong_key_marks_the_cache_but_never_delivers() {
        let alice = engine_for([0xA; 6]);
        let now = now_at(T0);
        let sos = alice.originate_sos("secret", location(), "fire", now).unwrap();
        let bytes = sos.encode().unwrap();

        let eve = RoutingEngine::new(
            PeerId::new([0xE; 6]),
            PayloadCipher::new(b"WrongKey00000000"),
            Arc::new(DuplicateCache::new(500, Duration::from_secs(300))),
            Arc::new(RoutingMetrics::new()),
            5,
            Duration::from_secs(300),
        );

        assert_eq!(
            eve.ingest(&bytes, now).decision,
            Decision::Drop(DropReason::DecryptFailed)
        );
        // A second copy dies in the cache, decryptable or not.
        assert_eq!(
            eve.ingest(&bytes, now).decision,
            Decision::Drop(DropReason::Duplicate)
        );
    }

    #[test]
    fn corrupted_datagram_is_dropped() {
        let alice = engine_for([0xA; 6]);
        let bob = engine_for([0xB; 6]);
        let now = now_at(T0);

        let mut bytes = alice
            .originate_sos("bits", location(), "fire", now)
            .unwrap()
            .encode()
            .unwrap();
        bytes[20] ^= 0x40;
        assert_eq!(
            bob.ingest(&bytes, now).decision,
            Decision::Drop(DropReason::BadChecksum)
        );
    }

    #[test]
    fn own_echo_does_not_loop_back() {
        let alice = engine_for([0xA; 6]);
        let now = now_at(T0);

        let sos = alice.originate_sos("echo", location(), "fire", now).unwrap();
        // A neighbor relays our SOS straight back at us.
        assert_eq!(
            alice.ingest(&sos.encode().unwrap(), now).decision,
            Decision::Drop(DropReason::Duplicate)
        );
    }

    #[test]
    fn relay_invariants_hold_along_a_chain() {
        let now = now_at(T0);
        let alice = engine_for([0xA; 6]);
        let origin = alice.originate_sos("chain", location(), "fire", now).unwrap();

        let mut bytes = origin.encode().unwrap();
        let mut hop = 0u8;
        for node in [[0xB; 6], [0xC; 6], [0xD; 6], [0xE; 6]] {
            let engine = engine_for(node);
            let out = engine.ingest(&bytes, now);
            assert!(out.decision.delivers());
            match out.relay {
                Some(relay) => {
                    hop += 1;
                    assert_eq!(relay.hop_count, hop);
                    assert!(relay.ttl < origin.ttl);
                    assert_eq!(relay.hop_count + relay.ttl, origin.ttl);
                    assert_eq!(relay.id, origin.id);
                    assert_eq!(relay.sender, origin.sender);
                    bytes = relay.encode().unwrap();
                }
                None => break,
            }
        }
        assert_eq!(hop, 4);
    }
}
