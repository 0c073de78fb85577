//! Node controller: lifecycle, public API and the background tasks.
//!
//! The embedder owns a [`MeshNode`] value. `start` brings the transport up
//! and spawns four tasks (inbound, outbound, maintenance, advertiser), all
//! tied to one cancellation token; `stop` cancels them and waits out a
//! short grace period. Several nodes can coexist in one process, which is
//! how the end-to-end tests run whole topologies.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::events::{DeliveredMessage, MeshEvent, MeshObserver, ObserverBus, ObserverId};
use crate::peers::{PeerRecord, PeerStatus, PeerTable};
use crate::protocol::{InnerRecord, Location, MeshPacket, PacketKind, PayloadCipher, PeerId};
use crate::queue::ForwardQueue;
use crate::routing::{DuplicateCache, Ingest, RoutingEngine, RoutingMetrics};
use crate::store::{DeliveryStatus, MeshStore, RoutingAction, StoredMessage};
use crate::transport::{Advertisement, Transport, TransportEvent};

/// Tasks must observe cancellation within this window.
const STOP_GRACE: Duration = Duration::from_millis(250);

/// A datagram headed for the radio. `notify` marks locally originated
/// messages that owe the embedder a `MessageSent` callback.
struct Outbound {
    packet: MeshPacket,
    priority: u8,
    notify: bool,
}

/// Everything the background tasks share.
struct Shared {
    self_id: PeerId,
    display_name: String,
    advertise_period: Duration,
    /// Peers are swept a few times per liveness window (10 s at defaults).
    peer_sweep_interval: Duration,
    /// Dedup expiry runs a few times per cache TTL (60 s at defaults).
    dedup_sweep_interval: Duration,
    /// Queue drain follows the retry cadence (30 s at defaults).
    queue_drain_interval: Duration,
    engine: RoutingEngine,
    dedup: Arc<DuplicateCache>,
    peers: PeerTable,
    queue: ForwardQueue,
    store: MeshStore,
    observers: ObserverBus,
    metrics: Arc<RoutingMetrics>,
    transport: Arc<dyn Transport>,
}

struct Running {
    token: CancellationToken,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    inbound: JoinHandle<mpsc::UnboundedReceiver<TransportEvent>>,
    workers: Vec<JoinHandle<()>>,
}

/// A Bluetooth mesh relay node.
pub struct MeshNode {
    shared: Arc<Shared>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    running: Mutex<Option<Running>>,
}

impl MeshNode {
    pub fn new(config: MeshConfig, transport: Arc<dyn Transport>) -> Self {
        let self_id = config.self_id.unwrap_or_else(PeerId::random);
        let cipher = PayloadCipher::new(&config.network_key);
        let dedup = Arc::new(DuplicateCache::new(config.dedup_capacity, config.dedup_ttl));
        let metrics = Arc::new(RoutingMetrics::new());
        let engine = RoutingEngine::new(
            self_id,
            cipher,
            Arc::clone(&dedup),
            Arc::clone(&metrics),
            config.initial_ttl,
            config.timestamp_tolerance,
        );

        let events_rx = transport.take_events();

        Self {
            shared: Arc::new(Shared {
                self_id,
                display_name: config.display_name.clone(),
                advertise_period: config.advertise_period,
                peer_sweep_interval: config.peer_liveness_window / 3,
                dedup_sweep_interval: config.dedup_ttl / 5,
                queue_drain_interval: config.queue_retry_interval,
                engine,
                dedup,
                peers: PeerTable::new(config.peer_liveness_window),
                queue: ForwardQueue::new(
                    config.queue_retry_interval,
                    config.queue_max_attempts,
                    config.queue_message_expiry,
                ),
                store: MeshStore::new(),
                observers: ObserverBus::new(),
                metrics,
                transport,
            }),
            events_rx: std::sync::Mutex::new(events_rx),
            running: Mutex::new(None),
        }
    }

    pub fn id(&self) -> PeerId {
        self.shared.self_id
    }

    /// Bring the node up. Idempotence contract: a second call leaves the
    /// running state untouched and reports `AlreadyRunning`.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(MeshError::AlreadyRunning);
        }

        self.shared
            .transport
            .start()
            .await
            .map_err(|e| MeshError::RadioUnavailable(e.to_string()))?;

        let events = self
            .events_rx
            .lock()
            .expect("event receiver poisoned")
            .take();
        let Some(events) = events else {
            self.shared.transport.stop().await;
            return Err(MeshError::RadioUnavailable("event stream lost".into()));
        };

        info!("mesh node {} starting", self.shared.self_id);

        let token = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let inbound = tokio::spawn(inbound_task(
            Arc::clone(&self.shared),
            events,
            outbound_tx.clone(),
            token.clone(),
        ));
        let workers = vec![
            tokio::spawn(outbound_task(
                Arc::clone(&self.shared),
                outbound_rx,
                token.clone(),
            )),
            tokio::spawn(maintenance_task(Arc::clone(&self.shared), token.clone())),
            tokio::spawn(advertiser_task(Arc::clone(&self.shared), token.clone())),
        ];

        *running = Some(Running {
            token,
            outbound_tx,
            inbound,
            workers,
        });
        Ok(())
    }

    /// Halt the transport, cancel the tasks and flush the peer table and
    /// queues. Acknowledgments in flight may be dropped.
    pub async fn stop(&self) {
        let Some(state) = self.running.lock().await.take() else {
            return;
        };
        info!("mesh node {} stopping", self.shared.self_id);

        state.token.cancel();

        let mut inbound = state.inbound;
        match time::timeout(STOP_GRACE, &mut inbound).await {
            Ok(Ok(events)) => {
                *self.events_rx.lock().expect("event receiver poisoned") = Some(events);
            }
            Ok(Err(e)) => warn!("inbound task failed: {e}"),
            Err(_) => {
                warn!("inbound task missed the stop grace period");
                inbound.abort();
            }
        }
        for mut worker in state.workers {
            if time::timeout(STOP_GRACE, &mut worker).await.is_err() {
                warn!("worker task missed the stop grace period");
                worker.abort();
            }
        }

        self.shared.transport.stop().await;
        self.shared.peers.clear();
        self.shared.queue.clear();
    }

    /// Originate an SOS broadcast. Returns the message id.
    pub async fn send_sos(
        &self,
        content: &str,
        location: Location,
        sos_type: &str,
    ) -> Result<Uuid> {
        let outbound_tx = self.outbound_tx().await?;
        let now = SystemTime::now();
        let packet = self.shared.engine.originate_sos(content, location, sos_type, now)?;
        let id = packet.id;

        self.shared
            .store
            .record_message(outgoing_row(&packet, "broadcast", Some(content)))
            .await;
        let _ = outbound_tx.send(Outbound {
            packet,
            priority: 5,
            notify: true,
        });
        Ok(id)
    }

    /// Originate a direct message to `recipient` (12 hex digits).
    pub async fn send_direct(&self, recipient: &str, content: &str) -> Result<Uuid> {
        let outbound_tx = self.outbound_tx().await?;
        let target = PeerId::parse(recipient)
            .ok_or_else(|| MeshError::InvalidRecipient(recipient.to_string()))?;

        let now = SystemTime::now();
        let packet = self.shared.engine.originate_direct(target, content, now)?;
        let id = packet.id;

        self.shared
            .store
            .record_message(outgoing_row(&packet, &target.to_hex(), Some(content)))
            .await;
        let _ = outbound_tx.send(Outbound {
            packet,
            priority: 3,
            notify: true,
        });
        Ok(id)
    }

    /// Live neighbors, ordered by id.
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.shared.peers.list()
    }

    pub fn observe(&self, listener: Arc<dyn MeshObserver>) -> ObserverId {
        self.shared.observers.observe(listener)
    }

    pub fn unobserve(&self, id: ObserverId) {
        self.shared.observers.unobserve(id)
    }

    /// Routing counters.
    pub fn metrics(&self) -> Value {
        self.shared.metrics.snapshot()
    }

    /// Datagrams currently waiting in the store-and-forward queue.
    pub fn queued_messages(&self) -> usize {
        self.shared.queue.len()
    }

    /// Node statistics snapshot.
    pub async fn statistics(&self) -> Value {
        json!({
            "is_running": self.running.lock().await.is_some(),
            "device_id": self.shared.self_id.to_hex(),
            "peer_count": self.shared.peers.len(),
            "cache_size": self.shared.dedup.len(),
            "queued_messages": self.shared.queue.len(),
            "routing": self.shared.metrics.snapshot(),
            "store": self.shared.store.snapshot().await,
        })
    }

    async fn outbound_tx(&self) -> Result<mpsc::UnboundedSender<Outbound>> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|r| r.outbound_tx.clone())
            .ok_or(MeshError::NotRunning)
    }
}

fn outgoing_row(packet: &MeshPacket, peer: &str, content: Option<&str>) -> StoredMessage {
    StoredMessage {
        id: packet.id,
        kind: packet.kind,
        peer: peer.to_string(),
        content: content.map(str::to_string),
        hops: packet.hop_count,
        created_at: chrono::Utc::now(),
        delivered_at: None,
        status: DeliveryStatus::Pending,
        synced: false,
    }
}

/// Inbound task: transport events through the routing engine, decisions
/// dispatched to observers and the outbound path. Returns the event
/// receiver so the node can be started again after `stop`.
async fn inbound_task(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    token: CancellationToken,
) -> mpsc::UnboundedReceiver<TransportEvent> {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            event = events.recv() => match event {
                Some(TransportEvent::Advertisement { peer, name, rssi, status, protocol_version }) => {
                    handle_advertisement(&shared, peer, &name, rssi, status, protocol_version).await;
                }
                Some(TransportEvent::Datagram { bytes }) => {
                    handle_datagram(&shared, &bytes, &outbound_tx).await;
                }
                None => break,
            }
        }
    }
    events
}

async fn handle_advertisement(
    shared: &Shared,
    peer: PeerId,
    name: &str,
    rssi: i16,
    status: PeerStatus,
    protocol_version: u8,
) {
    if peer == shared.self_id {
        return;
    }
    let now = SystemTime::now();
    let newly_discovered = shared
        .peers
        .observe(peer, name, rssi, status, protocol_version, now);
    shared.store.record_peer_sighting(peer, rssi, status).await;

    if newly_discovered {
        if let Some(record) = shared.peers.find(peer) {
            info!("peer discovered: {} ({})", record.name, peer);
            shared.observers.emit(&MeshEvent::PeerDiscovered(record));
        }
    }
}

async fn handle_datagram(
    shared: &Shared,
    bytes: &[u8],
    outbound_tx: &mpsc::UnboundedSender<Outbound>,
) {
    let now = SystemTime::now();
    let out = shared.engine.ingest(bytes, now);
    record_routing(shared, &out).await;

    let Ingest {
        decision,
        packet,
        record,
        relay,
        ack,
    } = out;

    if decision.delivers() {
        if let (Some(packet), Some(record)) = (packet.as_ref(), record.as_ref()) {
            dispatch_delivery(shared, packet, record).await;
        }
    }

    if let Some(ack) = ack {
        let _ = outbound_tx.send(Outbound {
            packet: ack,
            priority: 2,
            notify: false,
        });
    }
    if let Some(relay) = relay {
        let priority = record.as_ref().map(InnerRecord::priority).unwrap_or(3);
        let _ = outbound_tx.send(Outbound {
            packet: relay,
            priority,
            notify: false,
        });
    }
}

async fn record_routing(shared: &Shared, out: &Ingest) {
    let Some(packet) = out.packet.as_ref() else {
        return;
    };
    let action = if out.decision.relays() {
        RoutingAction::Relayed
    } else if out.decision.delivers() {
        RoutingAction::Delivered
    } else {
        RoutingAction::Dropped
    };
    shared
        .store
        .record_routing_action(&packet.dedup_key(), action)
        .await;
}

async fn dispatch_delivery(shared: &Shared, packet: &MeshPacket, record: &InnerRecord) {
    match record {
        InnerRecord::Ack {
            original_message_id,
            ..
        } => {
            let Ok(original_id) = Uuid::parse_str(original_message_id) else {
                return;
            };
            debug!("ack received for {original_id}");
            shared
                .store
                .update_message_status(original_id, DeliveryStatus::Delivered)
                .await;
            shared.observers.emit(&MeshEvent::AckReceived {
                original_id,
                from: packet.sender,
            });
        }
        InnerRecord::Sos {
            content,
            location,
            priority,
            timestamp,
            sos_type,
            ..
        } => {
            let delivery = DeliveredMessage {
                id: packet.id,
                kind: PacketKind::Sos,
                sender: packet.sender,
                content: Some(content.clone()),
                location: Some(*location),
                sos_type: Some(sos_type.clone()),
                priority: *priority,
                hops: packet.hop_count,
                timestamp: *timestamp,
            };
            store_delivery(shared, &delivery).await;
            shared
                .observers
                .emit(&MeshEvent::MessageDelivered(delivery));
        }
        InnerRecord::Direct {
            content,
            priority,
            timestamp,
            ..
        } => {
            let delivery = DeliveredMessage {
                id: packet.id,
                kind: PacketKind::Direct,
                sender: packet.sender,
                content: Some(content.clone()),
                location: None,
                sos_type: None,
                priority: *priority,
                hops: packet.hop_count,
                timestamp: *timestamp,
            };
            store_delivery(shared, &delivery).await;
            shared
                .observers
                .emit(&MeshEvent::MessageDelivered(delivery));
        }
    }
}

async fn store_delivery(shared: &Shared, delivery: &DeliveredMessage) {
    shared
        .store
        .record_message(StoredMessage {
            id: delivery.id,
            kind: delivery.kind,
            peer: delivery.sender.to_hex(),
            content: delivery.content.clone(),
            hops: delivery.hops,
            created_at: chrono::Utc::now(),
            delivered_at: Some(chrono::Utc::now()),
            status: DeliveryStatus::Delivered,
            synced: false,
        })
        .await;
}

/// Outbound task: broadcasts datagrams; anything the radio cannot place on
/// a link right now falls into the store-and-forward queue.
async fn outbound_task(
    shared: Arc<Shared>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    token: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            _ = token.cancelled() => break,
            item = outbound_rx.recv() => match item {
                Some(item) => item,
                None => break,
            }
        };

        let bytes = match item.packet.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("dropping unencodable datagram {}: {e}", item.packet.id);
                continue;
            }
        };

        let sent = shared.transport.broadcast(&bytes).await;
        if sent > 0 {
            debug!("datagram {} reached {sent} peer(s)", item.packet.id);
            if item.notify {
                shared
                    .store
                    .update_message_status(item.packet.id, DeliveryStatus::Sent)
                    .await;
                shared.observers.emit(&MeshEvent::MessageSent {
                    id: item.packet.id,
                    success: true,
                });
            }
            continue;
        }

        // No reachable peer: store and retry later.
        let now = SystemTime::now();
        let originated_at =
            UNIX_EPOCH + Duration::from_secs(u64::from(item.packet.timestamp));
        let accepted = shared.queue.enqueue(
            item.packet.id,
            bytes,
            originated_at,
            item.priority,
            item.notify,
            now,
        );
        if accepted {
            debug!("datagram {} queued for store-and-forward", item.packet.id);
            shared.store.sync_forward_queue(&shared.queue.snapshot()).await;
        } else if item.notify {
            shared
                .store
                .update_message_status(item.packet.id, DeliveryStatus::Failed)
                .await;
            shared.observers.emit(&MeshEvent::MessageSent {
                id: item.packet.id,
                success: false,
            });
        }
    }
}

/// Maintenance ticker: peer liveness, cache expiry, queue retries and
/// store retention, each on its own cadence.
async fn maintenance_task(shared: Arc<Shared>, token: CancellationToken) {
    let mut peer_tick = time::interval(shared.peer_sweep_interval);
    let mut dedup_tick = time::interval(shared.dedup_sweep_interval);
    let mut queue_tick = time::interval(shared.queue_drain_interval);
    // Swallow the immediate first fire of each interval.
    peer_tick.tick().await;
    dedup_tick.tick().await;
    queue_tick.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = peer_tick.tick() => sweep_peers(&shared).await,
            _ = dedup_tick.tick() => {
                let removed = shared.dedup.sweep(SystemTime::now());
                if removed > 0 {
                    debug!("expired {removed} duplicate-cache entries");
                }
                shared.store.prune().await;
                shared
                    .store
                    .record_stat("dedup_cache_size", shared.dedup.len() as f64, json!({}))
                    .await;
            }
            _ = queue_tick.tick() => run_queue_pass(&shared).await,
        }
    }
}

async fn sweep_peers(shared: &Shared) {
    for evicted in shared.peers.sweep(SystemTime::now()) {
        info!("peer lost: {} ({})", evicted.name, evicted.id);
        shared.observers.emit(&MeshEvent::PeerLost(evicted));
    }
}

async fn run_queue_pass(shared: &Shared) {
    let now = SystemTime::now();
    let has_peers = !shared.transport.connected_peers().await.is_empty();

    for entry in shared.queue.drain(now, has_peers) {
        let sent = shared.transport.broadcast(&entry.bytes).await;
        if sent > 0 {
            debug!(
                "store-and-forward delivered {} after {} attempt(s)",
                entry.message_id, entry.attempts
            );
            if entry.notify {
                shared
                    .store
                    .update_message_status(entry.message_id, DeliveryStatus::Sent)
                    .await;
                shared.observers.emit(&MeshEvent::MessageSent {
                    id: entry.message_id,
                    success: true,
                });
            }
        } else {
            shared.queue.requeue(entry, now);
        }
    }

    for dead in shared.queue.sweep(now) {
        debug!(
            "store-and-forward gave up on {} ({} attempts)",
            dead.message_id, dead.attempts
        );
        shared
            .store
            .update_message_status(dead.message_id, DeliveryStatus::Failed)
            .await;
        if dead.notify {
            shared.observers.emit(&MeshEvent::MessageSent {
                id: dead.message_id,
                success: false,
            });
        }
    }

    shared.store.sync_forward_queue(&shared.queue.snapshot()).await;
}

/// Advertiser: refresh the discovery blob on a steady cadence.
async fn advertiser_task(shared: Arc<Shared>, token: CancellationToken) {
    let mut tick = time::interval(shared.advertise_period);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tick.tick() => {
                let ad = Advertisement::new(
                    shared.self_id,
                    PeerStatus::Active,
                    &shared.display_name,
                );
                if let Err(e) = shared.transport.advertise(ad).await {
                    debug!("advertise failed: {e}");
                }
            }
        }
    }
}
