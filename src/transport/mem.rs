//! In-process transport for tests and simulations.
//!
//! A [`MemHub`] plays the role of the radio ether: it owns the topology as
//! an explicit set of links and moves datagrams between attached node
//! transports over channels. Scenarios that need partitions, merges or
//! cliques just edit the link set.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::protocol::PeerId;

use super::{Advertisement, Transport, TransportEvent};

/// Synthetic signal strength reported for hub links.
const MEM_RSSI: i16 = -58;

struct NodeSlot {
    tx: mpsc::UnboundedSender<TransportEvent>,
    online: bool,
}

#[derive(Default)]
struct HubInner {
    nodes: HashMap<PeerId, NodeSlot>,
    links: HashSet<(PeerId, PeerId)>,
}

/// The shared ether connecting [`MemTransport`] instances.
#[derive(Default)]
pub struct MemHub {
    inner: Mutex<HubInner>,
    wire_count: AtomicU64,
}

impl MemHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connect two nodes bidirectionally.
    pub fn link(&self, a: PeerId, b: PeerId) {
        let mut inner = self.inner.lock().expect("mem hub poisoned");
        inner.links.insert((a, b));
        inner.links.insert((b, a));
    }

    pub fn unlink(&self, a: PeerId, b: PeerId) {
        let mut inner = self.inner.lock().expect("mem hub poisoned");
        inner.links.remove(&(a, b));
        inner.links.remove(&(b, a));
    }

    /// Total datagrams put on the wire since the hub was created.
    pub fn wire_datagrams(&self) -> u64 {
        self.wire_count.load(Ordering::Relaxed)
    }

    fn neighbors_of(&self, id: PeerId) -> Vec<PeerId> {
        let inner = self.inner.lock().expect("mem hub poisoned");
        inner
            .links
            .iter()
            .filter(|(from, to)| {
                *from == id
                    && inner.nodes.get(to).map(|slot| slot.online).unwrap_or(false)
            })
            .map(|(_, to)| *to)
            .collect()
    }

    fn set_online(&self, id: PeerId, online: bool) {
        if let Some(slot) = self.inner.lock().expect("mem hub poisoned").nodes.get_mut(&id) {
            slot.online = online;
        }
    }

    fn push(&self, to: PeerId, event: TransportEvent) -> bool {
        let inner = self.inner.lock().expect("mem hub poisoned");
        match inner.nodes.get(&to) {
            Some(slot) if slot.online => slot.tx.send(event).is_ok(),
            _ => false,
        }
    }
}

/// One node's endpoint on a [`MemHub`].
pub struct MemTransport {
    id: PeerId,
    hub: Arc<MemHub>,
    events: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl MemTransport {
    /// Attach a new endpoint to the hub. The node is offline until its
    /// `start` is called.
    pub fn new(hub: Arc<MemHub>, id: PeerId) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        hub.inner
            .lock()
            .expect("mem hub poisoned")
            .nodes
            .insert(id, NodeSlot { tx, online: false });
        Self {
            id,
            hub,
            events: Mutex::new(Some(rx)),
        }
    }
}

#[async_trait]
impl Transport for MemTransport {
    async fn start(&self) -> Result<(), TransportError> {
        self.hub.set_online(self.id, true);
        Ok(())
    }

    async fn stop(&self) {
        self.hub.set_online(self.id, false);
    }

    async fn advertise(&self, advertisement: Advertisement) -> Result<(), TransportError> {
        // Run the blob through the real codec so tests exercise it.
        let blob = advertisement.encode();
        let heard = Advertisement::decode(&blob)
            .ok_or_else(|| TransportError::RadioUnavailable("advertisement codec".into()))?;

        for neighbor in self.hub.neighbors_of(self.id) {
            self.hub.push(
                neighbor,
                TransportEvent::Advertisement {
                    peer: heard.sender,
                    name: heard.name.clone(),
                    rssi: MEM_RSSI,
                    status: heard.status,
                    protocol_version: heard.protocol_version,
                },
            );
        }
        Ok(())
    }

    async fn connected_peers(&self) -> Vec<PeerId> {
        self.hub.neighbors_of(self.id)
    }

    async fn send(&self, peer: PeerId, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.hub.neighbors_of(self.id).contains(&peer) {
            return Err(TransportError::NotConnected(peer));
        }
        let delivered = self.hub.push(
            peer,
            TransportEvent::Datagram { bytes: bytes.to_vec() },
        );
        if !delivered {
            return Err(TransportError::SendFailed {
                peer,
                reason: "receiver gone".into(),
            });
        }
        self.hub.wire_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn broadcast(&self, bytes: &[u8]) -> usize {
        let mut sent = 0;
        for neighbor in self.hub.neighbors_of(self.id) {
            let delivered = self.hub.push(
                neighbor,
                TransportEvent::Datagram { bytes: bytes.to_vec() },
            );
            if delivered {
                sent += 1;
            }
        }
        self.hub.wire_count.fetch_add(sent as u64, Ordering::Relaxed);
        sent
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.lock().expect("mem transport poisoned").take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::PeerStatus;

    const A: PeerId = PeerId::new([0xA; 6]);
    const B: PeerId = PeerId::new([0xB; 6]);
    const C: PeerId = PeerId::new([0xC; 6]);

    #[tokio::test]
    async fn broadcast_reaches_linked_started_nodes_only() {
        let hub = MemHub::new();
        let a = MemTransport::new(hub.clone(), A);
        let b = MemTransport::new(hub.clone(), B);
        let c = MemTransport::new(hub.clone(), C);
        hub.link(A, B);
        hub.link(A, C);

        a.start().await.unwrap();
        b.start().await.unwrap();
        // C never starts.

        assert_eq!(a.broadcast(b"hello").await, 1);
        assert_eq!(hub.wire_datagrams(), 1);

        let mut events = b.take_events().unwrap();
        match events.try_recv().unwrap() {
            TransportEvent::Datagram { bytes } => assert_eq!(bytes, b"hello"),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(c.take_events().unwrap().try_recv().is_err());
    }

    #[tokio::test]
    async fn send_to_unlinked_peer_fails() {
        let hub = MemHub::new();
        let a = MemTransport::new(hub.clone(), A);
        let b = MemTransport::new(hub.clone(), B);
        a.start().await.unwrap();
        b.start().await.unwrap();

        assert!(matches!(
            a.send(B, b"x").await,
            Err(TransportError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn advertisements_travel_over_links() {
        let hub = MemHub::new();
        let a = MemTransport::new(hub.clone(), A);
        let b = MemTransport::new(hub.clone(), B);
        hub.link(A, B);
        a.start().await.unwrap();
        b.start().await.unwrap();

        a.advertise(Advertisement::new(A, PeerStatus::Active, "alpha"))
            .await
            .unwrap();

        let mut events = b.take_events().unwrap();
        match events.try_recv().unwrap() {
            TransportEvent::Advertisement { peer, name, .. } => {
                assert_eq!(peer, A);
                assert_eq!(name, "alpha");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
