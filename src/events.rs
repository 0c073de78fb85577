//! Observer interface: how the embedding application hears about the mesh.
//!
//! A single listener trait receives a tagged event. Callbacks run on the
//! controller's dispatch path with no internal lock held, so a listener may
//! call back into the node.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::peers::PeerRecord;
use crate::protocol::{Location, PacketKind, PeerId};

/// A message surfaced to the local application.
#[derive(Debug, Clone)]
pub struct DeliveredMessage {
    pub id: Uuid,
    /// Kind the message originated as (relay copies report the original).
    pub kind: PacketKind,
    pub sender: PeerId,
    pub content: Option<String>,
    pub location: Option<Location>,
    pub sos_type: Option<String>,
    pub priority: u8,
    /// Relay edges the delivered copy traversed.
    pub hops: u8,
    /// Originator's wall clock, seconds since epoch.
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
pub enum MeshEvent {
    PeerDiscovered(PeerRecord),
    PeerLost(PeerRecord),
    MessageDelivered(DeliveredMessage),
    /// Fired once per originated message: `success` is true when it reached
    /// the radio, false when the forward queue gave up on it.
    MessageSent { id: Uuid, success: bool },
    AckReceived { original_id: Uuid, from: PeerId },
}

pub trait MeshObserver: Send + Sync {
    fn on_event(&self, event: &MeshEvent);
}

/// Handle returned by `observe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Fan-out registry for listeners.
#[derive(Default)]
pub struct ObserverBus {
    listeners: Mutex<Vec<(ObserverId, Arc<dyn MeshObserver>)>>,
    next_id: AtomicU64,
}

impl ObserverBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, listener: Arc<dyn MeshObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .expect("observer bus poisoned")
            .push((id, listener));
        id
    }

    pub fn unobserve(&self, id: ObserverId) {
        self.listeners
            .lock()
            .expect("observer bus poisoned")
            .retain(|(listener_id, _)| *listener_id != id);
    }

    /// Deliver an event to every listener. The registry lock is released
    /// before any callback runs.
    pub fn emit(&self, event: &MeshEvent) {
        let listeners: Vec<Arc<dyn MeshObserver>> = self
            .listeners
            .lock()
            .expect("observer bus poisoned")
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener.on_event(event);
        }
    }

    pub fn clear(&self) {
        self.listeners.lock().expect("observer bus poisoned").clear();
    }
}
