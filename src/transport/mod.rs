//! Transport abstraction: the capability set the node expects from a radio.
//!
//! Implementations hide the radio stack's idiosyncrasies (link limits,
//! connection establishment, advertisement parsing). A transport guarantees
//! at-most-once delivery per received datagram on a single link; cross-link
//! deduplication belongs to the routing layer.

mod ble;
mod mem;

pub use ble::BleTransport;
pub use mem::{MemHub, MemTransport};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::peers::PeerStatus;
use crate::protocol::{PeerId, PROTOCOL_VERSION};

/// Service UUID under which mesh nodes advertise and exchange datagrams.
pub const SERVICE_UUID: &str = "0000FE50-0000-1000-8000-00805F9B34FB";

/// Characteristic UUID for datagram writes and notifications.
pub const CHARACTERISTIC_UUID: &str = "0000FE51-0000-1000-8000-00805F9B34FB";

/// Most BLE stacks cap concurrent links around seven.
pub const MAX_LINKS: usize = 7;

/// A link write that has not completed within this window counts as failed.
pub const SEND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Fixed size of the discovery service-data blob.
pub const ADVERTISEMENT_LEN: usize = 24;

/// Discovery advertisement: who we are, how we are doing, what we speak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub sender: PeerId,
    pub status: PeerStatus,
    pub protocol_version: u8,
    pub name: String,
}

impl Advertisement {
    pub fn new(sender: PeerId, status: PeerStatus, name: &str) -> Self {
        Self {
            sender,
            status,
            protocol_version: PROTOCOL_VERSION,
            name: name.to_string(),
        }
    }

    /// Encode the 24-byte service-data blob: bytes 0–5 sender id, byte 6
    /// status, byte 7 protocol version, bytes 8–23 zero-padded UTF-8 name.
    pub fn encode(&self) -> [u8; ADVERTISEMENT_LEN] {
        let mut blob = [0u8; ADVERTISEMENT_LEN];
        blob[..6].copy_from_slice(self.sender.as_bytes());
        blob[6] = self.status as u8;
        blob[7] = self.protocol_version;

        let mut cursor = 8;
        for ch in self.name.chars() {
            let mut buf = [0u8; 4];
            let encoded = ch.encode_utf8(&mut buf).as_bytes();
            if cursor + encoded.len() > ADVERTISEMENT_LEN {
                break;
            }
            blob[cursor..cursor + encoded.len()].copy_from_slice(encoded);
            cursor += encoded.len();
        }
        blob
    }

    /// Parse a service-data blob; anything malformed is silently ignored by
    /// the scanner.
    pub fn decode(blob: &[u8]) -> Option<Self> {
        if blob.len() != ADVERTISEMENT_LEN {
            return None;
        }
        let sender = PeerId::from_slice(&blob[..6])?;
        let status = PeerStatus::from_u8(blob[6])?;
        let protocol_version = blob[7];

        let name_bytes = &blob[8..];
        let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
        let name = std::str::from_utf8(&name_bytes[..end]).ok()?.to_string();

        Some(Self {
            sender,
            status,
            protocol_version,
            name,
        })
    }
}

/// Inbound radio events, delivered on the channel handed out by
/// [`Transport::take_events`].
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A peer advertisement was heard.
    Advertisement {
        peer: PeerId,
        name: String,
        rssi: i16,
        status: PeerStatus,
        protocol_version: u8,
    },
    /// A datagram arrived on some link.
    Datagram { bytes: Vec<u8> },
}

/// Capability set the node controller drives. The controller owns the
/// transport exclusively; no other component calls it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bring the radio up. Fails when no usable adapter exists.
    async fn start(&self) -> Result<(), TransportError>;

    /// Tear the radio down and drop all links.
    async fn stop(&self);

    /// Begin or refresh the periodic discovery advertisement.
    async fn advertise(&self, advertisement: Advertisement) -> Result<(), TransportError>;

    /// Peers with an active logical connection.
    async fn connected_peers(&self) -> Vec<PeerId>;

    /// Write one encoded datagram to one peer.
    async fn send(&self, peer: PeerId, bytes: &[u8]) -> Result<(), TransportError>;

    /// Write to every connected peer; per-peer failures do not abort the
    /// loop. Returns the number of successful writes.
    async fn broadcast(&self, bytes: &[u8]) -> usize;

    /// Hand out the inbound event stream. Yields `None` after the first
    /// call: there is exactly one consumer, the node's inbound task.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;
}
