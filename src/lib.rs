//! sosmesh: Bluetooth LE mesh relay node for off-grid emergency messaging.
//!
//! Every node originates, relays and delivers datagrams over a swarm of
//! nearby devices: controlled flooding with per-node duplicate suppression
//! and a TTL hop budget, an AES-encrypted payload envelope under one
//! pre-shared network key, peer discovery through radio advertisements,
//! and store-and-forward buffering for partitioned operation. Delivery is
//! best effort; direct messages are acknowledged end-to-end.
//!
//! The embedder owns a [`MeshNode`] and drives it through `start`/`stop`,
//! the `send_*` operations and the observer interface:
//!
//! ```no_run
//! use std::sync::Arc;
//! use sosmesh::{BleTransport, Location, MeshConfig, MeshNode, ScanMode};
//!
//! # async fn run() -> sosmesh::Result<()> {
//! let config = MeshConfig::default();
//! let transport = Arc::new(BleTransport::new(ScanMode::Balanced));
//! let node = MeshNode::new(config, transport);
//!
//! node.start().await?;
//! node.send_sos(
//!     "injured, need help",
//!     Location { lat: 28.61, lng: 77.21 },
//!     "medical",
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod node;
pub mod peers;
pub mod protocol;
pub mod queue;
pub mod routing;
pub mod store;
pub mod transport;

pub use config::{MeshConfig, ScanMode, DEFAULT_NETWORK_KEY};
pub use error::{MeshError, PacketError, Result, TransportError};
pub use events::{DeliveredMessage, MeshEvent, MeshObserver, ObserverId};
pub use node::MeshNode;
pub use peers::{PeerRecord, PeerStatus};
pub use protocol::{InnerRecord, Location, MeshPacket, PacketKind, PeerId};
pub use transport::{Advertisement, BleTransport, MemHub, MemTransport, Transport};
