//! Error types for the mesh node.

use thiserror::Error;

use crate::protocol::PeerId;

/// Result type alias for node-level operations.
pub type Result<T> = std::result::Result<T, MeshError>;

/// Top-level error for the public node API.
#[derive(Error, Debug)]
pub enum MeshError {
    /// `start()` was called on a node that is already running.
    #[error("node is already running")]
    AlreadyRunning,

    /// A send was attempted before `start()` (or after `stop()`).
    #[error("node is not running")]
    NotRunning,

    /// The recipient string is not a 12-hex-digit peer id.
    #[error("invalid recipient: {0:?}")]
    InvalidRecipient(String),

    /// The radio stack could not be initialized.
    #[error("radio unavailable: {0}")]
    RadioUnavailable(String),

    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Wire codec failures. Each of these is non-fatal: the routing engine
/// counts the failure and silently drops the datagram.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Fewer bytes than header + checksum, or a header field that cannot
    /// exist on the wire (e.g. a relay with hop count zero).
    #[error("malformed header")]
    MalformedHeader,

    #[error("checksum mismatch")]
    BadChecksum,

    #[error("unknown packet kind: {0:#04x}")]
    UnknownKind(u8),

    #[error("declared payload length inconsistent with datagram size")]
    LengthMismatch,

    /// Ciphertext is not a positive multiple of the block size, or the
    /// plaintext failed to unpad or parse. Wrong network keys land here.
    #[error("payload decryption failed")]
    DecryptFailed,

    /// The decrypted record is valid JSON but violates the per-kind schema.
    #[error("malformed inner record: {0}")]
    MalformedRecord(String),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

/// Radio transport failures.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("radio unavailable: {0}")]
    RadioUnavailable(String),

    #[error("transport not started")]
    NotStarted,

    #[error("peer {0} is not connected")]
    NotConnected(PeerId),

    #[error("send to {peer} failed: {reason}")]
    SendFailed { peer: PeerId, reason: String },

    #[error("send to {peer} timed out")]
    SendTimeout { peer: PeerId },
}
