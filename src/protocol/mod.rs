//! Binary mesh protocol: wire format, inner records, payload crypto.
//!
//! A datagram is a 32-byte big-endian header, a 2-byte CRC-16-CCITT over the
//! header and ciphertext, and an AES-128-CBC encrypted JSON record. Total
//! on-wire size never exceeds the 512-byte radio MTU ceiling.

mod crypto;
mod packet;
mod record;

pub use crypto::PayloadCipher;
pub use packet::{crc16_ccitt, MeshPacket, PacketKind};
pub use record::{InnerRecord, Location};

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Protocol version carried in byte 0 of every header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Header size in bytes (checksum excluded).
pub const HEADER_SIZE: usize = 32;

/// CRC field size in bytes.
pub const CRC_SIZE: usize = 2;

/// Maximum ciphertext payload per datagram (512-byte MTU minus framing).
pub const MAX_PAYLOAD_SIZE: usize = 478;

/// Block size of the payload cipher; ciphertexts are positive multiples.
pub const CIPHER_BLOCK_SIZE: usize = 16;

/// Recipient sentinel meaning any-and-all nodes should deliver.
pub const BROADCAST_RECIPIENT: &str = "broadcast";

/// Six-byte node identifier. The originator's id travels in the clear
/// header; hex renderings of it appear inside the encrypted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 6]);

impl PeerId {
    pub const LEN: usize = 6;

    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Generate a random id for a node's first start.
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 6] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Parse a 12-hex-digit id, as it appears in inner records.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != 12 || !s.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 6];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            bytes[i] = ((hi << 4) | lo) as u8;
        }
        Some(Self(bytes))
    }

    /// Lowercase hex rendering used in record `sender`/`recipient` fields.
    pub fn to_hex(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PeerId::parse(&s).ok_or_else(|| serde::de::Error::custom("expected 12 hex digits"))
    }
}
