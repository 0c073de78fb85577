//! Inner record schema: the plaintext carried inside the encrypted payload.
//!
//! The record is JSON, tagged by `"type"`, with a fixed field set per kind.
//! Sender and recipient appear here *and* in the clear header: routing
//! decisions use the header, message semantics use the record.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{PacketKind, PeerId, BROADCAST_RECIPIENT};

/// Latitude/longitude pair attached to SOS records.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
}

fn ack_priority() -> u8 {
    2
}

/// Decrypted message record. Relay datagrams carry the record of the kind
/// that originated them, so there is no relay variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InnerRecord {
    #[serde(rename = "SOS")]
    Sos {
        sender: String,
        recipient: String,
        content: String,
        location: Location,
        priority: u8,
        timestamp: u64,
        #[serde(rename = "sosType")]
        sos_type: String,
    },
    #[serde(rename = "DIRECT")]
    Direct {
        sender: String,
        recipient: String,
        content: String,
        priority: u8,
        timestamp: u64,
    },
    #[serde(rename = "ACK")]
    Ack {
        sender: String,
        recipient: String,
        #[serde(rename = "originalMessageId")]
        original_message_id: String,
        #[serde(default = "ack_priority")]
        priority: u8,
        timestamp: u64,
    },
}

impl InnerRecord {
    /// The datagram kind this record originates as.
    pub fn kind(&self) -> PacketKind {
        match self {
            Self::Sos { .. } => PacketKind::Sos,
            Self::Direct { .. } => PacketKind::Direct,
            Self::Ack { .. } => PacketKind::Ack,
        }
    }

    pub fn sender(&self) -> &str {
        match self {
            Self::Sos { sender, .. } | Self::Direct { sender, .. } | Self::Ack { sender, .. } => {
                sender
            }
        }
    }

    pub fn recipient(&self) -> &str {
        match self {
            Self::Sos { recipient, .. }
            | Self::Direct { recipient, .. }
            | Self::Ack { recipient, .. } => recipient,
        }
    }

    pub fn priority(&self) -> u8 {
        match self {
            Self::Sos { priority, .. }
            | Self::Direct { priority, .. }
            | Self::Ack { priority, .. } => *priority,
        }
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            Self::Sos { content, .. } | Self::Direct { content, .. } => Some(content),
            Self::Ack { .. } => None,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient() == BROADCAST_RECIPIENT
    }

    /// Check the per-kind schema constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        let priority = self.priority();
        if !(1..=5).contains(&priority) {
            return Err(format!("priority {priority} outside 1..=5"));
        }
        if PeerId::parse(self.sender()).is_none() {
            return Err(format!("sender {:?} is not a peer id", self.sender()));
        }
        let recipient = self.recipient();
        if recipient != BROADCAST_RECIPIENT && PeerId::parse(recipient).is_none() {
            return Err(format!("recipient {recipient:?} is not a peer id"));
        }
        if let Self::Ack {
            original_message_id,
            ..
        } = self
        {
            if Uuid::parse_str(original_message_id).is_err() {
                return Err(format!(
                    "originalMessageId {original_message_id:?} is not a UUID"
                ));
            }
        }
        Ok(())
    }
}
