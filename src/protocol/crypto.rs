//! Payload envelope: AES-128-CBC with PKCS#7 padding.
//!
//! The key is the pre-shared network key truncated or zero-padded to
//! 16 bytes. The IV is the datagram's 16-byte message id, so a relay that
//! re-encrypts with the same id reproduces the original ciphertext.

use aes::Aes128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use serde_json::Value;
use uuid::Uuid;

use crate::error::PacketError;

use super::{InnerRecord, CIPHER_BLOCK_SIZE};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Symmetric cipher for datagram payloads, shared by every node on the
/// network.
#[derive(Clone)]
pub struct PayloadCipher {
    key: [u8; 16],
}

impl PayloadCipher {
    /// Build a cipher from the pre-shared network key. Keys longer than
    /// 16 bytes are truncated, shorter ones zero-padded.
    pub fn new(network_key: &[u8]) -> Self {
        let mut key = [0u8; 16];
        let n = network_key.len().min(16);
        key[..n].copy_from_slice(&network_key[..n]);
        Self { key }
    }

    /// Serialize and encrypt a record under the given message id.
    pub fn encrypt_record(
        &self,
        record: &InnerRecord,
        message_id: &Uuid,
    ) -> Result<Vec<u8>, PacketError> {
        let plaintext = serde_json::to_vec(record)
            .map_err(|e| PacketError::MalformedRecord(e.to_string()))?;
        let iv = message_id.as_bytes();
        let ciphertext = Aes128CbcEnc::new(&self.key.into(), iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(&plaintext);
        Ok(ciphertext)
    }

    /// Decrypt, parse and validate a payload.
    ///
    /// A wrong network key surfaces as `DecryptFailed`: either the padding
    /// is invalid or the plaintext is not JSON. Valid JSON that violates
    /// the per-kind schema is `MalformedRecord`.
    pub fn decrypt_record(
        &self,
        ciphertext: &[u8],
        message_id: &Uuid,
    ) -> Result<InnerRecord, PacketError> {
        if ciphertext.is_empty() {
            return Err(PacketError::MalformedRecord("empty payload".into()));
        }
        if ciphertext.len() % CIPHER_BLOCK_SIZE != 0 {
            return Err(PacketError::DecryptFailed);
        }

        let iv = message_id.as_bytes();
        let plaintext = Aes128CbcDec::new(&self.key.into(), iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| PacketError::DecryptFailed)?;

        let value: Value =
            serde_json::from_slice(&plaintext).map_err(|_| PacketError::DecryptFailed)?;
        let record: InnerRecord = serde_json::from_value(value)
            .map_err(|e| PacketError::MalformedRecord(e.to_string()))?;
        record
            .validate()
            .map_err(PacketError::MalformedRecord)?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Location, BROADCAST_RECIPIENT};

    fn sample_record() -> InnerRecord {
        InnerRecord::Sos {
            sender: "aabbccddeeff".into(),
            recipient: BROADCAST_RECIPIENT.into(),
            content: "need evacuation".into(),
            location: Location { lat: 13.08, lng: 80.27 },
            priority: 5,
            timestamp: 1_700_000_000,
            sos_type: "flood".into(),
        }
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let cipher = PayloadCipher::new(b"DisasterMeshNet!");
        let id = Uuid::new_v4();
        let record = sample_record();

        let ciphertext = cipher.encrypt_record(&record, &id).unwrap();
        assert_eq!(ciphertext.len() % CIPHER_BLOCK_SIZE, 0);
        assert!(!ciphertext.is_empty());

        let decrypted = cipher.decrypt_record(&ciphertext, &id).unwrap();
        assert_eq!(decrypted, record);
    }

    #[test]
    fn same_id_reproduces_ciphertext() {
        // Relays re-encrypt under the original message id; the bytes on the
        // wire must not change or the CRC-covered payload would drift.
        let cipher = PayloadCipher::new(b"DisasterMeshNet!");
        let id = Uuid::new_v4();
        let record = sample_record();

        let a = cipher.encrypt_record(&record, &id).unwrap();
        let b = cipher.encrypt_record(&record, &id).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn wrong_key_fails_decrypt() {
        let good = PayloadCipher::new(b"DisasterMeshNet!");
        let bad = PayloadCipher::new(b"SomeOtherKey0000");
        let id = Uuid::new_v4();

        let ciphertext = good.encrypt_record(&sample_record(), &id).unwrap();
        assert_eq!(
            bad.decrypt_record(&ciphertext, &id),
            Err(PacketError::DecryptFailed)
        );
    }

    #[test]
    fn short_key_is_zero_padded() {
        let short = PayloadCipher::new(b"abc");
        let padded = PayloadCipher::new(b"abc\0\0\0\0\0\0\0\0\0\0\0\0\0");
        let id = Uuid::new_v4();
        let record = sample_record();

        let ciphertext = short.encrypt_record(&record, &id).unwrap();
        assert_eq!(padded.decrypt_record(&ciphertext, &id).unwrap(), record);
    }

    #[test]
    fn ragged_ciphertext_fails_decrypt() {
        let cipher = PayloadCipher::new(b"DisasterMeshNet!");
        let id = Uuid::new_v4();
        let mut ciphertext = cipher.encrypt_record(&sample_record(), &id).unwrap();
        ciphertext.pop();
        assert_eq!(
            cipher.decrypt_record(&ciphertext, &id),
            Err(PacketError::DecryptFailed)
        );
    }

    #[test]
    fn empty_payload_is_schema_invalid() {
        let cipher = PayloadCipher::new(b"DisasterMeshNet!");
        assert!(matches!(
            cipher.decrypt_record(&[], &Uuid::new_v4()),
            Err(PacketError::MalformedRecord(_))
        ));
    }
}
