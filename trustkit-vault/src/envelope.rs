//! On-disk envelope format.

use serde::{Deserialize, Serialize};

use crate::error::VaultError;

const ENVELOPE_VERSION: u32 = 1;

/// A sealed vault entry as persisted by the backend.
///
/// The data key that sealed `ciphertext` is itself stored here, wrapped by
/// the vault master key. Envelopes are CBOR encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultEnvelope {
    /// Envelope format version.
    pub version: u32,
    /// 12-byte GCM nonce.
    pub iv: Vec<u8>,
    /// AES-256-GCM ciphertext with the tag appended.
    pub ciphertext: Vec<u8>,
    /// The per-entry data key, wrapped with RSA-OAEP(SHA-256).
    pub wrapped_data_key: Vec<u8>,
    /// Unix epoch milliseconds at sealing time.
    pub created_at: u64,
}

impl VaultEnvelope {
    /// Creates a version-tagged envelope.
    #[must_use]
    pub fn new(iv: Vec<u8>, ciphertext: Vec<u8>, wrapped_data_key: Vec<u8>, created_at: u64) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            iv,
            ciphertext,
            wrapped_data_key,
            created_at,
        }
    }

    /// Encodes the envelope to CBOR.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Serialization`] if encoding fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, VaultError> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|err| VaultError::Serialization(err.to_string()))?;
        Ok(bytes)
    }

    /// Decodes an envelope from CBOR, rejecting unknown versions.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::Serialization`] on malformed bytes or an
    /// unsupported version.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, VaultError> {
        let envelope: Self = ciborium::de::from_reader(bytes)
            .map_err(|err| VaultError::Serialization(err.to_string()))?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(VaultError::Serialization(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let envelope = VaultEnvelope::new(vec![1; 12], vec![2; 48], vec![3; 256], 1234);
        let bytes = envelope.to_bytes().expect("encode");
        let decoded = VaultEnvelope::from_bytes(&bytes).expect("decode");
        assert_eq!(decoded.version, ENVELOPE_VERSION);
        assert_eq!(decoded.iv, vec![1; 12]);
        assert_eq!(decoded.ciphertext, vec![2; 48]);
        assert_eq!(decoded.created_at, 1234);
    }

    #[test]
    fn test_unknown_version_rejected() {
        let mut envelope = VaultEnvelope::new(vec![], vec![], vec![], 0);
        envelope.version = 99;
        let bytes = envelope.to_bytes().expect("encode");
        assert!(matches!(
            VaultEnvelope::from_bytes(&bytes),
            Err(VaultError::Serialization(_))
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(VaultEnvelope::from_bytes(b"not cbor").is_err());
    }
}
