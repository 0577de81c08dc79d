use thiserror::Error;
use trustkit_core::TrustError;

/// Error outputs from the vault.
#[derive(Debug, Error)]
pub enum VaultError {
    /// The storage backend failed to read, write or delete an entry.
    #[error("backend_error: {0}")]
    Backend(String),
    /// An envelope could not be encoded or decoded.
    #[error("serialization_error: {0}")]
    Serialization(String),
    /// A cryptographic operation failed for a reason other than an
    /// authentication mismatch.
    #[error("crypto_error: {0}")]
    Crypto(String),
    /// The vault master key is missing or unusable.
    #[error("key_unavailable: {0}")]
    KeyUnavailable(String),
    /// Authentication failed while opening an entry. The entry was written
    /// under different key material or has been tampered with; no partial
    /// plaintext is returned.
    #[error("decryption_failed")]
    DecryptionFailed,
    /// The requested entry does not exist.
    #[error("not_found: {0}")]
    NotFound(String),
}

impl From<TrustError> for VaultError {
    fn from(err: TrustError) -> Self {
        match err {
            TrustError::DecryptionFailed => Self::DecryptionFailed,
            TrustError::KeyUnavailable(reason) => Self::KeyUnavailable(reason),
            TrustError::Storage(reason) => Self::Backend(reason),
            TrustError::Serialization(reason) => Self::Serialization(reason),
            other => Self::Crypto(other.to_string()),
        }
    }
}
