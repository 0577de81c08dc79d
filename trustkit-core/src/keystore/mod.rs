//! Hardware-backed key custody abstraction.
//!
//! The protocol layers address keys by alias and never see private or
//! secret key material: signing, agreement and unwrapping all happen
//! behind this trait. Platform integrations (secure enclave, TPM-backed
//! store) implement it; [`SoftwareKeystore`] is the in-process fallback
//! used in tests and on platforms without a hardware store.

mod software;
pub use software::SoftwareKeystore;

use zeroize::Zeroizing;

use crate::error::TrustError;

/// Alias-addressed key store. Implementations must be safely callable from
/// multiple threads; the SDK adds no locking of its own around key
/// generation or retrieval.
pub trait KeyCustody: Send + Sync {
    /// Generates a random 256-bit secret key under `alias`, replacing any
    /// existing key.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store refuses the operation.
    fn generate_secret_key(&self, alias: &str) -> Result<(), TrustError>;

    /// Imports externally supplied secret key material under `alias`.
    ///
    /// # Errors
    ///
    /// Returns an error if the material is empty or storage fails.
    fn import_secret_key(&self, alias: &str, material: &[u8]) -> Result<(), TrustError>;

    /// Computes HMAC-SHA256 over `data` with the secret key stored under
    /// `alias`. The key never leaves the custody boundary.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::KeyUnavailable`] if no secret key exists under
    /// `alias`.
    fn hmac_sha256(&self, alias: &str, data: &[u8]) -> Result<[u8; 32], TrustError>;

    /// Generates a P-256 key pair under `alias` and returns the public key
    /// as X.509 SPKI DER.
    ///
    /// # Errors
    ///
    /// Returns an error if generation or encoding fails.
    fn generate_p256_key_pair(&self, alias: &str) -> Result<Vec<u8>, TrustError>;

    /// Performs ECDH agreement between the private key under `alias` and a
    /// peer public key in X.509 SPKI DER form, returning the raw shared
    /// secret.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::KeyUnavailable`] if no key pair exists under
    /// `alias`, or [`TrustError::InvalidInput`] if the peer key does not
    /// parse.
    fn ecdh_agree(
        &self,
        alias: &str,
        peer_public_spki: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, TrustError>;

    /// Generates an RSA-2048 key pair under `alias`, replacing any existing
    /// key.
    ///
    /// # Errors
    ///
    /// Returns an error if generation fails.
    fn generate_rsa_key_pair(&self, alias: &str) -> Result<(), TrustError>;

    /// Wraps `data_key` with RSA-OAEP(SHA-256) under the public half of the
    /// key pair stored at `alias`.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::KeyUnavailable`] if no RSA key exists under
    /// `alias`.
    fn rsa_wrap(&self, alias: &str, data_key: &[u8]) -> Result<Vec<u8>, TrustError>;

    /// Unwraps a data key previously wrapped by [`KeyCustody::rsa_wrap`].
    /// The private key never leaves the custody boundary.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::KeyUnavailable`] if no RSA key exists under
    /// `alias`, or [`TrustError::DecryptionFailed`] if unwrapping fails.
    fn rsa_unwrap(
        &self,
        alias: &str,
        wrapped: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, TrustError>;

    /// Reports whether any key exists under `alias`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be queried.
    fn contains(&self, alias: &str) -> Result<bool, TrustError>;

    /// Deletes the key under `alias`, returning whether one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store refuses the deletion.
    fn delete(&self, alias: &str) -> Result<bool, TrustError>;
}
