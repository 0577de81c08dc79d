//! Stateless cryptographic primitives.
//!
//! Everything here operates on caller-supplied key material; keys held by
//! the platform key store are used through [`crate::keystore::KeyCustody`]
//! instead.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key, Nonce,
};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::TrustError;

type HmacSha256 = Hmac<Sha256>;

/// AES-GCM IV size in bytes (96 bits, as recommended for GCM).
pub const GCM_IV_SIZE: usize = 12;

/// Computes HMAC-SHA256 over `data` with `key`.
///
/// # Errors
///
/// Returns an error if the MAC cannot be initialized.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], TrustError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|err| TrustError::Crypto(err.to_string()))?;
    mac.update(data);
    let digest = mac.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// Returns the hex-encoded SHA-256 digest of `data`.
#[must_use]
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Returns the raw SHA-256 digest of `data`.
#[must_use]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Encrypts `plaintext` with AES-256-GCM under a fresh random 96-bit IV.
///
/// The authentication tag is appended to the returned ciphertext. The IV is
/// never reused under the same key because it is drawn from the OS RNG per
/// call.
///
/// # Errors
///
/// Returns an error if encryption fails.
pub fn aes256_gcm_encrypt(
    key: &[u8; 32],
    plaintext: &[u8],
    associated_data: &[u8],
) -> Result<(Vec<u8>, [u8; GCM_IV_SIZE]), TrustError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut iv = [0u8; GCM_IV_SIZE];
    OsRng.fill_bytes(&mut iv);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&iv),
            Payload {
                msg: plaintext,
                aad: associated_data,
            },
        )
        .map_err(|err| TrustError::Crypto(err.to_string()))?;
    Ok((ciphertext, iv))
}

/// Decrypts AES-256-GCM ciphertext produced by [`aes256_gcm_encrypt`].
///
/// Fails closed: any tag or associated-data mismatch returns
/// [`TrustError::DecryptionFailed`] and no partial plaintext.
///
/// # Errors
///
/// Returns [`TrustError::DecryptionFailed`] on any authentication failure.
pub fn aes256_gcm_decrypt(
    key: &[u8; 32],
    iv: &[u8],
    ciphertext: &[u8],
    associated_data: &[u8],
) -> Result<Vec<u8>, TrustError> {
    if iv.len() != GCM_IV_SIZE {
        return Err(TrustError::DecryptionFailed);
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(iv),
            Payload {
                msg: ciphertext,
                aad: associated_data,
            },
        )
        .map_err(|_| TrustError::DecryptionFailed)
}

/// Fills an array of `N` bytes from the OS RNG.
#[must_use]
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// Generates a 128-bit random nonce, hex encoded.
#[must_use]
pub fn random_nonce_hex() -> String {
    hex::encode(random_bytes::<16>())
}

/// Constant-time byte equality; never short-circuits.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
