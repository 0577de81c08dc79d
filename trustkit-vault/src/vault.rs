//! The vault itself.

use std::sync::Arc;

use log::{debug, info, warn};
use serde::{de::DeserializeOwned, Serialize};
use zeroize::Zeroizing;

use trustkit_core::{
    crypto::{aes256_gcm_decrypt, aes256_gcm_encrypt, random_bytes},
    keystore::KeyCustody,
};

use crate::{
    backend::VaultBackend,
    envelope::VaultEnvelope,
    error::VaultError,
};

/// Key custody alias of the vault's RSA master key.
pub const MASTER_KEY_ALIAS: &str = "trustkit.vault.master";

/// Envelope-encrypted key-value store.
///
/// Entry keys double as associated data: an envelope copied to a different
/// key fails authentication instead of decrypting under the wrong name.
pub struct SecureVault {
    custody: Arc<dyn KeyCustody>,
    backend: Box<dyn VaultBackend>,
}

impl SecureVault {
    /// Opens a vault over the given custody and backend.
    #[must_use]
    pub fn new(custody: Arc<dyn KeyCustody>, backend: Box<dyn VaultBackend>) -> Self {
        Self { custody, backend }
    }

    /// Seals `plaintext` under `key`, replacing any existing entry.
    ///
    /// The first store generates the RSA master key; on hardware-backed
    /// custody implementations this can take a moment.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::KeyUnavailable`] if the master key cannot be
    /// created or used, or [`VaultError::Backend`] if persistence fails.
    pub fn store(&self, key: &str, plaintext: &[u8]) -> Result<(), VaultError> {
        self.ensure_master_key()?;

        let data_key = Zeroizing::new(random_bytes::<32>());
        let (ciphertext, iv) = aes256_gcm_encrypt(&data_key, plaintext, key.as_bytes())?;
        let wrapped = self.custody.rsa_wrap(MASTER_KEY_ALIAS, data_key.as_slice())?;

        let envelope = VaultEnvelope::new(iv.to_vec(), ciphertext, wrapped, now_ms());
        self.backend.write_atomic(key, &envelope.to_bytes()?)?;
        debug!("vault entry {key} sealed");
        Ok(())
    }

    /// Opens the entry under `key`.
    ///
    /// # Errors
    ///
    /// - [`VaultError::NotFound`] if no entry exists.
    /// - [`VaultError::DecryptionFailed`] if authentication fails.
    /// - [`VaultError::KeyUnavailable`] if the master key is gone; the
    ///   entry is then permanently unreadable.
    pub fn retrieve(&self, key: &str) -> Result<Vec<u8>, VaultError> {
        let bytes = self
            .backend
            .read(key)?
            .ok_or_else(|| VaultError::NotFound(key.to_string()))?;
        let envelope = VaultEnvelope::from_bytes(&bytes)?;

        let data_key = self
            .custody
            .rsa_unwrap(MASTER_KEY_ALIAS, &envelope.wrapped_data_key)?;
        let data_key: Zeroizing<[u8; 32]> = Zeroizing::new(
            data_key
                .as_slice()
                .try_into()
                .map_err(|_| VaultError::DecryptionFailed)?,
        );
        let plaintext = aes256_gcm_decrypt(
            &data_key,
            &envelope.iv,
            &envelope.ciphertext,
            key.as_bytes(),
        )?;
        Ok(plaintext)
    }

    /// Serializes `value` as JSON and seals it under `key`.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::store`], plus
    /// [`VaultError::Serialization`] if the value does not serialize.
    pub fn store_value<T: Serialize>(&self, key: &str, value: &T) -> Result<(), VaultError> {
        let json = serde_json::to_vec(value)
            .map_err(|err| VaultError::Serialization(err.to_string()))?;
        self.store(key, &json)
    }

    /// Opens the entry under `key` and deserializes it from JSON.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::retrieve`], plus
    /// [`VaultError::Serialization`] if the plaintext does not parse.
    pub fn retrieve_value<T: DeserializeOwned>(&self, key: &str) -> Result<T, VaultError> {
        let plaintext = self.retrieve(key)?;
        serde_json::from_slice(&plaintext)
            .map_err(|err| VaultError::Serialization(err.to_string()))
    }

    /// Reports whether an entry exists under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    pub fn exists(&self, key: &str) -> Result<bool, VaultError> {
        Ok(self.backend.read(key)?.is_some())
    }

    /// Deletes the entry under `key`, returning whether one existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails.
    pub fn remove(&self, key: &str) -> Result<bool, VaultError> {
        self.backend.delete(key)
    }

    /// Lists the keys of all stored entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    pub fn list_keys(&self) -> Result<Vec<String>, VaultError> {
        self.backend.list()
    }

    /// Deletes every entry and the master key. Entries sealed before the
    /// clear are unrecoverable afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if any entry cannot be deleted; deletion continues
    /// past individual failures and the first error is returned.
    pub fn clear(&self) -> Result<(), VaultError> {
        info!("clearing vault");
        let mut first_error = None;
        for key in self.backend.list()? {
            if let Err(err) = self.backend.delete(&key) {
                warn!("failed to delete vault entry {key}: {err}");
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
        }
        if let Err(err) = self.custody.delete(MASTER_KEY_ALIAS) {
            warn!("failed to delete vault master key: {err}");
            if first_error.is_none() {
                first_error = Some(err.into());
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn ensure_master_key(&self) -> Result<(), VaultError> {
        if !self.custody.contains(MASTER_KEY_ALIAS)? {
            info!("generating vault master key");
            self.custody.generate_rsa_key_pair(MASTER_KEY_ALIAS)?;
        }
        Ok(())
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
