//! In-process software key store.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use p256::{
    ecdh,
    pkcs8::{DecodePublicKey, EncodePublicKey},
    PublicKey, SecretKey,
};
use rand::rngs::OsRng;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use zeroize::Zeroizing;

use super::KeyCustody;
use crate::{crypto, error::TrustError};

const RSA_KEY_BITS: usize = 2048;

enum KeyEntry {
    Secret(Zeroizing<Vec<u8>>),
    P256(SecretKey),
    Rsa(Box<RsaPrivateKey>),
}

/// Software fallback implementation of [`KeyCustody`].
///
/// Keys live in process memory only and are zeroized on drop. Suitable for
/// tests and platforms without a hardware-backed store; it intentionally
/// mirrors the platform store contract so protocol code cannot tell the
/// difference.
pub struct SoftwareKeystore {
    entries: Mutex<HashMap<String, KeyEntry>>,
}

impl SoftwareKeystore {
    /// Creates an empty keystore.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, KeyEntry>>, TrustError> {
        self.entries
            .lock()
            .map_err(|_| TrustError::KeyUnavailable("keystore mutex poisoned".to_string()))
    }
}

impl Default for SoftwareKeystore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyCustody for SoftwareKeystore {
    fn generate_secret_key(&self, alias: &str) -> Result<(), TrustError> {
        let material = crypto::random_bytes::<32>();
        self.lock()?.insert(
            alias.to_string(),
            KeyEntry::Secret(Zeroizing::new(material.to_vec())),
        );
        Ok(())
    }

    fn import_secret_key(&self, alias: &str, material: &[u8]) -> Result<(), TrustError> {
        if material.is_empty() {
            return Err(TrustError::InvalidInput(
                "secret key material is empty".to_string(),
            ));
        }
        self.lock()?.insert(
            alias.to_string(),
            KeyEntry::Secret(Zeroizing::new(material.to_vec())),
        );
        Ok(())
    }

    fn hmac_sha256(&self, alias: &str, data: &[u8]) -> Result<[u8; 32], TrustError> {
        let guard = self.lock()?;
        match guard.get(alias) {
            Some(KeyEntry::Secret(material)) => crypto::hmac_sha256(material, data),
            _ => Err(TrustError::KeyUnavailable(format!(
                "no secret key under alias {alias}"
            ))),
        }
    }

    fn generate_p256_key_pair(&self, alias: &str) -> Result<Vec<u8>, TrustError> {
        let secret = SecretKey::random(&mut OsRng);
        let spki = secret
            .public_key()
            .to_public_key_der()
            .map_err(|err| TrustError::Crypto(err.to_string()))?
            .as_bytes()
            .to_vec();
        self.lock()?
            .insert(alias.to_string(), KeyEntry::P256(secret));
        Ok(spki)
    }

    fn ecdh_agree(
        &self,
        alias: &str,
        peer_public_spki: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, TrustError> {
        let peer = PublicKey::from_public_key_der(peer_public_spki).map_err(|err| {
            TrustError::InvalidInput(format!("invalid peer public key: {err}"))
        })?;
        let guard = self.lock()?;
        match guard.get(alias) {
            Some(KeyEntry::P256(secret)) => {
                let shared =
                    ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
                Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
            }
            _ => Err(TrustError::KeyUnavailable(format!(
                "no EC key pair under alias {alias}"
            ))),
        }
    }

    fn generate_rsa_key_pair(&self, alias: &str) -> Result<(), TrustError> {
        let key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
            .map_err(|err| TrustError::Crypto(err.to_string()))?;
        self.lock()?
            .insert(alias.to_string(), KeyEntry::Rsa(Box::new(key)));
        Ok(())
    }

    fn rsa_wrap(&self, alias: &str, data_key: &[u8]) -> Result<Vec<u8>, TrustError> {
        let guard = self.lock()?;
        match guard.get(alias) {
            Some(KeyEntry::Rsa(key)) => {
                let public = RsaPublicKey::from(key.as_ref());
                public
                    .encrypt(&mut OsRng, Oaep::new::<Sha256>(), data_key)
                    .map_err(|err| TrustError::Crypto(err.to_string()))
            }
            _ => Err(TrustError::KeyUnavailable(format!(
                "no RSA key pair under alias {alias}"
            ))),
        }
    }

    fn rsa_unwrap(
        &self,
        alias: &str,
        wrapped: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, TrustError> {
        let guard = self.lock()?;
        match guard.get(alias) {
            Some(KeyEntry::Rsa(key)) => key
                .decrypt(Oaep::new::<Sha256>(), wrapped)
                .map(Zeroizing::new)
                .map_err(|_| TrustError::DecryptionFailed),
            _ => Err(TrustError::KeyUnavailable(format!(
                "no RSA key pair under alias {alias}"
            ))),
        }
    }

    fn contains(&self, alias: &str) -> Result<bool, TrustError> {
        Ok(self.lock()?.contains_key(alias))
    }

    fn delete(&self, alias: &str) -> Result<bool, TrustError> {
        Ok(self.lock()?.remove(alias).is_some())
    }
}
