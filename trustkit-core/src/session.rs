//! Session establishment via ECDH key exchange.
//!
//! A session is negotiated by generating an ephemeral P-256 key pair,
//! exchanging public keys with the backend, and deriving a symmetric
//! session key as `SHA-256(shared secret)`. The ephemeral private key is
//! deleted from custody the moment the session key is derived; the derived
//! key lives only in memory and is zeroized on drop.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::{
    error::TrustError,
    keystore::KeyCustody,
    provisioning::now_ms,
    state::StateStore,
};

const SESSION_ALIAS_PREFIX: &str = "trustkit.session.ecdh.";
const SESSION_POINTER: &str = "session_pointer";
const KEY_EXCHANGE_ALGORITHM: &str = "ECDH-P256";

/// Body of the key-exchange request sent to the backend.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyExchangeRequest {
    /// Base64 DER (SPKI) encoding of the client's ephemeral public key.
    pub client_public_key: String,
    /// Client-proposed session identifier.
    pub session_id: String,
    /// Key agreement algorithm identifier.
    pub algorithm: String,
}

/// Body of the key-exchange response returned by the backend.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyExchangeResponse {
    /// Base64 DER (SPKI) encoding of the server's ephemeral public key.
    pub server_public_key: String,
    /// Session identifier confirmed by the server.
    pub session_id: String,
    /// Key agreement algorithm identifier; must match the request.
    pub algorithm: String,
    /// Session expiry as Unix epoch milliseconds.
    pub expires_at: u64,
}

/// Non-secret session pointer persisted across restarts so the host can
/// tell an expired session from a never-established one. The key itself
/// is never persisted; after a restart the session must be renegotiated.
#[derive(Debug, Serialize, Deserialize)]
struct SessionPointer {
    session_id: String,
    expires_at: u64,
}

struct ActiveSession {
    session_id: String,
    key: Zeroizing<[u8; 32]>,
    expires_at: u64,
}

/// Negotiates and holds the symmetric session key.
pub struct SessionManager {
    custody: Arc<dyn KeyCustody>,
    store: Arc<dyn StateStore>,
    current: std::sync::Mutex<Option<ActiveSession>>,
    pending: std::sync::Mutex<Option<String>>,
    refresh_threshold: Duration,
}

impl SessionManager {
    /// Creates a session manager with the given refresh threshold.
    #[must_use]
    pub fn new(
        custody: Arc<dyn KeyCustody>,
        store: Arc<dyn StateStore>,
        refresh_threshold: Duration,
    ) -> Self {
        Self {
            custody,
            store,
            current: std::sync::Mutex::new(None),
            pending: std::sync::Mutex::new(None),
            refresh_threshold,
        }
    }

    /// Starts a key exchange: generates an ephemeral P-256 key pair under a
    /// fresh session alias and returns the request to send to the backend.
    ///
    /// A previous pending exchange, if any, is discarded and its ephemeral
    /// key deleted.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::KeyUnavailable`] if key generation fails.
    pub fn initiate_key_exchange(&self) -> Result<KeyExchangeRequest, TrustError> {
        self.discard_pending();

        let session_id = Uuid::new_v4().simple().to_string();
        let alias = format!("{SESSION_ALIAS_PREFIX}{session_id}");
        let public_key_der = self.custody.generate_p256_key_pair(&alias)?;
        debug!("initiated key exchange for session {session_id}");

        if let Ok(mut pending) = self.pending.lock() {
            *pending = Some(session_id.clone());
        }
        Ok(KeyExchangeRequest {
            client_public_key: BASE64.encode(public_key_der),
            session_id,
            algorithm: KEY_EXCHANGE_ALGORITHM.to_string(),
        })
    }

    /// Completes the exchange: derives the session key from the server's
    /// public key and the pending ephemeral key, deletes the ephemeral key,
    /// and activates the session.
    ///
    /// # Errors
    ///
    /// - [`TrustError::SessionAbsent`] if no exchange is pending.
    /// - [`TrustError::InvalidInput`] on an algorithm mismatch or an
    ///   undecodable server key.
    /// - [`TrustError::KeyUnavailable`] if the agreement fails.
    pub fn establish_session(&self, response: &KeyExchangeResponse) -> Result<(), TrustError> {
        let pending_id = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.take())
            .ok_or(TrustError::SessionAbsent)?;
        let alias = format!("{SESSION_ALIAS_PREFIX}{pending_id}");

        let result = self.derive_session(&alias, response);
        // The ephemeral private key is single use, success or not.
        if let Err(err) = self.custody.delete(&alias) {
            warn!("failed to delete ephemeral session key: {err}");
        }
        let key = result?;

        let pointer = SessionPointer {
            session_id: response.session_id.clone(),
            expires_at: response.expires_at,
        };
        if let Err(err) = self.persist_pointer(&pointer) {
            warn!("failed to persist session pointer: {err}");
        }

        if let Ok(mut current) = self.current.lock() {
            *current = Some(ActiveSession {
                session_id: response.session_id.clone(),
                key,
                expires_at: response.expires_at,
            });
        }
        info!("session {} established", response.session_id);
        Ok(())
    }

    fn derive_session(
        &self,
        alias: &str,
        response: &KeyExchangeResponse,
    ) -> Result<Zeroizing<[u8; 32]>, TrustError> {
        if response.algorithm != KEY_EXCHANGE_ALGORITHM {
            return Err(TrustError::InvalidInput(format!(
                "unexpected key exchange algorithm {}",
                response.algorithm
            )));
        }
        let server_key_der = BASE64.decode(&response.server_public_key).map_err(|err| {
            TrustError::InvalidInput(format!("server public key is not valid base64: {err}"))
        })?;

        let shared_secret = self.custody.ecdh_agree(alias, &server_key_der)?;
        let digest = Sha256::digest(shared_secret.as_slice());
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&digest);
        Ok(key)
    }

    /// Returns the current session key, or [`TrustError::SessionAbsent`]
    /// if no unexpired session is active.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::SessionAbsent`] when no session is active or
    /// the active session has expired.
    pub fn session_key(&self) -> Result<Zeroizing<[u8; 32]>, TrustError> {
        let mut guard = self
            .current
            .lock()
            .map_err(|_| TrustError::SessionAbsent)?;
        match guard.as_ref() {
            Some(session) if session.expires_at > now_ms() => {
                Ok(Zeroizing::new(*session.key))
            }
            Some(_) => {
                debug!("session expired; dropping key");
                *guard = None;
                Err(TrustError::SessionAbsent)
            }
            None => Err(TrustError::SessionAbsent),
        }
    }

    /// Returns the active session id, if an unexpired session exists.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.with_active(|session| session.session_id.clone())
    }

    /// Reports whether an unexpired session is active.
    #[must_use]
    pub fn has_active_session(&self) -> bool {
        self.with_active(|_| ()).is_some()
    }

    /// Time remaining until the active session expires, if one is active.
    #[must_use]
    pub fn session_remaining(&self) -> Option<Duration> {
        self.with_active(|session| {
            Duration::from_millis(session.expires_at.saturating_sub(now_ms()))
        })
    }

    /// Reports whether the active session is inside the refresh threshold:
    /// still valid, but close enough to expiry that the host should
    /// renegotiate. An absent or expired session does not need refresh, it
    /// needs establishment.
    #[must_use]
    pub fn needs_refresh(&self) -> bool {
        self.session_remaining()
            .is_some_and(|remaining| {
                remaining > Duration::ZERO && remaining <= self.refresh_threshold
            })
    }

    /// Returns the session pointer persisted by a previous process, as
    /// `(session_id, expires_at_ms)`. The key itself is never persisted,
    /// so after a restart this only tells the host whether negotiation
    /// replaces a session that was live or starts the first one.
    #[must_use]
    pub fn persisted_session(&self) -> Option<(String, u64)> {
        let bytes = self.store.read(SESSION_POINTER).ok()??;
        let pointer: SessionPointer = ciborium::de::from_reader(bytes.as_slice()).ok()?;
        Some((pointer.session_id, pointer.expires_at))
    }

    /// Abandons a pending key exchange without touching the active
    /// session: deletes the pending ephemeral key, leaves the current key
    /// and persisted pointer alone. A rotation only supersedes the
    /// previous session once it is established; a rejected exchange must
    /// not cost the caller a session that still works.
    pub fn abandon_pending_exchange(&self) {
        self.discard_pending();
    }

    /// Drops the active session and any pending exchange.
    pub fn clear_session(&self) {
        self.discard_pending();
        if let Ok(mut current) = self.current.lock() {
            *current = None;
        }
        if let Err(err) = self.store.delete(SESSION_POINTER) {
            warn!("failed to delete session pointer: {err}");
        }
        debug!("session cleared");
    }

    fn with_active<T>(&self, f: impl FnOnce(&ActiveSession) -> T) -> Option<T> {
        let mut guard = self.current.lock().ok()?;
        match guard.as_ref() {
            Some(session) if session.expires_at > now_ms() => Some(f(session)),
            Some(_) => {
                *guard = None;
                None
            }
            None => None,
        }
    }

    fn discard_pending(&self) {
        let Ok(mut pending) = self.pending.lock() else {
            return;
        };
        if let Some(session_id) = pending.take() {
            let alias = format!("{SESSION_ALIAS_PREFIX}{session_id}");
            if let Err(err) = self.custody.delete(&alias) {
                warn!("failed to delete stale ephemeral key: {err}");
            }
        }
    }

    fn persist_pointer(&self, pointer: &SessionPointer) -> Result<(), TrustError> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(pointer, &mut bytes)
            .map_err(|err| TrustError::Serialization(err.to_string()))?;
        self.store.write_atomic(SESSION_POINTER, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{keystore::SoftwareKeystore, state::MemoryStateStore};
    use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
    use p256::SecretKey;
    use rand::rngs::OsRng;

    fn manager() -> (SessionManager, Arc<dyn KeyCustody>) {
        let custody: Arc<dyn KeyCustody> = Arc::new(SoftwareKeystore::new());
        (
            SessionManager::new(
                Arc::clone(&custody),
                Arc::new(MemoryStateStore::new()),
                Duration::from_secs(300),
            ),
            custody,
        )
    }

    fn server_response_for(request: &KeyExchangeRequest, expires_at: u64) -> (KeyExchangeResponse, [u8; 32]) {
        // Play the server side of the exchange with an independent P-256 key.
        let server_secret = SecretKey::random(&mut OsRng);
        let server_public_der = server_secret
            .public_key()
            .to_public_key_der()
            .expect("encode server key");

        let client_der = BASE64
            .decode(&request.client_public_key)
            .expect("decode client key");
        let client_public =
            p256::PublicKey::from_public_key_der(&client_der).expect("parse client key");
        let shared = p256::ecdh::diffie_hellman(
            server_secret.to_nonzero_scalar(),
            client_public.as_affine(),
        );
        let digest = Sha256::digest(shared.raw_secret_bytes());
        let mut expected_key = [0u8; 32];
        expected_key.copy_from_slice(&digest);

        (
            KeyExchangeResponse {
                server_public_key: BASE64.encode(server_public_der.as_bytes()),
                session_id: request.session_id.clone(),
                algorithm: KEY_EXCHANGE_ALGORITHM.to_string(),
                expires_at,
            },
            expected_key,
        )
    }

    #[test]
    fn test_full_exchange_derives_matching_key() {
        let (manager, custody) = manager();
        let request = manager.initiate_key_exchange().expect("initiate");
        let alias = format!("{SESSION_ALIAS_PREFIX}{}", request.session_id);
        assert!(custody.contains(&alias).expect("contains"));

        let (response, expected_key) = server_response_for(&request, now_ms() + 3_600_000);
        manager.establish_session(&response).expect("establish");

        // Both sides agree on SHA-256 of the shared secret.
        let key = manager.session_key().expect("session key");
        assert_eq!(*key, expected_key);
        // Ephemeral key is gone once the session key exists.
        assert!(!custody.contains(&alias).expect("contains"));
        assert!(manager.has_active_session());
        assert!(!manager.needs_refresh());
    }

    #[test]
    fn test_establish_without_initiate_fails() {
        let (manager, _) = manager();
        let response = KeyExchangeResponse {
            server_public_key: String::new(),
            session_id: "s".to_string(),
            algorithm: KEY_EXCHANGE_ALGORITHM.to_string(),
            expires_at: now_ms() + 1000,
        };
        let err = manager.establish_session(&response).expect_err("must fail");
        assert!(matches!(err, TrustError::SessionAbsent));
    }

    #[test]
    fn test_algorithm_mismatch_rejected() {
        let (manager, custody) = manager();
        let request = manager.initiate_key_exchange().expect("initiate");
        let alias = format!("{SESSION_ALIAS_PREFIX}{}", request.session_id);
        let (mut response, _) = server_response_for(&request, now_ms() + 1000);
        response.algorithm = "ECDH-P384".to_string();

        let err = manager.establish_session(&response).expect_err("must fail");
        assert!(matches!(err, TrustError::InvalidInput(_)));
        // Even a failed establishment consumes the ephemeral key.
        assert!(!custody.contains(&alias).expect("contains"));
        assert!(!manager.has_active_session());
    }

    #[test]
    fn test_expired_session_is_absent() {
        let (manager, _) = manager();
        let request = manager.initiate_key_exchange().expect("initiate");
        let (response, _) = server_response_for(&request, now_ms().saturating_sub(1));
        manager.establish_session(&response).expect("establish");

        assert!(!manager.has_active_session());
        assert!(matches!(
            manager.session_key().expect_err("expired"),
            TrustError::SessionAbsent
        ));
        assert!(!manager.needs_refresh());
    }

    #[test]
    fn test_needs_refresh_inside_threshold() {
        let (manager, _) = manager();
        let request = manager.initiate_key_exchange().expect("initiate");
        // 60s remaining, threshold 300s.
        let (response, _) = server_response_for(&request, now_ms() + 60_000);
        manager.establish_session(&response).expect("establish");

        assert!(manager.has_active_session());
        assert!(manager.needs_refresh());
    }

    #[test]
    fn test_failed_rotation_keeps_active_session() {
        let (manager, custody) = manager();
        let first = manager.initiate_key_exchange().expect("initiate");
        let (response, expected_key) = server_response_for(&first, now_ms() + 3_600_000);
        manager.establish_session(&response).expect("establish");
        assert!(manager.has_active_session());

        // A rotation attempt is rejected before it is established. The
        // pending ephemeral key goes, the live session stays.
        let rotation = manager.initiate_key_exchange().expect("initiate rotation");
        let rotation_alias = format!("{SESSION_ALIAS_PREFIX}{}", rotation.session_id);
        manager.abandon_pending_exchange();

        assert!(!custody.contains(&rotation_alias).expect("contains"));
        assert!(manager.has_active_session());
        assert_eq!(manager.session_id(), Some(response.session_id.clone()));
        assert_eq!(*manager.session_key().expect("session key"), expected_key);
        // The abandoned exchange cannot be established later.
        let (stale, _) = server_response_for(&rotation, now_ms() + 3_600_000);
        assert!(matches!(
            manager.establish_session(&stale).expect_err("abandoned"),
            TrustError::SessionAbsent
        ));
    }

    #[test]
    fn test_clear_session() {
        let (manager, _) = manager();
        let request = manager.initiate_key_exchange().expect("initiate");
        let (response, _) = server_response_for(&request, now_ms() + 3_600_000);
        manager.establish_session(&response).expect("establish");
        assert!(manager.has_active_session());

        manager.clear_session();
        assert!(!manager.has_active_session());
        assert!(matches!(
            manager.session_key().expect_err("cleared"),
            TrustError::SessionAbsent
        ));
    }

    #[test]
    fn test_session_pointer_persists_and_clears() {
        let custody: Arc<dyn KeyCustody> = Arc::new(SoftwareKeystore::new());
        let store: Arc<dyn crate::state::StateStore> = Arc::new(MemoryStateStore::new());
        let manager = SessionManager::new(
            Arc::clone(&custody),
            Arc::clone(&store),
            Duration::from_secs(300),
        );
        assert!(manager.persisted_session().is_none());

        let request = manager.initiate_key_exchange().expect("initiate");
        let expires_at = now_ms() + 3_600_000;
        let (response, _) = server_response_for(&request, expires_at);
        manager.establish_session(&response).expect("establish");

        // A manager over the same store sees the pointer but not the key.
        let restarted = SessionManager::new(custody, store, Duration::from_secs(300));
        let (session_id, pointer_expiry) =
            restarted.persisted_session().expect("pointer");
        assert_eq!(session_id, response.session_id);
        assert_eq!(pointer_expiry, expires_at);
        assert!(!restarted.has_active_session());

        manager.clear_session();
        assert!(restarted.persisted_session().is_none());
    }

    #[test]
    fn test_reinitiate_discards_previous_pending_key() {
        let (manager, custody) = manager();
        let first = manager.initiate_key_exchange().expect("initiate");
        let first_alias = format!("{SESSION_ALIAS_PREFIX}{}", first.session_id);
        assert!(custody.contains(&first_alias).expect("contains"));

        let second = manager.initiate_key_exchange().expect("initiate again");
        assert_ne!(first.session_id, second.session_id);
        assert!(!custody.contains(&first_alias).expect("contains"));
    }
}
