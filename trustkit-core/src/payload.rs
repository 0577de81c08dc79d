//! Payload encryption under the session key.
//!
//! Payloads are sealed with AES-256-GCM using the session key from
//! [`SessionManager`]. Callers may bind a payload to its request context
//! with additional authenticated data; decryption fails closed on any
//! mismatch.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

use crate::{
    crypto::{aes256_gcm_decrypt, aes256_gcm_encrypt},
    error::TrustError,
    session::SessionManager,
};

const PAYLOAD_VERSION: u32 = 1;
const PAYLOAD_ALGORITHM: &str = "AES-256-GCM";

/// An encrypted payload as carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    /// Envelope format version.
    pub version: u32,
    /// Base64 12-byte GCM nonce.
    pub iv: String,
    /// Base64 ciphertext with the 16-byte GCM tag appended.
    pub ciphertext: String,
    /// Cipher identifier, always `AES-256-GCM`.
    pub algorithm: String,
    /// Additional authenticated data the payload is bound to, if any.
    /// Carried in the clear; its integrity is protected by the GCM tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aad: Option<String>,
}

/// A signed-and-encrypted request envelope: the encrypted payload plus the
/// request context it is bound to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureRequest {
    /// Session the payload was sealed under.
    pub session_id: String,
    /// The sealed request body.
    pub payload: EncryptedPayload,
}

/// Encrypts and decrypts payloads with the active session key.
pub struct PayloadCipher {
    sessions: Arc<SessionManager>,
}

impl PayloadCipher {
    /// Creates a cipher over the given session manager.
    #[must_use]
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }

    /// Encrypts `plaintext` under the active session key, optionally bound
    /// to `aad`.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::SessionAbsent`] without an active session, or
    /// [`TrustError::Crypto`] if sealing fails.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        aad: Option<&str>,
    ) -> Result<EncryptedPayload, TrustError> {
        let key = self.sessions.session_key()?;
        let (ciphertext, iv) =
            aes256_gcm_encrypt(&key, plaintext, aad.map_or(&[], str::as_bytes))?;
        Ok(EncryptedPayload {
            version: PAYLOAD_VERSION,
            iv: BASE64.encode(iv),
            ciphertext: BASE64.encode(ciphertext),
            algorithm: PAYLOAD_ALGORITHM.to_string(),
            aad: aad.map(ToString::to_string),
        })
    }

    /// Decrypts a payload with the active session key, authenticating the
    /// embedded additional data.
    ///
    /// # Errors
    ///
    /// - [`TrustError::SessionAbsent`] without an active session.
    /// - [`TrustError::InvalidInput`] on an unsupported version or
    ///   algorithm, or undecodable fields.
    /// - [`TrustError::DecryptionFailed`] if authentication fails. No
    ///   plaintext is ever returned from a failed authentication.
    pub fn decrypt(&self, payload: &EncryptedPayload) -> Result<Vec<u8>, TrustError> {
        if payload.version != PAYLOAD_VERSION {
            return Err(TrustError::InvalidInput(format!(
                "unsupported payload version {}",
                payload.version
            )));
        }
        if payload.algorithm != PAYLOAD_ALGORITHM {
            return Err(TrustError::InvalidInput(format!(
                "unsupported payload algorithm {}",
                payload.algorithm
            )));
        }

        let key = self.sessions.session_key()?;
        let iv = BASE64
            .decode(&payload.iv)
            .map_err(|err| TrustError::InvalidInput(format!("iv is not valid base64: {err}")))?;
        let ciphertext = BASE64.decode(&payload.ciphertext).map_err(|err| {
            TrustError::InvalidInput(format!("ciphertext is not valid base64: {err}"))
        })?;

        let aad = payload.aad.as_deref().map_or(&[] as &[u8], str::as_bytes);
        aes256_gcm_decrypt(&key, &iv, &ciphertext, aad)
    }

    /// Seals a request body into a [`SecureRequest`], binding the payload
    /// to its method, path, timestamp and session id.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::encrypt`].
    pub fn seal_request(
        &self,
        method: &str,
        uri: &str,
        timestamp: &str,
        body: &[u8],
    ) -> Result<SecureRequest, TrustError> {
        let session_id = self
            .sessions
            .session_id()
            .ok_or(TrustError::SessionAbsent)?;
        let binding = request_binding(method, uri, timestamp, &session_id);
        let payload = self.encrypt(body, Some(&binding))?;
        Ok(SecureRequest {
            session_id,
            payload,
        })
    }
}

/// Builds the context string a sealed request body is bound to.
#[must_use]
pub fn request_binding(method: &str, uri: &str, timestamp: &str, session_id: &str) -> String {
    [method.to_uppercase().as_str(), uri, timestamp, session_id].join("|")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        keystore::{KeyCustody, SoftwareKeystore},
        session::{KeyExchangeResponse, SessionManager},
        state::MemoryStateStore,
    };
    use base64::engine::general_purpose::STANDARD;
    use p256::pkcs8::EncodePublicKey;
    use rand::rngs::OsRng;
    use std::time::Duration;

    fn cipher_with_session() -> PayloadCipher {
        let custody: Arc<dyn KeyCustody> = Arc::new(SoftwareKeystore::new());
        let sessions = Arc::new(SessionManager::new(
            custody,
            Arc::new(MemoryStateStore::new()),
            Duration::from_secs(300),
        ));

        let request = sessions.initiate_key_exchange().expect("initiate");
        let server_secret = p256::SecretKey::random(&mut OsRng);
        let response = KeyExchangeResponse {
            server_public_key: STANDARD.encode(
                server_secret
                    .public_key()
                    .to_public_key_der()
                    .expect("encode")
                    .as_bytes(),
            ),
            session_id: request.session_id,
            algorithm: "ECDH-P256".to_string(),
            expires_at: crate::provisioning::now_ms() + 3_600_000,
        };
        sessions.establish_session(&response).expect("establish");
        PayloadCipher::new(sessions)
    }

    #[test]
    fn test_round_trip_with_aad() {
        let cipher = cipher_with_session();
        let payload = cipher
            .encrypt(b"{\"account\":\"12345\"}", Some("POST|/api/v1/balance"))
            .expect("encrypt");
        assert_eq!(payload.algorithm, "AES-256-GCM");
        assert_eq!(payload.version, 1);

        let plaintext = cipher.decrypt(&payload).expect("decrypt");
        assert_eq!(plaintext, b"{\"account\":\"12345\"}");
    }

    #[test]
    fn test_aad_mismatch_fails_closed() {
        let cipher = cipher_with_session();
        let mut payload = cipher
            .encrypt(b"secret", Some("POST|/api/v1/transfer"))
            .expect("encrypt");
        payload.aad = Some("POST|/api/v1/balance".to_string());

        let err = cipher.decrypt(&payload).expect_err("must fail");
        assert!(matches!(err, TrustError::DecryptionFailed));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let cipher = cipher_with_session();
        let mut payload = cipher.encrypt(b"x", None).expect("encrypt");
        payload.version = 2;
        assert!(matches!(
            cipher.decrypt(&payload).expect_err("must fail"),
            TrustError::InvalidInput(_)
        ));
    }

    #[test]
    fn test_no_session_means_no_encryption() {
        let cipher = PayloadCipher::new(Arc::new(SessionManager::new(
            Arc::new(SoftwareKeystore::new()),
            Arc::new(MemoryStateStore::new()),
            Duration::from_secs(300),
        )));
        assert!(matches!(
            cipher.encrypt(b"x", None).expect_err("must fail"),
            TrustError::SessionAbsent
        ));
    }

    #[test]
    fn test_seal_request_binds_context() {
        let cipher = cipher_with_session();
        let sealed = cipher
            .seal_request("post", "/api/v1/transfer", "2026-08-25T10:00:00Z", b"{}")
            .expect("seal");
        let expected = request_binding(
            "POST",
            "/api/v1/transfer",
            "2026-08-25T10:00:00Z",
            &sealed.session_id,
        );
        assert_eq!(sealed.payload.aad.as_deref(), Some(expected.as_str()));
        assert_eq!(cipher.decrypt(&sealed.payload).expect("decrypt"), b"{}");
    }

    #[test]
    fn test_wire_format_field_names() {
        let cipher = cipher_with_session();
        let payload = cipher.encrypt(b"x", None).expect("encrypt");
        let json = serde_json::to_value(&payload).expect("json");
        assert!(json.get("iv").is_some());
        assert!(json.get("ciphertext").is_some());
        assert_eq!(json.get("algorithm").and_then(|v| v.as_str()), Some("AES-256-GCM"));
        // absent aad is omitted, not null
        assert!(json.get("aad").is_none());
    }
}
