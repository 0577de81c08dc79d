//! HMAC request signing.
//!
//! Every protected API call carries a signature over a canonical string of
//! its method, path, timestamp, nonce and body hash, computed with the
//! device's secret key. The key never leaves key custody; signing happens
//! through [`KeyCustody::hmac_sha256`].

use std::{collections::HashMap, sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{NaiveDateTime, Utc};

use crate::{
    crypto::{constant_time_eq, random_nonce_hex, sha256_hex},
    error::TrustError,
    keystore::KeyCustody,
    provisioning::{DeviceIdentity, DEVICE_KEY_ALIAS},
};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Header carrying the device id.
pub const HEADER_DEVICE_ID: &str = "X-Device-Id";
/// Header carrying the base64 signature.
pub const HEADER_SIGNATURE: &str = "X-Signature";
/// Header carrying the signing timestamp.
pub const HEADER_TIMESTAMP: &str = "X-Timestamp";
/// Header carrying the request nonce.
pub const HEADER_NONCE: &str = "X-Nonce";

/// A signed request: the canonical inputs plus the resulting signature,
/// ready to be attached to an outgoing HTTP call.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    /// Device id the signature is bound to.
    pub device_id: String,
    /// Upper-cased HTTP method.
    pub method: String,
    /// Request path with any query string stripped.
    pub uri: String,
    /// ISO-8601 UTC timestamp, second precision.
    pub timestamp: String,
    /// Random per-request nonce, 32 hex characters.
    pub nonce: String,
    /// Lowercase hex SHA-256 of the request body, or the empty string for
    /// a body-less request.
    pub body_hash: String,
    /// Base64 HMAC-SHA256 over the canonical string.
    pub signature: String,
}

impl SignedRequest {
    /// Returns the headers a protected request must carry.
    #[must_use]
    pub fn headers(&self) -> HashMap<&'static str, String> {
        HashMap::from([
            (HEADER_DEVICE_ID, self.device_id.clone()),
            (HEADER_SIGNATURE, self.signature.clone()),
            (HEADER_TIMESTAMP, self.timestamp.clone()),
            (HEADER_NONCE, self.nonce.clone()),
        ])
    }
}

/// Signing material extracted from a received header map, for verification
/// paths (tests, server-side emulation).
#[derive(Debug, Clone)]
pub struct ReceivedSignature {
    /// Device id the request claims.
    pub device_id: String,
    /// Base64 signature.
    pub signature: String,
    /// Signing timestamp.
    pub timestamp: String,
    /// Request nonce.
    pub nonce: String,
}

impl ReceivedSignature {
    /// Extracts the four trust headers from a header map. Returns `None`
    /// if any of them is missing.
    #[must_use]
    pub fn from_headers(headers: &HashMap<String, String>) -> Option<Self> {
        Some(Self {
            device_id: headers.get(HEADER_DEVICE_ID)?.clone(),
            signature: headers.get(HEADER_SIGNATURE)?.clone(),
            timestamp: headers.get(HEADER_TIMESTAMP)?.clone(),
            nonce: headers.get(HEADER_NONCE)?.clone(),
        })
    }
}

/// Signs outgoing requests with the provisioned device key.
pub struct RequestSigner {
    identity: Arc<DeviceIdentity>,
    custody: Arc<dyn KeyCustody>,
    replay_window: Duration,
}

impl RequestSigner {
    /// Creates a signer over the given identity and key custody.
    #[must_use]
    pub fn new(
        identity: Arc<DeviceIdentity>,
        custody: Arc<dyn KeyCustody>,
        replay_window: Duration,
    ) -> Self {
        Self {
            identity,
            custody,
            replay_window,
        }
    }

    /// Signs a request with a fresh timestamp and nonce.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::NotProvisioned`] if the device has no
    /// identity, or [`TrustError::KeyUnavailable`] if the signing key
    /// cannot be used.
    pub fn sign(&self, method: &str, uri: &str, body: &[u8]) -> Result<SignedRequest, TrustError> {
        let timestamp = Utc::now().format(TIMESTAMP_FORMAT).to_string();
        let nonce = random_nonce_hex();
        self.sign_with(method, uri, body, &timestamp, &nonce)
    }

    /// Signs a request with a caller-supplied timestamp and nonce.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::sign`].
    pub fn sign_with(
        &self,
        method: &str,
        uri: &str,
        body: &[u8],
        timestamp: &str,
        nonce: &str,
    ) -> Result<SignedRequest, TrustError> {
        if !self.identity.is_provisioned() {
            return Err(TrustError::NotProvisioned);
        }
        let device_id = self
            .identity
            .device_id()
            .ok_or(TrustError::NotProvisioned)?;

        let method = method.to_uppercase();
        let uri = strip_query(uri);
        let body_hash = body_hash_component(body);
        let canonical = canonical_string(&method, &uri, timestamp, nonce, &body_hash);
        let mac = self.custody.hmac_sha256(DEVICE_KEY_ALIAS, canonical.as_bytes())?;

        Ok(SignedRequest {
            device_id,
            method,
            uri,
            timestamp: timestamp.to_string(),
            nonce: nonce.to_string(),
            body_hash,
            signature: BASE64.encode(mac),
        })
    }

    /// Verifies a signature against the canonical inputs, in constant time.
    ///
    /// # Errors
    ///
    /// Returns [`TrustError::SignatureInvalid`] on mismatch or if the
    /// signature is not valid base64; propagates custody errors.
    pub fn verify(
        &self,
        method: &str,
        uri: &str,
        body: &[u8],
        timestamp: &str,
        nonce: &str,
        signature: &str,
    ) -> Result<(), TrustError> {
        let method = method.to_uppercase();
        let uri = strip_query(uri);
        let body_hash = body_hash_component(body);
        let canonical = canonical_string(&method, &uri, timestamp, nonce, &body_hash);
        let expected = self.custody.hmac_sha256(DEVICE_KEY_ALIAS, canonical.as_bytes())?;
        let provided = BASE64
            .decode(signature)
            .map_err(|_| TrustError::SignatureInvalid)?;
        if constant_time_eq(&expected, &provided) {
            Ok(())
        } else {
            Err(TrustError::SignatureInvalid)
        }
    }

    /// Checks a signed timestamp against the configured replay window.
    #[must_use]
    pub fn is_timestamp_valid(&self, timestamp: &str) -> bool {
        is_timestamp_within(timestamp, self.replay_window)
    }
}

/// Builds the canonical string that gets signed:
/// `METHOD|uri|timestamp|nonce|bodyHashHex`.
#[must_use]
pub fn canonical_string(
    method: &str,
    uri: &str,
    timestamp: &str,
    nonce: &str,
    body_hash: &str,
) -> String {
    [method, uri, timestamp, nonce, body_hash].join("|")
}

fn strip_query(uri: &str) -> String {
    uri.split('?').next().unwrap_or(uri).to_string()
}

// Body-less requests sign an empty component, not the hash of zero bytes;
// the server-side verifier does the same.
fn body_hash_component(body: &[u8]) -> String {
    if body.is_empty() {
        String::new()
    } else {
        sha256_hex(body)
    }
}

fn is_timestamp_within(timestamp: &str, window: Duration) -> bool {
    let Ok(parsed) = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT) else {
        return false;
    };
    let skew = (Utc::now() - parsed.and_utc()).num_seconds().unsigned_abs();
    skew <= window.as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        keystore::SoftwareKeystore,
        provisioning::NoAttestation,
        state::MemoryStateStore,
    };
    use crate::crypto::hmac_sha256;

    fn provisioned_signer() -> (RequestSigner, Arc<dyn KeyCustody>) {
        let custody: Arc<dyn KeyCustody> = Arc::new(SoftwareKeystore::new());
        custody
            .import_secret_key(DEVICE_KEY_ALIAS, b"test-secret")
            .expect("import");
        let store: Arc<dyn crate::state::StateStore> = Arc::new(MemoryStateStore::new());
        let record = crate::provisioning::DeviceIdentityRecord {
            version: 1,
            device_id: "dev-42".to_string(),
            client_id: "BANK_PROD".to_string(),
            is_provisioned: true,
            provisioned_at: 1,
        };
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(&record, &mut bytes).expect("serialize");
        store.write_atomic("device_identity", &bytes).expect("write");

        let config = Config::new("http://localhost:0", "BANK_PROD", "abc123");
        let identity = Arc::new(DeviceIdentity::new(
            &config,
            Arc::clone(&custody),
            store,
            Arc::new(NoAttestation),
        ));
        (
            RequestSigner::new(identity, Arc::clone(&custody), Duration::from_secs(300)),
            custody,
        )
    }

    #[test]
    fn test_canonical_string_layout() {
        let canonical = canonical_string("POST", "/api/v1/transfer", "t", "n", "h");
        assert_eq!(canonical, "POST|/api/v1/transfer|t|n|h");
    }

    #[test]
    fn test_sign_matches_independent_hmac() {
        let (signer, _) = provisioned_signer();
        let signed = signer
            .sign_with(
                "post",
                "/api/v1/transfer?debug=1",
                br#"{"amount":100}"#,
                "2026-08-25T10:00:00Z",
                "00112233445566778899aabbccddeeff",
            )
            .expect("sign");

        assert_eq!(signed.method, "POST");
        assert_eq!(signed.uri, "/api/v1/transfer");
        assert_eq!(signed.device_id, "dev-42");

        let canonical = canonical_string(
            "POST",
            "/api/v1/transfer",
            "2026-08-25T10:00:00Z",
            "00112233445566778899aabbccddeeff",
            &sha256_hex(br#"{"amount":100}"#),
        );
        let expected = hmac_sha256(b"test-secret", canonical.as_bytes()).expect("hmac");
        assert_eq!(signed.signature, BASE64.encode(expected));
    }

    #[test]
    fn test_empty_body_signs_empty_hash_component() {
        let (signer, _) = provisioned_signer();
        let signed = signer
            .sign_with(
                "GET",
                "/api/v1/account",
                b"",
                "2026-08-25T10:00:00Z",
                "00112233445566778899aabbccddeeff",
            )
            .expect("sign");

        assert_eq!(signed.body_hash, "");

        // The canonical string carries the empty component, matching what
        // the server recomputes for a body-less request.
        let canonical = canonical_string(
            "GET",
            "/api/v1/account",
            "2026-08-25T10:00:00Z",
            "00112233445566778899aabbccddeeff",
            "",
        );
        assert!(canonical.ends_with("00112233445566778899aabbccddeeff|"));
        let expected = hmac_sha256(b"test-secret", canonical.as_bytes()).expect("hmac");
        assert_eq!(signed.signature, BASE64.encode(expected));
    }

    #[test]
    fn test_verify_round_trip_and_tamper() {
        let (signer, _) = provisioned_signer();
        let signed = signer
            .sign("GET", "/api/v1/account", b"")
            .expect("sign");

        signer
            .verify(
                "GET",
                "/api/v1/account",
                b"",
                &signed.timestamp,
                &signed.nonce,
                &signed.signature,
            )
            .expect("verify");

        let err = signer
            .verify(
                "GET",
                "/api/v1/account",
                b"tampered",
                &signed.timestamp,
                &signed.nonce,
                &signed.signature,
            )
            .expect_err("tampered body must fail");
        assert!(matches!(err, TrustError::SignatureInvalid));
    }

    #[test]
    fn test_signature_covers_every_canonical_component() {
        let (signer, _) = provisioned_signer();
        let signed = signer
            .sign("POST", "/api/v1/transfer", br#"{"amount":100}"#)
            .expect("sign");

        // Flipping any single component invalidates the signature.
        let tampered: [(&str, &str, &str, &str); 4] = [
            ("PUT", "/api/v1/transfer", signed.timestamp.as_str(), signed.nonce.as_str()),
            ("POST", "/api/v1/payees", signed.timestamp.as_str(), signed.nonce.as_str()),
            ("POST", "/api/v1/transfer", "2001-01-01T00:00:00Z", signed.nonce.as_str()),
            (
                "POST",
                "/api/v1/transfer",
                signed.timestamp.as_str(),
                "ffeeddccbbaa99887766554433221100",
            ),
        ];
        for (method, uri, timestamp, nonce) in tampered {
            let err = signer
                .verify(
                    method,
                    uri,
                    br#"{"amount":100}"#,
                    timestamp,
                    nonce,
                    &signed.signature,
                )
                .expect_err("tampered component must fail");
            assert!(matches!(err, TrustError::SignatureInvalid));
        }
    }

    #[test]
    fn test_unprovisioned_device_cannot_sign() {
        let custody: Arc<dyn KeyCustody> = Arc::new(SoftwareKeystore::new());
        let config = Config::new("http://localhost:0", "BANK_PROD", "abc123");
        let identity = Arc::new(DeviceIdentity::new(
            &config,
            Arc::clone(&custody),
            Arc::new(MemoryStateStore::new()),
            Arc::new(NoAttestation),
        ));
        let signer = RequestSigner::new(identity, custody, Duration::from_secs(300));
        let err = signer.sign("GET", "/x", b"").expect_err("must fail");
        assert!(matches!(err, TrustError::NotProvisioned));
    }

    #[test]
    fn test_query_strings_do_not_affect_signature() {
        let (signer, _) = provisioned_signer();
        let ts = "2026-08-25T10:00:00Z";
        let nonce = "00112233445566778899aabbccddeeff";
        let a = signer.sign_with("GET", "/a/b?x=1", b"", ts, nonce).expect("sign");
        let b = signer.sign_with("GET", "/a/b?x=2", b"", ts, nonce).expect("sign");
        assert_eq!(a.signature, b.signature);
        assert_eq!(a.uri, "/a/b");
    }

    #[test]
    fn test_received_signature_from_headers() {
        let (signer, _) = provisioned_signer();
        let signed = signer.sign("GET", "/x", b"").expect("sign");
        let headers: HashMap<String, String> = signed
            .headers()
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect();

        let received = ReceivedSignature::from_headers(&headers).expect("extract");
        assert_eq!(received.device_id, "dev-42");
        assert_eq!(received.signature, signed.signature);
        signer
            .verify(
                "GET",
                "/x",
                b"",
                &received.timestamp,
                &received.nonce,
                &received.signature,
            )
            .expect("verify");

        let mut incomplete = headers;
        incomplete.remove(HEADER_NONCE);
        assert!(ReceivedSignature::from_headers(&incomplete).is_none());
    }

    #[test]
    fn test_headers_contain_all_fields() {
        let (signer, _) = provisioned_signer();
        let signed = signer.sign("GET", "/x", b"").expect("sign");
        let headers = signed.headers();
        assert_eq!(headers.get(HEADER_DEVICE_ID), Some(&"dev-42".to_string()));
        assert!(headers.contains_key(HEADER_SIGNATURE));
        assert!(headers.contains_key(HEADER_TIMESTAMP));
        assert!(headers.contains_key(HEADER_NONCE));
    }

    #[test]
    fn test_timestamp_window() {
        let (signer, _) = provisioned_signer();
        let fresh = Utc::now().format(TIMESTAMP_FORMAT).to_string();
        assert!(signer.is_timestamp_valid(&fresh));

        let stale = (Utc::now() - chrono::Duration::seconds(600))
            .format(TIMESTAMP_FORMAT)
            .to_string();
        assert!(!signer.is_timestamp_valid(&stale));

        // The window is symmetric: a timestamp too far in the future is
        // rejected even with a correct signature.
        let ahead = (Utc::now() + chrono::Duration::seconds(600))
            .format(TIMESTAMP_FORMAT)
            .to_string();
        assert!(!signer.is_timestamp_valid(&ahead));

        assert!(!signer.is_timestamp_valid("not-a-timestamp"));
    }
}
