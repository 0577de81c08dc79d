use thiserror::Error;

/// Error outputs from `TrustKit`.
///
/// Host applications branch on the variant, never on message strings.
/// Platform key-store and filesystem failures are converted into this
/// taxonomy at every API boundary; no raw platform error escapes the SDK.
#[derive(Debug, Error)]
pub enum TrustError {
    /// The device has no identity yet; provisioning must run first.
    #[error("not_provisioned")]
    NotProvisioned,
    /// The device already holds a valid identity. Not a failure; returned so
    /// callers do not re-register an already registered device.
    #[error("already_provisioned")]
    AlreadyProvisioned,
    /// The backend rejected the request (bad registration key, disabled
    /// client, blocked device).
    #[error("api_error: {code} {message}")]
    Api {
        /// HTTP status code returned by the backend.
        code: u16,
        /// Error message extracted from the response body.
        message: String,
    },
    /// Transport-level failure reaching the backend.
    #[error("network_error: {0}")]
    Network(String),
    /// Local persistence failure (identity record, session pointer).
    #[error("storage_error: {0}")]
    Storage(String),
    /// The key custody backend cannot produce a required key.
    #[error("key_unavailable: {0}")]
    KeyUnavailable(String),
    /// A signature did not verify.
    #[error("signature_invalid")]
    SignatureInvalid,
    /// No active session key is available for payload encryption.
    #[error("session_absent")]
    SessionAbsent,
    /// AEAD tag or associated-data mismatch. No partial plaintext is ever
    /// returned.
    #[error("decryption_failed")]
    DecryptionFailed,
    /// The presented input is not valid for the requested operation.
    #[error("invalid_input: {0}")]
    InvalidInput(String),
    /// Unexpected error serializing or deserializing information.
    #[error("serialization_error: {0}")]
    Serialization(String),
    /// Unhandled cryptographic failure.
    #[error("crypto_error: {0}")]
    Crypto(String),
}

impl From<reqwest::Error> for TrustError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}
