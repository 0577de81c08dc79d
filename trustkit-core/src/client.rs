//! SDK entry point.
//!
//! [`TrustClient`] wires the components together behind one explicit,
//! host-owned object: provisioning, request signing, session negotiation,
//! payload encryption and the reprovisioning guard. Hosts construct one
//! client per backend environment and share it.

use std::sync::Arc;

use log::{debug, info, warn};
use reqwest::Method;

use crate::{
    config::{Config, KEY_EXCHANGE_PATH},
    error::TrustError,
    http_request::Request,
    keystore::KeyCustody,
    payload::PayloadCipher,
    provisioning::{AttestationProvider, DeviceIdentity, NoAttestation, ProvisioningInfo},
    reprovision::{ReprovisionOutcome, ReprovisioningGuard},
    session::{KeyExchangeResponse, SessionManager},
    signing::{RequestSigner, SignedRequest},
    state::StateStore,
};

/// Response of a signed API call, after any automatic recovery.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// Raw response body.
    pub body: String,
}

impl ApiResponse {
    /// Reports whether the status is in the 2xx range.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// The device-trust client.
pub struct TrustClient {
    config: Config,
    identity: Arc<DeviceIdentity>,
    signer: RequestSigner,
    sessions: Arc<SessionManager>,
    cipher: PayloadCipher,
    guard: ReprovisioningGuard,
    http: Request,
}

impl TrustClient {
    /// Builds a client from a configuration and the platform seams: key
    /// custody, persistent state and attestation.
    #[must_use]
    pub fn new(
        config: Config,
        custody: Arc<dyn KeyCustody>,
        store: Arc<dyn StateStore>,
        attestation: Arc<dyn AttestationProvider>,
    ) -> Self {
        let identity = Arc::new(DeviceIdentity::new(
            &config,
            Arc::clone(&custody),
            Arc::clone(&store),
            attestation,
        ));
        let signer = RequestSigner::new(
            Arc::clone(&identity),
            Arc::clone(&custody),
            config.replay_window,
        );
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&custody),
            Arc::clone(&store),
            config.session_refresh_threshold,
        ));
        let cipher = PayloadCipher::new(Arc::clone(&sessions));
        let guard = ReprovisioningGuard::new(
            Arc::clone(&identity),
            config.client_id.clone(),
            config.registration_key.clone(),
            config.reprovision_cooldown,
        );
        let http = Request::new(config.network_timeout);
        Self {
            config,
            identity,
            signer,
            sessions,
            cipher,
            guard,
            http,
        }
    }

    /// Builds a client without attestation, for hosts on platforms where
    /// no attestation service exists.
    #[must_use]
    pub fn without_attestation(
        config: Config,
        custody: Arc<dyn KeyCustody>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self::new(config, custody, store, Arc::new(NoAttestation))
    }

    /// Registers this device with the backend using the configured
    /// credentials. See [`DeviceIdentity::provision`].
    ///
    /// # Errors
    ///
    /// Propagates provisioning failures unchanged.
    pub async fn provision(&self) -> Result<String, TrustError> {
        self.identity
            .provision(&self.config.client_id, &self.config.registration_key, false)
            .await
    }

    /// Clears identity, sessions and keys, returning the device to the
    /// factory state. Returns whether cleanup fully succeeded.
    pub fn reset(&self) -> bool {
        self.sessions.clear_session();
        self.identity.clear()
    }

    /// Reports whether the device holds a usable identity.
    #[must_use]
    pub fn is_provisioned(&self) -> bool {
        self.identity.is_provisioned()
    }

    /// Returns a diagnostic snapshot of the provisioning state.
    #[must_use]
    pub fn provisioning_info(&self) -> ProvisioningInfo {
        self.identity.provisioning_info()
    }

    /// Access to the request signer, for hosts that send requests through
    /// their own HTTP stack.
    #[must_use]
    pub fn signer(&self) -> &RequestSigner {
        &self.signer
    }

    /// Access to the session manager.
    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Access to the payload cipher.
    #[must_use]
    pub fn payload_cipher(&self) -> &PayloadCipher {
        &self.cipher
    }

    /// Signs a request for the host's own HTTP stack.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`RequestSigner::sign`].
    pub fn sign_request(
        &self,
        method: &str,
        uri: &str,
        body: &[u8],
    ) -> Result<SignedRequest, TrustError> {
        self.signer.sign(method, uri, body)
    }

    /// Negotiates a fresh session with the backend: initiates the key
    /// exchange, posts it, and derives the session key from the response.
    ///
    /// # Errors
    ///
    /// - [`TrustError::NotProvisioned`] if the device has no identity.
    /// - [`TrustError::Api`] if the backend rejects the exchange.
    /// - [`TrustError::Network`] on transport failure.
    pub async fn negotiate_session(&self) -> Result<String, TrustError> {
        if !self.identity.is_provisioned() {
            return Err(TrustError::NotProvisioned);
        }
        let exchange = self.sessions.initiate_key_exchange()?;
        let uri = KEY_EXCHANGE_PATH;
        let body = serde_json::to_vec(&exchange)
            .map_err(|err| TrustError::Serialization(err.to_string()))?;
        let signed = self.signer.sign("POST", uri, &body)?;

        let url = format!("{}{uri}", self.config.base_url);
        let mut builder = self.http.post(&url).body(body);
        for (name, value) in signed.headers() {
            builder = builder.header(name, value);
        }
        builder = builder.header("Content-Type", "application/json");
        let response = match self.http.handle(builder).await {
            Ok(response) => response,
            Err(err) => {
                self.sessions.abandon_pending_exchange();
                return Err(err);
            }
        };

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let message = response.text().await.unwrap_or_default();
            // A rejected rotation leaves any previous session in place.
            self.sessions.abandon_pending_exchange();
            return Err(TrustError::Api {
                code: status,
                message,
            });
        }
        let exchange_response: KeyExchangeResponse = match response.json().await {
            Ok(exchange_response) => exchange_response,
            Err(err) => {
                self.sessions.abandon_pending_exchange();
                return Err(TrustError::Serialization(err.to_string()));
            }
        };
        self.sessions.establish_session(&exchange_response)?;
        Ok(exchange_response.session_id)
    }

    /// Renegotiates the session, dropping the current one first.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Self::negotiate_session`].
    pub async fn refresh_session(&self) -> Result<String, TrustError> {
        debug!("refreshing session");
        self.sessions.clear_session();
        self.negotiate_session().await
    }

    /// Sends a signed request to the backend, recovering once from a
    /// signature rejection.
    ///
    /// If the backend answers 401/403 with a signature complaint, the
    /// device is reprovisioned through the guard and the request re-signed
    /// and retried exactly once. Any other response, and the response to
    /// the retry itself, is returned as is.
    ///
    /// # Errors
    ///
    /// - [`TrustError::NotProvisioned`] if the device has no identity.
    /// - [`TrustError::InvalidInput`] for an unsupported method.
    /// - [`TrustError::Network`] on transport failure.
    pub async fn execute_signed(
        &self,
        method: &str,
        uri: &str,
        body: &[u8],
    ) -> Result<ApiResponse, TrustError> {
        let first = self.send_signed(method, uri, body).await?;
        if !ReprovisioningGuard::should_trigger(first.status, &first.body) {
            return Ok(first);
        }

        warn!("request to {uri} rejected with a signature failure");
        match self.guard.try_reprovision().await {
            ReprovisionOutcome::Reprovisioned => {
                info!("retrying {uri} with fresh credentials");
                self.send_signed(method, uri, body).await
            }
            ReprovisionOutcome::Skipped => {
                debug!("reprovisioning skipped; surfacing original response");
                Ok(first)
            }
            ReprovisionOutcome::Failed(reason) => {
                warn!("recovery failed: {reason}");
                Ok(first)
            }
        }
    }

    async fn send_signed(
        &self,
        method: &str,
        uri: &str,
        body: &[u8],
    ) -> Result<ApiResponse, TrustError> {
        let parsed_method = Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|_| TrustError::InvalidInput(format!("unsupported method {method}")))?;
        let signed = self.signer.sign(method, uri, body)?;

        let url = format!("{}{uri}", self.config.base_url);
        let mut builder = self.http.req(parsed_method, &url).body(body.to_vec());
        for (name, value) in signed.headers() {
            builder = builder.header(name, value);
        }
        if !body.is_empty() {
            builder = builder.header("Content-Type", "application/json");
        }
        let response = self.http.handle(builder).await?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(ApiResponse { status, body })
    }
}
