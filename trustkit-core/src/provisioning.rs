//! Device provisioning and identity.
//!
//! One-time registration with the backend: the device presents its client
//! id and registration key (plus a best-effort attestation token), receives
//! a device id and a secret signing key, and persists both — the key into
//! [`KeyCustody`], the record into the [`StateStore`]. Everything else in
//! the SDK refuses to operate until this has succeeded.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::{Config, REGISTER_PATH},
    error::TrustError,
    http_request::Request,
    keystore::KeyCustody,
    state::StateStore,
};

/// Key custody alias of the device's secret signing key.
pub const DEVICE_KEY_ALIAS: &str = "trustkit.device.secret";

const IDENTITY_RECORD: &str = "device_identity";
const RECORD_VERSION: u32 = 1;

/// Best-effort remote attestation. The token is an opportunistic fraud
/// signal, not a gate: implementations may legitimately return `None`
/// (attestation service unreachable, platform unsupported).
pub trait AttestationProvider: Send + Sync {
    /// Requests an attestation token bound to `nonce`, if one is available.
    fn attestation_token(&self, nonce: &str) -> Option<String>;
}

/// Attestation provider that never produces a token.
pub struct NoAttestation;

impl AttestationProvider for NoAttestation {
    fn attestation_token(&self, _nonce: &str) -> Option<String> {
        None
    }
}

/// Persisted device identity. The signing key itself lives in key custody
/// under [`DEVICE_KEY_ALIAS`], never alongside this record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentityRecord {
    /// Record format version.
    pub version: u32,
    /// Backend-assigned device identifier.
    pub device_id: String,
    /// Client identifier used during provisioning.
    pub client_id: String,
    /// Whether provisioning completed. Only trusted together with the
    /// presence of the signing key; see [`DeviceIdentity::is_provisioned`].
    pub is_provisioned: bool,
    /// Unix epoch milliseconds of the successful registration.
    pub provisioned_at: u64,
}

impl DeviceIdentityRecord {
    fn serialize(&self) -> Result<Vec<u8>, TrustError> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)
            .map_err(|err| TrustError::Serialization(err.to_string()))?;
        Ok(bytes)
    }

    fn deserialize(bytes: &[u8]) -> Result<Self, TrustError> {
        let record: Self = ciborium::de::from_reader(bytes)
            .map_err(|err| TrustError::Serialization(err.to_string()))?;
        if record.version != RECORD_VERSION {
            return Err(TrustError::Serialization(format!(
                "unsupported identity record version {}",
                record.version
            )));
        }
        Ok(record)
    }
}

/// Point-in-time provisioning status snapshot, for host diagnostics.
#[derive(Debug, Clone)]
pub struct ProvisioningInfo {
    /// Whether the invariant-checked provisioned state holds.
    pub is_provisioned: bool,
    /// Device id, if a record exists.
    pub device_id: Option<String>,
    /// Client id, if a record exists.
    pub client_id: Option<String>,
    /// Registration time in epoch milliseconds, if a record exists.
    pub provisioned_at: Option<u64>,
    /// Whether the signing key is present in key custody.
    pub has_secret_key: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationRequest<'a> {
    client_id: &'a str,
    registration_key: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    attestation_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationResponse {
    device_id: String,
    secret_key: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Orchestrates registration and owns the persisted identity record.
pub struct DeviceIdentity {
    base_url: String,
    custody: Arc<dyn KeyCustody>,
    store: Arc<dyn StateStore>,
    attestation: Arc<dyn AttestationProvider>,
    http: Request,
    record: std::sync::Mutex<Option<DeviceIdentityRecord>>,
    provision_lock: tokio::sync::Mutex<()>,
}

impl DeviceIdentity {
    /// Creates the identity component, loading any persisted record.
    #[must_use]
    pub fn new(
        config: &Config,
        custody: Arc<dyn KeyCustody>,
        store: Arc<dyn StateStore>,
        attestation: Arc<dyn AttestationProvider>,
    ) -> Self {
        let record = load_record(store.as_ref());
        Self {
            base_url: config.base_url.clone(),
            custody,
            store,
            attestation,
            http: Request::new(config.network_timeout),
            record: std::sync::Mutex::new(record),
            provision_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Reports whether the device holds a usable identity.
    ///
    /// The persisted flag alone is not trusted: a record claiming
    /// provisioned state without a device id or without the signing key in
    /// custody is treated as not provisioned.
    #[must_use]
    pub fn is_provisioned(&self) -> bool {
        let Some(record) = self.current_record() else {
            return false;
        };
        if !record.is_provisioned || record.device_id.is_empty() {
            return false;
        }
        match self.custody.contains(DEVICE_KEY_ALIAS) {
            Ok(present) => present,
            Err(err) => {
                warn!("key custody unavailable while checking provisioning: {err}");
                false
            }
        }
    }

    /// Returns the device id, if provisioned.
    #[must_use]
    pub fn device_id(&self) -> Option<String> {
        self.current_record().map(|record| record.device_id)
    }

    /// Returns the client id used during provisioning, if provisioned.
    #[must_use]
    pub fn client_id(&self) -> Option<String> {
        self.current_record().map(|record| record.client_id)
    }

    /// Returns a diagnostic snapshot of the provisioning state.
    #[must_use]
    pub fn provisioning_info(&self) -> ProvisioningInfo {
        let record = self.current_record();
        ProvisioningInfo {
            is_provisioned: self.is_provisioned(),
            device_id: record.as_ref().map(|r| r.device_id.clone()),
            client_id: record.as_ref().map(|r| r.client_id.clone()),
            provisioned_at: record.as_ref().map(|r| r.provisioned_at),
            has_secret_key: self
                .custody
                .contains(DEVICE_KEY_ALIAS)
                .unwrap_or(false),
        }
    }

    /// Registers this device with the backend and persists the resulting
    /// identity.
    ///
    /// With `force_reprovisioning` the existing identity is cleared first
    /// and a fresh registration is performed; otherwise an already
    /// provisioned device returns [`TrustError::AlreadyProvisioned`]
    /// without contacting the network.
    ///
    /// # Errors
    ///
    /// - [`TrustError::AlreadyProvisioned`] if a usable identity exists.
    /// - [`TrustError::Api`] if the backend rejects the registration.
    /// - [`TrustError::Network`] on transport failure.
    /// - [`TrustError::Storage`] if local persistence fails after a
    ///   successful registration; the device is rolled back to
    ///   unprovisioned so no record ever claims an identity without a
    ///   usable key.
    pub async fn provision(
        &self,
        client_id: &str,
        registration_key: &str,
        force_reprovisioning: bool,
    ) -> Result<String, TrustError> {
        let _guard = self.provision_lock.lock().await;

        if self.is_provisioned() {
            if !force_reprovisioning {
                debug!("device already provisioned; skipping registration");
                return Err(TrustError::AlreadyProvisioned);
            }
            info!("force reprovisioning requested; clearing existing identity");
            self.clear_internal();
        }

        let nonce = BASE64.encode(Uuid::new_v4().simple().to_string());
        let attestation_token = self.attestation.attestation_token(&nonce);
        debug!(
            "registering device (attestation token {})",
            if attestation_token.is_some() {
                "present"
            } else {
                "absent"
            }
        );

        let url = format!("{}{REGISTER_PATH}", self.base_url);
        let request = RegistrationRequest {
            client_id,
            registration_key,
            attestation_token,
        };
        let response = self.http.handle(self.http.post(&url).json(&request)).await?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .map_or(text, |body| body.message);
            error!("registration rejected: {status} {message}");
            return Err(TrustError::Api {
                code: status,
                message,
            });
        }

        let registration: RegistrationResponse = response
            .json()
            .await
            .map_err(|err| TrustError::Serialization(err.to_string()))?;
        info!("registration succeeded, device id {}", registration.device_id);

        self.store_credentials(client_id, &registration)?;
        Ok(registration.device_id)
    }

    /// Clears the identity record and signing key, returning the device to
    /// the unprovisioned state. Returns whether cleanup fully succeeded.
    pub fn clear(&self) -> bool {
        info!("clearing device identity");
        self.clear_internal()
    }

    fn store_credentials(
        &self,
        client_id: &str,
        registration: &RegistrationResponse,
    ) -> Result<(), TrustError> {
        let secret = BASE64.decode(&registration.secret_key).map_err(|err| {
            TrustError::Serialization(format!("secret key is not valid base64: {err}"))
        })?;

        if let Err(err) = self.custody.import_secret_key(DEVICE_KEY_ALIAS, &secret) {
            error!("failed to store signing key: {err}");
            self.clear_internal();
            return Err(TrustError::Storage(err.to_string()));
        }

        let record = DeviceIdentityRecord {
            version: RECORD_VERSION,
            device_id: registration.device_id.clone(),
            client_id: client_id.to_string(),
            is_provisioned: true,
            provisioned_at: now_ms(),
        };
        let bytes = record.serialize()?;
        if let Err(err) = self.store.write_atomic(IDENTITY_RECORD, &bytes) {
            error!("failed to persist identity record: {err}");
            self.clear_internal();
            return Err(TrustError::Storage(err.to_string()));
        }

        if let Ok(mut guard) = self.record.lock() {
            *guard = Some(record);
        }
        Ok(())
    }

    fn clear_internal(&self) -> bool {
        let key_cleared = match self.custody.delete(DEVICE_KEY_ALIAS) {
            Ok(_) => true,
            Err(err) => {
                warn!("failed to delete signing key: {err}");
                false
            }
        };
        let record_cleared = match self.store.delete(IDENTITY_RECORD) {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to delete identity record: {err}");
                false
            }
        };
        if let Ok(mut guard) = self.record.lock() {
            *guard = None;
        }
        key_cleared && record_cleared
    }

    fn current_record(&self) -> Option<DeviceIdentityRecord> {
        self.record.lock().map_or(None, |guard| guard.clone())
    }
}

fn load_record(store: &dyn StateStore) -> Option<DeviceIdentityRecord> {
    match store.read(IDENTITY_RECORD) {
        Ok(Some(bytes)) => match DeviceIdentityRecord::deserialize(&bytes) {
            Ok(record) => Some(record),
            Err(err) => {
                warn!("discarding unreadable identity record: {err}");
                None
            }
        },
        Ok(None) => None,
        Err(err) => {
            warn!("failed to read identity record: {err}");
            None
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{keystore::SoftwareKeystore, state::MemoryStateStore};

    fn test_config() -> Config {
        Config::new("http://localhost:0", "BANK_PROD", "abc123")
    }

    fn identity_with(
        custody: Arc<dyn KeyCustody>,
        store: Arc<dyn StateStore>,
    ) -> DeviceIdentity {
        DeviceIdentity::new(&test_config(), custody, store, Arc::new(NoAttestation))
    }

    #[test]
    fn test_record_round_trip() {
        let record = DeviceIdentityRecord {
            version: RECORD_VERSION,
            device_id: "dev-1".to_string(),
            client_id: "BANK_PROD".to_string(),
            is_provisioned: true,
            provisioned_at: 1234,
        };
        let bytes = record.serialize().expect("serialize");
        let decoded = DeviceIdentityRecord::deserialize(&bytes).expect("deserialize");
        assert_eq!(decoded.device_id, "dev-1");
        assert!(decoded.is_provisioned);
    }

    #[test]
    fn test_record_version_mismatch_rejected() {
        let record = DeviceIdentityRecord {
            version: RECORD_VERSION + 1,
            device_id: "dev-1".to_string(),
            client_id: "BANK_PROD".to_string(),
            is_provisioned: true,
            provisioned_at: 1234,
        };
        let bytes = record.serialize().expect("serialize");
        assert!(DeviceIdentityRecord::deserialize(&bytes).is_err());
    }

    #[test]
    fn test_unprovisioned_by_default() {
        let identity = identity_with(
            Arc::new(SoftwareKeystore::new()),
            Arc::new(MemoryStateStore::new()),
        );
        assert!(!identity.is_provisioned());
        assert!(identity.device_id().is_none());
    }

    #[test]
    fn test_record_without_key_is_not_provisioned() {
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let record = DeviceIdentityRecord {
            version: RECORD_VERSION,
            device_id: "dev-1".to_string(),
            client_id: "BANK_PROD".to_string(),
            is_provisioned: true,
            provisioned_at: 1,
        };
        store
            .write_atomic(IDENTITY_RECORD, &record.serialize().expect("serialize"))
            .expect("write");

        // The flag claims provisioned but the signing key is missing, so the
        // invariant check must report unprovisioned.
        let identity = identity_with(Arc::new(SoftwareKeystore::new()), store);
        assert!(!identity.is_provisioned());
        let info = identity.provisioning_info();
        assert!(!info.is_provisioned);
        assert!(!info.has_secret_key);
        assert_eq!(info.device_id.as_deref(), Some("dev-1"));
    }

    #[test]
    fn test_clear_removes_key_and_record() {
        let custody: Arc<dyn KeyCustody> = Arc::new(SoftwareKeystore::new());
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        custody
            .import_secret_key(DEVICE_KEY_ALIAS, b"secret")
            .expect("import");
        let record = DeviceIdentityRecord {
            version: RECORD_VERSION,
            device_id: "dev-1".to_string(),
            client_id: "BANK_PROD".to_string(),
            is_provisioned: true,
            provisioned_at: 1,
        };
        store
            .write_atomic(IDENTITY_RECORD, &record.serialize().expect("serialize"))
            .expect("write");

        let identity = identity_with(Arc::clone(&custody), Arc::clone(&store));
        assert!(identity.is_provisioned());
        assert!(identity.clear());
        assert!(!identity.is_provisioned());
        assert!(!custody.contains(DEVICE_KEY_ALIAS).expect("contains"));
        assert!(store.read(IDENTITY_RECORD).expect("read").is_none());
    }
}
