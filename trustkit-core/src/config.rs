use std::time::Duration;

/// Path of the device registration endpoint, relative to the base URL.
pub const REGISTER_PATH: &str = "/v1/register";

/// Path of the session key-exchange endpoint, relative to the base URL.
pub const KEY_EXCHANGE_PATH: &str = "/v1/session/key-exchange";

/// SDK configuration.
///
/// One `Config` is built at startup and handed to
/// [`crate::client::TrustClient`]; the defaults match the reference backend
/// and only need overriding in tests or staging environments.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the device-trust backend.
    pub base_url: String,
    /// Client identifier issued to this application.
    pub client_id: String,
    /// Shared registration key issued by administrators.
    pub registration_key: String,
    /// Upper bound for any single network call.
    pub network_timeout: Duration,
    /// Maximum accepted clock skew for signed-request timestamps.
    pub replay_window: Duration,
    /// Minimum interval between reprovisioning attempts.
    pub reprovision_cooldown: Duration,
    /// Remaining session lifetime below which a refresh is recommended.
    pub session_refresh_threshold: Duration,
}

impl Config {
    /// Builds a configuration with reference defaults.
    #[must_use]
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        registration_key: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            client_id: client_id.into(),
            registration_key: registration_key.into(),
            network_timeout: Duration::from_secs(30),
            replay_window: Duration::from_secs(300),
            reprovision_cooldown: Duration::from_secs(10),
            session_refresh_threshold: Duration::from_secs(300),
        }
    }
}
