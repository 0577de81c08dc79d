//! Automatic recovery from signature rejection.
//!
//! When the backend rejects a signed request with 401/403 and a
//! signature-related message, the device key material has usually diverged
//! (app reinstall, backend-side key reset). The guard reprovisions once,
//! rate limited, so concurrent failing requests cannot stampede the
//! registration endpoint.

use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use log::{info, warn};

use crate::provisioning::DeviceIdentity;

/// Guard state. At most one reprovisioning attempt is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    /// No recovery in progress.
    Idle,
    /// A reprovisioning attempt started at the given instant.
    Reprovisioning {
        /// When the in-flight attempt began.
        since: Instant,
    },
}

/// Outcome of [`ReprovisioningGuard::try_reprovision`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReprovisionOutcome {
    /// The device was reprovisioned; the caller should retry its request
    /// once with a fresh signature.
    Reprovisioned,
    /// Another attempt is in flight or the cooldown has not elapsed; the
    /// caller should surface its original failure.
    Skipped,
    /// Reprovisioning itself failed.
    Failed(String),
}

struct GuardInner {
    state: GuardState,
    last_attempt: Option<Instant>,
}

/// Serializes reprovisioning attempts across concurrent request failures.
pub struct ReprovisioningGuard {
    identity: Arc<DeviceIdentity>,
    client_id: String,
    registration_key: String,
    cooldown: Duration,
    inner: Mutex<GuardInner>,
}

impl ReprovisioningGuard {
    /// Creates a guard that reprovisions with the given credentials.
    #[must_use]
    pub fn new(
        identity: Arc<DeviceIdentity>,
        client_id: impl Into<String>,
        registration_key: impl Into<String>,
        cooldown: Duration,
    ) -> Self {
        Self {
            identity,
            client_id: client_id.into(),
            registration_key: registration_key.into(),
            cooldown,
            inner: Mutex::new(GuardInner {
                state: GuardState::Idle,
                last_attempt: None,
            }),
        }
    }

    /// Decides whether a response should trigger recovery: 401 or 403 with
    /// a body mentioning the signature. Other 401/403 responses (expired
    /// credentials, authorization failures) are left to the host.
    #[must_use]
    pub fn should_trigger(status: u16, body: &str) -> bool {
        (status == 401 || status == 403) && body.to_lowercase().contains("signature")
    }

    /// Returns the current guard state.
    #[must_use]
    pub fn state(&self) -> GuardState {
        self.lock_inner().state
    }

    /// Attempts a single rate-limited reprovision.
    ///
    /// Returns [`ReprovisionOutcome::Skipped`] if another attempt is in
    /// flight or one finished less than the cooldown ago; the skipped
    /// caller must not retry its request.
    pub async fn try_reprovision(&self) -> ReprovisionOutcome {
        {
            let mut inner = self.lock_inner();
            if let GuardState::Reprovisioning { since } = inner.state {
                info!(
                    "reprovisioning already in flight for {:?}; skipping",
                    since.elapsed()
                );
                return ReprovisionOutcome::Skipped;
            }
            if let Some(last) = inner.last_attempt {
                if last.elapsed() < self.cooldown {
                    info!("reprovisioning attempted {:?} ago; within cooldown", last.elapsed());
                    return ReprovisionOutcome::Skipped;
                }
            }
            let now = Instant::now();
            inner.state = GuardState::Reprovisioning { since: now };
            inner.last_attempt = Some(now);
        }

        // State is restored to Idle on every exit path, including panics in
        // the provisioning future.
        let _reset = ResetOnDrop { guard: self };

        info!("signature rejected by backend; reprovisioning device");
        match self
            .identity
            .provision(&self.client_id, &self.registration_key, true)
            .await
        {
            Ok(device_id) => {
                info!("reprovisioned as device {device_id}");
                ReprovisionOutcome::Reprovisioned
            }
            Err(err) => {
                warn!("reprovisioning failed: {err}");
                ReprovisionOutcome::Failed(err.to_string())
            }
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, GuardInner> {
        // The critical sections never panic, but recover anyway rather than
        // wedging every future request on a poisoned lock.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

struct ResetOnDrop<'a> {
    guard: &'a ReprovisioningGuard,
}

impl Drop for ResetOnDrop<'_> {
    fn drop(&mut self) {
        self.guard.lock_inner().state = GuardState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_classification() {
        assert!(ReprovisioningGuard::should_trigger(
            401,
            r#"{"message":"Invalid signature"}"#
        ));
        assert!(ReprovisioningGuard::should_trigger(
            403,
            r#"{"message":"SIGNATURE verification failed"}"#
        ));
        // auth failures without a signature complaint are not ours
        assert!(!ReprovisioningGuard::should_trigger(
            401,
            r#"{"message":"Token expired"}"#
        ));
        assert!(!ReprovisioningGuard::should_trigger(
            500,
            r#"{"message":"Invalid signature"}"#
        ));
    }
}
