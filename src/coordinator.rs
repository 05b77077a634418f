//! Request Coordinator.
//!
//! Orchestrates one user command end to end: validate the input, ask the
//! Guard for a slot, call the Provisioning Client, and map the result to a
//! single user-facing message. States per request:
//! Received → Guarded → Calling → Completed, or Rejected on validation
//! failure/denial, or Failed on timeout/exhausted retries.
//!
//! The Guard's `release` runs on every exit from the Calling state. A
//! drop guard backs this up so cancellation or a panic inside the call
//! cannot leave the user permanently locked.

use std::sync::Arc;

use crate::guard::UsageGuard;
use crate::messages::UserFacingOutcome;
use crate::provision::{ProvisioningClient, ProvisioningRequest, ProvisioningResult};
use crate::store::{AcquireDecision, SessionStore};

const USERNAME_MIN: usize = 3;
const USERNAME_MAX: usize = 32;

pub struct Coordinator {
    guard: UsageGuard,
    client: ProvisioningClient,
    store: Arc<dyn SessionStore>,
}

/// Releases the in-flight slot from `Drop` unless defused. The normal
/// path awaits `release` directly and then defuses; this only fires when
/// the future is cancelled or the call panics.
struct ReleaseOnDrop {
    guard: UsageGuard,
    requester_id: i64,
    armed: bool,
}

impl ReleaseOnDrop {
    fn new(guard: UsageGuard, requester_id: i64) -> Self {
        Self {
            guard,
            requester_id,
            armed: true,
        }
    }

    fn defuse(&mut self) {
        self.armed = false;
    }
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        if self.armed {
            let guard = self.guard.clone();
            let requester_id = self.requester_id;
            tokio::spawn(async move {
                guard.release(requester_id).await;
            });
        }
    }
}

impl Coordinator {
    pub fn new(guard: UsageGuard, client: ProvisioningClient, store: Arc<dyn SessionStore>) -> Self {
        Self {
            guard,
            client,
            store,
        }
    }

    pub fn guard(&self) -> &UsageGuard {
        &self.guard
    }

    /// Handles one user command. Always produces exactly one outcome.
    ///
    /// `raw_command` is the argument text of the request (the desired
    /// account username, possibly empty).
    pub async fn handle(&self, requester_id: i64, raw_command: &str) -> UserFacingOutcome {
        // Received: validate before touching the Guard.
        let request = match build_request(requester_id, raw_command) {
            Ok(request) => request,
            Err(reason) => {
                log::info!("rejected invalid request from {}: {}", requester_id, reason);
                return UserFacingOutcome::InvalidRequest { reason };
            }
        };

        // Guarded.
        match self.guard.try_acquire(requester_id).await {
            Err(e) => {
                // Store unreachable: fail closed, no API call.
                log::error!("store unavailable, denying request from {}: {}", requester_id, e);
                UserFacingOutcome::TemporarilyUnavailable
            }
            Ok(AcquireDecision::DeniedQuota { retry_after }) => {
                UserFacingOutcome::QuotaExceeded { retry_after }
            }
            Ok(AcquireDecision::DeniedConcurrent) => UserFacingOutcome::RequestInProgress,
            Ok(AcquireDecision::Granted) => {
                // Calling.
                let mut release_guard = ReleaseOnDrop::new(self.guard.clone(), requester_id);
                let result = self.client.provision(&request).await;
                self.guard.release(requester_id).await;
                release_guard.defuse();

                self.complete(requester_id, result).await
            }
        }
    }

    /// Maps the client result to an outcome and records side effects
    /// (stats, quota-reset notice). Stats failures are logged, never
    /// surfaced.
    async fn complete(&self, requester_id: i64, result: ProvisioningResult) -> UserFacingOutcome {
        match result {
            ProvisioningResult::Success { details } => {
                if let Err(e) = self.store.record_success().await {
                    log::warn!("failed to record success stat: {}", e);
                }
                self.maybe_schedule_reset_notice(requester_id).await;
                UserFacingOutcome::AccountCreated {
                    username: details.username.unwrap_or_else(|| "N/A".to_string()),
                    password: details.password.unwrap_or_else(|| "N/A".to_string()),
                    expires: details.expires.unwrap_or_else(|| "N/A".to_string()),
                }
            }
            ProvisioningResult::RemoteError { code, message } => {
                // Full detail stays in the logs; the user gets a category.
                log::error!(
                    "provisioning refused for {}: status {} body {:?}",
                    requester_id,
                    code,
                    message
                );
                self.record_error("remote").await;
                UserFacingOutcome::ProvisioningFailed
            }
            ProvisioningResult::Timeout => {
                self.record_error("timeout").await;
                UserFacingOutcome::TryAgainLater
            }
            ProvisioningResult::Transient { .. } => {
                self.record_error("transient").await;
                UserFacingOutcome::TryAgainLater
            }
        }
    }

    /// Parks the "you can request again" notice at the window's actual
    /// expiry, and only once this success used the last slot. The window
    /// starts at the first request, so a later success must not push the
    /// notice past the real reset.
    async fn maybe_schedule_reset_notice(&self, requester_id: i64) {
        let quota = self.guard.quota();
        match self.guard.status(requester_id).await {
            Ok(status) if status.used >= quota.max_per_window => {
                let resets_in = status.resets_in.unwrap_or(quota.window);
                if let Err(e) = self.store.schedule_reset_notice(requester_id, resets_in).await {
                    log::warn!("failed to schedule reset notice for {}: {}", requester_id, e);
                }
            }
            Ok(_) => {}
            Err(e) => {
                log::warn!("failed to read quota status for {}: {}", requester_id, e);
            }
        }
    }

    async fn record_error(&self, kind: &str) {
        if let Err(e) = self.store.record_error(kind).await {
            log::warn!("failed to record error stat: {}", e);
        }
    }
}

/// Validates the raw command into a [`ProvisioningRequest`].
///
/// An empty argument falls back to a deterministic `tg<id>` username;
/// anything explicit must be 3-32 chars of `[a-z A-Z 0-9 _ -]`.
fn build_request(requester_id: i64, raw_command: &str) -> Result<ProvisioningRequest, String> {
    let raw = raw_command.trim();

    let username = if raw.is_empty() {
        format!("tg{}", requester_id)
    } else {
        if raw.len() < USERNAME_MIN || raw.len() > USERNAME_MAX {
            return Err(format!(
                "Username must be {}-{} characters long.",
                USERNAME_MIN, USERNAME_MAX
            ));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err("Username may only contain letters, digits, '_' and '-'.".to_string());
        }
        raw.to_string()
    };

    Ok(ProvisioningRequest::new(requester_id, username))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_command_falls_back_to_telegram_id() {
        let request = build_request(42, "  ").unwrap();
        assert_eq!(request.username, "tg42");
        assert_eq!(request.requester_id, 42);
    }

    #[test]
    fn explicit_username_is_kept() {
        assert_eq!(build_request(1, "alice_dev").unwrap().username, "alice_dev");
    }

    #[test]
    fn rejects_bad_characters() {
        assert!(build_request(1, "bad name").is_err());
        assert!(build_request(1, "héllo").is_err());
        assert!(build_request(1, "a;rm-rf").is_err());
    }

    #[test]
    fn rejects_bad_lengths() {
        assert!(build_request(1, "ab").is_err());
        assert!(build_request(1, &"x".repeat(33)).is_err());
        assert!(build_request(1, "abc").is_ok());
    }
}
