//! Rate/Usage Guard.
//!
//! Enforces the per-user quota and the one-in-flight-request invariant
//! against the Shared State Store. The store does the atomic check-and-set;
//! the Guard owns the policy ([`Quota`]) and the fail-closed behavior: if
//! the store cannot be reached, requests are denied rather than allowed to
//! bypass the quota.

use std::sync::Arc;

use crate::config::Quota;
use crate::store::{AcquireDecision, QuotaStatus, SessionStore, StoreError};

#[derive(Clone)]
pub struct UsageGuard {
    store: Arc<dyn SessionStore>,
    quota: Quota,
}

impl UsageGuard {
    pub fn new(store: Arc<dyn SessionStore>, quota: Quota) -> Self {
        Self { store, quota }
    }

    pub fn quota(&self) -> &Quota {
        &self.quota
    }

    /// Atomically checks and, if allowed, claims a request slot.
    ///
    /// A second command from the same user while one is in flight gets
    /// `DeniedConcurrent` immediately; there is no queueing.
    pub async fn try_acquire(&self, requester_id: i64) -> Result<AcquireDecision, StoreError> {
        let decision = self.store.try_acquire(requester_id, &self.quota).await?;
        match &decision {
            AcquireDecision::Granted => {
                log::debug!("guard: granted slot to {}", requester_id);
            }
            AcquireDecision::DeniedQuota { retry_after } => {
                log::info!("guard: quota denial for {} (retry after {:?})", requester_id, retry_after);
            }
            AcquireDecision::DeniedConcurrent => {
                log::info!("guard: concurrent denial for {}", requester_id);
            }
        }
        Ok(decision)
    }

    /// Clears the in-flight flag.
    ///
    /// Must run on every exit path of a granted request, including timeout
    /// and failure paths. Idempotent, and a store failure here is logged
    /// rather than propagated: the lock has a TTL, so the user recovers
    /// even if this release is lost.
    pub async fn release(&self, requester_id: i64) {
        if let Err(e) = self.store.release(requester_id).await {
            log::error!(
                "guard: failed to release in-flight flag for {} (lock TTL will clear it): {}",
                requester_id,
                e
            );
        }
    }

    /// Current usage within the window, for status displays.
    pub async fn status(&self, requester_id: i64) -> Result<QuotaStatus, StoreError> {
        self.store.quota_status(requester_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemorySessionStore;
    use std::time::Duration;

    fn quota(max: u32, window_secs: u64) -> Quota {
        Quota {
            max_per_window: max,
            window: Duration::from_secs(window_secs),
            inflight_ttl: Duration::from_secs(120),
        }
    }

    fn guard_with_store(max: u32, window_secs: u64) -> (UsageGuard, Arc<MemorySessionStore>) {
        let store = Arc::new(MemorySessionStore::new());
        (UsageGuard::new(store.clone(), quota(max, window_secs)), store)
    }

    #[tokio::test]
    async fn second_acquire_before_release_is_denied_concurrent() {
        let (guard, _) = guard_with_store(10, 60);

        assert_eq!(guard.try_acquire(1).await.unwrap(), AcquireDecision::Granted);
        assert_eq!(
            guard.try_acquire(1).await.unwrap(),
            AcquireDecision::DeniedConcurrent
        );
    }

    #[tokio::test]
    async fn concurrent_acquires_yield_exactly_one_grant() {
        let (guard, _) = guard_with_store(10, 60);

        let (a, b) = tokio::join!(guard.try_acquire(1), guard.try_acquire(1));
        let decisions = [a.unwrap(), b.unwrap()];
        let grants = decisions
            .iter()
            .filter(|d| **d == AcquireDecision::Granted)
            .count();
        let concurrent = decisions
            .iter()
            .filter(|d| **d == AcquireDecision::DeniedConcurrent)
            .count();
        assert_eq!(grants, 1);
        assert_eq!(concurrent, 1);
    }

    #[tokio::test]
    async fn users_do_not_share_locks_or_quota() {
        let (guard, _) = guard_with_store(1, 60);

        assert_eq!(guard.try_acquire(1).await.unwrap(), AcquireDecision::Granted);
        assert_eq!(guard.try_acquire(2).await.unwrap(), AcquireDecision::Granted);
    }

    #[tokio::test]
    async fn quota_exhaustion_and_window_reset() {
        let (guard, store) = guard_with_store(3, 60);

        for _ in 0..3 {
            assert_eq!(guard.try_acquire(1).await.unwrap(), AcquireDecision::Granted);
            guard.release(1).await;
        }
        assert!(matches!(
            guard.try_acquire(1).await.unwrap(),
            AcquireDecision::DeniedQuota { retry_after: Some(_) }
        ));

        // Window elapses; counter resets by expiry, not manual clearing.
        store.advance(Duration::from_secs(61));
        assert_eq!(guard.try_acquire(1).await.unwrap(), AcquireDecision::Granted);
    }

    #[tokio::test]
    async fn quota_denial_reports_remaining_window() {
        let (guard, store) = guard_with_store(1, 60);

        assert_eq!(guard.try_acquire(1).await.unwrap(), AcquireDecision::Granted);
        guard.release(1).await;
        store.advance(Duration::from_secs(20));

        match guard.try_acquire(1).await.unwrap() {
            AcquireDecision::DeniedQuota { retry_after: Some(left) } => {
                assert_eq!(left, Duration::from_secs(40));
            }
            other => panic!("expected quota denial with retry_after, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn release_is_idempotent_and_never_underflows() {
        let (guard, store) = guard_with_store(3, 60);

        assert_eq!(guard.try_acquire(1).await.unwrap(), AcquireDecision::Granted);
        guard.release(1).await;
        guard.release(1).await;
        guard.release(1).await;

        // Counter untouched by releases.
        assert_eq!(store.raw_quota_count(1).await, 1);
        assert_eq!(guard.try_acquire(1).await.unwrap(), AcquireDecision::Granted);
    }

    #[tokio::test]
    async fn stale_inflight_lock_expires_via_ttl() {
        let store = Arc::new(MemorySessionStore::new());
        let quota = Quota {
            max_per_window: 10,
            window: Duration::from_secs(600),
            inflight_ttl: Duration::from_secs(120),
        };
        let guard = UsageGuard::new(store.clone(), quota);

        assert_eq!(guard.try_acquire(1).await.unwrap(), AcquireDecision::Granted);
        // Instance died without releasing; the lock TTL frees the user.
        store.advance(Duration::from_secs(121));
        assert_eq!(guard.try_acquire(1).await.unwrap(), AcquireDecision::Granted);
    }

    #[tokio::test]
    async fn store_outage_fails_closed() {
        let (guard, store) = guard_with_store(3, 60);
        store.set_unavailable(true);

        assert!(guard.try_acquire(1).await.is_err());
    }
}
