//! Test support: an in-memory [`SessionStore`] with a manual clock.
//!
//! Production code never touches this module; it exists so the Guard and
//! Coordinator can be exercised without a live Redis, including window
//! expiry (via [`MemorySessionStore::advance`]) and store outages (via
//! [`MemorySessionStore::set_unavailable`]).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::Quota;
use crate::store::{AcquireDecision, QuotaStatus, SessionStore, StoreError, UsageSnapshot};

#[derive(Default)]
struct Inner {
    /// requester id -> lock expiry (unix seconds)
    inflight: HashMap<i64, i64>,
    /// requester id -> (count, window expiry)
    quota: HashMap<i64, (u32, i64)>,
    total_requests: u64,
    success_count: u64,
    error_count: u64,
    unique_users: HashSet<i64>,
    user_requests: HashMap<i64, u64>,
    /// requester id -> notify-at (unix seconds)
    notices: HashMap<i64, i64>,
}

/// In-memory stand-in for Redis with the same acquire/release semantics.
pub struct MemorySessionStore {
    inner: Mutex<Inner>,
    now: AtomicI64,
    unavailable: AtomicBool,
    acquire_calls: AtomicU32,
    release_calls: AtomicU32,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            // Arbitrary fixed epoch so tests are deterministic.
            now: AtomicI64::new(1_700_000_000),
            unavailable: AtomicBool::new(false),
            acquire_calls: AtomicU32::new(0),
            release_calls: AtomicU32::new(0),
        }
    }

    /// Moves the simulated clock forward.
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_secs() as i64, Ordering::SeqCst);
    }

    pub fn now(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }

    /// When set, every store operation fails with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// How many times `try_acquire` was called.
    pub fn acquire_calls(&self) -> u32 {
        self.acquire_calls.load(Ordering::SeqCst)
    }

    /// How many times `release` was called.
    pub fn release_calls(&self) -> u32 {
        self.release_calls.load(Ordering::SeqCst)
    }

    /// Pending quota-reset notices (requester id -> notify-at).
    pub async fn pending_notices(&self) -> HashMap<i64, i64> {
        self.inner.lock().await.notices.clone()
    }

    /// Current rolling counter for a requester, ignoring expiry.
    pub async fn raw_quota_count(&self, requester_id: i64) -> u32 {
        self.inner
            .lock()
            .await
            .quota
            .get(&requester_id)
            .map(|(count, _)| *count)
            .unwrap_or(0)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("simulated outage".to_string()))
        } else {
            Ok(())
        }
    }

    /// Drops expired locks and counters, mimicking Redis TTL expiry.
    fn purge_expired(inner: &mut Inner, now: i64) {
        inner.inflight.retain(|_, expiry| *expiry > now);
        inner.quota.retain(|_, (_, expiry)| *expiry > now);
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn try_acquire(&self, requester_id: i64, quota: &Quota) -> Result<AcquireDecision, StoreError> {
        self.acquire_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let now = self.now();
        let mut inner = self.inner.lock().await;
        Self::purge_expired(&mut inner, now);

        if inner.inflight.contains_key(&requester_id) {
            return Ok(AcquireDecision::DeniedConcurrent);
        }

        let window_secs = quota.window.as_secs() as i64;
        let entry = inner.quota.entry(requester_id).or_insert((0, now + window_secs));
        if entry.0 >= quota.max_per_window {
            let retry_after = (entry.1 - now).max(0) as u64;
            return Ok(AcquireDecision::DeniedQuota {
                retry_after: (retry_after > 0).then(|| Duration::from_secs(retry_after)),
            });
        }
        entry.0 += 1;

        let lock_expiry = now + quota.inflight_ttl.as_secs() as i64;
        inner.inflight.insert(requester_id, lock_expiry);
        Ok(AcquireDecision::Granted)
    }

    async fn release(&self, requester_id: i64) -> Result<(), StoreError> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        self.inner.lock().await.inflight.remove(&requester_id);
        Ok(())
    }

    async fn quota_status(&self, requester_id: i64) -> Result<QuotaStatus, StoreError> {
        self.check_available()?;
        let now = self.now();
        let mut inner = self.inner.lock().await;
        Self::purge_expired(&mut inner, now);
        Ok(match inner.quota.get(&requester_id) {
            Some((used, expiry)) => QuotaStatus {
                used: *used,
                resets_in: Some(Duration::from_secs((*expiry - now).max(0) as u64)),
            },
            None => QuotaStatus::default(),
        })
    }

    async fn record_request(&self, requester_id: i64, _command: &str) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner.total_requests += 1;
        inner.unique_users.insert(requester_id);
        *inner.user_requests.entry(requester_id).or_default() += 1;
        Ok(())
    }

    async fn record_success(&self) -> Result<(), StoreError> {
        self.check_available()?;
        self.inner.lock().await.success_count += 1;
        Ok(())
    }

    async fn record_error(&self, _kind: &str) -> Result<(), StoreError> {
        self.check_available()?;
        self.inner.lock().await.error_count += 1;
        Ok(())
    }

    async fn stats(&self) -> Result<UsageSnapshot, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(UsageSnapshot {
            total_requests: inner.total_requests,
            success_count: inner.success_count,
            error_count: inner.error_count,
            unique_users: inner.unique_users.len() as u64,
        })
    }

    async fn user_request_count(&self, requester_id: i64) -> Result<u64, StoreError> {
        self.check_available()?;
        Ok(self
            .inner
            .lock()
            .await
            .user_requests
            .get(&requester_id)
            .copied()
            .unwrap_or(0))
    }

    async fn schedule_reset_notice(&self, requester_id: i64, resets_in: Duration) -> Result<(), StoreError> {
        self.check_available()?;
        let notify_at = self.now() + resets_in.as_secs() as i64;
        self.inner.lock().await.notices.insert(requester_id, notify_at);
        Ok(())
    }

    async fn take_due_notices(&self, now: i64) -> Result<Vec<i64>, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let due: Vec<i64> = inner
            .notices
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &due {
            inner.notices.remove(id);
        }
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn due_notices_are_taken_exactly_once() {
        let store = MemorySessionStore::new();
        store.schedule_reset_notice(1, Duration::from_secs(10)).await.unwrap();
        store.schedule_reset_notice(2, Duration::from_secs(100)).await.unwrap();

        store.advance(Duration::from_secs(10));
        assert_eq!(store.take_due_notices(store.now()).await.unwrap(), vec![1]);
        // A second poll must not hand the same id out again.
        assert!(store.take_due_notices(store.now()).await.unwrap().is_empty());

        store.advance(Duration::from_secs(90));
        assert_eq!(store.take_due_notices(store.now()).await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn rescheduling_overwrites_the_pending_notice() {
        let store = MemorySessionStore::new();
        store.schedule_reset_notice(1, Duration::from_secs(10)).await.unwrap();
        store.schedule_reset_notice(1, Duration::from_secs(50)).await.unwrap();

        store.advance(Duration::from_secs(10));
        assert!(store.take_due_notices(store.now()).await.unwrap().is_empty());

        store.advance(Duration::from_secs(40));
        assert_eq!(store.take_due_notices(store.now()).await.unwrap(), vec![1]);
    }
}
