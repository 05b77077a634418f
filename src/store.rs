//! Shared State Store access.
//!
//! All cross-process state (per-user quota counters, in-flight locks,
//! usage stats, the quota-reset notification queue) lives in Redis and is
//! reached through the [`SessionStore`] trait so the mediation core can be
//! tested against an in-memory double (see [`crate::testing`]).
//!
//! The acquire check-and-set runs as a single Lua script: multiple bot
//! instances may share the same store, so the decision must be one atomic
//! operation, never a read-then-write pair.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use thiserror::Error;

use crate::config::Quota;
use crate::errors::AppResult;
use crate::provision::unix_now;

/// Key for the sorted set of pending quota-reset notifications
/// (member = requester id, score = unix expiry).
const QUOTA_RESETS_ZSET: &str = "quota_resets";

/// Store-level failures. The Guard fails closed on these: new requests
/// are denied rather than allowed to bypass the quota.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),
    #[error("state store returned an unexpected reply: {0}")]
    BadReply(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Outcome of an atomic acquire attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireDecision {
    /// The in-flight lock is held and the counter was incremented.
    Granted,
    /// The rolling counter already reached the window maximum.
    DeniedQuota {
        /// Time until the window expires, when the store knows it.
        retry_after: Option<Duration>,
    },
    /// The requester already has an outstanding request.
    DeniedConcurrent,
}

/// Global usage counters, read by `/admin`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub total_requests: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub unique_users: u64,
}

/// Per-user quota status, read by `/start` and `/mystats`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QuotaStatus {
    /// Requests already counted in the current window.
    pub used: u32,
    /// Time until the window resets, if a window is open.
    pub resets_in: Option<Duration>,
}

/// Async interface to the Shared State Store.
///
/// Every mutation of a single requester's session state is one atomic
/// store operation. No implementation may cache session state in-process.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Atomically checks quota + in-flight flag and, if allowed, sets the
    /// flag and increments the rolling counter.
    async fn try_acquire(&self, requester_id: i64, quota: &Quota) -> Result<AcquireDecision, StoreError>;

    /// Clears the in-flight flag. Idempotent; never touches the counter.
    async fn release(&self, requester_id: i64) -> Result<(), StoreError>;

    /// Current quota usage for one requester.
    async fn quota_status(&self, requester_id: i64) -> Result<QuotaStatus, StoreError>;

    /// Records one command invocation in the usage stats.
    async fn record_request(&self, requester_id: i64, command: &str) -> Result<(), StoreError>;

    /// Increments the global success counter.
    async fn record_success(&self) -> Result<(), StoreError>;

    /// Increments the global and per-kind error counters.
    async fn record_error(&self, kind: &str) -> Result<(), StoreError>;

    /// Global usage counters.
    async fn stats(&self) -> Result<UsageSnapshot, StoreError>;

    /// Lifetime request count for one requester.
    async fn user_request_count(&self, requester_id: i64) -> Result<u64, StoreError>;

    /// Schedules a quota-reset notification for `requester_id`, due
    /// `resets_in` from now. Overwrites any pending entry.
    async fn schedule_reset_notice(&self, requester_id: i64, resets_in: Duration) -> Result<(), StoreError>;

    /// Removes and returns requester ids whose notification time has
    /// passed. Each id is returned by exactly one caller across instances.
    async fn take_due_notices(&self, now: i64) -> Result<Vec<i64>, StoreError>;
}

pub(crate) fn inflight_key(requester_id: i64) -> String {
    format!("inflight:{}", requester_id)
}

pub(crate) fn quota_key(requester_id: i64) -> String {
    format!("quota:{}", requester_id)
}

fn user_requests_key(requester_id: i64) -> String {
    format!("stats:user_requests:{}", requester_id)
}

/// Parses the reply of the acquire script.
///
/// The script answers `"granted"`, `"inflight"`, or `"quota:<ttl>"` where
/// `<ttl>` is the remaining window TTL in seconds (negative when Redis
/// reports no expiry).
pub(crate) fn parse_acquire_reply(reply: &str) -> Result<AcquireDecision, StoreError> {
    match reply {
        "granted" => Ok(AcquireDecision::Granted),
        "inflight" => Ok(AcquireDecision::DeniedConcurrent),
        other => match other.strip_prefix("quota:") {
            Some(ttl) => {
                let secs: i64 = ttl
                    .parse()
                    .map_err(|_| StoreError::BadReply(other.to_string()))?;
                Ok(AcquireDecision::DeniedQuota {
                    retry_after: (secs > 0).then(|| Duration::from_secs(secs as u64)),
                })
            }
            None => Err(StoreError::BadReply(other.to_string())),
        },
    }
}

/// Redis-backed [`SessionStore`].
///
/// Uses a multiplexed [`ConnectionManager`] (reconnects internally) and a
/// server-side Lua script for the acquire check-and-set.
#[derive(Clone)]
pub struct RedisSessionStore {
    conn: ConnectionManager,
    acquire_script: Script,
}

/// KEYS[1] = inflight key, KEYS[2] = quota key.
/// ARGV[1] = max per window, ARGV[2] = window secs, ARGV[3] = lock TTL secs.
const ACQUIRE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 'inflight'
end
local count = tonumber(redis.call('GET', KEYS[2]) or '0')
if count >= tonumber(ARGV[1]) then
  return 'quota:' .. redis.call('TTL', KEYS[2])
end
count = redis.call('INCR', KEYS[2])
if count == 1 then
  redis.call('EXPIRE', KEYS[2], ARGV[2])
end
redis.call('SET', KEYS[1], '1', 'EX', ARGV[3])
return 'granted'
"#;

impl RedisSessionStore {
    /// Connects to Redis and verifies the connection with a PING.
    pub async fn connect(redis_url: &str) -> AppResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let mut conn = client.get_connection_manager().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        log::info!("Connected to Redis");

        Ok(Self {
            conn,
            acquire_script: Script::new(ACQUIRE_SCRIPT),
        })
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn try_acquire(&self, requester_id: i64, quota: &Quota) -> Result<AcquireDecision, StoreError> {
        let mut conn = self.conn.clone();
        let reply: String = self
            .acquire_script
            .key(inflight_key(requester_id))
            .key(quota_key(requester_id))
            .arg(quota.max_per_window)
            .arg(quota.window.as_secs())
            .arg(quota.inflight_ttl.as_secs())
            .invoke_async(&mut conn)
            .await?;
        parse_acquire_reply(&reply)
    }

    async fn release(&self, requester_id: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        // DEL of a missing key is a no-op, so double release is harmless.
        let _: i64 = conn.del(inflight_key(requester_id)).await?;
        Ok(())
    }

    async fn quota_status(&self, requester_id: i64) -> Result<QuotaStatus, StoreError> {
        let mut conn = self.conn.clone();
        let key = quota_key(requester_id);
        let (used, ttl): (Option<u32>, i64) = redis::pipe()
            .get(&key)
            .ttl(&key)
            .query_async(&mut conn)
            .await?;
        Ok(QuotaStatus {
            used: used.unwrap_or(0),
            resets_in: (ttl > 0).then(|| Duration::from_secs(ttl as u64)),
        })
    }

    async fn record_request(&self, requester_id: i64, command: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .incr("stats:total_requests", 1)
            .ignore()
            .incr(user_requests_key(requester_id), 1)
            .ignore()
            .incr(format!("stats:commands:{}", command), 1)
            .ignore()
            .sadd("stats:unique_users", requester_id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn record_success(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.incr("stats:success_count", 1).await?;
        Ok(())
    }

    async fn record_error(&self, kind: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .incr("stats:error_count", 1)
            .ignore()
            .incr(format!("stats:errors:{}", kind), 1)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn stats(&self) -> Result<UsageSnapshot, StoreError> {
        let mut conn = self.conn.clone();
        let (total, success, errors, users): (Option<u64>, Option<u64>, Option<u64>, u64) =
            redis::pipe()
                .get("stats:total_requests")
                .get("stats:success_count")
                .get("stats:error_count")
                .scard("stats:unique_users")
                .query_async(&mut conn)
                .await?;
        Ok(UsageSnapshot {
            total_requests: total.unwrap_or(0),
            success_count: success.unwrap_or(0),
            error_count: errors.unwrap_or(0),
            unique_users: users,
        })
    }

    async fn user_request_count(&self, requester_id: i64) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let count: Option<u64> = conn.get(user_requests_key(requester_id)).await?;
        Ok(count.unwrap_or(0))
    }

    async fn schedule_reset_notice(&self, requester_id: i64, resets_in: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let notify_at = unix_now() + resets_in.as_secs() as i64;
        let _: i64 = conn.zadd(QUOTA_RESETS_ZSET, requester_id, notify_at).await?;
        Ok(())
    }

    async fn take_due_notices(&self, now: i64) -> Result<Vec<i64>, StoreError> {
        let mut conn = self.conn.clone();
        let due: Vec<i64> = conn.zrangebyscore(QUOTA_RESETS_ZSET, 0, now).await?;

        // ZREM returns how many members this call removed; with several
        // bot instances polling the same zset, only the one that actually
        // removed an entry gets to notify that user.
        let mut taken = Vec::with_capacity(due.len());
        for requester_id in due {
            let removed: i64 = conn.zrem(QUOTA_RESETS_ZSET, requester_id).await?;
            if removed > 0 {
                taken.push(requester_id);
            }
        }
        Ok(taken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout_is_stable() {
        // These keys are shared with other bot instances; renaming them
        // would orphan live state.
        assert_eq!(inflight_key(42), "inflight:42");
        assert_eq!(quota_key(42), "quota:42");
        assert_eq!(user_requests_key(42), "stats:user_requests:42");
    }

    #[test]
    fn acquire_reply_granted() {
        assert_eq!(parse_acquire_reply("granted").unwrap(), AcquireDecision::Granted);
    }

    #[test]
    fn acquire_reply_inflight() {
        assert_eq!(
            parse_acquire_reply("inflight").unwrap(),
            AcquireDecision::DeniedConcurrent
        );
    }

    #[test]
    fn acquire_reply_quota_with_ttl() {
        assert_eq!(
            parse_acquire_reply("quota:90").unwrap(),
            AcquireDecision::DeniedQuota {
                retry_after: Some(Duration::from_secs(90))
            }
        );
    }

    #[test]
    fn acquire_reply_quota_without_ttl() {
        // TTL is -1/-2 when the key has no expiry or vanished mid-script.
        assert_eq!(
            parse_acquire_reply("quota:-1").unwrap(),
            AcquireDecision::DeniedQuota { retry_after: None }
        );
    }

    #[test]
    fn acquire_reply_garbage_is_an_error() {
        assert!(parse_acquire_reply("wat").is_err());
        assert!(parse_acquire_reply("quota:abc").is_err());
    }
}
