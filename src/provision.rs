//! Provisioning Client: HTTP bridge to the external SSH panel API.
//!
//! One POST per attempt, bounded by a per-call timeout. Outcomes are
//! classified, never surfaced raw: 2xx is success, 4xx is the caller's
//! fault and never retried, 5xx and network failures are transient and
//! retried a few times with exponential backoff and jitter. A timeout is
//! terminal for the call — the remote API may not be idempotent, so we do
//! not fire blind duplicates at it.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::config::ProvisionConfig;
use crate::errors::AppResult;

/// Fixed `store_owner_id` the panel expects in every request.
const STORE_OWNER_ID: u32 = 1;

/// A validated, immutable provisioning request.
#[derive(Debug, Clone)]
pub struct ProvisioningRequest {
    pub requester_id: i64,
    pub username: String,
    /// Unix seconds at construction time.
    pub created_at: i64,
}

impl ProvisioningRequest {
    pub fn new(requester_id: i64, username: String) -> Self {
        Self {
            requester_id,
            username,
            created_at: unix_now(),
        }
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Wire payload for the panel's account-creation endpoint.
#[derive(Debug, Serialize)]
struct ApiPayload<'a> {
    store_owner_id: u32,
    user_id: i64,
    username: &'a str,
    timestamp: i64,
}

/// Account fields returned by the panel. The panel answers in Portuguese
/// (`Usuario`/`Senha`/`Expiracao`); snake_case spellings are accepted too.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct AccountDetails {
    #[serde(default, alias = "Usuario", alias = "usuario", alias = "user")]
    pub username: Option<String>,
    #[serde(default, alias = "Senha", alias = "senha")]
    pub password: Option<String>,
    #[serde(default, alias = "Expiracao", alias = "expiracao", alias = "expires_at")]
    pub expires: Option<String>,
}

/// Outcome of one provisioning call, after the retry budget is spent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningResult {
    Success { details: AccountDetails },
    /// 4xx or an unusable response body; the message stays internal.
    RemoteError { code: u16, message: String },
    /// The per-call timeout fired. Terminal: no silent retry.
    Timeout,
    /// 5xx or network failure with the retry budget exhausted.
    Transient { retry_after: Option<Duration> },
}

/// Backoff policy for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub add_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Calculates the delay before retry number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let final_delay = if self.add_jitter {
            // Up to 25% jitter so concurrent retries spread out.
            capped + rand::random::<f64>() * 0.25 * capped
        } else {
            capped
        };

        Duration::from_secs_f64(final_delay)
    }
}

/// What a single attempt produced.
enum Attempt {
    /// Terminal for the whole call.
    Done(ProvisioningResult),
    /// Worth another attempt if budget remains.
    Transient { retry_after: Option<Duration> },
}

pub struct ProvisioningClient {
    http: reqwest::Client,
    api_url: String,
    retry: RetryPolicy,
}

impl ProvisioningClient {
    /// Builds a client with the per-call timeout baked into the HTTP
    /// client, so every attempt is individually bounded.
    pub fn new(api_url: &str, config: &ProvisionConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            api_url: api_url.to_string(),
            retry: RetryPolicy {
                max_retries: config.max_retries,
                base_delay: config.retry_base,
                ..RetryPolicy::default()
            },
        })
    }

    /// Builds a client with an explicit retry policy. Used by tests to
    /// shrink delays.
    pub fn with_policy(api_url: &str, timeout: Duration, retry: RetryPolicy) -> AppResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            api_url: api_url.to_string(),
            retry,
        })
    }

    /// Issues the provisioning call, retrying transient failures within
    /// the configured budget. Always returns a classified result.
    pub async fn provision(&self, request: &ProvisioningRequest) -> ProvisioningResult {
        let mut attempt = 0u32;
        loop {
            match self.attempt(request).await {
                Attempt::Done(result) => return result,
                Attempt::Transient { retry_after } if attempt < self.retry.max_retries => {
                    // A server hint is advisory; never sleep past max_delay,
                    // or a bad hint could hold the in-flight lock to its TTL.
                    let delay = retry_after
                        .unwrap_or_else(|| self.retry.delay_for_attempt(attempt))
                        .min(self.retry.max_delay);
                    attempt += 1;
                    log::warn!(
                        "provisioning attempt {}/{} failed for {}, retrying in {:?}",
                        attempt,
                        self.retry.max_retries + 1,
                        request.requester_id,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Attempt::Transient { retry_after } => {
                    log::error!(
                        "provisioning retries exhausted for {} after {} attempts",
                        request.requester_id,
                        attempt + 1
                    );
                    return ProvisioningResult::Transient { retry_after };
                }
            }
        }
    }

    async fn attempt(&self, request: &ProvisioningRequest) -> Attempt {
        let payload = ApiPayload {
            store_owner_id: STORE_OWNER_ID,
            user_id: request.requester_id,
            username: &request.username,
            timestamp: request.created_at,
        };

        let response = match self.http.post(&self.api_url).json(&payload).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                log::warn!("provisioning call timed out for {}", request.requester_id);
                return Attempt::Done(ProvisioningResult::Timeout);
            }
            Err(e) => {
                log::warn!("provisioning network failure for {}: {}", request.requester_id, e);
                return Attempt::Transient { retry_after: None };
            }
        };

        let status = response.status();
        if status.is_success() {
            return match response.json::<AccountDetails>().await {
                Ok(details) => Attempt::Done(ProvisioningResult::Success { details }),
                Err(e) if e.is_timeout() => Attempt::Done(ProvisioningResult::Timeout),
                Err(e) => Attempt::Done(ProvisioningResult::RemoteError {
                    code: status.as_u16(),
                    message: format!("unusable response body: {}", e),
                }),
            };
        }

        let retry_after = parse_retry_after(&response);
        let body = response.text().await.unwrap_or_default();
        let message = truncate(&body, 200);

        if status.is_server_error() {
            Attempt::Transient { retry_after }
        } else {
            // Caller fault; retrying would just repeat the refusal.
            Attempt::Done(ProvisioningResult::RemoteError {
                code: status.as_u16(),
                message,
            })
        }
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            backoff_multiplier: 2.0,
            add_jitter: false,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4)); // capped
    }

    #[test]
    fn jitter_stays_within_a_quarter_of_the_delay() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(1),
            add_jitter: true,
            ..RetryPolicy::default()
        };

        for _ in 0..50 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= Duration::from_secs(1));
            assert!(delay <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn account_details_accepts_panel_field_names() {
        let details: AccountDetails =
            serde_json::from_str(r#"{"Usuario":"u1","Senha":"pw","Expiracao":"3h"}"#).unwrap();
        assert_eq!(details.username.as_deref(), Some("u1"));
        assert_eq!(details.password.as_deref(), Some("pw"));
        assert_eq!(details.expires.as_deref(), Some("3h"));
    }

    #[test]
    fn account_details_accepts_snake_case_and_missing_fields() {
        let details: AccountDetails =
            serde_json::from_str(r#"{"username":"u2","password":"pw2"}"#).unwrap();
        assert_eq!(details.username.as_deref(), Some("u2"));
        assert_eq!(details.expires, None);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 200), "short");
        let cut = truncate("приветприветпривет", 5);
        assert!(cut.len() <= 5 + "…".len());
    }
}
