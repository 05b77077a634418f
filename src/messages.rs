//! User-facing outcome messages.
//!
//! Every terminal state of a request maps to exactly one entry here.
//! Internal detail (HTTP status codes, store errors, raw response bodies)
//! never reaches these texts.

use std::time::Duration;

use crate::store::{QuotaStatus, UsageSnapshot};

/// The one message a user receives for a handled command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserFacingOutcome {
    /// Account created; fields already defaulted to "N/A" where the panel
    /// omitted them.
    AccountCreated {
        username: String,
        password: String,
        expires: String,
    },
    /// The command itself was malformed.
    InvalidRequest { reason: String },
    /// Window quota reached.
    QuotaExceeded { retry_after: Option<Duration> },
    /// A previous request from the same user is still in flight.
    RequestInProgress,
    /// The panel refused the request.
    ProvisioningFailed,
    /// Timeout or exhausted transient retries.
    TryAgainLater,
    /// The Shared State Store is unreachable; we fail closed.
    TemporarilyUnavailable,
}

impl UserFacingOutcome {
    /// Renders the message sent to the user.
    pub fn text(&self) -> String {
        match self {
            Self::AccountCreated {
                username,
                password,
                expires,
            } => format!(
                "🎉 SSH account created!\n\n\
                 👤 User: `{}`\n\
                 🔑 Password: `{}`\n\
                 ⏰ Valid for: {}\n\n\
                 You'll get a message when you can request a new one.",
                username, password, expires
            ),
            Self::InvalidRequest { reason } => format!("❌ {}", reason),
            Self::QuotaExceeded { retry_after } => match retry_after {
                Some(left) => format!("⏳ Request limit reached. Try again in {}.", format_duration(*left)),
                None => "⏳ Request limit reached. Try again later.".to_string(),
            },
            Self::RequestInProgress => {
                "⏳ Your previous request is still being processed.".to_string()
            }
            Self::ProvisioningFailed => {
                "❌ Account creation failed. Please try again later.".to_string()
            }
            Self::TryAgainLater => {
                "⚠️ The account service didn't respond. Please try again later.".to_string()
            }
            Self::TemporarilyUnavailable => {
                "🛠 The bot is temporarily unavailable. Please try again in a few minutes.".to_string()
            }
        }
    }
}

/// Text for the `/start` greeting.
pub fn start_text(status: &QuotaStatus, max_per_window: u32) -> String {
    format!(
        "🔐 Trial SSH account bot\n\n\
         Quota: {}/{} requests this window{}\n\n\
         Press the button below to get an account.",
        status.used,
        max_per_window,
        match status.resets_in {
            Some(left) => format!(" (resets in {})", format_duration(left)),
            None => String::new(),
        }
    )
}

/// Text for `/mystats`.
pub fn my_stats_text(total_requests: u64, status: &QuotaStatus, max_per_window: u32) -> String {
    format!(
        "📊 Your stats\n\n\
         • Total requests: {}\n\
         • Quota: {}/{} this window{}",
        total_requests,
        status.used,
        max_per_window,
        match status.resets_in {
            Some(left) => format!(", resets in {}", format_duration(left)),
            None => String::new(),
        }
    )
}

/// Text for `/admin`.
pub fn admin_stats_text(stats: &UsageSnapshot) -> String {
    format!(
        "🔧 Global stats\n\n\
         • Total requests: {}\n\
         • Successes: {}\n\
         • Errors: {}\n\
         • Unique users: {}",
        stats.total_requests, stats.success_count, stats.error_count, stats.unique_users
    )
}

/// Quota-reset notification.
pub fn reset_notice_text() -> &'static str {
    "⏰ Your quota window has reset. You can request a new SSH account now."
}

/// Sent to non-admins calling `/admin`.
pub fn admin_only_text() -> &'static str {
    "❌ This command is for admins only."
}

/// Compact human form: "1d 2h", "3h 5m", "45s".
pub fn format_duration(d: Duration) -> String {
    let total = d.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{}d", days));
    }
    if hours > 0 {
        parts.push(format!("{}h", hours));
    }
    if minutes > 0 {
        parts.push(format!("{}m", minutes));
    }
    if parts.is_empty() {
        parts.push(format!("{}s", seconds));
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_formatting() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0s");
        assert_eq!(format_duration(Duration::from_secs(45)), "45s");
        assert_eq!(format_duration(Duration::from_secs(185)), "3m");
        assert_eq!(format_duration(Duration::from_secs(3 * 3600 + 300)), "3h 5m");
        assert_eq!(format_duration(Duration::from_secs(90_000)), "1d 1h");
    }

    #[test]
    fn success_text_contains_account_details() {
        let outcome = UserFacingOutcome::AccountCreated {
            username: "u1".to_string(),
            password: "pw".to_string(),
            expires: "3h".to_string(),
        };
        let text = outcome.text();
        assert!(text.contains("u1"));
        assert!(text.contains("pw"));
        assert!(text.contains("3h"));
    }

    #[test]
    fn quota_text_mentions_remaining_wait() {
        let outcome = UserFacingOutcome::QuotaExceeded {
            retry_after: Some(Duration::from_secs(120)),
        };
        assert!(outcome.text().contains("2m"));
    }
}
