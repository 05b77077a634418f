//! sshgate — Telegram bot that hands out trial SSH accounts through an
//! external panel API.
//!
//! # Module Structure
//!
//! - `config`: immutable runtime configuration, loaded once from env
//! - `store`: Shared State Store trait + Redis implementation
//! - `guard`: per-user quota and in-flight enforcement
//! - `provision`: HTTP client for the provisioning API
//! - `coordinator`: per-command orchestration
//! - `telegram`: transport (commands, callbacks, dispatcher schema)
//! - `health`: liveness endpoint
//! - `notifier`: quota-reset notifications
//! - `testing`: in-memory store double for tests

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod guard;
pub mod health;
pub mod logging;
pub mod messages;
pub mod notifier;
pub mod provision;
pub mod store;
pub mod telegram;
pub mod testing;

// Re-export commonly used types for convenience
pub use config::{Config, Quota};
pub use coordinator::Coordinator;
pub use errors::{AppError, AppResult};
pub use guard::UsageGuard;
pub use messages::UserFacingOutcome;
pub use provision::{ProvisioningClient, ProvisioningRequest, ProvisioningResult};
pub use store::{AcquireDecision, RedisSessionStore, SessionStore};
