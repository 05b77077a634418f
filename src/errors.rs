use thiserror::Error;

/// Centralized error types for the application.
///
/// All errors are converted to this enum for consistent error handling.
/// Uses `thiserror` for automatic conversion and display formatting.
#[derive(Error, Debug)]
pub enum AppError {
    /// Shared State Store errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// HTTP errors from the provisioning API
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Startup configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for Result with AppError
pub type AppResult<T> = Result<T, AppError>;
