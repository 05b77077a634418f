//! Logging initialization and startup diagnostics.

use std::fs::File;

use anyhow::Result;
use simplelog::{ColorChoice, CombinedLogger, LevelFilter, TermLogger, TerminalMode, WriteLogger};

use crate::config::Config;

/// Initialize logger for both console and file output.
///
/// # Arguments
/// * `log_file_path` - Path to the log file
pub fn init_logger(log_file_path: &str) -> Result<()> {
    let log_file =
        File::create(log_file_path).map_err(|e| anyhow::anyhow!("Failed to create log file: {}", e))?;

    CombinedLogger::init(vec![
        TermLogger::new(
            LevelFilter::Info,
            simplelog::Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ),
        WriteLogger::new(LevelFilter::Info, simplelog::Config::default(), log_file),
    ])
    .map_err(|e| anyhow::anyhow!("Failed to initialize logger: {}", e))?;

    Ok(())
}

/// Logs the effective configuration at startup, with the token redacted.
pub fn log_startup_configuration(config: &Config) {
    log::info!("Configuration:");
    log::info!("  API_URL: {}", config.api_url);
    log::info!("  REDIS_URL: {}", config.redis_url);
    log::info!(
        "  quota: {} requests / {}s window, in-flight lock TTL {}s",
        config.quota.max_per_window,
        config.quota.window.as_secs(),
        config.quota.inflight_ttl.as_secs()
    );
    log::info!(
        "  provisioning: timeout {}s, {} retries, base delay {}ms",
        config.provision.timeout.as_secs(),
        config.provision.max_retries,
        config.provision.retry_base.as_millis()
    );
    log::info!("  health port: {}", config.health_port);
    if config.admin_users.is_empty() {
        log::info!("  admins: none configured");
    } else {
        log::info!("  admins: {} user(s)", config.admin_users.len());
    }
}
