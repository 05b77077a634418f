use std::sync::Arc;

use anyhow::Result;
use dotenvy::dotenv;
use teloxide::prelude::*;
use teloxide::update_listeners::Polling;

use sshgate::cli::{Cli, Commands};
use sshgate::config::Config;
use sshgate::coordinator::Coordinator;
use sshgate::guard::UsageGuard;
use sshgate::health::start_health_server;
use sshgate::logging::{init_logger, log_startup_configuration};
use sshgate::notifier::run_reset_notifier;
use sshgate::provision::ProvisioningClient;
use sshgate::store::{RedisSessionStore, SessionStore};
use sshgate::telegram::{create_bot, schema, setup_bot_commands, HandlerDeps};

/// Main entry point for the Telegram bot.
///
/// Parses CLI arguments and dispatches to the appropriate subcommand.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    // Log panics instead of dying silently inside a spawned task.
    std::panic::set_hook(Box::new(|panic_info| {
        log::error!("Panic caught: {:?}", panic_info);
        if let Some(location) = panic_info.location() {
            log::error!("Panic at {}:{}:{}", location.file(), location.line(), location.column());
        }
    }));

    // Load environment variables from .env if present
    let _ = dotenv();

    let config = Config::from_env()?;
    init_logger(&config.log_file_path)?;

    match cli.command {
        Some(Commands::Check) => run_check(config).await,
        Some(Commands::Run) | None => run_bot(config).await,
    }
}

/// Validate configuration and check the Redis connection.
async fn run_check(config: Config) -> Result<()> {
    log_startup_configuration(&config);
    let _store = RedisSessionStore::connect(&config.redis_url).await?;
    log::info!("Configuration OK, Redis reachable");
    Ok(())
}

/// Run the bot: health endpoint, reset notifier, and the dispatcher.
async fn run_bot(config: Config) -> Result<()> {
    log_startup_configuration(&config);
    let config = Arc::new(config);

    let store: Arc<dyn SessionStore> =
        Arc::new(RedisSessionStore::connect(&config.redis_url).await?);
    let guard = UsageGuard::new(Arc::clone(&store), config.quota);
    let client = ProvisioningClient::new(&config.api_url, &config.provision)?;
    let coordinator = Arc::new(Coordinator::new(guard, client, Arc::clone(&store)));

    let bot = create_bot(&config)?;
    if let Err(e) = setup_bot_commands(&bot).await {
        log::warn!("Failed to register bot commands: {}", e);
    }

    // Liveness endpoint stays up regardless of Redis/API state.
    let health_port = config.health_port;
    let health = tokio::spawn(async move {
        if let Err(e) = start_health_server(health_port).await {
            log::error!("Health server exited: {}", e);
        }
    });

    let notifier = tokio::spawn(run_reset_notifier(bot.clone(), Arc::clone(&store)));

    let deps = HandlerDeps {
        coordinator,
        store,
        config: Arc::clone(&config),
    };

    log::info!("Starting bot in long polling mode");
    let listener = Polling::builder(bot.clone()).drop_pending_updates().build();
    Dispatcher::builder(bot, schema(deps))
        .enable_ctrlc_handler()
        .build()
        .dispatch_with_listener(
            listener,
            LoggingErrorHandler::with_custom_text("An error from the update listener"),
        )
        .await;

    log::info!("Shutting down...");
    notifier.abort();
    health.abort();
    Ok(())
}
