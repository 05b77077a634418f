//! Dispatcher schema and handlers.
//!
//! The transport layer stays thin: handlers decode the requester id and
//! command text, delegate to the [`Coordinator`], and send its outcome.
//! The same schema is used in production and can be driven from tests.

use std::sync::Arc;

use teloxide::dispatching::{UpdateFilterExt, UpdateHandler};
use teloxide::prelude::*;
use teloxide::types::{CallbackQuery, ChatId, InlineKeyboardButton, InlineKeyboardMarkup, Message, ParseMode};
use teloxide::utils::command::BotCommands;

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::messages::{self, UserFacingOutcome};
use crate::store::SessionStore;
use crate::telegram::bot::Command;

/// Error type for handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Dependencies required by handlers
#[derive(Clone)]
pub struct HandlerDeps {
    pub coordinator: Arc<Coordinator>,
    pub store: Arc<dyn SessionStore>,
    pub config: Arc<Config>,
}

/// Creates the handler tree for the dispatcher.
pub fn schema(deps: HandlerDeps) -> UpdateHandler<HandlerError> {
    let deps_commands = deps.clone();
    let deps_callbacks = deps;

    dptree::entry()
        .branch(
            Update::filter_message()
                .filter_command::<Command>()
                .endpoint(move |bot: Bot, msg: Message, cmd: Command| {
                    let deps = deps_commands.clone();
                    async move { handle_command(bot, msg, cmd, deps).await }
                }),
        )
        .branch(Update::filter_callback_query().endpoint(move |bot: Bot, q: CallbackQuery| {
            let deps = deps_callbacks.clone();
            async move { handle_callback(bot, q, deps).await }
        }))
}

/// Main inline keyboard, shown by `/start` and reused by the notifier.
fn main_keyboard() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new([
        [InlineKeyboardButton::callback("🔐 Get an SSH account", "get_account")],
        [InlineKeyboardButton::callback("📊 My stats", "mystats")],
    ])
}

async fn handle_command(bot: Bot, msg: Message, cmd: Command, deps: HandlerDeps) -> Result<(), HandlerError> {
    let Some(requester_id) = msg.from.as_ref().map(|user| user.id.0 as i64) else {
        // Channel posts and the like carry no sender; nothing to do.
        return Ok(());
    };
    let chat_id = msg.chat.id;

    match cmd {
        Command::Start => {
            record_request(&deps, requester_id, "start").await;
            let status = deps
                .coordinator
                .guard()
                .status(requester_id)
                .await
                .unwrap_or_default();
            bot.send_message(
                chat_id,
                messages::start_text(&status, deps.config.quota.max_per_window),
            )
            .reply_markup(main_keyboard())
            .await?;
        }
        Command::Get(arg) => {
            let arg = effective_account_arg(
                &arg,
                msg.from.as_ref().and_then(|user| user.username.as_deref()),
            );
            run_get(&bot, chat_id, requester_id, &arg, &deps).await?;
        }
        Command::Mystats => {
            send_my_stats(&bot, chat_id, requester_id, &deps).await?;
        }
        Command::Admin => {
            record_request(&deps, requester_id, "admin").await;
            if !deps.config.is_admin(requester_id) {
                bot.send_message(chat_id, messages::admin_only_text()).await?;
                return Ok(());
            }
            match deps.store.stats().await {
                Ok(stats) => {
                    bot.send_message(chat_id, messages::admin_stats_text(&stats)).await?;
                }
                Err(e) => {
                    log::error!("admin stats unavailable: {}", e);
                    bot.send_message(chat_id, UserFacingOutcome::TemporarilyUnavailable.text())
                        .await?;
                }
            }
        }
    }

    Ok(())
}

async fn handle_callback(bot: Bot, q: CallbackQuery, deps: HandlerDeps) -> Result<(), HandlerError> {
    // Always answer, or the client shows a spinner forever.
    bot.answer_callback_query(q.id.clone()).await?;

    let Some(data) = q.data.clone() else {
        return Ok(());
    };
    let requester_id = q.from.id.0 as i64;
    let chat_id = q
        .message
        .as_ref()
        .map(|m| m.chat().id)
        .unwrap_or(ChatId(requester_id));

    match data.as_str() {
        "get_account" => {
            let arg = effective_account_arg("", q.from.username.as_deref());
            run_get(&bot, chat_id, requester_id, &arg, &deps).await?;
        }
        "mystats" => send_my_stats(&bot, chat_id, requester_id, &deps).await?,
        other => log::debug!("ignoring unknown callback data {:?}", other),
    }

    Ok(())
}

/// Shared by `/get` and the `get_account` button.
async fn run_get(
    bot: &Bot,
    chat_id: ChatId,
    requester_id: i64,
    arg: &str,
    deps: &HandlerDeps,
) -> Result<(), HandlerError> {
    record_request(deps, requester_id, "get").await;

    let progress = bot.send_message(chat_id, "⏳ Creating your account...").await?;
    let outcome = deps.coordinator.handle(requester_id, arg).await;

    let edit = bot.edit_message_text(chat_id, progress.id, outcome.text());
    if matches!(outcome, UserFacingOutcome::AccountCreated { .. }) {
        edit.parse_mode(ParseMode::Markdown).await?;
    } else {
        edit.await?;
    }

    Ok(())
}

async fn send_my_stats(
    bot: &Bot,
    chat_id: ChatId,
    requester_id: i64,
    deps: &HandlerDeps,
) -> Result<(), HandlerError> {
    record_request(deps, requester_id, "mystats").await;

    let total = deps.store.user_request_count(requester_id).await.unwrap_or(0);
    let status = deps
        .coordinator
        .guard()
        .status(requester_id)
        .await
        .unwrap_or_default();

    bot.send_message(
        chat_id,
        messages::my_stats_text(total, &status, deps.config.quota.max_per_window),
    )
    .await?;
    Ok(())
}

/// Stats are best effort; a store hiccup must not break the command.
async fn record_request(deps: &HandlerDeps, requester_id: i64, command: &str) {
    if let Err(e) = deps.store.record_request(requester_id, command).await {
        log::warn!("failed to record request stat for {}: {}", requester_id, e);
    }
}

/// The account name to request: an explicit argument wins, then the
/// sender's Telegram username. The Coordinator falls back to `tg<id>`
/// when both are absent.
fn effective_account_arg(explicit: &str, telegram_username: Option<&str>) -> String {
    let explicit = explicit.trim();
    if explicit.is_empty() {
        telegram_username.unwrap_or_default().to_string()
    } else {
        explicit.to_string()
    }
}
