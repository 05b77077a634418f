//! Background quota-reset notifier.
//!
//! After a successful provisioning, the user's window expiry is recorded
//! in the store. This task polls for due entries and tells each user they
//! can request a new account, with the same inline button as `/start`.
//! Delivery failures (user blocked the bot) are logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::{ChatId, InlineKeyboardButton, InlineKeyboardMarkup};

use crate::messages;
use crate::provision::unix_now;
use crate::store::SessionStore;

const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Runs until the owning task is aborted at shutdown.
pub async fn run_reset_notifier(bot: Bot, store: Arc<dyn SessionStore>) {
    log::info!("Quota-reset notifier started");
    let mut tick = tokio::time::interval(POLL_INTERVAL);

    loop {
        tick.tick().await;

        let due = match store.take_due_notices(unix_now()).await {
            Ok(due) => due,
            Err(e) => {
                log::warn!("notifier: store poll failed: {}", e);
                continue;
            }
        };

        for requester_id in due {
            let keyboard = InlineKeyboardMarkup::new([[InlineKeyboardButton::callback(
                "🔐 Get a new account",
                "get_account",
            )]]);

            if let Err(e) = bot
                .send_message(ChatId(requester_id), messages::reset_notice_text())
                .reply_markup(keyboard)
                .await
            {
                log::warn!("notifier: failed to notify {}: {}", requester_id, e);
            }
        }
    }
}
