//! Bot initialization and command definitions.

use reqwest::ClientBuilder;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;

use crate::config::Config;

/// Bot commands enum with descriptions
#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "lowercase", description = "I can:")]
pub enum Command {
    #[command(description = "show the main menu")]
    Start,
    #[command(description = "request a trial SSH account")]
    Get(String),
    #[command(description = "show your usage stats")]
    Mystats,
    #[command(description = "global stats (admins only)")]
    Admin,
}

/// Creates a Bot instance with the configured HTTP timeout.
///
/// # Returns
/// * `Ok(Bot)` - Successfully created bot instance
/// * `Err(anyhow::Error)` - Failed to build the HTTP client
pub fn create_bot(config: &Config) -> anyhow::Result<Bot> {
    let client = ClientBuilder::new().timeout(config.provision.timeout).build()?;
    Ok(Bot::with_client(config.bot_token.clone(), client))
}

/// Registers the command list in the Telegram UI.
pub async fn setup_bot_commands(bot: &Bot) -> Result<(), teloxide::RequestError> {
    bot.set_my_commands(Command::bot_commands()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_descriptions_cover_the_menu() {
        let descriptions = format!("{}", Command::descriptions());
        assert!(descriptions.contains("start"));
        assert!(descriptions.contains("get"));
        assert!(descriptions.contains("mystats"));
        assert!(descriptions.contains("admin"));
    }
}
