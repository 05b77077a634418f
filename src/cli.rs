use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sshgate")]
#[command(author, version, about = "Telegram bot that provisions trial SSH accounts", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the bot (long polling)
    Run,

    /// Validate configuration and check the Redis connection, then exit
    Check,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
