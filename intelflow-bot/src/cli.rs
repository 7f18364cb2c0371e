//! CLI argument definitions for intelflow-bot.
//!
//! Uses `clap` v4 derive macros to parse command-line arguments.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// Runs one intelflow bot.
///
/// The bot's `[bots.<bot-id>]` table selects the implementation and its
/// queues.
#[derive(Parser, Debug)]
#[command(name = "intelflow-bot")]
#[command(version, about, long_about = None)]
pub struct BotCli {
    /// Bot id, the key of its `[bots.<bot-id>]` table.
    pub bot_id: String,

    /// Path to the intelflow.toml configuration file.
    #[arg(short, long, default_value = "/etc/intelflow/intelflow.toml")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty).
    ///
    /// Takes precedence over the config file and environment variables.
    #[arg(long)]
    pub log_format: Option<String>,

    /// Validate the configuration and the bot's wiring, then exit.
    #[arg(long)]
    pub validate: bool,

    /// Serve Prometheus metrics on this address, e.g. `127.0.0.1:9464`.
    #[arg(long)]
    pub metrics_listen: Option<SocketAddr>,
}
