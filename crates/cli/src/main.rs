//! quire command-line entry point.
//!
//! Runs cached reads against the configured SQLite database or HTTP API and
//! statements inside transactions. Results go to stdout as JSON; logs go to
//! stderr.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use quire_core::{EngineConfig, TransactionStrategy};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file (overrides QUIRE_CONFIG_FILE)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a SQL query through the cache
    Sql {
        sql: String,
        /// JSON params: object for named, array for positional
        #[arg(short, long, default_value = "null")]
        params: String,
        /// Number of reads to issue
        #[arg(short, long, default_value_t = 1)]
        repeat: u32,
    },
    /// GET a JSON resource through the cache
    Get {
        path: String,
        /// JSON object sent as the query string
        #[arg(short, long, default_value = "null")]
        params: String,
        #[arg(short, long, default_value_t = 1)]
        repeat: u32,
    },
    /// Run a SQL statement in a transaction
    Exec {
        sql: String,
        #[arg(short, long, default_value = "null")]
        params: String,
        #[arg(short, long, value_enum, default_value_t = Strategy::Throw)]
        strategy: Strategy,
    },
    /// Print the effective configuration
    Config,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Strategy {
    Throw,
    None,
    Retry,
}

impl From<Strategy> for TransactionStrategy {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::Throw => TransactionStrategy::RollbackAndThrow,
            Strategy::None => TransactionStrategy::RollbackAndReturnNone,
            Strategy::Retry => TransactionStrategy::Retry,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    let args = Args::parse();
    let config = match args.config.as_deref() {
        Some(path) => EngineConfig::load_from(Some(path)),
        None => EngineConfig::load(),
    }
    .context("failed to load configuration")?;

    tracing::debug!(max_entries = config.max_entries, ttl_ms = config.ttl_ms, "configuration loaded");

    let output = match args.command {
        Command::Sql { sql, params, repeat } => commands::sql(&config, &sql, commands::parse_params(&params)?, repeat).await?,
        Command::Get { path, params, repeat } => {
            commands::get(&config, &path, commands::parse_params(&params)?, repeat).await?
        }
        Command::Exec { sql, params, strategy } => {
            commands::exec(&config, &sql, commands::parse_params(&params)?, strategy.into()).await?
        }
        Command::Config => serde_json::to_value(&config)?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
