//! Command line interface and logging setup

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Ground station pairing daemon
#[derive(Parser, Debug)]
#[command(name = "gcs-pairing-daemon")]
#[command(about = "Pairs field devices and supervises their links", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Shorthand for `--log-level debug`
    #[arg(short, long)]
    pub verbose: bool,

    /// Enable JSON structured logging
    #[arg(long)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the pairing manager, reading sealed offers from stdin
    Run {
        /// Start pairing immediately
        #[arg(long)]
        pair: bool,
    },

    /// Print the local public key and fingerprint
    Identity,

    /// List paired devices
    List,

    /// Remove a paired device
    Unpair {
        /// Device name
        name: String,
    },
}

impl Cli {
    fn log_level(&self) -> Result<Level> {
        if self.verbose {
            return Ok(Level::DEBUG);
        }
        self.log_level.parse::<Level>().with_context(|| {
            format!(
                "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
                self.log_level
            )
        })
    }
}

/// Initialize logging; `RUST_LOG` takes precedence over the CLI level
pub fn init_logging(cli: &Cli) -> Result<()> {
    let log_level = cli.log_level()?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.as_str()))
        .context("Failed to create log filter")?;

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Logging initialized: level={}, json={}", log_level, cli.json_logs);
    Ok(())
}
