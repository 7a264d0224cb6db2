//! Ground Station Pairing Daemon
//!
//! Wires the pairing manager to its concrete collaborators: the HTTP
//! uploader, the UDP link transport and stdin as the offer source.

mod cli;
mod config;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use config::Config;
use gcs_pairing_protocol::{
    forward_offers, CryptoIdentity, DeviceRegistry, HttpUploader, LineOfferSource, PairingEvent, PairingHandle,
    PairingManager, UdpLinkTransport,
};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli::init_logging(&cli).context("Failed to initialize logging")?;

    let config = match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("Failed to load configuration")?;
    config.ensure_directories()?;

    match cli.command {
        Command::Run { pair } => run(config, pair).await,
        Command::Identity => show_identity(&config),
        Command::List => list_devices(&config),
        Command::Unpair { name } => unpair(&config, &name),
    }
}

async fn run(config: Config, pair: bool) -> Result<()> {
    info!("Starting pairing daemon as '{}'", config.device.name);

    let identity = CryptoIdentity::load_or_generate(&config.paths.config_dir)
        .context("Failed to load identity")?;
    let registry = DeviceRegistry::open(&config.paths.cache_dir).context("Failed to open pairing cache")?;
    let uploader = HttpUploader::new(config.pairing.upload_timeout()).context("Failed to create HTTP client")?;

    let (activity_tx, activity_rx) = mpsc::unbounded_channel();
    let transport = UdpLinkTransport::new(config.transport.link_config(), activity_tx);

    let (handle, manager) = PairingManager::spawn(
        config.manager_config(),
        identity,
        registry,
        Arc::new(uploader),
        Arc::new(transport),
        activity_rx,
    );

    tokio::spawn(log_events(handle.subscribe_events()));

    let source = LineOfferSource::new(BufReader::new(tokio::io::stdin()), "stdin");
    let offers = handle.clone();
    tokio::spawn(async move {
        match forward_offers(source, offers).await {
            Ok(count) => debug!("Forwarded {} offer(s) from stdin", count),
            Err(e) => warn!("Offer reader stopped: {}", e),
        }
    });

    if pair {
        handle.start_pairing().await.context("Failed to start pairing")?;
    }

    wait_for_shutdown(&handle).await;

    if let Err(e) = handle.shutdown().await {
        debug!("Manager already stopped: {}", e);
    }
    if let Err(e) = manager.await {
        error!("Pairing manager task failed: {}", e);
    }

    info!("Pairing daemon stopped");
    Ok(())
}

async fn wait_for_shutdown(handle: &PairingHandle) {
    let mut status = handle.watch_status();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Received Ctrl-C, shutting down");
        }
        _ = async { while status.changed().await.is_ok() {} } => {
            warn!("Pairing manager stopped unexpectedly");
        }
    }
}

async fn log_events(mut events: broadcast::Receiver<PairingEvent>) {
    loop {
        match events.recv().await {
            Ok(PairingEvent::StatusChanged { previous, status }) => {
                info!(code = status.code(), "Pairing status: {} -> {}", previous, status);
            }
            Ok(event) if event.is_error() => warn!("{:?}", event),
            Ok(event) => info!("{:?}", event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event log skipped {} event(s)", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn show_identity(config: &Config) -> Result<()> {
    let identity = CryptoIdentity::load_or_generate(&config.paths.config_dir)
        .context("Failed to load identity")?;

    println!("Name:        {}", config.device.name);
    println!("Fingerprint: {}", identity.fingerprint());
    println!("Public key:  {}", identity.public_key_base64());
    Ok(())
}

fn list_devices(config: &Config) -> Result<()> {
    let registry = DeviceRegistry::open(&config.paths.cache_dir).context("Failed to open pairing cache")?;
    let devices = registry.list_paired();

    if devices.is_empty() {
        println!("No paired devices");
        return Ok(());
    }

    println!("{:<24} {:>7}  {:<39} LAST CONNECTED", "NAME", "CHANNEL", "ADDRESS");
    for device in devices.iter() {
        let last = match (device.last_connected, device.seconds_since_connected()) {
            (Some(at), Some(secs)) => format!("{} ({})", at.format("%Y-%m-%d %H:%M:%S UTC"), format_age(secs)),
            _ => "never".to_string(),
        };
        println!(
            "{:<24} {:>7}  {:<39} {}",
            device.name,
            device.channel,
            device.remote_ip.to_string(),
            last
        );
    }
    Ok(())
}

fn format_age(secs: i64) -> String {
    match secs {
        s if s < 60 => format!("{}s ago", s),
        s if s < 3600 => format!("{}m ago", s / 60),
        s if s < 86_400 => format!("{}h ago", s / 3600),
        s => format!("{}d ago", s / 86_400),
    }
}

fn unpair(config: &Config, name: &str) -> Result<()> {
    let mut registry = DeviceRegistry::open(&config.paths.cache_dir).context("Failed to open pairing cache")?;

    if registry.remove(name).is_none() {
        println!("{} is not paired", name);
        return Ok(());
    }
    registry.flush().context("Failed to update pairing cache")?;
    println!("Unpaired {}", name);
    Ok(())
}
