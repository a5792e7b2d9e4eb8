//! Chandler Service - background poller for water-treatment valves.
//!
//! Run with: `cargo run -p chandler-service`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use chandler_core::scanner::AdvertisementScanner;
use chandler_core::{BtleConnector, ConnectionManager, ValveDiscovery};
use chandler_service::{Config, OutputFormat, Reporter};

/// Chandler Service - polls nearby valves and prints their telemetry.
#[derive(Parser, Debug)]
#[command(name = "chandler-service")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging for the protocol engine.
    #[arg(short, long)]
    verbose: bool,

    /// Print events as JSON lines.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let core_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chandler_service=info".parse()?)
                .add_directive(format!("chandler_core={core_level}").parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    config.validate()?;
    let manager_config = config.manager_config()?;

    let connector = BtleConnector::from_default_adapter()
        .await
        .context("failed to open Bluetooth adapter")?;
    let cancel = CancellationToken::new();

    let discovery = Arc::new(ValveDiscovery::new());
    let scanner = Arc::new(AdvertisementScanner::new(
        connector.adapter().clone(),
        Arc::clone(&discovery),
        config.scanner.options(),
    ));
    let scanner_task = scanner.start(cancel.child_token());

    let manager = Arc::new(ConnectionManager::new(Arc::new(connector), manager_config));

    let format = if args.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };
    let reporter = config
        .devices
        .iter()
        .filter_map(|d| d.alias.as_ref().map(|alias| (&d.address, alias)))
        .fold(Reporter::new(format), |reporter, (address, alias)| {
            reporter.alias(address.clone(), alias.clone())
        });
    let reporter_task = tokio::spawn(reporter.run(manager.subscribe(), cancel.child_token()));

    // The scanner is running, so the host is ready for the initial poll.
    manager
        .setup(Arc::clone(&discovery), std::future::ready(()))
        .await;
    info!(
        devices = config.devices.len(),
        interval = config.polling.interval,
        "Chandler service started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutting down");

    manager.shutdown().await;
    cancel.cancel();
    let _ = scanner_task.await;
    let _ = reporter_task.await;
    Ok(())
}
