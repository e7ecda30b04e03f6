//! scangate daemon
//!
//! Supervises a USB barcode scanner for a POS: the scanner stays powered
//! off until the POS opens a scan session, then every completed read is
//! submitted to the POS over HTTPS.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};

use common::{scan_channel, setup_logging};
use daemon::config::{DaemonConfig, SettingsStore};
use daemon::pos::{PosClient, PosPoller, SessionApi};
use daemon::scanner::{BarcodeScanner, ScannerTimings};
use daemon::service;
use daemon::usb::{PowerControl, UsbDiscovery, UsbPowerController};

/// How long shutdown waits for the polling task before aborting it.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "scangate")]
#[command(
    author,
    version,
    about = "USB barcode scanner gateway for POS scan sessions"
)]
#[command(long_about = "
Supervises a USB barcode scanner for a POS: the scanner stays powered off
until the POS opens a scan session, then every completed read is submitted
to the POS over HTTPS.

EXAMPLES:
    # Run with default config
    scangate

    # Run with custom config
    scangate --config /path/to/daemon.toml

    # List supported scanners currently attached
    scangate --discover

    # Verify the configured POS URL and token
    scangate --test-pos

    # Run with debug logging
    scangate --log-level debug

CONFIGURATION:
    The daemon looks for its configuration in the following order:
    1. Path specified with --config
    2. ~/.config/scangate/daemon.toml
    3. /etc/scangate/daemon.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List supported scanners currently attached and exit
    #[arg(long)]
    discover: bool,

    /// Test the configured POS connection and exit
    #[arg(long)]
    test_pos: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = DaemonConfig::default();
        let path = DaemonConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    // Load configuration first (to get log level from config if not specified)
    let config = DaemonConfig::load_or_default(args.config.clone());

    // Use CLI log level if specified, otherwise use config value
    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("scangate v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    if args.discover {
        return discover_mode();
    }
    if args.test_pos {
        return test_pos_mode(&config).await;
    }

    let config_path = match args.config {
        Some(path) => path,
        None => DaemonConfig::default_path(),
    };
    run_daemon(config, config_path).await
}

/// List supported scanners currently attached and exit
fn discover_mode() -> Result<()> {
    let devices = UsbDiscovery::new().discover_devices();

    if devices.is_empty() {
        println!("No supported scanner found.");
    } else {
        println!("Found {} supported device(s):\n", devices.len());
        for device in devices {
            println!(
                "  {} {}:{} - {}",
                device.hidraw_path.display(),
                device.vendor_id,
                device.product_id,
                device.name
            );
            println!("      USB port: {}", device.usb_port);
            println!();
        }
    }

    Ok(())
}

/// Check the configured POS URL and token with a single session fetch
async fn test_pos_mode(config: &DaemonConfig) -> Result<()> {
    if config.pos.url.is_empty() || config.pos.token.is_empty() {
        println!("POS URL or token not configured");
        std::process::exit(1);
    }

    let (ok, message) = PosClient::test_connection(&config.pos.url, &config.pos.token).await;
    println!("{}", message);
    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

/// Run the daemon: wire settings, power control, scanner, and POS poller,
/// then wait for a shutdown signal.
async fn run_daemon(config: DaemonConfig, config_path: PathBuf) -> Result<()> {
    info!("Starting scangate daemon");
    if service::is_systemd() {
        info!("Running under systemd");
    }

    let settings = Arc::new(SettingsStore::new(config, config_path));
    if !settings.pos_configured() {
        info!("POS not configured yet; polling starts once URL and token are set");
    }

    let power = Arc::new(UsbPowerController::new(Arc::clone(&settings)));
    let (scan_tx, scan_rx) = scan_channel();

    let scanner = Arc::new(BarcodeScanner::new(
        UsbDiscovery::new(),
        Arc::clone(&power) as Arc<dyn PowerControl>,
        scan_tx,
        ScannerTimings::default(),
    ));
    scanner.start().context("Failed to start scanner thread")?;

    let client = PosClient::new().context("Failed to build POS HTTP client")?;
    let poller = Arc::new(PosPoller::new(
        Arc::clone(&settings),
        Arc::clone(&scanner),
        Arc::new(client) as Arc<dyn SessionApi>,
        scan_rx,
    ));
    let poller_task = {
        let poller = Arc::clone(&poller);
        tokio::spawn(async move { poller.run().await })
    };

    // Start watchdog task if enabled
    let watchdog_handle = service::spawn_watchdog_task();

    // Notify systemd that we're ready
    service::notify_ready().context("Failed to notify systemd ready")?;
    service::notify_status("Waiting for scan session")
        .context("Failed to send status to systemd")?;

    info!("Press Ctrl+C to shutdown");

    // Wait for shutdown signal
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = signal::ctrl_c() => match result {
            Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
            Err(e) => error!("Error waiting for Ctrl+C: {}", e),
        },
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }

    // Notify systemd we're stopping
    service::notify_stopping().context("Failed to notify systemd stopping")?;

    // Stop watchdog
    watchdog_handle.abort();

    // Poller first: it deactivates the scanner session before the scanner
    // thread is asked to stop
    let abort = poller_task.abort_handle();
    poller.stop();
    match tokio::time::timeout(STOP_TIMEOUT, poller_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("POS polling task failed: {}", e),
        Err(_) => {
            warn!("POS polling task did not stop in time, aborting it");
            abort.abort();
        }
    }

    scanner.stop();

    info!("scangate shutdown complete");
    Ok(())
}
