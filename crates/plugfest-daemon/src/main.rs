//! Plugfest Daemon - Main entry point
//!
//! Discovers Plugfest CoAP lighting devices and keeps a synchronized
//! session open to each of them.

mod config;
mod registry;

use anyhow::Result;
use clap::Parser;
use plugfest_bridge::session::SessionEvent;
use plugfest_bridge::{Bridge, PlugfestBridge, SharedListener};
use plugfest_coap::{Transport, UdpTransport};
use plugfest_discovery::Crawler;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::Config;
use crate::registry::DeviceRegistry;

#[derive(Parser, Debug)]
#[command(name = "plugfest")]
#[command(about = "Plugfest CoAP lighting bridge daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "plugfest.toml")]
    config: PathBuf,

    /// Gateway URL to discover from (overrides bridge.url)
    #[arg(short, long)]
    url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Run a single discovery pass, print the devices and exit
    #[arg(long)]
    discover_once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Plugfest v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config::load_config(&args.config)?;
    if let Some(url) = args.url {
        config.bridge.url = Some(url);
    }

    info!(
        url = ?config.bridge.url,
        poll = config.bridge.poll,
        server = config.bridge.server,
        model = ?config.bridge.model,
        "Configuration loaded"
    );

    let transport: Arc<dyn Transport> = Arc::new(UdpTransport::new());

    if args.discover_once {
        discover_once(&config, transport).await
    } else {
        run(&config, transport).await
    }
}

/// Crawl once and print what was found
async fn discover_once(config: &Config, transport: Arc<dyn Transport>) -> Result<()> {
    info!("Running single discovery pass");
    let crawler = Crawler::new(transport, config.to_crawler_config());
    let mut devices = crawler.discover(config.bridge.url.as_deref())?;

    let mut found = Vec::new();
    while let Some(device) = devices.recv().await {
        found.push(device);
    }

    println!("Discovered {} devices:", found.len());
    for device in found {
        let identity = &device.identity;
        println!(
            "  - {} ({}) at {}",
            identity.display_name(),
            identity.thing_id,
            identity.url
        );
        if identity.has_config {
            println!("    Config: {}", identity.config_url);
        }
        println!("    State: {}", device.state.to_json());
    }
    Ok(())
}

/// Daemon mode: discover periodically and keep sessions open until Ctrl-C
async fn run(config: &Config, transport: Arc<dyn Transport>) -> Result<()> {
    let mut template = PlugfestBridge::new(
        config.bridge.clone(),
        config.to_crawler_config(),
        transport,
    );
    if config.bridge.server {
        template = template.with_listener(SharedListener::udp(
            config.bridge.server_host.clone(),
            config.bridge.server_port,
        ));
    }

    let registry = DeviceRegistry::new();

    let mut events = registry.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::StateChanged { thing_id, state } => {
                    let state = Value::Object(state);
                    info!(thing_id = %thing_id, state = %state, "State changed");
                }
                SessionEvent::Disconnected { thing_id } => {
                    info!(thing_id = %thing_id, "Device disconnected");
                }
            }
        }
    });

    let interval = config.rediscovery_interval();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        // A configuration error stops the daemon before any traffic
        let pass = template.discover(registry.clone())?;

        tokio::select! {
            signal = &mut shutdown => {
                shutdown_signal(signal);
                break;
            }
            _ = pass => {
                if registry.is_empty() {
                    info!("No devices found");
                } else {
                    debug!(devices = registry.len(), "Discovery pass complete");
                }
            }
        }

        match interval {
            Some(interval) => {
                tokio::select! {
                    signal = &mut shutdown => {
                        shutdown_signal(signal);
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            None => {
                shutdown_signal((&mut shutdown).await);
                break;
            }
        }
    }

    info!(devices = registry.len(), "Shutting down");
    for record in registry.devices() {
        debug!(
            thing_id = %record.meta.thing_id,
            first_seen = %record.first_seen,
            last_seen = %record.last_seen,
            reachable = record.bridge.reachable(),
            "Known device"
        );
    }
    registry.shutdown();
    Ok(())
}

/// Report a failure to listen for Ctrl-C; the daemon stops either way
fn shutdown_signal(signal: std::io::Result<()>) {
    if let Err(e) = signal {
        warn!(error = %e, "Failed to wait for Ctrl-C");
    }
}
