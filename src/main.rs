//! hidlink CLI
//!
//! Connects to one HID device and dumps its input reports.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use hidlink::{
    handler_fn, ConnectionManager, HidApiService, HidLinkConfig, HidService,
    HotplugListener, InputReport, SessionEvent,
};

mod cli;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config_path = cli.config_path();
    info!("Loading config from {:?}", config_path);
    let mut config = HidLinkConfig::load(&config_path)?;
    cli.apply(&mut config);
    config.validate()?;

    match cli.command {
        Some(Commands::List { json }) => list(&config, json).await,
        Some(Commands::Config { write }) => {
            print!("{}", config.to_toml()?);
            if write {
                config.save(&config_path)?;
                info!("Wrote {:?}", config_path);
            }
            Ok(())
        }
        Some(Commands::Watch) | None => watch(config).await,
    }
}

fn open_service(config: &HidLinkConfig) -> Result<Arc<HidApiService>> {
    let service =
        HidApiService::with_config(config.transport).context("Failed to initialize hidapi")?;
    Ok(Arc::new(service))
}

async fn list(config: &HidLinkConfig, json: bool) -> Result<()> {
    let service = open_service(config)?;
    let devices = service.enumerate(&config.criteria).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No devices matching {}", config.criteria);
        return Ok(());
    }
    for d in &devices {
        println!("{}", d);
        println!("  path:   {}", d.path);
        if let Some(serial) = &d.serial {
            println!("  serial: {}", serial);
        }
        for c in &d.collections {
            println!(
                "  usage {:04X}:{:04X} (interface {})",
                c.usage_page, c.usage, c.interface_number
            );
        }
    }
    Ok(())
}

async fn watch(config: HidLinkConfig) -> Result<()> {
    let service = open_service(&config)?;

    let handler = handler_fn(|report: &InputReport| {
        println!("[{:02X}] {}", report.report_id, hex(&report.data));
        Some(report.data.len())
    });
    let manager = ConnectionManager::from_config(service, handler, &config);

    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                SessionEvent::Connected { device, .. } => println!("connected: {}", device),
                SessionEvent::Disconnected {
                    device_id, reason, ..
                } => println!("disconnected: device {} ({:?})", device_id, reason),
                SessionEvent::PollerStopped { error, .. } => println!("poller stopped: {}", error),
            }
        }
    });

    let _listener = HotplugListener::spawn(manager.clone());

    if let Err(e) = manager.connect(None).await {
        warn!("Initial connect failed: {}; waiting for a device to be plugged in", e);
    }

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, disconnecting");

    if let Some(id) = manager.current_device_id() {
        manager.disconnect(id)?;
    }
    // Let the background release finish
    tokio::task::yield_now().await;
    Ok(())
}

fn hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
