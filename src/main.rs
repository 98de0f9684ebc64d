//! ==============================================================================
//! main.rs - arduino hub entry point
//! ==============================================================================
//!
//! purpose:
//!     the hub that sits between arduino boards and the dashboard. it polls
//!     boards over usb serial and ethernet, reads modbus tcp devices, keeps every reading in postgres
//!     (or in memory when no database is configured), replicates them to a
//!     hosted postgres, and serves a REST api plus an html dashboard.
//!
//! responsibilities:
//!     - load hub.toml and environment overrides, set up logging
//!     - connect the local store (schema created on start)
//!     - run the selected mode: full, api, acquire, sync or scan
//!     - stop acquisition cleanly on ctrl-c
//!
//! relationships:
//!     - config.rs:      hub.toml schema and env overrides
//!     - store/:         postgres / in-memory persistence
//!     - acquisition.rs: collection loop over usb.rs, ethernet.rs and modbus.rs
//!     - sync.rs:        local -> cloud replication
//!     - api.rs:         axum routes, dashboard.rs renders `/`,
//!                       services.rs answers `/service_status`
//!
//! architecture:
//!
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │                      rust hub (this binary)                   │
//!     │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐  │
//!     │  │ acquisition  │   │  web server  │   │   cloud sync     │  │
//!     │  │ (10s cycle)  │   │ (port 8000)  │   │   (60s cycle)    │  │
//!     │  └──────┬───────┘   └──────┬───────┘   └────────┬─────────┘  │
//!     │         │                  │                    │            │
//!     │         └──────────────────┼────────────────────┘            │
//!     │                      ┌─────┴─────┐                           │
//!     │                      │   store   │ <- store/                 │
//!     │                      └─────┬─────┘                           │
//!     └────────────────────────────┼─────────────────────────────────┘
//!              ┌───────────────────┼───────────────────┐
//!              ▼                   ▼                   ▼
//!       ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//!       │ arduino usb │     │ arduino eth │     │  postgres   │
//!       │  (serial)   │     │ (http /data)│     │ local/cloud │
//!       └─────────────┘     └─────────────┘     └─────────────┘
//!
//! ==============================================================================

mod acquisition;
mod api;
mod config;
mod dashboard;
mod domain;
mod ethernet;
mod modbus;
mod ntc;
mod protocol;
mod services;
mod store;
mod sync;
mod usb;

use acquisition::Acquisition;
use api::ApiState;
use config::HubConfig;
use store::{Retention, Store};
use sync::SyncMonitor;

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "arduino-hub", version, about = "Arduino USB/Ethernet data hub")]
struct Args {
    /// Path to hub.toml (default: config/hub.toml, then ../config/hub.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// What to run
    #[arg(long, value_enum, default_value_t = Mode::Full)]
    mode: Mode,

    /// Acquisition interval in seconds, overrides the config file
    #[arg(long)]
    interval: Option<u64>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// Acquisition, cloud sync and api together
    Full,
    /// Api server only
    Api,
    /// Acquisition loop only
    Acquire,
    /// Cloud sync loop only
    Sync,
    /// One discovery pass, then exit
    Scan,
}

// ==============================================================================
// main entry point
// ==============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // startup banner
    println!("===========================================================");
    println!("  Arduino Hub");
    println!("  USB + Ethernet -> Postgres -> API");
    println!("===========================================================");

    // step 1: configuration, env overrides win over the file
    let mut config = HubConfig::load_or_default(args.config.as_deref());
    config.apply_env(|key| std::env::var(key).ok());
    if let Some(interval) = args.interval {
        config.polling.interval_seconds = interval;
    }
    init_logging(&config.logging.level);
    config.print_summary();

    // step 2: local store
    println!("\n[STARTUP] Connecting local store...");
    let store = match Store::open(config.database.url.as_deref(), "local", retention(&config)).await {
        Ok(store) => {
            println!("[STARTUP] ✓ Local store ready ({})", store.backend());
            store
        }
        Err(e) => {
            eprintln!("[ERROR] Fatal: local store unavailable: {:#}", e);
            return Err(e);
        }
    };

    let acquisition = Acquisition::new(store.clone(), &config)?;

    match args.mode {
        Mode::Scan => run_scan(&acquisition).await,
        Mode::Api => api::serve(ApiState::new(acquisition, SyncMonitor::new(), &config)).await,
        Mode::Sync => {
            let cloud = open_cloud(&config)
                .await?
                .ok_or_else(|| anyhow!("sync mode needs database.cloud_url (or CLOUD_DATABASE_URL)"))?;
            let (stop_tx, stop_rx) = watch::channel(false);
            let sync_task = tokio::spawn(sync::run(
                store,
                cloud,
                config.sync.interval_seconds,
                config.sync.batch_size,
                SyncMonitor::new(),
                stop_rx,
            ));
            tokio::signal::ctrl_c().await?;
            let _ = stop_tx.send(true);
            sync_task.await?;
            Ok(())
        }
        Mode::Acquire => {
            acquisition.start(config.polling.interval_seconds).await?;
            wait_for_shutdown(&acquisition).await
        }
        Mode::Full => run_full(store, acquisition, &config).await,
    }
}

fn init_logging(level: &str) {
    // RUST_LOG, when set, takes precedence over the config level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn retention(config: &HubConfig) -> Retention {
    Retention {
        max_readings: config.database.memory_max_readings,
        max_events: config.database.memory_max_events,
    }
}

/// hosted postgres for replication, if configured and enabled
async fn open_cloud(config: &HubConfig) -> Result<Option<Store>> {
    match (&config.database.cloud_url, config.sync.enabled) {
        (Some(url), true) => Ok(Some(Store::open(Some(url), "cloud", retention(config)).await?)),
        _ => Ok(None),
    }
}

async fn run_scan(acquisition: &Acquisition) -> Result<()> {
    println!("\n[SCAN] Looking for boards...");
    let report = acquisition.scan().await?;
    println!("[SCAN] USB: {}", report.usb_port.as_deref().unwrap_or("not found"));
    if report.ethernet.is_empty() {
        println!("[SCAN] Ethernet: none found");
    }
    for board in &report.ethernet {
        println!(
            "[SCAN] Ethernet: {} via {} ({})",
            board.ip,
            board.endpoint,
            board.device_id.as_deref().unwrap_or("no device id")
        );
    }
    for device in &report.modbus {
        let first = device.blocks.first().map(|b| b.start).unwrap_or_default();
        println!("[SCAN] Modbus: {} unit {} (registers from {})", device.ip, device.unit_id, first);
    }
    Ok(())
}

async fn run_full(store: Store, acquisition: Acquisition, config: &HubConfig) -> Result<()> {
    // step 3: initial discovery so the first cycle already knows the boards
    println!("\n[STARTUP] Scanning for boards...");
    match acquisition.scan().await {
        Ok(report) => println!(
            "[STARTUP] ✓ USB: {} | Ethernet: {} board(s) | Modbus: {} device(s)",
            report.usb_port.as_deref().unwrap_or("none"),
            report.ethernet.len(),
            report.modbus.len()
        ),
        Err(e) => println!("[STARTUP] ⚠ Scan failed: {:#}", e),
    }

    // step 4: cloud sync in background
    let (stop_tx, stop_rx) = watch::channel(false);
    let sync_monitor = SyncMonitor::new();
    match open_cloud(config).await {
        Ok(Some(cloud)) => {
            println!("[STARTUP] ✓ Cloud sync every {}s", config.sync.interval_seconds);
            tokio::spawn(sync::run(
                store,
                cloud,
                config.sync.interval_seconds,
                config.sync.batch_size,
                sync_monitor.clone(),
                stop_rx,
            ));
        }
        Ok(None) => println!("[STARTUP] Cloud sync disabled"),
        Err(e) => println!("[STARTUP] ⚠ Cloud store unavailable, sync disabled: {:#}", e),
    }

    // step 5: web server in background
    let web_state = ApiState::new(acquisition.clone(), sync_monitor, config);
    let addr = config.api.bind_addr();
    tokio::spawn(async move {
        println!("[STARTUP] ✓ Dashboard live at http://{}", addr);
        if let Err(e) = api::serve(web_state).await {
            eprintln!("[ERROR] Web server error: {:#}", e);
        }
    });

    // step 6: acquisition loop
    println!("\n[RUNTIME] Starting acquisition ({}s interval)", config.polling.interval_seconds);
    println!("────────────────────────────────────────────────────────────");
    acquisition.start(config.polling.interval_seconds).await?;

    let result = wait_for_shutdown(&acquisition).await;
    let _ = stop_tx.send(true);
    result
}

async fn wait_for_shutdown(acquisition: &Acquisition) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    println!("\n[SHUTDOWN] Stopping acquisition...");
    acquisition.stop().await?;
    println!("[SHUTDOWN] ✓ Done");
    Ok(())
}
