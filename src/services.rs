//! ==============================================================================
//! services.rs - traffic-light view of the hub's services
//! ==============================================================================
//!
//! purpose:
//!     answers `/service_status`. the hub's own parts (acquisition loop, api,
//!     store, cloud sync) are judged from in-process state; extra systemd
//!     units listed under `[services]` are asked through
//!     `systemctl is-active`.
//!
//! levels:
//!     green   running normally
//!     yellow  starting, stopping or degraded
//!     red     stopped or failed
//!     grey    unknown
//!
//! ==============================================================================

use crate::acquisition::Acquisition;
use crate::sync::{SyncMonitor, SyncState};

use serde::Serialize;
use std::collections::BTreeMap;
use tokio::process::Command;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Green,
    Yellow,
    Red,
    Grey,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServiceState {
    /// systemd-style word: active, inactive, failed, ...
    pub status: String,
    pub level: Level,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ServiceState {
    fn new(status: &str, level: Level) -> Self {
        Self { status: status.to_string(), level, detail: None }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// colour for a `systemctl is-active` answer
pub fn level_for(status: &str) -> Level {
    match status {
        "active" => Level::Green,
        "activating" | "reloading" | "deactivating" => Level::Yellow,
        _ => Level::Red,
    }
}

fn acquisition_state(running: bool, last_errors: &[String]) -> ServiceState {
    match (running, last_errors.first()) {
        (true, None) => ServiceState::new("active", Level::Green),
        (true, Some(first)) => ServiceState::new("degraded", Level::Yellow)
            .with_detail(format!("{} source(s) failed, first: {first}", last_errors.len())),
        (false, _) => ServiceState::new("inactive", Level::Red),
    }
}

fn sync_state(sync: &SyncState) -> ServiceState {
    match (sync.running, sync.last_run, &sync.last_error) {
        (false, None, _) => ServiceState::new("inactive", Level::Grey),
        (true, _, Some(e)) => ServiceState::new("degraded", Level::Yellow).with_detail(e.clone()),
        (true, _, None) => ServiceState::new("active", Level::Green),
        (false, Some(_), _) => ServiceState::new("inactive", Level::Red),
    }
}

async fn systemd_unit(unit: &str) -> ServiceState {
    match Command::new("systemctl").args(["is-active", unit]).output().await {
        // is-active exits non-zero for anything but "active", stdout still names the state
        Ok(out) => {
            let status = String::from_utf8_lossy(&out.stdout).trim().to_string();
            if status.is_empty() {
                ServiceState::new("unknown", Level::Grey)
                    .with_detail(String::from_utf8_lossy(&out.stderr).trim().to_string())
            } else {
                let level = level_for(&status);
                ServiceState { status, level, detail: None }
            }
        }
        Err(e) => {
            debug!("services: systemctl {unit}: {e}");
            ServiceState::new("unknown", Level::Grey).with_detail(e.to_string())
        }
    }
}

/// state of every service, keyed by name
pub async fn service_status(
    acquisition: &Acquisition,
    sync: &SyncMonitor,
    systemd_units: &[String],
) -> BTreeMap<String, ServiceState> {
    let mut services = BTreeMap::new();

    let acq = match acquisition.status().await {
        Ok(status) => acquisition_state(status.running, &status.errors),
        Err(e) => ServiceState::new("unknown", Level::Grey).with_detail(format!("{e:#}")),
    };
    services.insert("acquisition".to_string(), acq);

    // answering this request is proof enough
    services.insert("api".to_string(), ServiceState::new("active", Level::Green));

    let store = acquisition.store();
    let database = match store.ping().await {
        Ok(()) => ServiceState::new("active", Level::Green).with_detail(store.backend()),
        Err(e) => ServiceState::new("failed", Level::Red).with_detail(format!("{e:#}")),
    };
    services.insert("database".to_string(), database);

    services.insert("sync".to_string(), sync_state(&sync.snapshot().await));

    for unit in systemd_units {
        services.insert(unit.clone(), systemd_unit(unit).await);
    }
    services
}
