//! ==============================================================================
//! sync.rs - local -> cloud replication
//! ==============================================================================
//!
//! purpose:
//!     pushes readings that the cloud has not seen yet (synced = false) from
//!     the local store to the hosted one, oldest first, in batches. devices
//!     are copied before their readings so the cloud keeps names and
//!     addresses instead of stub rows.
//!
//!     a failed batch is left unsynced and retried on the next round.
//!
//!     the loop publishes its last outcome through `SyncMonitor`, which the
//!     api reads for `/service_status`.
//!
//! ==============================================================================

use crate::store::Store;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct SyncReport {
    pub pushed: usize,
    pub marked: usize,
}

/// what the replication loop last did
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct SyncState {
    pub running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub pushed_total: usize,
}

/// shared view of the loop, cheap to clone
#[derive(Clone, Default)]
pub struct SyncMonitor(Arc<RwLock<SyncState>>);

impl SyncMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> SyncState {
        self.0.read().await.clone()
    }

    async fn set_running(&self, running: bool) {
        self.0.write().await.running = running;
    }

    async fn record(&self, outcome: &Result<SyncReport>) {
        let mut st = self.0.write().await;
        st.last_run = Some(Utc::now());
        match outcome {
            Ok(report) => {
                st.pushed_total += report.pushed;
                st.last_error = None;
            }
            Err(e) => st.last_error = Some(format!("{e:#}")),
        }
    }
}

/// replicate one batch
pub async fn sync_once(local: &Store, cloud: &Store, batch_size: i64) -> Result<SyncReport> {
    let pending = local.unsynced(batch_size.max(1)).await?;
    if pending.is_empty() {
        return Ok(SyncReport::default());
    }

    let device_ids: BTreeSet<&str> = pending.iter().map(|r| r.device_id.as_str()).collect();
    for id in device_ids {
        if let Some(device) = local.device(id).await? {
            cloud
                .register_device(&device)
                .await
                .with_context(|| format!("cloud rejected device {id}"))?;
        }
    }

    let pushed = cloud
        .upsert_readings(&pending)
        .await
        .context("cloud rejected readings")?;
    let marked = local.mark_synced(&pending).await?;

    Ok(SyncReport { pushed, marked })
}

/// drain everything pending, batch by batch
pub async fn sync_all(local: &Store, cloud: &Store, batch_size: i64) -> Result<SyncReport> {
    let mut total = SyncReport::default();
    loop {
        let round = sync_once(local, cloud, batch_size).await?;
        total.pushed += round.pushed;
        total.marked += round.marked;
        // nothing moved, or a reading was rewritten mid-flight
        if round.marked == 0 {
            return Ok(total);
        }
    }
}

/// background replication until `stop` flips to true
pub async fn run(
    local: Store,
    cloud: Store,
    interval_seconds: u64,
    batch_size: i64,
    monitor: SyncMonitor,
    mut stop: watch::Receiver<bool>,
) {
    info!("sync: replicating every {interval_seconds}s ({} -> {})", local.backend(), cloud.backend());
    let period = Duration::from_secs(interval_seconds.max(1));
    monitor.set_running(true).await;

    loop {
        let outcome = sync_all(&local, &cloud, batch_size).await;
        monitor.record(&outcome).await;
        match outcome {
            Ok(report) if report.pushed > 0 => {
                info!("sync: pushed {} readings to cloud", report.pushed)
            }
            Ok(_) => debug!("sync: nothing to push"),
            Err(e) => {
                warn!("sync: {e:#}");
                let _ = local
                    .log_event("sync_error", None, &format!("{e:#}"), None)
                    .await;
            }
        }

        let stopped = tokio::select! {
            _ = tokio::time::sleep(period) => false,
            changed = stop.changed() => changed.is_err(),
        };
        if stopped || *stop.borrow() {
            monitor.set_running(false).await;
            info!("sync: stopped");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Device, DeviceKind, ReadingQuery, SensorReading};
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;

    fn reading(device: &str, value: f64, offset_s: i64) -> SensorReading {
        SensorReading {
            device_id: device.to_string(),
            sensor_type: "temperature_1".to_string(),
            value,
            unit: "°C".to_string(),
            raw_data: json!({"source": "usb"}),
            timestamp: Utc::now() - ChronoDuration::seconds(offset_s),
        }
    }

    #[tokio::test]
    async fn pushes_devices_then_readings() {
        let local = Store::memory();
        let cloud = Store::memory();

        let mut dev = Device::new("arduino_usb", DeviceKind::ArduinoUsb);
        dev.name = Some("bench".to_string());
        local.register_device(&dev).await.unwrap();
        local
            .upsert_readings(&[reading("arduino_usb", 20.0, 30), reading("arduino_usb", 21.0, 20)])
            .await
            .unwrap();

        let report = sync_once(&local, &cloud, 100).await.unwrap();
        assert_eq!(report, SyncReport { pushed: 2, marked: 2 });

        let copied = cloud.device("arduino_usb").await.unwrap().unwrap();
        assert_eq!(copied.device_type, DeviceKind::ArduinoUsb);
        assert_eq!(copied.name.as_deref(), Some("bench"));
        assert!(local.unsynced(10).await.unwrap().is_empty());

        // nothing left
        assert_eq!(sync_once(&local, &cloud, 100).await.unwrap(), SyncReport::default());
    }

    #[tokio::test]
    async fn batches_oldest_first() {
        let local = Store::memory();
        let cloud = Store::memory();
        local
            .upsert_readings(&[reading("a", 1.0, 10), reading("a", 2.0, 30), reading("a", 3.0, 20)])
            .await
            .unwrap();

        sync_once(&local, &cloud, 2).await.unwrap();
        let in_cloud = cloud
            .readings(&ReadingQuery::from_params(None, None, None, None, 100))
            .await
            .unwrap();
        let mut values: Vec<f64> = in_cloud.iter().map(|r| r.value).collect();
        values.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(values, vec![2.0, 3.0]);

        let total = sync_all(&local, &cloud, 2).await.unwrap();
        assert_eq!(total.pushed, 1);
        assert_eq!(cloud.stats().await.unwrap().total_readings, 3);
    }

    #[tokio::test]
    async fn run_stops_on_signal() {
        let local = Store::memory();
        local.upsert_readings(&[reading("a", 1.0, 5)]).await.unwrap();
        let monitor = SyncMonitor::new();

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(run(local, Store::memory(), 3600, 10, monitor.clone(), rx));
        // first round runs before the loop waits
        tokio::time::timeout(Duration::from_secs(5), async {
            while monitor.snapshot().await.last_run.is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        let state = monitor.snapshot().await;
        assert!(!state.running);
        assert_eq!(state.pushed_total, 1);
        assert!(state.last_error.is_none());
    }
}
