//! ==============================================================================
//! store/ - persistence layer
//! ==============================================================================
//!
//! purpose:
//!     one handle (`Store`) over two backends:
//!     - postgres.rs: local PostgreSQL or a hosted postgres (supabase)
//!     - memory.rs:   in-process tables, used by tests and when no database
//!                    url is configured
//!
//!     both backends implement the same operations with the same semantics,
//!     so the acquisition loop and the api never care which one they talk to.
//!
//! upsert keys:
//!     devices      -> device_id
//!     sensor_data  -> (device_id, sensor_type, timestamp)
//!
//! relationships:
//!     - used by: acquisition.rs, sync.rs, api.rs, main.rs
//!
//! ==============================================================================

pub mod memory;
pub mod postgres;

use crate::domain::{Device, DeviceStatus, HubStats, ReadingQuery, SensorReading, SystemEvent};

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub use memory::{MemoryStore, Retention};
pub use postgres::PgStore;

/// cheap to clone, all backends are shared behind an `Arc`
#[derive(Clone)]
pub enum Store {
    Postgres(Arc<PgStore>),
    Memory(Arc<MemoryStore>),
}

macro_rules! dispatch {
    ($self:ident . $method:ident ( $($arg:expr),* )) => {
        match $self {
            Store::Postgres(s) => s.$method($($arg),*).await,
            Store::Memory(s) => s.$method($($arg),*).await,
        }
    };
}

impl Store {
    /// connect to postgres when a url is given, otherwise keep data in memory
    ///
    /// the schema is created on connect. `retention` only applies to memory.
    pub async fn open(url: Option<&str>, label: &'static str, retention: Retention) -> Result<Self> {
        let store = match url {
            Some(url) => Store::Postgres(Arc::new(PgStore::connect(url, label).await?)),
            None => {
                tracing::warn!(
                    "{label}: no database url configured, keeping the last {} readings in memory",
                    retention.max_readings
                );
                Store::Memory(Arc::new(MemoryStore::with_retention(retention)))
            }
        };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn memory() -> Self {
        Store::Memory(Arc::new(MemoryStore::new()))
    }

    pub fn backend(&self) -> &'static str {
        match self {
            Store::Postgres(_) => "postgres",
            Store::Memory(_) => "memory",
        }
    }

    pub async fn init_schema(&self) -> Result<()> {
        dispatch!(self.init_schema())
    }

    pub async fn ping(&self) -> Result<()> {
        dispatch!(self.ping())
    }

    /// insert or refresh a device, `first_seen` is never overwritten
    pub async fn register_device(&self, device: &Device) -> Result<()> {
        dispatch!(self.register_device(device))
    }

    /// returns false when the device is unknown
    pub async fn set_device_status(&self, device_id: &str, status: DeviceStatus) -> Result<bool> {
        dispatch!(self.set_device_status(device_id, status))
    }

    /// upsert readings, creating stub devices for unknown ids
    pub async fn upsert_readings(&self, readings: &[SensorReading]) -> Result<usize> {
        if readings.is_empty() {
            return Ok(0);
        }
        dispatch!(self.upsert_readings(readings))
    }

    pub async fn log_event(
        &self,
        event_type: &str,
        device_id: Option<&str>,
        message: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        dispatch!(self.log_event(event_type, device_id, message, metadata))
    }

    /// most recently seen first
    pub async fn devices(&self, status: Option<DeviceStatus>) -> Result<Vec<Device>> {
        dispatch!(self.devices(status))
    }

    pub async fn device(&self, device_id: &str) -> Result<Option<Device>> {
        dispatch!(self.device(device_id))
    }

    /// newest first
    pub async fn readings(&self, query: &ReadingQuery) -> Result<Vec<SensorReading>> {
        dispatch!(self.readings(query))
    }

    pub async fn events(&self, limit: i64) -> Result<Vec<SystemEvent>> {
        dispatch!(self.events(limit))
    }

    pub async fn stats(&self) -> Result<HubStats> {
        dispatch!(self.stats())
    }

    /// oldest first, so a partial sync never leaves gaps behind
    pub async fn unsynced(&self, limit: i64) -> Result<Vec<SensorReading>> {
        dispatch!(self.unsynced(limit))
    }

    /// flag pushed rows as synced, matching key and value
    ///
    /// a row rewritten after it was read for pushing keeps `synced = false`.
    pub async fn mark_synced(&self, pushed: &[SensorReading]) -> Result<usize> {
        if pushed.is_empty() {
            return Ok(0);
        }
        dispatch!(self.mark_synced(pushed))
    }

    pub async fn latest_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        dispatch!(self.latest_timestamp())
    }
}
