//! ==============================================================================
//! store/postgres.rs - postgres backend (local or hosted)
//! ==============================================================================
//!
//! one `tokio_postgres::Client` per store, shared behind an `Arc`. when the
//! connection drops (server restart, idle timeout on the hosted side) the
//! client is discarded, a new one is opened and the statement is retried once.
//!
//! every statement runs in autocommit mode, so a failed statement never leaves
//! the session stuck in an aborted transaction.
//!
//! ==============================================================================

use crate::domain::{
    Device, DeviceKind, DeviceStatus, HubStats, ReadingQuery, SensorReading, SystemEvent,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, info, warn};

/// reconnect-and-retry budget per call
const MAX_RECONNECTS: u32 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    id SERIAL PRIMARY KEY,
    device_id TEXT UNIQUE NOT NULL,
    device_type TEXT NOT NULL,
    name TEXT,
    ip_address TEXT,
    port INTEGER,
    status TEXT NOT NULL DEFAULT 'online',
    metadata JSONB,
    first_seen TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    last_seen TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE TABLE IF NOT EXISTS sensor_data (
    id BIGSERIAL PRIMARY KEY,
    device_id TEXT NOT NULL REFERENCES devices(device_id) ON DELETE CASCADE,
    sensor_type TEXT NOT NULL,
    value DOUBLE PRECISION NOT NULL,
    unit TEXT NOT NULL DEFAULT '',
    raw_data JSONB,
    timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    synced BOOLEAN NOT NULL DEFAULT FALSE,
    UNIQUE (device_id, sensor_type, timestamp)
);

CREATE TABLE IF NOT EXISTS system_events (
    id BIGSERIAL PRIMARY KEY,
    event_type TEXT NOT NULL,
    device_id TEXT,
    message TEXT NOT NULL DEFAULT '',
    metadata JSONB,
    timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_devices_status ON devices(status);
CREATE INDEX IF NOT EXISTS idx_sensor_data_device_id ON sensor_data(device_id);
CREATE INDEX IF NOT EXISTS idx_sensor_data_timestamp ON sensor_data(timestamp);
CREATE INDEX IF NOT EXISTS idx_sensor_data_unsynced ON sensor_data(synced) WHERE synced = FALSE;
CREATE INDEX IF NOT EXISTS idx_system_events_timestamp ON system_events(timestamp);
CREATE INDEX IF NOT EXISTS idx_system_events_device_id ON system_events(device_id);
"#;

const UPSERT_DEVICE: &str = "
INSERT INTO devices (device_id, device_type, name, ip_address, port, status, metadata)
VALUES ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (device_id) DO UPDATE SET
    device_type = EXCLUDED.device_type,
    name = COALESCE(EXCLUDED.name, devices.name),
    ip_address = COALESCE(EXCLUDED.ip_address, devices.ip_address),
    port = COALESCE(EXCLUDED.port, devices.port),
    status = EXCLUDED.status,
    metadata = EXCLUDED.metadata,
    last_seen = NOW(),
    updated_at = NOW()";

const TOUCH_DEVICE: &str = "
INSERT INTO devices (device_id, device_type, status)
VALUES ($1, 'unknown', 'online')
ON CONFLICT (device_id) DO UPDATE SET last_seen = NOW()";

const UPSERT_READING: &str = "
INSERT INTO sensor_data (device_id, sensor_type, value, unit, raw_data, timestamp, synced)
VALUES ($1, $2, $3, $4, $5, $6, FALSE)
ON CONFLICT (device_id, sensor_type, timestamp) DO UPDATE SET
    value = EXCLUDED.value,
    unit = EXCLUDED.unit,
    raw_data = EXCLUDED.raw_data,
    synced = FALSE";

const DEVICE_COLUMNS: &str =
    "device_id, device_type, name, ip_address, port, status, metadata, first_seen, last_seen";

const READING_COLUMNS: &str = "device_id, sensor_type, value, unit, raw_data, timestamp";

pub struct PgStore {
    url: String,
    label: &'static str,
    client: Mutex<Option<Arc<Client>>>,
}

impl PgStore {
    pub async fn connect(url: &str, label: &'static str) -> Result<Self> {
        let client = open(url, label).await?;
        info!("{label}: connected to postgres");
        Ok(Self {
            url: url.to_string(),
            label,
            client: Mutex::new(Some(Arc::new(client))),
        })
    }

    /// live client, reopening the connection if it was lost
    async fn client(&self) -> Result<Arc<Client>> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            if !client.is_closed() {
                return Ok(client.clone());
            }
            warn!("{}: connection closed, reconnecting", self.label);
        }
        let client = Arc::new(open(&self.url, self.label).await?);
        *guard = Some(client.clone());
        Ok(client)
    }

    async fn discard(&self) {
        *self.client.lock().await = None;
    }

    /// run `op`, reconnecting and retrying when the connection broke under it
    async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Arc<Client>) -> Fut,
        Fut: Future<Output = Result<T, tokio_postgres::Error>>,
    {
        let mut reconnects = 0;
        loop {
            let client = self.client().await?;
            match op(client.clone()).await {
                Ok(v) => return Ok(v),
                Err(e) if reconnects < MAX_RECONNECTS && (e.is_closed() || client.is_closed()) => {
                    warn!("{}: statement lost its connection ({e}), retrying", self.label);
                    self.discard().await;
                    reconnects += 1;
                }
                Err(e) => return Err(e).context(format!("{}: query failed", self.label)),
            }
        }
    }

    pub async fn init_schema(&self) -> Result<()> {
        self.run(|c| async move { c.batch_execute(SCHEMA).await }).await?;
        debug!("{}: schema ready", self.label);
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        self.run(|c| async move { c.simple_query("SELECT 1").await.map(|_| ()) }).await
    }

    pub async fn register_device(&self, device: &Device) -> Result<()> {
        let port = device.port.map(i32::from);
        let metadata = Some(&device.metadata).filter(|m| !m.is_null());
        self.run(|c| async move {
            c.execute(
                UPSERT_DEVICE,
                &[
                    &device.device_id,
                    &device.device_type.as_str(),
                    &device.name,
                    &device.ip_address,
                    &port,
                    &device.status.as_str(),
                    &metadata,
                ],
            )
            .await
        })
        .await?;
        Ok(())
    }

    pub async fn set_device_status(&self, device_id: &str, status: DeviceStatus) -> Result<bool> {
        let n = self
            .run(|c| async move {
                c.execute(
                    "UPDATE devices SET status = $2, last_seen = NOW(), updated_at = NOW() WHERE device_id = $1",
                    &[&device_id, &status.as_str()],
                )
                .await
            })
            .await?;
        Ok(n > 0)
    }

    pub async fn upsert_readings(&self, readings: &[SensorReading]) -> Result<usize> {
        let mut device_ids: Vec<&str> = readings.iter().map(|r| r.device_id.as_str()).collect();
        device_ids.sort_unstable();
        device_ids.dedup();
        let device_ids = &device_ids;

        let written = self
            .run(|c| async move {
                let touch = c.prepare(TOUCH_DEVICE).await?;
                for id in device_ids {
                    c.execute(&touch, &[id]).await?;
                }
                let upsert = c.prepare(UPSERT_READING).await?;
                let mut n = 0u64;
                for r in readings {
                    n += c
                        .execute(
                            &upsert,
                            &[&r.device_id, &r.sensor_type, &r.value, &r.unit, &r.raw_data, &r.timestamp],
                        )
                        .await?;
                }
                Ok::<_, tokio_postgres::Error>(n)
            })
            .await?;
        Ok(written as usize)
    }

    pub async fn log_event(
        &self,
        event_type: &str,
        device_id: Option<&str>,
        message: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        let metadata = &metadata;
        self.run(|c| async move {
            c.execute(
                "INSERT INTO system_events (event_type, device_id, message, metadata) VALUES ($1, $2, $3, $4)",
                &[&event_type, &device_id, &message, metadata],
            )
            .await
        })
        .await?;
        Ok(())
    }

    pub async fn devices(&self, status: Option<DeviceStatus>) -> Result<Vec<Device>> {
        let status = status.map(|s| s.as_str());
        let sql = format!(
            "SELECT {DEVICE_COLUMNS} FROM devices WHERE ($1::TEXT IS NULL OR status = $1::TEXT) ORDER BY last_seen DESC"
        );
        let sql = sql.as_str();
        let rows = self.run(|c| async move { c.query(sql, &[&status]).await }).await?;
        rows.iter().map(device_from_row).collect()
    }

    pub async fn device(&self, device_id: &str) -> Result<Option<Device>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM devices WHERE device_id = $1");
        let sql = sql.as_str();
        let row = self.run(|c| async move { c.query_opt(sql, &[&device_id]).await }).await?;
        row.as_ref().map(device_from_row).transpose()
    }

    pub async fn readings(&self, query: &ReadingQuery) -> Result<Vec<SensorReading>> {
        let device_id = query.device_id.as_deref();
        let since = query.since(Utc::now());
        let limit = query.limit;
        let sql = format!(
            "SELECT {READING_COLUMNS} FROM sensor_data
             WHERE ($1::TEXT IS NULL OR device_id = $1::TEXT)
               AND ($2::TIMESTAMPTZ IS NULL OR timestamp >= $2::TIMESTAMPTZ)
             ORDER BY timestamp DESC, id DESC
             LIMIT $3"
        );
        let sql = sql.as_str();
        let rows = self
            .run(|c| async move { c.query(sql, &[&device_id, &since, &limit]).await })
            .await?;
        rows.iter().map(reading_from_row).collect()
    }

    pub async fn events(&self, limit: i64) -> Result<Vec<SystemEvent>> {
        let rows = self
            .run(|c| async move {
                c.query(
                    "SELECT id, event_type, device_id, message, metadata, timestamp
                     FROM system_events ORDER BY timestamp DESC, id DESC LIMIT $1",
                    &[&limit],
                )
                .await
            })
            .await?;
        rows.iter()
            .map(|row| -> Result<SystemEvent> {
                Ok(SystemEvent {
                    id: row.try_get("id")?,
                    event_type: row.try_get("event_type")?,
                    device_id: row.try_get("device_id")?,
                    message: row.try_get("message")?,
                    metadata: row.try_get("metadata")?,
                    timestamp: row.try_get("timestamp")?,
                })
            })
            .collect()
    }

    pub async fn stats(&self) -> Result<HubStats> {
        let row = self
            .run(|c| async move {
                c.query_one(
                    "SELECT
                        (SELECT COUNT(*) FROM devices) AS total_devices,
                        (SELECT COUNT(*) FROM devices WHERE status = 'online') AS online_devices,
                        (SELECT COUNT(*) FROM sensor_data) AS total_readings,
                        (SELECT MAX(timestamp) FROM sensor_data) AS last_reading",
                    &[],
                )
                .await
            })
            .await?;
        Ok(HubStats {
            total_devices: row.try_get::<_, i64>("total_devices")? as usize,
            online_devices: row.try_get::<_, i64>("online_devices")? as usize,
            total_readings: row.try_get("total_readings")?,
            last_reading: row.try_get("last_reading")?,
        })
    }

    pub async fn unsynced(&self, limit: i64) -> Result<Vec<SensorReading>> {
        let sql = format!(
            "SELECT {READING_COLUMNS} FROM sensor_data WHERE synced = FALSE ORDER BY timestamp ASC, id ASC LIMIT $1"
        );
        let sql = sql.as_str();
        let rows = self.run(|c| async move { c.query(sql, &[&limit]).await }).await?;
        rows.iter().map(reading_from_row).collect()
    }

    pub async fn mark_synced(&self, pushed: &[SensorReading]) -> Result<usize> {
        let marked = self
            .run(|c| async move {
                let stmt = c
                    .prepare(
                        "UPDATE sensor_data SET synced = TRUE
                         WHERE device_id = $1 AND sensor_type = $2 AND timestamp = $3
                           AND value = $4 AND synced = FALSE",
                    )
                    .await?;
                let mut n = 0u64;
                for r in pushed {
                    n += c
                        .execute(&stmt, &[&r.device_id, &r.sensor_type, &r.timestamp, &r.value])
                        .await?;
                }
                Ok::<_, tokio_postgres::Error>(n)
            })
            .await?;
        Ok(marked as usize)
    }

    pub async fn latest_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        let row = self
            .run(|c| async move { c.query_one("SELECT MAX(timestamp) FROM sensor_data", &[]).await })
            .await?;
        Ok(row.try_get(0)?)
    }
}

async fn open(url: &str, label: &'static str) -> Result<Client> {
    let (client, connection) = tokio_postgres::connect(url, NoTls)
        .await
        .with_context(|| format!("{label}: failed to connect to postgres"))?;

    // the connection object drives the socket, it lives until the client is dropped
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!("{label}: postgres connection ended: {e}");
        }
    });
    Ok(client)
}

fn device_from_row(row: &Row) -> Result<Device> {
    let device_type: String = row.try_get("device_type")?;
    let status: String = row.try_get("status")?;
    let port: Option<i32> = row.try_get("port")?;
    let metadata: Option<serde_json::Value> = row.try_get("metadata")?;
    Ok(Device {
        device_id: row.try_get("device_id")?,
        device_type: DeviceKind::parse(&device_type),
        name: row.try_get("name")?,
        ip_address: row.try_get("ip_address")?,
        port: port.and_then(|p| u16::try_from(p).ok()),
        status: DeviceStatus::parse(&status),
        metadata: metadata.unwrap_or(serde_json::Value::Null),
        first_seen: row.try_get("first_seen")?,
        last_seen: row.try_get("last_seen")?,
    })
}

fn reading_from_row(row: &Row) -> Result<SensorReading> {
    let raw_data: Option<serde_json::Value> = row.try_get("raw_data")?;
    Ok(SensorReading {
        device_id: row.try_get("device_id")?,
        sensor_type: row.try_get("sensor_type")?,
        value: row.try_get("value")?,
        unit: row.try_get("unit")?,
        raw_data: raw_data.unwrap_or(serde_json::Value::Null),
        timestamp: row.try_get("timestamp")?,
    })
}
