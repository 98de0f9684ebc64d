//! in-memory backend
//!
//! same semantics as the postgres tables. readings are kept in a map ordered
//! by timestamp, so newest-first queries walk the tail and retention drops the
//! head. both readings and events are capped, the oldest rows go first.

use crate::domain::{
    Device, DeviceKind, DeviceStatus, HubStats, ReadingQuery, SensorReading, SystemEvent,
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::Mutex;
use tracing::debug;

/// how much the store keeps before dropping the oldest rows
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Retention {
    pub max_readings: usize,
    pub max_events: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self { max_readings: 100_000, max_events: 10_000 }
    }
}

/// reading key ordered by time first
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Slot {
    timestamp: DateTime<Utc>,
    device_id: String,
    sensor_type: String,
}

impl Slot {
    fn of(r: &SensorReading) -> Self {
        Self {
            timestamp: r.timestamp,
            device_id: r.device_id.clone(),
            sensor_type: r.sensor_type.clone(),
        }
    }

    /// sorts before every slot at `timestamp`
    fn floor(timestamp: DateTime<Utc>) -> Self {
        Self { timestamp, device_id: String::new(), sensor_type: String::new() }
    }
}

struct Row {
    value: f64,
    unit: String,
    raw_data: serde_json::Value,
    synced: bool,
}

fn reading(slot: &Slot, row: &Row) -> SensorReading {
    SensorReading {
        device_id: slot.device_id.clone(),
        sensor_type: slot.sensor_type.clone(),
        value: row.value,
        unit: row.unit.clone(),
        raw_data: row.raw_data.clone(),
        timestamp: slot.timestamp,
    }
}

#[derive(Default)]
struct Tables {
    devices: Vec<Device>,
    readings: BTreeMap<Slot, Row>,
    events: VecDeque<SystemEvent>,
    next_event_id: i64,
}

impl Tables {
    fn touch_device(&mut self, device_id: &str, now: DateTime<Utc>) {
        match self.devices.iter_mut().find(|d| d.device_id == device_id) {
            Some(d) => d.last_seen = Some(now),
            None => {
                let mut stub = Device::new(device_id, DeviceKind::Unknown);
                stub.first_seen = Some(now);
                stub.last_seen = Some(now);
                self.devices.push(stub);
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    retention: Retention,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: Retention) -> Self {
        Self { tables: Mutex::default(), retention }
    }

    pub async fn init_schema(&self) -> Result<()> {
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        Ok(())
    }

    pub async fn register_device(&self, device: &Device) -> Result<()> {
        let now = Utc::now();
        let mut t = self.tables.lock().await;
        match t.devices.iter_mut().find(|d| d.device_id == device.device_id) {
            Some(existing) => {
                existing.device_type = device.device_type;
                existing.status = device.status;
                existing.metadata = device.metadata.clone();
                if device.name.is_some() {
                    existing.name = device.name.clone();
                }
                if device.ip_address.is_some() {
                    existing.ip_address = device.ip_address.clone();
                }
                if device.port.is_some() {
                    existing.port = device.port;
                }
                existing.last_seen = Some(now);
            }
            None => {
                let mut fresh = device.clone();
                fresh.first_seen = Some(now);
                fresh.last_seen = Some(now);
                t.devices.push(fresh);
            }
        }
        Ok(())
    }

    pub async fn set_device_status(&self, device_id: &str, status: DeviceStatus) -> Result<bool> {
        let mut t = self.tables.lock().await;
        Ok(match t.devices.iter_mut().find(|d| d.device_id == device_id) {
            Some(d) => {
                d.status = status;
                d.last_seen = Some(Utc::now());
                true
            }
            None => false,
        })
    }

    pub async fn upsert_readings(&self, readings: &[SensorReading]) -> Result<usize> {
        let now = Utc::now();
        let mut t = self.tables.lock().await;

        let mut device_ids: Vec<&str> = readings.iter().map(|r| r.device_id.as_str()).collect();
        device_ids.sort_unstable();
        device_ids.dedup();
        for id in device_ids {
            t.touch_device(id, now);
        }

        for r in readings {
            let row = Row {
                value: r.value,
                unit: r.unit.clone(),
                raw_data: r.raw_data.clone(),
                synced: false,
            };
            t.readings.insert(Slot::of(r), row);
        }

        let mut dropped = 0;
        while t.readings.len() > self.retention.max_readings {
            t.readings.pop_first();
            dropped += 1;
        }
        if dropped > 0 {
            debug!("memory store: dropped {dropped} oldest readings");
        }
        Ok(readings.len())
    }

    pub async fn log_event(
        &self,
        event_type: &str,
        device_id: Option<&str>,
        message: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut t = self.tables.lock().await;
        t.next_event_id += 1;
        let id = t.next_event_id;
        t.events.push_back(SystemEvent {
            id,
            event_type: event_type.to_string(),
            device_id: device_id.map(str::to_string),
            message: message.to_string(),
            metadata,
            timestamp: Utc::now(),
        });
        while t.events.len() > self.retention.max_events {
            t.events.pop_front();
        }
        Ok(())
    }

    pub async fn devices(&self, status: Option<DeviceStatus>) -> Result<Vec<Device>> {
        let t = self.tables.lock().await;
        let mut out: Vec<Device> = t
            .devices
            .iter()
            .filter(|d| status.map_or(true, |s| d.status == s))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(out)
    }

    pub async fn device(&self, device_id: &str) -> Result<Option<Device>> {
        let t = self.tables.lock().await;
        Ok(t.devices.iter().find(|d| d.device_id == device_id).cloned())
    }

    pub async fn readings(&self, query: &ReadingQuery) -> Result<Vec<SensorReading>> {
        let since = query.since(Utc::now());
        let t = self.tables.lock().await;
        let window = match since {
            Some(since) => t.readings.range(Slot::floor(since)..),
            None => t.readings.range(..),
        };
        Ok(window
            .rev()
            .filter(|(slot, _)| query.device_id.as_ref().map_or(true, |d| &slot.device_id == d))
            .take(query.limit.max(0) as usize)
            .map(|(slot, row)| reading(slot, row))
            .collect())
    }

    pub async fn events(&self, limit: i64) -> Result<Vec<SystemEvent>> {
        let t = self.tables.lock().await;
        Ok(t.events.iter().rev().take(limit.max(0) as usize).cloned().collect())
    }

    pub async fn stats(&self) -> Result<HubStats> {
        let t = self.tables.lock().await;
        Ok(HubStats {
            total_devices: t.devices.len(),
            online_devices: t.devices.iter().filter(|d| d.status == DeviceStatus::Online).count(),
            total_readings: t.readings.len() as i64,
            last_reading: t.readings.last_key_value().map(|(slot, _)| slot.timestamp),
        })
    }

    pub async fn unsynced(&self, limit: i64) -> Result<Vec<SensorReading>> {
        let t = self.tables.lock().await;
        Ok(t
            .readings
            .iter()
            .filter(|(_, row)| !row.synced)
            .take(limit.max(0) as usize)
            .map(|(slot, row)| reading(slot, row))
            .collect())
    }

    /// rows whose value changed since `pushed` was read stay unsynced
    pub async fn mark_synced(&self, pushed: &[SensorReading]) -> Result<usize> {
        let mut t = self.tables.lock().await;
        let mut marked = 0;
        for r in pushed {
            if let Some(row) = t.readings.get_mut(&Slot::of(r)) {
                if !row.synced && row.value == r.value {
                    row.synced = true;
                    marked += 1;
                }
            }
        }
        Ok(marked)
    }

    pub async fn latest_timestamp(&self) -> Result<Option<DateTime<Utc>>> {
        let t = self.tables.lock().await;
        Ok(t.readings.last_key_value().map(|(slot, _)| slot.timestamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn reading(device: &str, sensor: &str, value: f64, at: DateTime<Utc>) -> SensorReading {
        SensorReading {
            device_id: device.to_string(),
            sensor_type: sensor.to_string(),
            value,
            unit: String::new(),
            raw_data: json!({}),
            timestamp: at,
        }
    }

    #[tokio::test]
    async fn upsert_is_keyed_on_device_sensor_timestamp() {
        let store = MemoryStore::new();
        let t0 = Utc::now();

        store.upsert_readings(&[reading("a", "temperature_1", 20.0, t0)]).await.unwrap();
        store.upsert_readings(&[reading("a", "temperature_1", 21.5, t0)]).await.unwrap();
        store
            .upsert_readings(&[reading("a", "temperature_1", 22.0, t0 + Duration::seconds(1))])
            .await
            .unwrap();

        let all = store
            .readings(&ReadingQuery::from_params(None, None, None, None, 100))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].value, 22.0);
        assert_eq!(all[1].value, 21.5);
    }

    #[tokio::test]
    async fn readings_create_stub_devices() {
        let store = MemoryStore::new();
        store.upsert_readings(&[reading("ghost", "humidity", 40.0, Utc::now())]).await.unwrap();

        let dev = store.device("ghost").await.unwrap().unwrap();
        assert_eq!(dev.device_type, DeviceKind::Unknown);
        assert!(dev.first_seen.is_some());
    }

    #[tokio::test]
    async fn register_keeps_first_seen_and_known_fields() {
        let store = MemoryStore::new();
        let mut dev = Device::new("eth", DeviceKind::ArduinoEthernet);
        dev.ip_address = Some("192.168.0.110".into());
        store.register_device(&dev).await.unwrap();
        let first = store.device("eth").await.unwrap().unwrap().first_seen;

        let mut again = Device::new("eth", DeviceKind::ArduinoEthernet);
        again.status = DeviceStatus::Offline;
        store.register_device(&again).await.unwrap();

        let stored = store.device("eth").await.unwrap().unwrap();
        assert_eq!(stored.first_seen, first);
        assert_eq!(stored.ip_address.as_deref(), Some("192.168.0.110"));
        assert_eq!(stored.status, DeviceStatus::Offline);
        assert_eq!(store.devices(Some(DeviceStatus::Online)).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn window_and_device_filters() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .upsert_readings(&[
                reading("a", "t", 1.0, now - Duration::hours(30)),
                reading("a", "t", 2.0, now - Duration::minutes(10)),
                reading("b", "t", 3.0, now - Duration::minutes(5)),
            ])
            .await
            .unwrap();

        let q = ReadingQuery::from_params(Some("a".into()), None, Some(1.0), None, 100);
        let got = store.readings(&q).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].value, 2.0);

        let q = ReadingQuery::from_params(None, Some(2), None, Some(2), 100);
        let got = store.readings(&q).await.unwrap();
        assert_eq!(got.iter().map(|r| r.value).collect::<Vec<_>>(), vec![3.0, 2.0]);
    }

    #[tokio::test]
    async fn sync_flags_reset_on_rewrite() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        let r = reading("a", "t", 1.0, t0);
        store.upsert_readings(&[r.clone()]).await.unwrap();

        assert_eq!(store.mark_synced(&[r.clone()]).await.unwrap(), 1);
        assert!(store.unsynced(10).await.unwrap().is_empty());

        store.upsert_readings(&[reading("a", "t", 1.5, t0)]).await.unwrap();
        assert_eq!(store.unsynced(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn events_newest_first() {
        let store = MemoryStore::new();
        store.log_event("device_connected", Some("a"), "first", None).await.unwrap();
        store.log_event("acquisition_stopped", None, "second", None).await.unwrap();

        let events = store.events(1).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "second");
        assert_eq!(events[0].id, 2);
    }

    #[tokio::test]
    async fn rewrite_between_read_and_mark_stays_unsynced() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        store.upsert_readings(&[reading("a", "t", 1.0, t0)]).await.unwrap();

        let pushed = store.unsynced(10).await.unwrap();
        store.upsert_readings(&[reading("a", "t", 2.0, t0)]).await.unwrap();

        assert_eq!(store.mark_synced(&pushed).await.unwrap(), 0);
        let pending = store.unsynced(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].value, 2.0);
    }

    #[tokio::test]
    async fn retention_drops_oldest_rows() {
        let store = MemoryStore::with_retention(Retention { max_readings: 3, max_events: 2 });
        let t0 = Utc::now();
        let batch: Vec<_> = (0..5)
            .map(|i| reading("a", "t", i as f64, t0 + Duration::seconds(i)))
            .collect();
        store.upsert_readings(&batch).await.unwrap();

        let all = store
            .readings(&ReadingQuery::from_params(None, None, None, None, 100))
            .await
            .unwrap();
        assert_eq!(all.iter().map(|r| r.value).collect::<Vec<_>>(), vec![4.0, 3.0, 2.0]);
        assert_eq!(store.stats().await.unwrap().total_readings, 3);
        assert_eq!(store.unsynced(10).await.unwrap()[0].value, 2.0);

        for n in 0..4 {
            store.log_event("network_scan", None, &n.to_string(), None).await.unwrap();
        }
        let events = store.events(10).await.unwrap();
        assert_eq!(events.iter().map(|e| e.message.as_str()).collect::<Vec<_>>(), vec!["3", "2"]);
        assert_eq!(events[0].id, 4);
    }

    #[tokio::test]
    async fn newest_first_respects_limit_and_device() {
        let store = MemoryStore::new();
        let t0 = Utc::now();
        store
            .upsert_readings(&[
                reading("a", "t", 1.0, t0),
                reading("b", "t", 2.0, t0 + Duration::seconds(1)),
                reading("a", "t", 3.0, t0 + Duration::seconds(2)),
                reading("a", "h", 4.0, t0 + Duration::seconds(2)),
            ])
            .await
            .unwrap();

        let q = ReadingQuery::from_params(Some("a".into()), Some(2), None, None, 100);
        let got = store.readings(&q).await.unwrap();
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|r| r.device_id == "a" && r.timestamp == t0 + Duration::seconds(2)));
        assert_eq!(store.latest_timestamp().await.unwrap(), Some(t0 + Duration::seconds(2)));
    }
}
