//! ==============================================================================
//! domain.rs - shared types
//! ==============================================================================
//!
//! purpose:
//!     the vocabulary every layer speaks: readings, devices, events, queries.
//!     serde derives make the same structs usable for the json api and for the
//!     in-memory store.
//!
//! relationships:
//!     - produced by: protocol.rs (readings), usb.rs / ethernet.rs (devices)
//!     - persisted by: store/
//!     - served by: api.rs
//!
//! ==============================================================================

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// largest page a single query may return
pub const MAX_QUERY_LIMIT: i64 = 5000;

/// one normalized sensor value
///
/// identity is `(device_id, sensor_type, timestamp)`: writing the same key
/// twice updates the row instead of duplicating it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub device_id: String,
    pub sensor_type: String,
    pub value: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub raw_data: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    ArduinoUsb,
    ArduinoEthernet,
    ModbusTcp,
    #[default]
    Unknown,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::ArduinoUsb => "arduino_usb",
            DeviceKind::ArduinoEthernet => "arduino_ethernet",
            DeviceKind::ModbusTcp => "modbus_tcp",
            DeviceKind::Unknown => "unknown",
        }
    }

    /// lenient parse, anything unrecognised is `Unknown`
    pub fn parse(s: &str) -> Self {
        match s {
            "arduino_usb" => DeviceKind::ArduinoUsb,
            "arduino_ethernet" => DeviceKind::ArduinoEthernet,
            "modbus_tcp" => DeviceKind::ModbusTcp,
            _ => DeviceKind::Unknown,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    #[default]
    Online,
    Offline,
    Error,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Error => "error",
        }
    }

    /// older rows used "active" for online
    pub fn parse(s: &str) -> Self {
        match s {
            "online" | "active" => DeviceStatus::Online,
            "offline" => DeviceStatus::Offline,
            _ => DeviceStatus::Error,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: String,
    #[serde(default)]
    pub device_type: DeviceKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub status: DeviceStatus,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default)]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl Device {
    /// a freshly seen device, timestamps filled in by the store
    pub fn new(device_id: impl Into<String>, device_type: DeviceKind) -> Self {
        Self {
            device_id: device_id.into(),
            device_type,
            name: None,
            ip_address: None,
            port: None,
            status: DeviceStatus::Online,
            metadata: serde_json::Value::Null,
            first_seen: None,
            last_seen: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SystemEvent {
    pub id: i64,
    pub event_type: String,
    pub device_id: Option<String>,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// filter for reading queries, newest first
#[derive(Clone, Debug, PartialEq)]
pub struct ReadingQuery {
    pub device_id: Option<String>,
    pub limit: i64,
    pub window: Option<Duration>,
}

impl ReadingQuery {
    /// build from the raw query-string values
    ///
    /// `hours` wins over `days` when both are given. the limit is clamped to
    /// `1..=MAX_QUERY_LIMIT`.
    pub fn from_params(
        device_id: Option<String>,
        limit: Option<i64>,
        hours: Option<f64>,
        days: Option<i64>,
        default_limit: i64,
    ) -> Self {
        let window = match (hours, days) {
            (Some(h), _) if h.is_finite() && h > 0.0 => {
                Some(Duration::milliseconds((h * 3_600_000.0) as i64))
            }
            (_, Some(d)) if d > 0 => Some(Duration::days(d)),
            _ => None,
        };
        Self {
            device_id: device_id.filter(|d| !d.is_empty()),
            limit: limit.unwrap_or(default_limit).clamp(1, MAX_QUERY_LIMIT),
            window,
        }
    }

    /// earliest timestamp included by the window, if any
    pub fn since(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.window.map(|w| now - w)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HubStats {
    pub total_devices: usize,
    pub online_devices: usize,
    pub total_readings: i64,
    pub last_reading: Option<DateTime<Utc>>,
}

/// device id given to an ethernet board that does not report its own
pub fn ethernet_device_id(ip: &str) -> String {
    format!("arduino_ethernet_{}", ip.replace('.', "_"))
}

pub fn modbus_device_id(ip: &str) -> String {
    format!("modbus_tcp_{}", ip.replace('.', "_"))
}
