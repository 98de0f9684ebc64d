//! ==============================================================================
//! protocol.rs - arduino frame parsing and normalization
//! ==============================================================================
//!
//! purpose:
//!     turns whatever a board sends (one serial line, or one http body) into
//!     `SensorReading`s.
//!
//! wire formats seen in the field:
//!     {"message_type":"sensor_data","device_id":"arduino_usb_001",
//!      "sensors":{"temperature_1":22.4,"light_level":61},"debug":{"adc_ntc1":498}}
//!     {"message_type":"command_response","command":"STATUS","status":"ok"}
//!     {"device_id":"eth_01","device_type":"arduino_ethernet","sensors":{...}}
//!     {"sensor_type":"temperature","value":21.0,"unit":"C"}      (legacy)
//!     temp:25.5,humid:60.2                                          (text)
//!     Temperature: 25.5 °C                                          (text)
//!
//! relationships:
//!     - used by: usb.rs, ethernet.rs, acquisition.rs
//!     - uses: ntc.rs (temperature backfill from raw adc counts)
//!
//! ==============================================================================

use crate::domain::{ethernet_device_id, SensorReading};
use crate::ntc;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

/// derived by the firmware from the individual probes, never stored
const AGGREGATE_SENSORS: &[&str] = &["temperature_avg"];

/// firmware placeholder values for "no reading"
const SENTINELS: &[f64] = &[-999.0, -1.0];

pub const USB_DEFAULT_DEVICE_ID: &str = "arduino_usb";

/// where a frame came from
#[derive(Clone, Debug, PartialEq)]
pub enum Origin {
    Usb,
    Ethernet { ip: String },
}

impl Origin {
    pub fn source(&self) -> &'static str {
        match self {
            Origin::Usb => "usb",
            Origin::Ethernet { .. } => "ethernet",
        }
    }

    pub fn default_device_id(&self) -> String {
        match self {
            Origin::Usb => USB_DEFAULT_DEVICE_ID.to_string(),
            Origin::Ethernet { ip } => ethernet_device_id(ip),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    /// multi-sensor frame; a `None` value is present but non-numeric
    SensorData {
        device_id: Option<String>,
        sensors: Vec<(String, Option<f64>)>,
        raw: Value,
    },
    /// legacy single value frame
    Single {
        device_id: Option<String>,
        sensor_type: String,
        value: f64,
        unit: Option<String>,
        raw: Value,
    },
    CommandResponse {
        command: Option<String>,
        status: Option<String>,
        raw: Value,
    },
    /// json we understand as an object but carries no readings
    Status(Value),
    /// best-effort `key:value` text
    KeyValue {
        pairs: Vec<(String, f64, Option<String>)>,
        line: String,
    },
}

impl Frame {
    pub fn device_id(&self) -> Option<&str> {
        match self {
            Frame::SensorData { device_id, .. } | Frame::Single { device_id, .. } => {
                device_id.as_deref()
            }
            Frame::CommandResponse { raw, .. } | Frame::Status(raw) => {
                raw.get("device_id").and_then(Value::as_str)
            }
            Frame::KeyValue { .. } => None,
        }
    }

    pub fn has_readings(&self) -> bool {
        matches!(
            self,
            Frame::SensorData { .. } | Frame::Single { .. } | Frame::KeyValue { .. }
        )
    }
}

/// parse one line (or http body)
///
/// json is tried first; anything else goes through the `key:value` fallback.
/// returns `None` when nothing usable is in the text, including json objects
/// that do not parse.
pub fn parse_frame(line: &str) -> Option<Frame> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    // a line cut mid-frame (first line after the port opens) is dropped whole
    if line.starts_with('{') {
        return match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(obj)) => Some(frame_from_object(obj)),
            _ => None,
        };
    }

    parse_key_values(line)
}

fn frame_from_object(obj: Map<String, Value>) -> Frame {
    let device_id = obj.get("device_id").and_then(Value::as_str).map(str::to_string);
    let message_type = obj.get("message_type").and_then(Value::as_str);

    if message_type == Some("command_response") {
        return Frame::CommandResponse {
            command: obj.get("command").and_then(Value::as_str).map(str::to_string),
            status: obj.get("status").and_then(Value::as_str).map(str::to_string),
            raw: Value::Object(obj),
        };
    }

    if let Some(Value::Object(sensors)) = obj.get("sensors") {
        if message_type.is_none() || message_type == Some("sensor_data") {
            let sensors = sensors
                .iter()
                .map(|(name, v)| (name.clone(), number(v)))
                .collect();
            return Frame::SensorData { device_id, sensors, raw: Value::Object(obj) };
        }
    }

    if let (Some(sensor_type), Some(value)) = (
        obj.get("sensor_type").and_then(Value::as_str),
        obj.get("value").and_then(number),
    ) {
        return Frame::Single {
            device_id,
            sensor_type: sensor_type.to_string(),
            value,
            unit: obj
                .get("unit")
                .and_then(Value::as_str)
                .filter(|u| !u.is_empty())
                .map(str::to_string),
            raw: Value::Object(obj),
        };
    }

    Frame::Status(Value::Object(obj))
}

/// numbers, and strings that hold numbers
fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_key_values(line: &str) -> Option<Frame> {
    let pairs: Vec<_> = line
        .split(',')
        .filter_map(|pair| {
            let (key, rest) = pair.split_once(':')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            let (value, unit) = split_value_unit(rest)?;
            Some((key.to_string(), value, unit))
        })
        .collect();

    if pairs.is_empty() {
        return None;
    }
    Some(Frame::KeyValue { pairs, line: line.to_string() })
}

/// "25.5 °C" -> (25.5, Some("°C"))
fn split_value_unit(s: &str) -> Option<(f64, Option<String>)> {
    let s = s.trim();
    let end = s
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || c == '.' || (i == 0 && (c == '-' || c == '+'))))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    let value: f64 = s[..end].parse().ok()?;
    let unit = s[end..].trim();
    Some((value, (!unit.is_empty()).then(|| unit.to_string())))
}

/// unit used when the board does not send one
pub fn infer_unit(sensor_type: &str) -> &'static str {
    let s = sensor_type.to_ascii_lowercase();
    if s.starts_with("temperature") || s.starts_with("temp") {
        "°C"
    } else if s.starts_with("humid") {
        "%"
    } else if s.starts_with("light") {
        "%"
    } else if s.starts_with("pressure") {
        "hPa"
    } else {
        ""
    }
}

fn usable(value: f64) -> bool {
    value.is_finite() && !SENTINELS.contains(&value)
}

/// expand a frame into storable readings
///
/// aggregates and sentinel values are dropped; the board's own `device_id`
/// wins over the origin default.
pub fn normalize(frame: &Frame, origin: &Origin, now: DateTime<Utc>) -> Vec<SensorReading> {
    let device_id = frame
        .device_id()
        .map(str::to_string)
        .unwrap_or_else(|| origin.default_device_id());

    let raw_data = |original: &Value| {
        let mut raw = json!({
            "source": origin.source(),
            "original_message": original,
        });
        if let Origin::Ethernet { ip } = origin {
            raw["ip_address"] = json!(ip);
        }
        if let Some(ts) = original.get("timestamp") {
            raw["arduino_timestamp"] = ts.clone();
        }
        raw
    };

    let make = |sensor_type: &str, value: f64, unit: Option<&str>, raw: &Value| {
        let sensor_type = sensor_type.to_lowercase();
        SensorReading {
            unit: unit.map(str::to_string).unwrap_or_else(|| infer_unit(&sensor_type).to_string()),
            device_id: device_id.clone(),
            sensor_type,
            value,
            raw_data: raw_data(raw),
            timestamp: now,
        }
    };

    match frame {
        Frame::SensorData { sensors, raw, .. } => {
            let mut out: Vec<SensorReading> = sensors
                .iter()
                .filter(|(name, _)| !AGGREGATE_SENSORS.contains(&name.to_lowercase().as_str()))
                .filter_map(|(name, value)| value.filter(|v| usable(*v)).map(|v| (name, v)))
                .map(|(name, v)| make(name, v, None, raw))
                .collect();

            for (sensor_type, value) in ntc_backfill(sensors, raw) {
                out.push(make(&sensor_type, value, Some("°C"), raw));
            }
            out
        }
        Frame::Single { sensor_type, value, unit, raw, .. } if usable(*value) => {
            vec![make(sensor_type, *value, unit.as_deref(), raw)]
        }
        Frame::KeyValue { pairs, line } => {
            let raw = Value::String(line.clone());
            pairs
                .iter()
                .filter(|(_, v, _)| usable(*v))
                .map(|(k, v, unit)| make(k, *v, unit.as_deref(), &raw))
                .collect()
        }
        _ => Vec::new(),
    }
}

/// `debug.adc_ntcN` -> `temperature_N` for probes the board could not convert
fn ntc_backfill(sensors: &[(String, Option<f64>)], raw: &Value) -> Vec<(String, f64)> {
    let Some(debug) = raw.get("debug").and_then(Value::as_object) else {
        return Vec::new();
    };

    debug
        .iter()
        .filter_map(|(key, adc)| {
            let probe = key.strip_prefix("adc_ntc")?;
            let sensor_type = format!("temperature_{probe}");
            let reported = sensors
                .iter()
                .find(|(name, _)| name.eq_ignore_ascii_case(&sensor_type))
                .and_then(|(_, v)| *v)
                .filter(|v| usable(*v));
            if reported.is_some() {
                return None;
            }
            let t = ntc::temperature_from_adc(number(adc)?)?;
            Some((sensor_type, (t * 100.0).round() / 100.0))
        })
        .collect()
}

/// does a reply to `STATUS` look like one of our boards?
pub fn is_status_ack(line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return false;
    }
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(obj)) => {
            obj.get("status").and_then(Value::as_str) == Some("ok")
                || obj
                    .get("device_id")
                    .and_then(Value::as_str)
                    .map(|id| id.to_lowercase().contains("arduino"))
                    .unwrap_or(false)
        }
        _ => {
            let lower = line.to_lowercase();
            lower.contains("ok") || lower.contains("arduino")
        }
    }
}
