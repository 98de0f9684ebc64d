//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `hub.toml`.
//!     loads configuration from file or falls back to defaults, then applies
//!     environment overrides (the same keys the old `.env.local` used).
//!
//! structure:
//!     - PollingConfig: How often the acquisition loop runs.
//!     - SerialConfig: USB port, baud rate, reconnect budget.
//!     - EthernetConfig: Candidate IPs / subnet sweep for Ethernet shields.
//!     - ModbusConfig: Modbus TCP hosts, unit ids and register probe ranges.
//!     - DatabaseConfig: Local Postgres URL, optional cloud (Supabase) URL,
//!       and retention of the in-memory store.
//!     - SyncConfig: Local -> cloud replication cadence.
//!     - ApiConfig: Bind address and dashboard refresh.
//!     - ServicesConfig: systemd units reported by /service_status.
//!     - LoggingConfig / TunnelConfig.
//!
//! ==============================================================================

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct HubConfig {
    pub polling: PollingConfig,
    pub serial: SerialConfig,
    pub ethernet: EthernetConfig,
    pub modbus: ModbusConfig,
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
    pub tunnel: TunnelConfig,
    pub services: ServicesConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PollingConfig {
    pub interval_seconds: u64,
    /// pause after a failed cycle
    pub error_backoff_seconds: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self { interval_seconds: 10, error_backoff_seconds: 5 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SerialConfig {
    pub enabled: bool,
    /// fallback when auto-detection finds nothing
    pub port: String,
    pub baud_rate: u32,
    pub auto_detect: bool,
    pub timeout_ms: u64,
    /// boards reset when the port opens
    pub reset_delay_ms: u64,
    pub reconnect_attempts: u32,
    /// cap on lines drained per poll
    pub max_lines_per_poll: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            auto_detect: true,
            timeout_ms: 2000,
            reset_delay_ms: 2000,
            reconnect_attempts: 3,
            max_lines_per_poll: 64,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EthernetConfig {
    pub enabled: bool,
    /// known board addresses, probed first
    pub candidates: Vec<String>,
    /// optional /24 prefix (e.g. "192.168.0") swept .1 - .254
    pub subnet: Option<String>,
    pub port: u16,
    pub timeout_ms: u64,
    pub probe_endpoints: Vec<String>,
    pub max_concurrent_probes: usize,
}

impl Default for EthernetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            candidates: vec!["192.168.0.110".to_string(), "192.168.0.177".to_string()],
            subnet: None,
            port: 80,
            timeout_ms: 3000,
            probe_endpoints: ["/data", "/", "/sensor", "/status"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_concurrent_probes: 32,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ModbusConfig {
    pub enabled: bool,
    /// hosts probed for a modbus tcp server
    pub candidates: Vec<String>,
    /// optional /24 prefix swept like the ethernet one
    pub subnet: Option<String>,
    pub port: u16,
    pub timeout_ms: u64,
    /// unit ids tried in order during identification
    pub unit_ids: Vec<u8>,
    /// first holding register of each probed block
    pub probe_starts: Vec<u16>,
    /// registers read per block
    pub register_count: u16,
    pub max_concurrent_probes: usize,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            candidates: Vec::new(),
            subnet: None,
            port: 502,
            timeout_ms: 3000,
            unit_ids: vec![1, 2, 3],
            probe_starts: vec![0, 10000, 30000, 40000],
            register_count: 10,
            max_concurrent_probes: 32,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    /// local postgres; none = in-memory store
    pub url: Option<String>,
    /// hosted postgres (supabase) used as sync target
    pub cloud_url: Option<String>,
    /// in-memory store caps, oldest rows are dropped first
    pub memory_max_readings: usize,
    pub memory_max_events: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            cloud_url: None,
            memory_max_readings: 100_000,
            memory_max_events: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub batch_size: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { enabled: true, interval_seconds: 60, batch_size: 500 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub refresh_seconds: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8000, refresh_seconds: 10 }
    }
}

impl ApiConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub show_sensor_data: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), show_sensor_data: true }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TunnelConfig {
    /// toml file holding `[cloudflare] url = "https://..."`
    pub secrets_path: PathBuf,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self { secrets_path: PathBuf::from("secrets_tunnel.toml") }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ServicesConfig {
    /// systemd units whose state `/service_status` reports next to the hub's own
    pub systemd_units: Vec<String>,
}

impl HubConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

        let config: HubConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;

        Ok(config)
    }

    /// Load with default fallback
    ///
    /// an explicit path is tried alone; otherwise the usual locations are searched.
    pub fn load_or_default(explicit: Option<&Path>) -> Self {
        let paths = match explicit {
            Some(p) => vec![p.to_path_buf()],
            None => vec![
                PathBuf::from("config").join("hub.toml"),
                PathBuf::from("..").join("config").join("hub.toml"),
            ],
        };

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        println!("[CONFIG] Warning: Failed to load {}: {}", path.display(), e);
                    }
                }
            }
        }

        println!("[CONFIG] Warning: No config file found - using defaults");
        Self::default()
    }

    /// apply `.env`-style overrides
    ///
    /// `lookup` is `std::env::var(..).ok()` in production; tests pass a map.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("DATABASE_URL").filter(|s| !s.is_empty()) {
            self.database.url = Some(url);
        }
        if let Some(url) = lookup("CLOUD_DATABASE_URL").filter(|s| !s.is_empty()) {
            self.database.cloud_url = Some(url);
        }
        if let Some(port) = lookup("USB_PORT").filter(|s| !s.is_empty()) {
            self.serial.port = port;
        }
        if let Some(baud) = lookup("USB_BAUDRATE").and_then(|s| s.parse().ok()) {
            self.serial.baud_rate = baud;
        }
        if let Some(host) = lookup("API_HOST").filter(|s| !s.is_empty()) {
            self.api.host = host;
        }
        if let Some(port) = lookup("API_PORT").and_then(|s| s.parse().ok()) {
            self.api.port = port;
        }
        if let Some(level) = lookup("LOG_LEVEL").filter(|s| !s.is_empty()) {
            self.logging.level = level.to_lowercase();
        }
        if let Some(port) = lookup("MODBUS_PORT").and_then(|s| s.parse().ok()) {
            self.modbus.port = port;
        }
        // seconds, as the old .env had it
        if let Some(secs) = lookup("MODBUS_TIMEOUT").and_then(|s| s.parse::<u64>().ok()) {
            self.modbus.timeout_ms = secs * 1000;
        }
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        let on_off = |b: bool| if b { "on" } else { "off" };
        println!("┌─────────────────────────────────────────┐");
        println!("│            HUB CONFIGURATION            │");
        println!("├─────────────────────────────────────────┤");
        println!("│ Poll Interval: {}s", self.polling.interval_seconds);
        println!("│ USB: {} ({} @ {} baud)", on_off(self.serial.enabled), self.serial.port, self.serial.baud_rate);
        println!("│ Ethernet: {} ({} candidates, subnet {})",
            on_off(self.ethernet.enabled),
            self.ethernet.candidates.len(),
            self.ethernet.subnet.as_deref().unwrap_or("-"));
        println!("│ Modbus TCP: {} ({} candidates, port {})",
            on_off(self.modbus.enabled),
            self.modbus.candidates.len(),
            self.modbus.port);
        match &self.database.url {
            Some(_) => println!("│ Local DB: postgres"),
            None => println!("│ Local DB: in-memory (keeps {} readings)", self.database.memory_max_readings),
        }
        println!("│ Cloud Sync: {}", on_off(self.sync.enabled && self.database.cloud_url.is_some()));
        println!("│ API: http://{}", self.api.bind_addr());
        println!("│ Log Level: {}", self.logging.level);
        println!("└─────────────────────────────────────────┘");
    }
}
