//! ==============================================================================
//! acquisition.rs - data collection service
//! ==============================================================================
//!
//! purpose:
//!     one cycle reads every connected board (usb lines, ethernet `/data`,
//!     modbus holding registers), normalizes the frames and upserts the
//!     readings. the background loop
//!     repeats the cycle on a fixed interval until stopped.
//!
//! relationships:
//!     - uses: usb.rs, ethernet.rs, modbus.rs (transports), protocol.rs (normalization),
//!             store/ (persistence and the system event log)
//!     - used by: api.rs (collect / start / stop / scan endpoints), main.rs
//!
//! state:
//!     the service handle is cheap to clone. run state lives behind
//!     Arc<RwLock<AppState>>, shared between the loop and the web
//!     server. the usb session sits behind a std mutex because it is only
//!     touched from blocking tasks. the loop closes the usb link on its way
//!     out, so a cycle that was still running when `stop` came in cannot
//!     leave the board marked online.
//!
//! timing:
//!     a cycle that took `elapsed` sleeps `interval - elapsed` (never less
//!     than zero). a cycle that failed outright (storage down) backs off for
//!     `error_backoff_seconds` instead.
//!
//! ==============================================================================

use crate::config::HubConfig;
use crate::domain::{Device, DeviceKind, DeviceStatus, SensorReading};
use crate::ethernet::{EthernetBoard, EthernetClient};
use crate::modbus::{ModbusClient, ModbusDevice};
use crate::protocol::{self, Origin, USB_DEFAULT_DEVICE_ID};
use crate::store::Store;
use crate::usb::{self, UsbPoll, UsbSession};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

/// rediscover lan devices at most this often while none are known
const RESCAN_AFTER_SECONDS: i64 = 300;

fn scan_is_stale(last_scan: Option<DateTime<Utc>>) -> bool {
    last_scan.map_or(true, |t| (Utc::now() - t).num_seconds() >= RESCAN_AFTER_SECONDS)
}

/// `start` while a loop is running
#[derive(Debug)]
pub struct AlreadyRunning;

impl std::fmt::Display for AlreadyRunning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("acquisition already running")
    }
}

impl std::error::Error for AlreadyRunning {}

/// outcome of one collection cycle
#[derive(Clone, Debug, Serialize)]
pub struct CollectReport {
    pub timestamp: DateTime<Utc>,
    /// readings stored from usb
    pub usb: usize,
    /// readings stored from ethernet boards
    pub ethernet: usize,
    /// readings stored from modbus devices
    pub modbus: usize,
    pub errors: Vec<String>,
}

impl CollectReport {
    pub fn total(&self) -> usize {
        self.usb + self.ethernet + self.modbus
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ScanReport {
    pub usb_port: Option<String>,
    pub ethernet: Vec<EthernetBoard>,
    pub modbus: Vec<ModbusDevice>,
}

/// what `/status` shows
#[derive(Clone, Debug, Serialize)]
pub struct AcquisitionStatus {
    pub timestamp: DateTime<Utc>,
    pub running: bool,
    pub interval_seconds: u64,
    pub cycles: u64,
    pub usb_port: Option<String>,
    pub ethernet_boards: Vec<String>,
    pub modbus_devices: Vec<String>,
    /// "total" plus one count per device status
    pub devices: BTreeMap<String, usize>,
    pub last_data: Option<DateTime<Utc>>,
    /// errors of the last cycle
    pub errors: Vec<String>,
}

#[derive(Default)]
struct AppState {
    running: bool,
    interval_seconds: u64,
    cycles: u64,
    last_report: Option<CollectReport>,
    /// id registered for the usb board while its link is up
    usb_device: Option<String>,
    usb_port: Option<String>,
    boards: Vec<EthernetBoard>,
    last_scan: Option<DateTime<Utc>>,
    modbus: Vec<ModbusDevice>,
    last_modbus_scan: Option<DateTime<Utc>>,
    stop: Option<watch::Sender<bool>>,
}

#[derive(Clone)]
pub struct Acquisition {
    store: Store,
    config: Arc<HubConfig>,
    usb: Arc<Mutex<UsbSession>>,
    ethernet: Option<EthernetClient>,
    modbus: Option<ModbusClient>,
    state: Arc<RwLock<AppState>>,
}

impl Acquisition {
    pub fn new(store: Store, config: &HubConfig) -> Result<Self> {
        Self::with_usb(store, config, UsbSession::new(config.serial.clone()))
    }

    pub fn with_usb(store: Store, config: &HubConfig, usb: UsbSession) -> Result<Self> {
        let ethernet = if config.ethernet.enabled {
            Some(EthernetClient::new(config.ethernet.clone())?)
        } else {
            None
        };
        let modbus = config.modbus.enabled.then(|| ModbusClient::new(config.modbus.clone()));
        let state = AppState {
            interval_seconds: config.polling.interval_seconds,
            ..AppState::default()
        };

        Ok(Self {
            store,
            config: Arc::new(config.clone()),
            usb: Arc::new(Mutex::new(usb)),
            ethernet,
            modbus,
            state: Arc::new(RwLock::new(state)),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn status(&self) -> Result<AcquisitionStatus> {
        let devices = self.store.devices(None).await?;
        let mut counts = BTreeMap::from([
            ("total".to_string(), devices.len()),
            (DeviceStatus::Online.as_str().to_string(), 0),
            (DeviceStatus::Offline.as_str().to_string(), 0),
            (DeviceStatus::Error.as_str().to_string(), 0),
        ]);
        for d in &devices {
            *counts.entry(d.status.as_str().to_string()).or_default() += 1;
        }
        let last_data = self.store.latest_timestamp().await?;

        let st = self.state.read().await;
        Ok(AcquisitionStatus {
            timestamp: Utc::now(),
            running: st.running,
            interval_seconds: st.interval_seconds,
            cycles: st.cycles,
            usb_port: st.usb_port.clone(),
            ethernet_boards: st.boards.iter().map(|b| b.ip.clone()).collect(),
            modbus_devices: st.modbus.iter().map(|d| d.ip.clone()).collect(),
            devices: counts,
            last_data,
            errors: st.last_report.as_ref().map(|r| r.errors.clone()).unwrap_or_default(),
        })
    }

    // ==========================================================================
    // one cycle
    // ==========================================================================

    /// read every source once and store what came back
    ///
    /// source failures end up in `errors`; only storage failures are `Err`.
    pub async fn collect_once(&self) -> Result<CollectReport> {
        let now = Utc::now();
        let mut report = CollectReport {
            timestamp: now,
            usb: 0,
            ethernet: 0,
            modbus: 0,
            errors: Vec::new(),
        };

        if self.config.serial.enabled {
            match self.read_usb().await {
                Ok(poll) => report.usb = self.store_usb(poll, now).await?,
                Err(e) => {
                    warn!("usb: {e:#}");
                    report.errors.push(format!("usb: {e:#}"));
                    self.usb_lost().await?;
                }
            }
        }

        if let Some(client) = &self.ethernet {
            for board in self.ethernet_boards(client).await {
                match client.fetch(&board.ip).await {
                    Ok(frame) => report.ethernet += self.store_ethernet(&board, &frame, now).await?,
                    Err(e) => {
                        warn!("ethernet: {e:#}");
                        report.errors.push(format!("ethernet {}: {e:#}", board.ip));
                        self.ethernet_lost(&board).await?;
                    }
                }
            }
        }

        if let Some(client) = &self.modbus {
            for device in self.modbus_devices(client).await {
                match client.read(&device, now).await {
                    Ok(readings) => report.modbus += self.store_modbus(&device, &readings).await?,
                    Err(e) => {
                        warn!("modbus: {e:#}");
                        report.errors.push(format!("modbus {}: {e:#}", device.ip));
                        self.modbus_lost(&device).await?;
                    }
                }
            }
        }

        if !report.errors.is_empty() {
            self.store
                .log_event(
                    "acquisition_errors",
                    None,
                    &format!("{} source(s) failed", report.errors.len()),
                    Some(json!({ "errors": report.errors })),
                )
                .await?;
        }

        debug!(
            "acquisition: cycle stored {} readings (usb {}, ethernet {}, modbus {})",
            report.total(),
            report.usb,
            report.ethernet,
            report.modbus
        );

        let mut st = self.state.write().await;
        st.cycles += 1;
        st.last_report = Some(report.clone());
        Ok(report)
    }

    async fn read_usb(&self) -> Result<UsbPoll> {
        let session = self.usb.clone();
        tokio::task::spawn_blocking(move || {
            let mut session = session.lock().map_err(|_| anyhow!("usb session lock poisoned"))?;
            session.poll()
        })
        .await?
    }

    async fn store_usb(&self, poll: UsbPoll, now: DateTime<Utc>) -> Result<usize> {
        if let Some(info) = &poll.connected {
            let id = info.device_id.clone().unwrap_or_else(|| USB_DEFAULT_DEVICE_ID.to_string());
            let mut device = Device::new(id.clone(), DeviceKind::ArduinoUsb);
            device.name = Some("Arduino USB".to_string());
            device.metadata = json!({
                "port": info.port,
                "baud_rate": self.config.serial.baud_rate,
                "uptime": info.uptime,
            });
            self.store.register_device(&device).await?;
            self.store
                .log_event(
                    "device_connected",
                    Some(&id),
                    &format!("arduino connected on {}", info.port),
                    Some(device.metadata.clone()),
                )
                .await?;

            let mut st = self.state.write().await;
            st.usb_device = Some(id);
            st.usb_port = Some(info.port.clone());
        }

        let readings: Vec<SensorReading> = poll
            .lines
            .iter()
            .filter_map(|line| protocol::parse_frame(line))
            .inspect(|frame| {
                if !frame.has_readings() {
                    debug!("usb: {:?}", frame);
                }
            })
            .flat_map(|frame| protocol::normalize(&frame, &Origin::Usb, now))
            .collect();

        self.show("usb", &readings);
        self.store.upsert_readings(&readings).await
    }

    async fn usb_lost(&self) -> Result<()> {
        let lost = {
            let mut st = self.state.write().await;
            st.usb_port = None;
            st.usb_device.take()
        };
        if let Some(id) = lost {
            self.store.set_device_status(&id, DeviceStatus::Offline).await?;
            self.store
                .log_event("device_disconnected", Some(&id), "arduino usb connection lost", None)
                .await?;
        }
        Ok(())
    }

    /// known boards, rediscovering when none are known and the last scan is stale
    async fn ethernet_boards(&self, client: &EthernetClient) -> Vec<EthernetBoard> {
        let (boards, stale) = {
            let st = self.state.read().await;
            (st.boards.clone(), scan_is_stale(st.last_scan))
        };
        if boards.is_empty() && stale {
            self.discover_ethernet(client).await
        } else {
            boards
        }
    }

    async fn discover_ethernet(&self, client: &EthernetClient) -> Vec<EthernetBoard> {
        let boards = client.discover().await;
        let mut st = self.state.write().await;
        st.boards = boards.clone();
        st.last_scan = Some(Utc::now());
        boards
    }

    async fn store_ethernet(
        &self,
        board: &EthernetBoard,
        frame: &protocol::Frame,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let origin = Origin::Ethernet { ip: board.ip.clone() };
        let id = frame
            .device_id()
            .map(str::to_string)
            .unwrap_or_else(|| origin.default_device_id());

        self.store.register_device(&self.ethernet_device(id, board)).await?;

        let readings = protocol::normalize(frame, &origin, now);
        self.show("ethernet", &readings);
        self.store.upsert_readings(&readings).await
    }

    fn ethernet_device(&self, id: String, board: &EthernetBoard) -> Device {
        let mut device = Device::new(id, DeviceKind::ArduinoEthernet);
        device.name = Some(format!("Arduino Ethernet {}", board.ip));
        device.ip_address = Some(board.ip.clone());
        device.port = Some(self.config.ethernet.port);
        device.metadata = json!({ "endpoint": board.endpoint });
        device
    }

    /// drop the board so the next scan can find it again
    async fn ethernet_lost(&self, board: &EthernetBoard) -> Result<()> {
        self.state.write().await.boards.retain(|b| b.ip != board.ip);
        let id = board
            .device_id
            .clone()
            .unwrap_or_else(|| Origin::Ethernet { ip: board.ip.clone() }.default_device_id());
        self.store.set_device_status(&id, DeviceStatus::Offline).await?;
        Ok(())
    }

    /// known modbus devices, same rescan rule as ethernet
    async fn modbus_devices(&self, client: &ModbusClient) -> Vec<ModbusDevice> {
        let (devices, stale) = {
            let st = self.state.read().await;
            (st.modbus.clone(), scan_is_stale(st.last_modbus_scan))
        };
        if devices.is_empty() && stale {
            self.discover_modbus(client).await
        } else {
            devices
        }
    }

    async fn discover_modbus(&self, client: &ModbusClient) -> Vec<ModbusDevice> {
        let devices = client.discover().await;
        let mut st = self.state.write().await;
        st.modbus = devices.clone();
        st.last_modbus_scan = Some(Utc::now());
        devices
    }

    async fn store_modbus(&self, device: &ModbusDevice, readings: &[SensorReading]) -> Result<usize> {
        self.store.register_device(&self.modbus_device(device)).await?;
        self.show("modbus", readings);
        self.store.upsert_readings(readings).await
    }

    fn modbus_device(&self, device: &ModbusDevice) -> Device {
        let mut registered = Device::new(device.device_id.clone(), DeviceKind::ModbusTcp);
        registered.name = Some(format!("Modbus TCP {}", device.ip));
        registered.ip_address = Some(device.ip.clone());
        registered.port = Some(self.config.modbus.port);
        let registers: Vec<_> = device
            .blocks
            .iter()
            .map(|b| json!({ "type": "holding", "start": b.start, "count": b.count }))
            .collect();
        registered.metadata = json!({
            "protocol": "modbus_tcp",
            "unit_id": device.unit_id,
            "registers": registers,
        });
        registered
    }

    /// a device that stopped answering is flagged `error` until a rescan finds it
    async fn modbus_lost(&self, device: &ModbusDevice) -> Result<()> {
        self.state.write().await.modbus.retain(|d| d.ip != device.ip);
        self.store.set_device_status(&device.device_id, DeviceStatus::Error).await?;
        Ok(())
    }

    fn show(&self, source: &str, readings: &[SensorReading]) {
        if !self.config.logging.show_sensor_data {
            return;
        }
        for r in readings {
            info!("[{source}] {} {} = {}{}", r.device_id, r.sensor_type, r.value, r.unit);
        }
    }

    // ==========================================================================
    // background loop
    // ==========================================================================

    /// spawn the collection loop; fails with [`AlreadyRunning`] if one is up
    pub async fn start(&self, interval_seconds: u64) -> Result<()> {
        let interval = interval_seconds.max(1);
        let stop = {
            let mut st = self.state.write().await;
            if st.running {
                return Err(AlreadyRunning.into());
            }
            let (tx, rx) = watch::channel(false);
            st.running = true;
            st.interval_seconds = interval;
            st.stop = Some(tx);
            rx
        };

        let this = self.clone();
        tokio::spawn(async move { this.run_loop(interval, stop).await });
        info!("acquisition: started ({interval}s interval)");

        if let Err(e) = self
            .store
            .log_event(
                "acquisition_started",
                None,
                &format!("acquisition started ({interval}s interval)"),
                Some(json!({ "interval_seconds": interval })),
            )
            .await
        {
            warn!("acquisition: could not log start: {e:#}");
        }
        Ok(())
    }

    async fn run_loop(self, interval: u64, mut stop: watch::Receiver<bool>) {
        let period = Duration::from_secs(interval);
        let backoff = Duration::from_secs(self.config.polling.error_backoff_seconds);

        loop {
            let started = Instant::now();
            let wait = match self.collect_once().await {
                Ok(_) => period.saturating_sub(started.elapsed()),
                Err(e) => {
                    error!("acquisition: cycle failed: {e:#}");
                    backoff
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *stop.borrow() {
                break;
            }
        }
        info!("acquisition: loop stopped");

        // the last cycle may have reconnected after stop() released the link
        if !self.state.read().await.running {
            if let Err(e) = self.release_usb().await {
                warn!("acquisition: usb cleanup failed: {e:#}");
            }
        }
    }

    /// close the usb link and mark its board offline
    async fn release_usb(&self) -> Result<()> {
        let session = self.usb.clone();
        tokio::task::spawn_blocking(move || {
            if let Ok(mut session) = session.lock() {
                session.close();
            }
        })
        .await?;

        let released = {
            let mut st = self.state.write().await;
            st.usb_port = None;
            st.usb_device.take()
        };
        if let Some(id) = released {
            self.store.set_device_status(&id, DeviceStatus::Offline).await?;
        }
        Ok(())
    }

    /// stop the loop and close the usb link; false if it was not running
    pub async fn stop(&self) -> Result<bool> {
        let stop = {
            let mut st = self.state.write().await;
            st.running = false;
            st.stop.take()
        };
        let Some(stop) = stop else {
            return Ok(false);
        };
        let _ = stop.send(true);
        self.release_usb().await?;

        self.store
            .log_event("acquisition_stopped", None, "acquisition stopped", None)
            .await?;
        info!("acquisition: stopped");
        Ok(true)
    }

    // ==========================================================================
    // discovery
    // ==========================================================================

    /// look for boards on usb and on the lan, registering what answers
    pub async fn scan(&self) -> Result<ScanReport> {
        let usb_port = if self.config.serial.enabled {
            let current = self.state.read().await.usb_port.clone();
            match current {
                Some(port) => Some(port),
                None => {
                    let cfg = self.config.serial.clone();
                    tokio::task::spawn_blocking(move || usb::detect_port(&cfg)).await?
                }
            }
        } else {
            None
        };

        let ethernet = match &self.ethernet {
            Some(client) => self.discover_ethernet(client).await,
            None => Vec::new(),
        };
        for board in &ethernet {
            let id = board
                .device_id
                .clone()
                .unwrap_or_else(|| Origin::Ethernet { ip: board.ip.clone() }.default_device_id());
            self.store.register_device(&self.ethernet_device(id.clone(), board)).await?;
            self.store
                .log_event(
                    "device_connected",
                    Some(&id),
                    &format!("arduino ethernet found at {}", board.ip),
                    Some(json!({ "ip_address": board.ip, "endpoint": board.endpoint })),
                )
                .await?;
        }

        let modbus = match &self.modbus {
            Some(client) => self.discover_modbus(client).await,
            None => Vec::new(),
        };
        for device in &modbus {
            self.store.register_device(&self.modbus_device(device)).await?;
            self.store
                .log_event(
                    "device_connected",
                    Some(&device.device_id),
                    &format!("modbus device found at {}", device.ip),
                    Some(json!({ "ip_address": device.ip, "unit_id": device.unit_id })),
                )
                .await?;
        }

        let report = ScanReport { usb_port, ethernet, modbus };
        self.store
            .log_event(
                "network_scan",
                None,
                &format!(
                    "scan found {} ethernet board(s), {} modbus device(s), usb {}",
                    report.ethernet.len(),
                    report.modbus.len(),
                    report.usb_port.as_deref().unwrap_or("none")
                ),
                serde_json::to_value(&report).ok(),
            )
            .await?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ReadingQuery;
    use crate::modbus::testing::fake_server;
    use crate::usb::testing::{Script, ScriptedConnector};
    use axum::{http::StatusCode, routing::get, Router};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    const FRAME: &str = r#"{"message_type":"sensor_data","sensors":{"temperature_1":22.5,"temperature_avg":22.5,"humidity":40,"light":-1}}"#;

    async fn fake_board() -> u16 {
        let app = Router::new().route("/data", get(|| async { FRAME }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        port
    }

    fn config(ethernet_port: Option<u16>) -> HubConfig {
        let mut config = HubConfig::default();
        config.serial.enabled = false;
        config.logging.show_sensor_data = false;
        match ethernet_port {
            Some(port) => {
                config.ethernet.candidates = vec!["127.0.0.1".to_string()];
                config.ethernet.port = port;
                config.ethernet.timeout_ms = 1000;
            }
            None => config.ethernet.enabled = false,
        }
        config
    }

    #[tokio::test]
    async fn collects_from_ethernet_board() {
        let port = fake_board().await;
        let store = Store::memory();
        let acq = Acquisition::new(store.clone(), &config(Some(port))).unwrap();

        let report = acq.collect_once().await.unwrap();
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        // avg and the -1 sentinel are dropped
        assert_eq!(report.ethernet, 2);

        let device = store.device("arduino_ethernet_127_0_0_1").await.unwrap().unwrap();
        assert_eq!(device.device_type, DeviceKind::ArduinoEthernet);
        assert_eq!(device.ip_address.as_deref(), Some("127.0.0.1"));

        let readings = store
            .readings(&ReadingQuery::from_params(None, None, None, None, 100))
            .await
            .unwrap();
        assert!(readings.iter().all(|r| r.raw_data["source"] == "ethernet"));

        let status = acq.status().await.unwrap();
        assert_eq!(status.cycles, 1);
        assert_eq!(status.ethernet_boards, vec!["127.0.0.1".to_string()]);
        assert_eq!(status.devices["total"], 1);
        assert_eq!(status.devices["online"], 1);
        assert!(status.last_data.is_some());
    }

    #[tokio::test]
    async fn usb_failure_is_reported_not_fatal() {
        let mut cfg = config(None);
        cfg.serial.enabled = true;
        cfg.serial.auto_detect = false;
        cfg.serial.port = "/dev/arduino-hub-test-missing".to_string();
        cfg.serial.reset_delay_ms = 0;
        cfg.serial.reconnect_attempts = 1;

        let store = Store::memory();
        let acq = Acquisition::new(store.clone(), &cfg).unwrap();
        let report = acq.collect_once().await.unwrap();

        assert_eq!(report.total(), 0);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("usb"));
        assert_eq!(store.events(10).await.unwrap()[0].event_type, "acquisition_errors");
    }

    #[tokio::test]
    async fn start_twice_fails_and_stop_logs() {
        let store = Store::memory();
        let acq = Acquisition::new(store.clone(), &config(None)).unwrap();

        acq.start(60).await.unwrap();
        let err = acq.start(60).await.unwrap_err();
        assert!(err.is::<AlreadyRunning>());
        assert!(acq.status().await.unwrap().running);

        assert!(acq.stop().await.unwrap());
        assert!(!acq.stop().await.unwrap());
        assert!(!acq.status().await.unwrap().running);

        let kinds: Vec<String> = store.events(10).await.unwrap().into_iter().map(|e| e.event_type).collect();
        assert_eq!(kinds, vec!["acquisition_stopped", "acquisition_started"]);
    }

    #[tokio::test]
    async fn scan_registers_boards() {
        let port = fake_board().await;
        let store = Store::memory();
        let acq = Acquisition::new(store.clone(), &config(Some(port))).unwrap();

        let report = acq.scan().await.unwrap();
        assert_eq!(report.ethernet.len(), 1);
        assert!(report.usb_port.is_none());
        assert_eq!(store.devices(None).await.unwrap().len(), 1);
        let kinds: Vec<String> = store.events(10).await.unwrap().into_iter().map(|e| e.event_type).collect();
        assert_eq!(kinds, vec!["network_scan", "device_connected"]);
    }

    /// serves FRAME while `up` is set, 500 otherwise
    async fn flaky_board(up: Arc<AtomicBool>) -> u16 {
        let app = Router::new().route(
            "/data",
            get(move || {
                let up = up.clone();
                async move {
                    if up.load(Ordering::SeqCst) {
                        (StatusCode::OK, FRAME)
                    } else {
                        (StatusCode::INTERNAL_SERVER_ERROR, "down")
                    }
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        port
    }

    #[tokio::test]
    async fn lost_board_goes_offline_until_rescan() {
        let up = Arc::new(AtomicBool::new(true));
        let port = flaky_board(up.clone()).await;
        let store = Store::memory();
        let acq = Acquisition::new(store.clone(), &config(Some(port))).unwrap();
        let id = "arduino_ethernet_127_0_0_1";

        assert_eq!(acq.collect_once().await.unwrap().ethernet, 2);

        up.store(false, Ordering::SeqCst);
        let report = acq.collect_once().await.unwrap();
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("ethernet 127.0.0.1"));
        assert!(acq.status().await.unwrap().ethernet_boards.is_empty());
        assert_eq!(store.device(id).await.unwrap().unwrap().status, DeviceStatus::Offline);

        // back up, but the last scan is recent
        up.store(true, Ordering::SeqCst);
        let report = acq.collect_once().await.unwrap();
        assert_eq!(report.total(), 0);
        assert!(report.errors.is_empty());
        assert_eq!(store.device(id).await.unwrap().unwrap().status, DeviceStatus::Offline);

        acq.state.write().await.last_scan =
            Some(Utc::now() - chrono::Duration::seconds(RESCAN_AFTER_SECONDS + 1));
        let report = acq.collect_once().await.unwrap();
        assert_eq!(report.ethernet, 2);
        assert_eq!(acq.status().await.unwrap().ethernet_boards, vec!["127.0.0.1".to_string()]);
        assert_eq!(store.device(id).await.unwrap().unwrap().status, DeviceStatus::Online);
    }

    fn usb_config() -> HubConfig {
        let mut cfg = config(None);
        cfg.serial.enabled = true;
        cfg.serial.reconnect_attempts = 1;
        cfg
    }

    #[tokio::test]
    async fn loop_exit_releases_usb_reopened_by_last_cycle() {
        let script: Script = VecDeque::from([Ok(vec!["humidity:40"])]);
        let (connector, attempts) = ScriptedConnector::new(0, script);
        let session = UsbSession::with_connector(usb_config().serial, Box::new(connector));
        let store = Store::memory();
        let acq = Acquisition::with_usb(store.clone(), &usb_config(), session).unwrap();

        // stop() already ran; the loop still finishes the cycle it was in
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        acq.clone().run_loop(60, rx).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        let status = acq.status().await.unwrap();
        assert!(status.usb_port.is_none());
        assert_eq!(status.cycles, 1);
        let device = store.device("arduino_usb_001").await.unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Offline);

        // the link was closed, so the next cycle reconnects
        let report = acq.collect_once().await.unwrap();
        assert_eq!(report.usb, 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(acq.status().await.unwrap().usb_port.as_deref(), Some("/dev/ttyTEST0"));
        let device = store.device("arduino_usb_001").await.unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
    }

    #[tokio::test]
    async fn stop_marks_usb_board_offline() {
        let (connector, _) = ScriptedConnector::new(0, Script::new());
        let session = UsbSession::with_connector(usb_config().serial, Box::new(connector));
        let store = Store::memory();
        let acq = Acquisition::with_usb(store.clone(), &usb_config(), session).unwrap();

        acq.start(3600).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while acq.status().await.unwrap().usb_port.is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert!(acq.stop().await.unwrap());
        assert!(acq.status().await.unwrap().usb_port.is_none());
        let device = store.device("arduino_usb_001").await.unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Offline);
    }

    fn modbus_config(port: u16) -> HubConfig {
        let mut cfg = config(None);
        cfg.modbus.enabled = true;
        cfg.modbus.candidates = vec!["127.0.0.1".to_string()];
        cfg.modbus.port = port;
        cfg.modbus.timeout_ms = 1000;
        cfg.modbus.unit_ids = vec![1];
        cfg.modbus.probe_starts = vec![40000];
        cfg.modbus.register_count = 2;
        cfg
    }

    #[tokio::test]
    async fn collects_modbus_registers() {
        let port = fake_server().await;
        let store = Store::memory();
        let acq = Acquisition::new(store.clone(), &modbus_config(port)).unwrap();

        let report = acq.collect_once().await.unwrap();
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.modbus, 2);
        assert_eq!(report.total(), 2);

        let device = store.device("modbus_tcp_127_0_0_1").await.unwrap().unwrap();
        assert_eq!(device.device_type, DeviceKind::ModbusTcp);
        assert_eq!(device.port, Some(port));
        assert_eq!(device.metadata["unit_id"], 1);
        assert_eq!(device.metadata["registers"][0]["start"], 40000);

        let readings = store
            .readings(&ReadingQuery::from_params(None, None, None, None, 100))
            .await
            .unwrap();
        let mut values: Vec<(String, f64)> = readings.into_iter().map(|r| (r.sensor_type, r.value)).collect();
        values.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            values,
            vec![
                ("modbus_register_40000".to_string(), 100.0),
                ("modbus_register_40001".to_string(), 101.0),
            ]
        );
        assert_eq!(acq.status().await.unwrap().modbus_devices, vec!["127.0.0.1".to_string()]);

        let scan = acq.scan().await.unwrap();
        assert_eq!(scan.modbus.len(), 1);
        assert!(scan.ethernet.is_empty());
    }
}
