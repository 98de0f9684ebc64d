//! ==============================================================================
//! usb.rs - arduino over usb serial
//! ==============================================================================
//!
//! purpose:
//!     finds the board on the usb bus, opens it and reads the line-delimited
//!     json it prints. everything here is BLOCKING; callers run it through
//!     `tokio::task::spawn_blocking` (see acquisition.rs).
//!
//! detection:
//!     a port is a candidate when it reports the official arduino usb vendor
//!     id (0x2341), when its product string mentions "arduino" / "uno", or when
//!     its device name looks like a cdc-acm port (/dev/ttyACM*). candidates
//!     are probed with `STATUS\n`; the configured port is the last resort.
//!
//! reconnection:
//!     `UsbSession` owns at most one open link. an i/o error drops the link,
//!     and the next poll tries to reconnect a bounded number of times.
//!     links come from a `Connector`; `SerialConnector` talks to real ports,
//!     tests plug in a scripted one.
//!
//! ==============================================================================

use crate::config::SerialConfig;
use crate::protocol;

use anyhow::{anyhow, Context, Result};
use serialport::{ClearBuffer, SerialPort, SerialPortType};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const ARDUINO_VID: u16 = 0x2341;

/// replies read while probing a port
const PROBE_REPLY_LINES: usize = 3;

/// does this port look like one of our boards?
pub fn is_arduino_candidate(port_name: &str, vid: Option<u16>, description: &str) -> bool {
    let description = description.to_lowercase();
    vid == Some(ARDUINO_VID)
        || description.contains("arduino")
        || description.contains("uno")
        || port_name.to_lowercase().contains("acm")
}

/// enumerate serial ports that may carry an arduino
pub fn list_candidates() -> Vec<String> {
    let ports = match serialport::available_ports() {
        Ok(ports) => ports,
        Err(e) => {
            warn!("usb: cannot enumerate serial ports: {e}");
            return Vec::new();
        }
    };

    ports
        .into_iter()
        .filter(|p| {
            let (vid, description) = match &p.port_type {
                SerialPortType::UsbPort(info) => (
                    Some(info.vid),
                    format!(
                        "{} {}",
                        info.manufacturer.as_deref().unwrap_or(""),
                        info.product.as_deref().unwrap_or("")
                    ),
                ),
                _ => (None, String::new()),
            };
            let hit = is_arduino_candidate(&p.port_name, vid, &description);
            if hit {
                debug!("usb: candidate {} ({})", p.port_name, description.trim());
            }
            hit
        })
        .map(|p| p.port_name)
        .collect()
}

/// open `port`, send `STATUS` and check the reply
pub fn probe(port: &str, cfg: &SerialConfig) -> bool {
    let mut link = match UsbLink::open(port, cfg) {
        Ok(link) => link,
        Err(e) => {
            debug!("usb: {port} not available: {e:#}");
            return false;
        }
    };

    if let Err(e) = link.write_line("STATUS") {
        debug!("usb: {port} write failed: {e}");
        return false;
    }

    for _ in 0..PROBE_REPLY_LINES {
        match link.lines.read_line() {
            Ok(Some(line)) if !line.is_empty() => {
                debug!("usb: {port} replied {line}");
                if protocol::is_status_ack(&line) {
                    return true;
                }
            }
            Ok(_) => {}
            Err(e) => {
                debug!("usb: {port} read failed: {e}");
                return false;
            }
        }
    }
    false
}

/// first port that answers like an arduino, falling back to the configured one
pub fn detect_port(cfg: &SerialConfig) -> Option<String> {
    info!("usb: detecting arduino port...");
    if cfg.auto_detect {
        for port in list_candidates() {
            if probe(&port, cfg) {
                info!("usb: arduino answering on {port}");
                return Some(port);
            }
        }
    }
    if probe(&cfg.port, cfg) {
        info!("usb: arduino answering on configured port {}", cfg.port);
        return Some(cfg.port.clone());
    }
    None
}

// ==============================================================================
// line reader
// ==============================================================================

/// newline framing on top of a reader with read timeouts
///
/// a line cut by a timeout is kept and completed on the next call.
pub struct LineReader<R> {
    inner: BufReader<R>,
    pending: Vec<u8>,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner: BufReader::new(inner), pending: Vec::new() }
    }

    /// `Ok(None)` when no complete line arrived before the timeout
    pub fn read_line(&mut self) -> io::Result<Option<String>> {
        match self.inner.read_until(b'\n', &mut self.pending) {
            Ok(_) if self.pending.ends_with(b"\n") => {
                let line = String::from_utf8_lossy(&self.pending).trim().to_string();
                self.pending.clear();
                Ok(Some(line))
            }
            Ok(_) => Ok(None),
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn has_buffered(&self) -> bool {
        !self.inner.buffer().is_empty()
    }

    pub fn get_ref(&self) -> &R {
        self.inner.get_ref()
    }

    pub fn get_mut(&mut self) -> &mut R {
        self.inner.get_mut()
    }
}

// ==============================================================================
// link
// ==============================================================================

pub struct UsbLink {
    port_name: String,
    lines: LineReader<Box<dyn SerialPort>>,
}

impl UsbLink {
    /// open the port and wait out the board reset
    pub fn open(port_name: &str, cfg: &SerialConfig) -> Result<Self> {
        let port = serialport::new(port_name, cfg.baud_rate)
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .open()
            .with_context(|| format!("failed to open serial port {port_name}"))?;

        // opening the port toggles DTR, the board reboots
        std::thread::sleep(Duration::from_millis(cfg.reset_delay_ms));
        port.clear(ClearBuffer::All)
            .with_context(|| format!("failed to clear {port_name}"))?;

        Ok(Self { port_name: port_name.to_string(), lines: LineReader::new(port) })
    }

    fn write_line(&mut self, command: &str) -> io::Result<()> {
        let port = self.lines.get_mut();
        port.write_all(format!("{command}\n").as_bytes())?;
        port.flush()
    }

    /// send a command and wait for its json reply
    ///
    /// non-json replies come back as `{"raw_response": "..."}`.
    pub fn send_command(&mut self, command: &str) -> Result<Option<serde_json::Value>> {
        self.write_line(command)
            .with_context(|| format!("failed to send {command} to {}", self.port_name))?;
        debug!("usb: sent {command}");

        for _ in 0..PROBE_REPLY_LINES {
            let Some(line) = self.lines.read_line()? else { continue };
            if line.is_empty() {
                continue;
            }
            let reply = serde_json::from_str::<serde_json::Value>(&line)
                .unwrap_or_else(|_| serde_json::json!({ "raw_response": line }));
            // sensor frames may interleave with the reply
            if reply.get("message_type").and_then(|m| m.as_str()) == Some("sensor_data") {
                continue;
            }
            return Ok(Some(reply));
        }
        warn!("usb: no reply to {command}");
        Ok(None)
    }
}

/// an open source of lines
pub trait Link: Send {
    fn port_name(&self) -> &str;

    /// drain complete lines already waiting, never blocks on an idle port
    fn read_available(&mut self, max_lines: usize) -> Result<Vec<String>>;
}

impl Link for UsbLink {
    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn read_available(&mut self, max_lines: usize) -> Result<Vec<String>> {
        let mut out = Vec::new();
        while out.len() < max_lines {
            let waiting = self
                .lines
                .get_ref()
                .bytes_to_read()
                .with_context(|| format!("lost {}", self.port_name))?;
            if waiting == 0 && !self.lines.has_buffered() {
                break;
            }
            match self.lines.read_line()? {
                Some(line) if !line.is_empty() => out.push(line),
                Some(_) => {}
                None => break,
            }
        }
        Ok(out)
    }
}

// ==============================================================================
// session
// ==============================================================================

/// what we learned while (re)connecting
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectInfo {
    pub port: String,
    pub device_id: Option<String>,
    pub uptime: Option<serde_json::Value>,
}

/// lines read in one poll, plus connection news for the caller to record
#[derive(Debug, Default)]
pub struct UsbPoll {
    pub lines: Vec<String>,
    pub connected: Option<ConnectInfo>,
}

/// opens links for a session
pub trait Connector: Send {
    fn connect(&mut self, cfg: &SerialConfig) -> Result<(Box<dyn Link>, ConnectInfo)>;
}

/// detects the board on the serial bus and asks it for `STATUS`
pub struct SerialConnector;

impl Connector for SerialConnector {
    fn connect(&mut self, cfg: &SerialConfig) -> Result<(Box<dyn Link>, ConnectInfo)> {
        let port = if cfg.auto_detect {
            detect_port(cfg).ok_or_else(|| anyhow!("no arduino found on any serial port"))?
        } else {
            cfg.port.clone()
        };

        let mut link = UsbLink::open(&port, cfg)?;
        let status = link.send_command("STATUS").unwrap_or_else(|e| {
            warn!("usb: STATUS failed on {port}: {e:#}");
            None
        });

        let info = ConnectInfo {
            port: link.port_name().to_string(),
            device_id: status
                .as_ref()
                .and_then(|s| s.get("device_id"))
                .and_then(|d| d.as_str())
                .map(str::to_string),
            uptime: status.as_ref().and_then(|s| s.get("uptime")).cloned(),
        };
        Ok((Box::new(link), info))
    }
}

pub struct UsbSession {
    cfg: SerialConfig,
    connector: Box<dyn Connector>,
    link: Option<Box<dyn Link>>,
}

impl UsbSession {
    pub fn new(cfg: SerialConfig) -> Self {
        Self::with_connector(cfg, Box::new(SerialConnector))
    }

    pub fn with_connector(cfg: SerialConfig, connector: Box<dyn Connector>) -> Self {
        Self { cfg, connector, link: None }
    }

    /// detect, open and identify the board
    pub fn connect(&mut self) -> Result<ConnectInfo> {
        self.link = None;
        let (link, info) = self.connector.connect(&self.cfg)?;
        info!("usb: connected on {}", info.port);
        self.link = Some(link);
        Ok(info)
    }

    /// read pending lines, reconnecting first if needed
    pub fn poll(&mut self) -> Result<UsbPoll> {
        let mut result = UsbPoll::default();

        if self.link.is_none() {
            warn!("usb: link down, reconnecting");
            let attempts = self.cfg.reconnect_attempts.max(1);
            let mut last_err = None;
            for attempt in 1..=attempts {
                match self.connect() {
                    Ok(info) => {
                        result.connected = Some(info);
                        last_err = None;
                        break;
                    }
                    Err(e) => {
                        debug!("usb: reconnect attempt {attempt}/{attempts} failed: {e:#}");
                        last_err = Some(e);
                    }
                }
            }
            if let Some(e) = last_err {
                return Err(e.context("arduino usb not reachable"));
            }
        }

        let max_lines = self.cfg.max_lines_per_poll;
        let Some(link) = self.link.as_mut() else {
            return Err(anyhow!("arduino usb not connected"));
        };
        match link.read_available(max_lines) {
            Ok(lines) => {
                result.lines = lines;
                Ok(result)
            }
            Err(e) => {
                // next poll reconnects
                self.link = None;
                Err(e.context("serial read failed"))
            }
        }
    }

    pub fn close(&mut self) {
        if let Some(link) = self.link.take() {
            info!("usb: closed {}", link.port_name());
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{Script, ScriptedConnector};
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::Ordering;

    fn session(cfg_attempts: u32, connector: ScriptedConnector) -> UsbSession {
        let cfg = SerialConfig { reconnect_attempts: cfg_attempts, ..SerialConfig::default() };
        UsbSession::with_connector(cfg, Box::new(connector))
    }

    /// reader that replays chunks, with `None` standing for a read timeout
    struct Scripted(VecDeque<Option<&'static [u8]>>);

    impl Read for Scripted {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(Some(chunk)) => {
                    buf[..chunk.len()].copy_from_slice(chunk);
                    Ok(chunk.len())
                }
                Some(None) => Err(io::Error::new(io::ErrorKind::TimedOut, "timeout")),
                None => Err(io::Error::new(io::ErrorKind::TimedOut, "idle")),
            }
        }
    }

    #[test]
    fn candidate_rules() {
        assert!(is_arduino_candidate("/dev/ttyUSB3", Some(ARDUINO_VID), ""));
        assert!(is_arduino_candidate("COM4", None, "Arduino Uno (COM4)"));
        assert!(is_arduino_candidate("/dev/ttyACM0", Some(0x1a86), "USB2.0-Serial"));
        assert!(!is_arduino_candidate("/dev/ttyS0", None, ""));
    }

    #[test]
    fn lines_survive_timeouts() {
        let mut reader = LineReader::new(Scripted(VecDeque::from([
            Some(&b"{\"status\":"[..]),
            None,
            Some(&b"\"ok\"}\r\n{\"a\""[..]),
            Some(&b":1}\n"[..]),
        ])));

        assert_eq!(reader.read_line().unwrap(), None);
        assert_eq!(reader.read_line().unwrap().as_deref(), Some("{\"status\":\"ok\"}"));
        assert_eq!(reader.read_line().unwrap().as_deref(), Some("{\"a\":1}"));
        assert_eq!(reader.read_line().unwrap(), None);
    }

    #[test]
    fn hard_errors_propagate() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged"))
            }
        }
        let mut reader = LineReader::new(Broken);
        assert_eq!(reader.read_line().unwrap_err().kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn reconnect_gives_up_after_configured_attempts() {
        let (connector, attempts) = ScriptedConnector::new(u32::MAX, Script::new());
        let mut usb = session(3, connector);

        let err = usb.poll().unwrap_err();
        assert!(format!("{err:#}").contains("not reachable"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);

        // every poll gets a fresh budget
        assert!(usb.poll().is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn reconnect_succeeds_within_budget() {
        let script: Script = VecDeque::from([Ok(vec!["{\"sensors\":{\"humidity\":40}}"])]);
        let (connector, attempts) = ScriptedConnector::new(2, script);
        let mut usb = session(3, connector);

        let poll = usb.poll().unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(poll.connected.unwrap().device_id.as_deref(), Some("arduino_usb_001"));
        assert_eq!(poll.lines.len(), 1);

        // link is up, no reconnect news
        let poll = usb.poll().unwrap();
        assert!(poll.connected.is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn read_error_drops_the_link() {
        let script: Script = VecDeque::from([Ok(vec!["a:1"]), Err("unplugged")]);
        let (connector, attempts) = ScriptedConnector::new(0, script);
        let mut usb = session(1, connector);

        assert_eq!(usb.poll().unwrap().lines, vec!["a:1".to_string()]);
        let err = usb.poll().unwrap_err();
        assert!(format!("{err:#}").contains("unplugged"));

        // the next poll opens a new link
        let poll = usb.poll().unwrap();
        assert!(poll.connected.is_some());
        assert_eq!(poll.lines, vec!["a:1".to_string()]);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        usb.close();
        assert!(usb.poll().unwrap().connected.is_some());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
