//! ==============================================================================
//! modbus.rs - modbus tcp devices
//! ==============================================================================
//!
//! purpose:
//!     finds modbus tcp servers on the lan and reads their holding registers.
//!     every register becomes one reading, `modbus_register_<address>`, with
//!     the raw 16-bit value and no unit.
//!
//! identification:
//!     a host counts as a device when it accepts a tcp connection on the
//!     modbus port and answers a holding-register read for one of the
//!     configured unit ids. probe blocks are tried in order; the first block
//!     that answers is what later cycles read.
//!
//! relationships:
//!     - uses: ethernet.rs (address sweep)
//!     - used by: acquisition.rs
//!
//! ==============================================================================

use crate::config::ModbusConfig;
use crate::domain::{modbus_device_id, SensorReading};
use crate::ethernet;

use anyhow::{anyhow, bail, Context as _, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_modbus::client::{tcp, Context, Reader};
use tokio_modbus::slave::{Slave, SlaveContext};
use tracing::{debug, info};

/// a readable range of holding registers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterBlock {
    pub start: u16,
    pub count: u16,
}

/// a host that answered a register read
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ModbusDevice {
    pub ip: String,
    pub device_id: String,
    pub unit_id: u8,
    pub blocks: Vec<RegisterBlock>,
}

/// one reading per register of `block`
pub fn readings_from_registers(
    device: &ModbusDevice,
    block: RegisterBlock,
    values: &[u16],
    now: DateTime<Utc>,
) -> Vec<SensorReading> {
    values
        .iter()
        .enumerate()
        .map(|(i, value)| {
            let address = u32::from(block.start) + i as u32;
            SensorReading {
                device_id: device.device_id.clone(),
                sensor_type: format!("modbus_register_{address}"),
                value: f64::from(*value),
                unit: String::new(),
                raw_data: json!({
                    "source": "modbus",
                    "ip_address": device.ip,
                    "unit_id": device.unit_id,
                    "register_type": "holding",
                    "register_address": address,
                }),
                timestamp: now,
            }
        })
        .collect()
}

#[derive(Clone)]
pub struct ModbusClient {
    cfg: ModbusConfig,
}

impl ModbusClient {
    pub fn new(cfg: ModbusConfig) -> Self {
        Self { cfg }
    }

    pub fn port(&self) -> u16 {
        self.cfg.port
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.cfg.timeout_ms)
    }

    async fn connect(&self, ip: &str, unit_id: u8) -> Result<Context> {
        let addr: SocketAddr = format!("{ip}:{}", self.cfg.port)
            .parse()
            .with_context(|| format!("invalid modbus host {ip}"))?;
        tokio::time::timeout(self.timeout(), tcp::connect_slave(addr, Slave(unit_id)))
            .await
            .map_err(|_| anyhow!("connect to {addr} timed out"))?
            .with_context(|| format!("no modbus server at {addr}"))
    }

    async fn read_block(&self, ctx: &mut Context, block: RegisterBlock) -> Result<Vec<u16>> {
        let reply = tokio::time::timeout(self.timeout(), ctx.read_holding_registers(block.start, block.count))
            .await
            .map_err(|_| anyhow!("read of {} registers at {} timed out", block.count, block.start))?;
        match reply {
            Ok(Ok(values)) => Ok(values),
            Ok(Err(code)) => bail!("register {} refused: {code:?}", block.start),
            Err(e) => bail!("register {} read failed: {e}", block.start),
        }
    }

    /// first unit id and probe block that answer, if any
    pub async fn identify(&self, ip: &str) -> Option<ModbusDevice> {
        let first_unit = *self.cfg.unit_ids.first()?;
        let mut ctx = match self.connect(ip, first_unit).await {
            Ok(ctx) => ctx,
            Err(e) => {
                debug!("modbus: {ip}: {e:#}");
                return None;
            }
        };

        for &unit_id in &self.cfg.unit_ids {
            ctx.set_slave(Slave(unit_id));
            for &start in &self.cfg.probe_starts {
                let block = RegisterBlock { start, count: self.cfg.register_count };
                match self.read_block(&mut ctx, block).await {
                    Ok(_) => {
                        info!(
                            "modbus: {ip} unit {unit_id} answers registers {}-{}",
                            start,
                            (u32::from(start) + u32::from(block.count)).saturating_sub(1)
                        );
                        return Some(ModbusDevice {
                            ip: ip.to_string(),
                            device_id: modbus_device_id(ip),
                            unit_id,
                            blocks: vec![block],
                        });
                    }
                    Err(e) => debug!("modbus: {ip} unit {unit_id}: {e:#}"),
                }
            }
        }
        None
    }

    /// identify every candidate host, sorted by address
    pub async fn discover(&self) -> Vec<ModbusDevice> {
        let ips = ethernet::sweep(&self.cfg.candidates, self.cfg.subnet.as_deref());
        if ips.is_empty() {
            return Vec::new();
        }
        info!("modbus: scanning {} addresses", ips.len());

        let permits = Arc::new(Semaphore::new(self.cfg.max_concurrent_probes.max(1)));
        let mut probes = JoinSet::new();
        for ip in ips {
            let client = self.clone();
            let permits = permits.clone();
            probes.spawn(async move {
                let _permit = permits.acquire_owned().await.ok()?;
                client.identify(&ip).await
            });
        }

        let mut found = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(Some(device)) => found.push(device),
                Ok(None) => {}
                Err(e) => debug!("modbus: probe task failed: {e}"),
            }
        }
        found.sort_by_key(|d| {
            d.ip.parse::<std::net::Ipv4Addr>()
                .map(u32::from)
                .unwrap_or(u32::MAX)
        });
        found
    }

    /// read every known block of `device`
    ///
    /// a block that fails is skipped; the call fails only when nothing came back.
    pub async fn read(&self, device: &ModbusDevice, now: DateTime<Utc>) -> Result<Vec<SensorReading>> {
        let mut ctx = self.connect(&device.ip, device.unit_id).await?;
        let mut readings = Vec::new();
        let mut last_err = None;

        for &block in &device.blocks {
            match self.read_block(&mut ctx, block).await {
                Ok(values) => readings.extend(readings_from_registers(device, block, &values, now)),
                Err(e) => {
                    debug!("modbus: {}: {e:#}", device.device_id);
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) if readings.is_empty() => Err(e.context(format!("modbus device {} unreadable", device.ip))),
            _ => Ok(readings),
        }
    }
}

/// in-process modbus tcp server for tests
#[cfg(test)]
pub(crate) mod testing {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// unit 1 serves holding registers 40000.. as `100 + offset`; anything
    /// else gets "illegal data address"
    pub async fn fake_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut req = [0u8; 12];
                    while socket.read_exact(&mut req).await.is_ok() {
                        let unit = req[6];
                        let function = req[7];
                        let start = u16::from_be_bytes([req[8], req[9]]);
                        let count = u16::from_be_bytes([req[10], req[11]]);

                        let pdu: Vec<u8> = if unit == 1 && function == 0x03 && start >= 40000 {
                            let mut pdu = vec![0x03, (count * 2) as u8];
                            for i in 0..count {
                                pdu.extend_from_slice(&(100 + start - 40000 + i).to_be_bytes());
                            }
                            pdu
                        } else {
                            vec![function | 0x80, 0x02]
                        };

                        let mut reply = vec![req[0], req[1], 0, 0];
                        reply.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
                        reply.push(unit);
                        reply.extend_from_slice(&pdu);
                        if socket.write_all(&reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(port: u16) -> ModbusConfig {
        ModbusConfig {
            enabled: true,
            candidates: vec!["127.0.0.1".to_string()],
            port,
            timeout_ms: 1000,
            unit_ids: vec![2, 1],
            probe_starts: vec![0, 40000],
            register_count: 3,
            ..ModbusConfig::default()
        }
    }

    #[test]
    fn one_reading_per_register() {
        let device = ModbusDevice {
            ip: "10.0.0.5".to_string(),
            device_id: modbus_device_id("10.0.0.5"),
            unit_id: 1,
            blocks: Vec::new(),
        };
        let now = Utc::now();
        let block = RegisterBlock { start: 65535, count: 2 };
        let readings = readings_from_registers(&device, block, &[7, 65535], now);

        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].sensor_type, "modbus_register_65535");
        // addresses past u16::MAX do not wrap
        assert_eq!(readings[1].sensor_type, "modbus_register_65536");
        assert_eq!(readings[1].value, 65535.0);
        assert_eq!(readings[0].unit, "");
        assert_eq!(readings[0].raw_data["source"], "modbus");
        assert_eq!(readings[0].raw_data["register_address"], 65535);
        assert_eq!(readings[0].device_id, "modbus_tcp_10_0_0_5");
    }

    #[tokio::test]
    async fn discover_then_read_registers() {
        let port = testing::fake_server().await;
        let client = ModbusClient::new(cfg(port));

        let devices = client.discover().await;
        assert_eq!(devices.len(), 1);
        let device = &devices[0];
        assert_eq!(device.unit_id, 1);
        assert_eq!(device.blocks, vec![RegisterBlock { start: 40000, count: 3 }]);

        let readings = client.read(device, Utc::now()).await.unwrap();
        let values: Vec<(String, f64)> = readings.iter().map(|r| (r.sensor_type.clone(), r.value)).collect();
        assert_eq!(
            values,
            vec![
                ("modbus_register_40000".to_string(), 100.0),
                ("modbus_register_40001".to_string(), 101.0),
                ("modbus_register_40002".to_string(), 102.0),
            ]
        );
    }

    #[tokio::test]
    async fn closed_port_is_not_a_device() {
        let client = ModbusClient::new(cfg(9));
        assert!(client.identify("127.0.0.1").await.is_none());

        let device = ModbusDevice {
            ip: "127.0.0.1".to_string(),
            device_id: modbus_device_id("127.0.0.1"),
            unit_id: 1,
            blocks: vec![RegisterBlock { start: 40000, count: 1 }],
        };
        assert!(client.read(&device, Utc::now()).await.is_err());
    }

    #[tokio::test]
    async fn refused_blocks_fail_the_read() {
        let port = testing::fake_server().await;
        let client = ModbusClient::new(cfg(port));
        let device = ModbusDevice {
            ip: "127.0.0.1".to_string(),
            device_id: modbus_device_id("127.0.0.1"),
            unit_id: 1,
            blocks: vec![RegisterBlock { start: 0, count: 2 }],
        };
        assert!(client.read(&device, Utc::now()).await.is_err());
    }
}
