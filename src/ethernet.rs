//! ==============================================================================
//! ethernet.rs - arduino boards with an ethernet shield
//! ==============================================================================
//!
//! purpose:
//!     discovers boards on the lan and pulls their readings over http.
//!     a board serves its latest frame as json on `GET /data`.
//!
//! discovery:
//!     the configured candidate addresses are probed first, then (if a subnet
//!     is configured) every host .1 - .254. probes run concurrently, bounded
//!     by a semaphore. a host counts as a board when
//!     - `/data` answers 200 with a sensor frame, or
//!     - any probe endpoint answers 200 with "arduino" in the body.
//!
//! relationships:
//!     - uses: protocol.rs (frame parsing)
//!     - used by: acquisition.rs, modbus.rs (address sweep)
//!
//! ==============================================================================

use crate::config::EthernetConfig;
use crate::protocol::{self, Frame};

use anyhow::{anyhow, Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// a board that answered a probe
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct EthernetBoard {
    pub ip: String,
    pub endpoint: String,
    pub device_id: Option<String>,
}

/// every address worth probing, configured candidates first, no duplicates
pub fn candidates(cfg: &EthernetConfig) -> Vec<String> {
    sweep(&cfg.candidates, cfg.subnet.as_deref())
}

/// `known` followed by `prefix.1 ..= prefix.254`, no duplicates
pub fn sweep(known: &[String], subnet: Option<&str>) -> Vec<String> {
    let mut seen = HashSet::new();
    let swept = subnet.into_iter().flat_map(|prefix| {
        let prefix = prefix.trim_end_matches('.').to_string();
        (1..=254).map(move |host| format!("{prefix}.{host}"))
    });

    known
        .iter()
        .cloned()
        .chain(swept)
        .filter(|ip| seen.insert(ip.clone()))
        .collect()
}

/// does a 200 response from `endpoint` look like one of our boards?
pub fn looks_like_arduino(endpoint: &str, body: &str) -> bool {
    let carries_frame = endpoint == "/data"
        && matches!(
            protocol::parse_frame(body),
            Some(Frame::SensorData { .. } | Frame::Single { .. })
        );
    carries_frame || body.to_lowercase().contains("arduino")
}

#[derive(Clone)]
pub struct EthernetClient {
    http: reqwest::Client,
    cfg: EthernetConfig,
}

impl EthernetClient {
    pub fn new(cfg: EthernetConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .context("failed to build http client")?;
        Ok(Self { http, cfg })
    }

    fn url(&self, ip: &str, path: &str) -> String {
        format!("http://{}:{}{}", ip, self.cfg.port, path)
    }

    async fn get_text(&self, ip: &str, path: &str) -> Result<String> {
        let response = self.http.get(self.url(ip, path)).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("{ip}{path} answered {}", response.status()));
        }
        Ok(response.text().await?)
    }

    /// try each probe endpoint in order, first match wins
    pub async fn probe(&self, ip: &str) -> Option<EthernetBoard> {
        for endpoint in &self.cfg.probe_endpoints {
            let body = match self.get_text(ip, endpoint).await {
                Ok(body) => body,
                Err(e) => {
                    debug!("ethernet: {ip}{endpoint}: {e}");
                    continue;
                }
            };
            if looks_like_arduino(endpoint, &body) {
                let device_id = protocol::parse_frame(&body)
                    .and_then(|f| f.device_id().map(str::to_string));
                return Some(EthernetBoard {
                    ip: ip.to_string(),
                    endpoint: endpoint.clone(),
                    device_id,
                });
            }
        }
        None
    }

    /// sweep all candidates, sorted by address
    pub async fn discover(&self) -> Vec<EthernetBoard> {
        let ips = candidates(&self.cfg);
        info!("ethernet: scanning {} addresses", ips.len());

        let permits = Arc::new(Semaphore::new(self.cfg.max_concurrent_probes.max(1)));
        let mut probes = JoinSet::new();
        for ip in ips {
            let client = self.clone();
            let permits = permits.clone();
            probes.spawn(async move {
                let _permit = permits.acquire_owned().await.ok()?;
                client.probe(&ip).await
            });
        }

        let mut found = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok(Some(board)) => {
                    info!("ethernet: arduino found at {} ({})", board.ip, board.endpoint);
                    found.push(board);
                }
                Ok(None) => {}
                Err(e) => debug!("ethernet: probe task failed: {e}"),
            }
        }

        found.sort_by_key(|b| {
            b.ip.parse::<std::net::Ipv4Addr>()
                .map(u32::from)
                .unwrap_or(u32::MAX)
        });
        found
    }

    /// latest frame served on `/data`
    pub async fn fetch(&self, ip: &str) -> Result<Frame> {
        let body = self
            .get_text(ip, "/data")
            .await
            .with_context(|| format!("ethernet board {ip} unreachable"))?;
        protocol::parse_frame(&body)
            .or_else(|| body.lines().find_map(protocol::parse_frame))
            .ok_or_else(|| anyhow!("ethernet board {ip} sent no readable frame"))
    }
}
