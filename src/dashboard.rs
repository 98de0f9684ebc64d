//! ==============================================================================
//! dashboard.rs - html dashboard
//! ==============================================================================
//!
//! purpose:
//!     renders the single page served on `GET /`. the first paint carries
//!     the stats and devices known at request time; after that the page polls
//!     `/api/stats`, `/devices` and `/data` with fetch() and redraws itself.
//!
//!     charts use chart.js from a cdn, one line per (device, sensor) pair,
//!     one chart per sensor family (temperature, humidity, light, ...).
//!
//! ==============================================================================

use crate::domain::{Device, HubStats};

const PAGE: &str = r##"<!doctype html>
<html lang="en">
<head>
<meta charset="utf-8">
<meta name="viewport" content="width=device-width, initial-scale=1">
<title>Arduino Hub</title>
<script src="https://cdn.jsdelivr.net/npm/chart.js@4"></script>
<style>
  body { font-family: system-ui, sans-serif; margin: 0; padding: 1.5rem; background: #1a1a2e; color: #eee; }
  h1 { margin: 0 0 1rem; font-size: 1.4rem; }
  h2 { font-size: 1.05rem; color: #9ad; margin: 1.5rem 0 .5rem; }
  .cards { display: grid; grid-template-columns: repeat(auto-fit, minmax(180px, 1fr)); gap: 1rem; }
  .card { background: #16213e; border-radius: 8px; padding: 1rem; }
  .card .label { color: #888; font-size: .8rem; text-transform: uppercase; }
  .card .value { font-size: 1.6rem; margin-top: .3rem; }
  table { width: 100%; border-collapse: collapse; background: #16213e; border-radius: 8px; overflow: hidden; }
  th, td { text-align: left; padding: .45rem .7rem; border-bottom: 1px solid #22304f; font-size: .9rem; }
  th { color: #9ad; }
  .online { color: #6bcf7f; } .offline { color: #ff6b6b; } .error { color: #ffb86b; }
  .charts { display: grid; grid-template-columns: repeat(auto-fit, minmax(420px, 1fr)); gap: 1rem; }
  .chart { background: #16213e; border-radius: 8px; padding: 1rem; }
  footer { color: #666; font-size: .8rem; margin-top: 1.5rem; }
</style>
</head>
<body>
<h1>Arduino Hub</h1>

<div class="cards">
  <div class="card"><div class="label">Devices</div><div class="value" id="total-devices">__TOTAL_DEVICES__</div></div>
  <div class="card"><div class="label">Online</div><div class="value" id="online-devices">__ONLINE_DEVICES__</div></div>
  <div class="card"><div class="label">Readings</div><div class="value" id="total-readings">__TOTAL_READINGS__</div></div>
  <div class="card"><div class="label">Last reading</div><div class="value" id="last-reading" style="font-size:1rem">__LAST_READING__</div></div>
</div>

<h2>Devices</h2>
<table>
  <thead><tr><th>Device</th><th>Type</th><th>Address</th><th>Status</th><th>Last seen</th></tr></thead>
  <tbody id="devices">__DEVICE_ROWS__</tbody>
</table>

<h2>Trends</h2>
<div class="charts" id="charts"></div>

<h2>Latest readings</h2>
<table>
  <thead><tr><th>Time</th><th>Device</th><th>Sensor</th><th>Value</th></tr></thead>
  <tbody id="readings"></tbody>
</table>

<footer>refreshing every __REFRESH_SECONDS__s &middot; <span id="updated"></span></footer>

<script>
const REFRESH_MS = __REFRESH_SECONDS__ * 1000;
const charts = {};

function esc(s) {
  return String(s ?? "").replace(/[&<>"]/g, c => ({"&": "&amp;", "<": "&lt;", ">": "&gt;", '"': "&quot;"}[c]));
}

function when(ts) {
  return ts ? new Date(ts).toLocaleString() : "-";
}

function family(sensor) {
  return sensor.replace(/_\d+$/, "");
}

async function getJson(url) {
  const res = await fetch(url);
  if (!res.ok) throw new Error(url + " -> " + res.status);
  return res.json();
}

function drawStats(s) {
  document.getElementById("total-devices").textContent = s.total_devices;
  document.getElementById("online-devices").textContent = s.online_devices;
  document.getElementById("total-readings").textContent = s.total_readings;
  document.getElementById("last-reading").textContent = when(s.last_reading);
}

function drawDevices(devices) {
  document.getElementById("devices").innerHTML = devices.map(d =>
    `<tr><td>${esc(d.name || d.device_id)}</td><td>${esc(d.device_type)}</td>` +
    `<td>${esc(d.ip_address || "-")}</td><td class="${esc(d.status)}">${esc(d.status)}</td>` +
    `<td>${esc(when(d.last_seen))}</td></tr>`).join("");
}

function drawReadings(rows) {
  document.getElementById("readings").innerHTML = rows.slice(0, 25).map(r =>
    `<tr><td>${esc(when(r.timestamp))}</td><td>${esc(r.device_id)}</td>` +
    `<td>${esc(r.sensor_type)}</td><td>${esc(r.value)} ${esc(r.unit)}</td></tr>`).join("");
}

function drawCharts(rows) {
  const groups = {};
  for (const r of rows.slice().reverse()) {
    const fam = family(r.sensor_type);
    const series = r.device_id + " / " + r.sensor_type;
    groups[fam] ??= {};
    groups[fam][series] ??= [];
    groups[fam][series].push({x: new Date(r.timestamp).toLocaleTimeString(), y: r.value});
  }

  const container = document.getElementById("charts");
  for (const [fam, series] of Object.entries(groups)) {
    const datasets = Object.entries(series).map(([label, data]) => ({label, data, tension: .25, pointRadius: 0}));
    if (charts[fam]) {
      charts[fam].data.datasets = datasets;
      charts[fam].update("none");
      continue;
    }
    const box = document.createElement("div");
    box.className = "chart";
    box.innerHTML = `<canvas id="chart-${esc(fam)}"></canvas>`;
    container.appendChild(box);
    charts[fam] = new Chart(box.querySelector("canvas"), {
      type: "line",
      data: {datasets},
      options: {
        parsing: {xAxisKey: "x", yAxisKey: "y"},
        plugins: {title: {display: true, text: fam, color: "#eee"}, legend: {labels: {color: "#ccc"}}},
        scales: {x: {type: "category", ticks: {color: "#888", maxTicksLimit: 8}}, y: {ticks: {color: "#888"}}},
      },
    });
  }
}

async function refresh() {
  try {
    const [stats, devices, data] = await Promise.all([
      getJson("/api/stats"), getJson("/devices"), getJson("/data?hours=6&limit=2000"),
    ]);
    drawStats(stats.data);
    drawDevices(devices.data || []);
    drawReadings(data.data || []);
    drawCharts(data.data || []);
    document.getElementById("updated").textContent = "updated " + new Date().toLocaleTimeString();
  } catch (e) {
    document.getElementById("updated").textContent = "refresh failed: " + e.message;
  }
}

refresh();
setInterval(refresh, REFRESH_MS);
</script>
</body>
</html>
"##;

/// escape html special characters to prevent xss
pub fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn device_rows(devices: &[Device]) -> String {
    devices
        .iter()
        .map(|d| {
            let status = d.status.as_str();
            format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td class=\"{status}\">{status}</td><td>{}</td></tr>",
                html_escape(d.name.as_deref().unwrap_or(&d.device_id)),
                d.device_type.as_str(),
                html_escape(d.ip_address.as_deref().unwrap_or("-")),
                d.last_seen.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string()).unwrap_or_else(|| "-".into()),
            )
        })
        .collect()
}

pub fn render(stats: &HubStats, devices: &[Device], refresh_seconds: u64) -> String {
    PAGE.replace("__TOTAL_DEVICES__", &stats.total_devices.to_string())
        .replace("__ONLINE_DEVICES__", &stats.online_devices.to_string())
        .replace("__TOTAL_READINGS__", &stats.total_readings.to_string())
        .replace(
            "__LAST_READING__",
            &stats
                .last_reading
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "-".into()),
        )
        .replace("__REFRESH_SECONDS__", &refresh_seconds.max(1).to_string())
        .replace("__DEVICE_ROWS__", &device_rows(devices))
}

/// page shown when the store cannot be read
pub fn render_error(message: &str) -> String {
    format!(
        r#"<!doctype html>
<html>
<head><title>error</title></head>
<body style="font-family: system-ui; padding: 2rem; background: #1a1a2e; color: #eee;">
    <h1 style="color: #ff6b6b;">dashboard error</h1>
    <p>failed to load hub data:</p>
    <pre style="background: #16213e; padding: 1rem; border-radius: 8px; overflow-x: auto;">{}</pre>
    <p style="color: #888;">check the database connection and the hub logs</p>
</body>
</html>"#,
        html_escape(message)
    )
}
