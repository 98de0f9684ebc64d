//! ==============================================================================
//! api.rs - REST api and dashboard server
//! ==============================================================================
//!
//! purpose:
//!     exposes the store and the acquisition service over http (axum).
//!     json responses share one envelope:
//!
//!         { "success": true, "message": "...", "data": ..., "timestamp": "..." }
//!
//!     `/health`, `/status`, `/service_status` and `/cf_url` answer with their
//!     own shapes.
//!
//! routes:
//!     GET  /                       dashboard (html)
//!     GET  /health                 store reachability + host memory/uptime
//!     GET  /status                 acquisition status
//!     GET  /service_status         traffic light per service
//!     GET  /devices                ?status=online|offline|error
//!     POST /devices                register a device
//!     GET  /devices/:device_id     device + 10 latest readings
//!     GET  /data                   ?device_id&limit&hours&days
//!     POST /data                   ingest one reading
//!     GET  /data/:device_id        ?limit&hours&days
//!     POST /data/collect           run one collection cycle now
//!     POST /acquisition/start      ?interval=N
//!     POST /acquisition/stop
//!     POST /scan/network           discovery in the background
//!     GET  /logs/system            ?limit=50
//!     GET  /api/stats
//!     GET  /cf_url                 public tunnel url
//!
//! ==============================================================================

use crate::acquisition::{Acquisition, AlreadyRunning};
use crate::config::HubConfig;
use crate::dashboard;
use crate::domain::{Device, DeviceKind, DeviceStatus, ReadingQuery, SensorReading};
use crate::protocol;
use crate::services;
use crate::store::Store;
use crate::sync::SyncMonitor;

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use sysinfo::System;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

const DEVICE_RECENT_READINGS: i64 = 10;
const DEFAULT_DATA_LIMIT: i64 = 200;
const DEFAULT_DEVICE_DATA_LIMIT: i64 = 100;
const DEFAULT_START_INTERVAL: u64 = 10;
const DEFAULT_LOG_LIMIT: i64 = 50;
const MAX_LOG_LIMIT: i64 = 1000;

// ==============================================================================
// shared state
// ==============================================================================

#[derive(Clone)]
pub struct ApiState {
    pub store: Store,
    pub acquisition: Acquisition,
    pub sync: SyncMonitor,
    pub config: Arc<HubConfig>,
}

impl ApiState {
    pub fn new(acquisition: Acquisition, sync: SyncMonitor, config: &HubConfig) -> Self {
        Self {
            store: acquisition.store().clone(),
            acquisition,
            sync,
            config: Arc::new(config.clone()),
        }
    }
}

// ==============================================================================
// responses
// ==============================================================================

#[derive(Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    pub timestamp: DateTime<Utc>,
}

fn ok<T: Serialize>(message: impl Into<String>, data: T) -> Json<Envelope<T>> {
    Json(Envelope { success: true, message: message.into(), data: Some(data), timestamp: Utc::now() })
}

fn done(message: impl Into<String>) -> Json<Envelope<()>> {
    Json(Envelope { success: true, message: message.into(), data: None, timestamp: Utc::now() })
}

/// error answered as `{"success": false, "message": ...}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        error!("api: {e:#}");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "success": false,
            "message": self.message,
            "timestamp": Utc::now(),
        }));
        (self.status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ==============================================================================
// server
// ==============================================================================

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(dashboard_handler))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/service_status", get(service_status))
        .route("/devices", get(list_devices).post(register_device))
        .route("/devices/:device_id", get(device_details))
        .route("/data", get(latest_data).post(ingest_reading))
        .route("/data/collect", post(collect_now))
        .route("/data/:device_id", get(device_data))
        .route("/acquisition/start", post(start_acquisition))
        .route("/acquisition/stop", post(stop_acquisition))
        .route("/scan/network", post(scan_network))
        .route("/logs/system", get(system_logs))
        .route("/api/stats", get(stats))
        .route("/cf_url", get(cf_url))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve(state: ApiState) -> Result<()> {
    let addr = state.config.api.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("api: listening on http://{addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ==============================================================================
// handlers
// ==============================================================================

async fn dashboard_handler(State(state): State<ApiState>) -> Html<String> {
    let stats = state.store.stats().await;
    let devices = state.store.devices(None).await;
    match (stats, devices) {
        (Ok(stats), Ok(devices)) => Html(dashboard::render(&stats, &devices, state.config.api.refresh_seconds)),
        (Err(e), _) | (_, Err(e)) => {
            error!("dashboard: {e:#}");
            Html(dashboard::render_error(&format!("{e:#}")))
        }
    }
}

async fn health(State(state): State<ApiState>) -> Response {
    let devices = match state.store.ping().await {
        Ok(()) => state.store.devices(None).await,
        Err(e) => Err(e),
    };
    let devices = match devices {
        Ok(devices) => devices,
        Err(e) => {
            return ApiError::new(StatusCode::SERVICE_UNAVAILABLE, format!("store unreachable: {e:#}"))
                .into_response();
        }
    };

    let mut sys = System::new();
    sys.refresh_memory();

    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now(),
        "database": state.store.backend(),
        "devices_count": devices.len(),
        "memory": {
            "used_bytes": sys.used_memory(),
            "total_bytes": sys.total_memory(),
        },
        "uptime_seconds": System::uptime(),
    }))
    .into_response()
}

async fn status(State(state): State<ApiState>) -> ApiResult<Json<crate::acquisition::AcquisitionStatus>> {
    Ok(Json(state.acquisition.status().await?))
}

async fn service_status(State(state): State<ApiState>) -> Json<Value> {
    let services =
        services::service_status(&state.acquisition, &state.sync, &state.config.services.systemd_units).await;
    Json(json!({ "success": true, "services": services, "timestamp": Utc::now() }))
}

#[derive(Deserialize)]
struct DeviceFilter {
    status: Option<String>,
}

async fn list_devices(
    State(state): State<ApiState>,
    Query(filter): Query<DeviceFilter>,
) -> ApiResult<Json<Envelope<Vec<Device>>>> {
    let status = filter.status.as_deref().filter(|s| !s.is_empty()).map(DeviceStatus::parse);
    let devices = state.store.devices(status).await?;
    Ok(ok(format!("{} devices found", devices.len()), devices))
}

#[derive(Deserialize)]
struct DeviceRequest {
    device_id: Option<String>,
    device_type: Option<String>,
    name: Option<String>,
    ip_address: Option<String>,
    port: Option<u16>,
    status: Option<String>,
    metadata: Option<Value>,
}

async fn register_device(
    State(state): State<ApiState>,
    Json(req): Json<DeviceRequest>,
) -> ApiResult<Json<Envelope<Device>>> {
    let device_id = req
        .device_id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::bad_request("device_id is required"))?;

    let mut device = Device::new(
        device_id.clone(),
        req.device_type.as_deref().map(DeviceKind::parse).unwrap_or_default(),
    );
    device.name = req.name;
    device.ip_address = req.ip_address;
    device.port = req.port;
    if let Some(status) = req.status.as_deref() {
        device.status = DeviceStatus::parse(status);
    }
    device.metadata = req.metadata.unwrap_or(Value::Null);

    state.store.register_device(&device).await?;
    state
        .store
        .log_event("device_registered", Some(&device_id), "device registered through the api", None)
        .await?;

    let stored = state.store.device(&device_id).await?.unwrap_or(device);
    Ok(ok(format!("device {device_id} registered"), stored))
}

async fn device_details(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
) -> ApiResult<Json<Envelope<Value>>> {
    let device = state
        .store
        .device(&device_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("device {device_id} not found")))?;

    let query = ReadingQuery::from_params(
        Some(device_id.clone()),
        Some(DEVICE_RECENT_READINGS),
        None,
        None,
        DEVICE_RECENT_READINGS,
    );
    let recent = state.store.readings(&query).await?;

    Ok(ok(
        format!("details for device {device_id}"),
        json!({ "device": device, "recent_data": recent }),
    ))
}

#[derive(Deserialize)]
struct DataParams {
    device_id: Option<String>,
    limit: Option<i64>,
    hours: Option<f64>,
    days: Option<i64>,
}

/// "last 200 records", "last 6 hours", ...
fn describe(query: &ReadingQuery, hours: Option<f64>, days: Option<i64>) -> String {
    match (hours, days) {
        (Some(h), _) => format!("last {h} hours"),
        (None, Some(d)) => format!("last {d} days"),
        (None, None) => format!("last {} records", query.limit),
    }
}

async fn latest_data(
    State(state): State<ApiState>,
    Query(p): Query<DataParams>,
) -> ApiResult<Json<Envelope<Vec<SensorReading>>>> {
    let query = ReadingQuery::from_params(p.device_id, p.limit, p.hours, p.days, DEFAULT_DATA_LIMIT);
    let data = state.store.readings(&query).await?;

    let mut message = format!("recent data ({})", describe(&query, p.hours, p.days));
    if let Some(id) = &query.device_id {
        message.push_str(&format!(" for {id}"));
    }
    Ok(ok(message, data))
}

#[derive(Deserialize)]
struct WindowParams {
    limit: Option<i64>,
    hours: Option<f64>,
    days: Option<i64>,
}

async fn device_data(
    State(state): State<ApiState>,
    Path(device_id): Path<String>,
    Query(p): Query<WindowParams>,
) -> ApiResult<Json<Envelope<Vec<SensorReading>>>> {
    let query = ReadingQuery::from_params(
        Some(device_id.clone()),
        p.limit,
        p.hours,
        p.days,
        DEFAULT_DEVICE_DATA_LIMIT,
    );
    let data = state.store.readings(&query).await?;
    Ok(ok(
        format!("history of {device_id} ({})", describe(&query, p.hours, p.days)),
        data,
    ))
}

#[derive(Deserialize)]
struct ReadingRequest {
    device_id: Option<String>,
    sensor_type: Option<String>,
    value: Option<f64>,
    unit: Option<String>,
    raw_data: Option<Value>,
    timestamp: Option<DateTime<Utc>>,
}

async fn ingest_reading(
    State(state): State<ApiState>,
    Json(req): Json<ReadingRequest>,
) -> ApiResult<Json<Envelope<SensorReading>>> {
    let non_empty = |s: Option<String>| s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    let (Some(device_id), Some(sensor_type), Some(value)) =
        (non_empty(req.device_id), non_empty(req.sensor_type), req.value.filter(|v| v.is_finite()))
    else {
        return Err(ApiError::bad_request("missing required fields: device_id, sensor_type, value"));
    };

    let sensor_type = sensor_type.to_lowercase();
    let reading = SensorReading {
        unit: req.unit.unwrap_or_else(|| protocol::infer_unit(&sensor_type).to_string()),
        device_id,
        sensor_type,
        value,
        raw_data: req.raw_data.unwrap_or_else(|| json!({ "source": "api" })),
        timestamp: req.timestamp.unwrap_or_else(Utc::now),
    };
    state.store.upsert_readings(std::slice::from_ref(&reading)).await?;
    Ok(ok("reading stored", reading))
}

async fn collect_now(
    State(state): State<ApiState>,
) -> ApiResult<Json<Envelope<crate::acquisition::CollectReport>>> {
    let report = state.acquisition.collect_once().await?;
    Ok(ok(format!("collected {} readings", report.total()), report))
}

#[derive(Deserialize)]
struct StartParams {
    interval: Option<u64>,
}

async fn start_acquisition(
    State(state): State<ApiState>,
    Query(p): Query<StartParams>,
) -> ApiResult<Json<Envelope<()>>> {
    let interval = p.interval.unwrap_or(DEFAULT_START_INTERVAL);
    match state.acquisition.start(interval).await {
        Ok(()) => {}
        Err(e) if e.is::<AlreadyRunning>() => return Err(ApiError::new(StatusCode::CONFLICT, e.to_string())),
        Err(e) => return Err(e.into()),
    }
    Ok(done(format!("acquisition started with a {interval}s interval")))
}

async fn stop_acquisition(State(state): State<ApiState>) -> ApiResult<Json<Envelope<()>>> {
    Ok(done(if state.acquisition.stop().await? {
        "acquisition stopped"
    } else {
        "acquisition was not running"
    }))
}

async fn scan_network(State(state): State<ApiState>) -> Json<Envelope<()>> {
    let acquisition = state.acquisition.clone();
    tokio::spawn(async move {
        info!("scan: started in background");
        match acquisition.scan().await {
            Ok(report) => info!(
                "scan: finished, {} ethernet board(s), {} modbus device(s)",
                report.ethernet.len(),
                report.modbus.len()
            ),
            Err(e) => error!("scan: {e:#}"),
        }
    });
    done("network scan started in background")
}

#[derive(Deserialize)]
struct LogParams {
    limit: Option<i64>,
}

async fn system_logs(
    State(state): State<ApiState>,
    Query(p): Query<LogParams>,
) -> ApiResult<Json<Envelope<Vec<crate::domain::SystemEvent>>>> {
    let limit = p.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
    let events = state.store.events(limit).await?;
    Ok(ok(format!("last {limit} system events"), events))
}

async fn stats(State(state): State<ApiState>) -> ApiResult<Json<Envelope<crate::domain::HubStats>>> {
    Ok(ok("hub statistics", state.store.stats().await?))
}

/// `[cloudflare] url` from the tunnel secrets file
async fn read_tunnel_url(path: &std::path::Path) -> std::result::Result<String, String> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let doc: toml::Value = toml::from_str(&content).map_err(|e| format!("invalid {}: {e}", path.display()))?;
    doc.get("cloudflare")
        .and_then(|c| c.get("url"))
        .and_then(|u| u.as_str())
        .filter(|u| !u.is_empty())
        .map(str::to_string)
        .ok_or_else(|| format!("no [cloudflare] url in {}", path.display()))
}

async fn cf_url(State(state): State<ApiState>) -> Json<Value> {
    match read_tunnel_url(&state.config.tunnel.secrets_path).await {
        Ok(url) => Json(json!({ "success": true, "cf_url": url })),
        Err(e) => Json(json!({ "success": false, "cf_url": null, "error": e })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    fn state() -> ApiState {
        let mut config = HubConfig::default();
        config.serial.enabled = false;
        config.ethernet.enabled = false;
        config.logging.show_sensor_data = false;
        config.tunnel.secrets_path = std::env::temp_dir().join("arduino-hub-no-such-tunnel.toml");
        let acquisition = Acquisition::new(Store::memory(), &config).unwrap();
        ApiState::new(acquisition, SyncMonitor::new(), &config)
    }

    async fn call(state: &ApiState, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let res = router(state.clone()).oneshot(req.body(body).unwrap()).await.unwrap();
        let status = res.status();
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn ingest_then_query() {
        let state = state();
        let (code, body) = call(
            &state,
            Method::POST,
            "/data",
            Some(json!({"device_id": "arduino_usb", "sensor_type": "Temperature_1", "value": 23.4})),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["data"]["unit"], "°C");
        assert_eq!(body["data"]["sensor_type"], "temperature_1");

        let (code, body) = call(&state, Method::GET, "/data?device_id=arduino_usb&hours=1", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (_, body) = call(&state, Method::GET, "/data/arduino_usb?limit=5", None).await;
        assert_eq!(body["data"][0]["value"], 23.4);
    }

    #[tokio::test]
    async fn ingest_requires_fields() {
        let state = state();
        let (code, body) = call(&state, Method::POST, "/data", Some(json!({"device_id": "x", "value": 1.0}))).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn device_lifecycle() {
        let state = state();
        let (code, _) = call(&state, Method::GET, "/devices/ghost", None).await;
        assert_eq!(code, StatusCode::NOT_FOUND);

        let (code, _) = call(&state, Method::POST, "/devices", Some(json!({"name": "no id"}))).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);

        let (code, body) = call(
            &state,
            Method::POST,
            "/devices",
            Some(json!({"device_id": "eth1", "device_type": "arduino_ethernet", "ip_address": "192.168.0.110"})),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["data"]["device_type"], "arduino_ethernet");

        let (code, body) = call(&state, Method::GET, "/devices/eth1", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["data"]["device"]["ip_address"], "192.168.0.110");
        assert!(body["data"]["recent_data"].as_array().unwrap().is_empty());

        let (_, body) = call(&state, Method::GET, "/devices?status=offline", None).await;
        assert!(body["data"].as_array().unwrap().is_empty());

        let (_, body) = call(&state, Method::GET, "/logs/system?limit=5", None).await;
        assert_eq!(body["data"][0]["event_type"], "device_registered");
    }

    #[tokio::test]
    async fn acquisition_start_stop() {
        let state = state();
        let (code, _) = call(&state, Method::POST, "/acquisition/start?interval=30", None).await;
        assert_eq!(code, StatusCode::OK);
        let (code, body) = call(&state, Method::POST, "/acquisition/start", None).await;
        assert_eq!(code, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);

        let (_, body) = call(&state, Method::GET, "/status", None).await;
        assert_eq!(body["running"], true);
        assert_eq!(body["interval_seconds"], 30);

        let (code, body) = call(&state, Method::POST, "/acquisition/stop", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["message"], "acquisition stopped");
    }

    #[tokio::test]
    async fn concurrent_starts_conflict_once() {
        let state = state();
        let ((a, _), (b, _)) = tokio::join!(
            call(&state, Method::POST, "/acquisition/start?interval=30", None),
            call(&state, Method::POST, "/acquisition/start?interval=30", None),
        );
        let mut codes = vec![a, b];
        codes.sort();
        assert_eq!(codes, vec![StatusCode::OK, StatusCode::CONFLICT]);

        let (_, body) = call(&state, Method::POST, "/acquisition/stop", None).await;
        assert_eq!(body["message"], "acquisition stopped");
    }

    #[tokio::test]
    async fn service_status_lights() {
        let state = state();
        let (code, body) = call(&state, Method::GET, "/service_status", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["services"]["api"]["level"], "green");
        assert_eq!(body["services"]["acquisition"]["level"], "red");
        assert_eq!(body["services"]["sync"]["level"], "grey");

        call(&state, Method::POST, "/acquisition/start?interval=30", None).await;
        let (_, body) = call(&state, Method::GET, "/service_status", None).await;
        assert_eq!(body["services"]["acquisition"]["status"], "active");
        call(&state, Method::POST, "/acquisition/stop", None).await;
    }

    #[tokio::test]
    async fn collect_with_no_sources() {
        let state = state();
        let (code, body) = call(&state, Method::POST, "/data/collect", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["data"]["usb"], 0);
        assert!(body["data"]["errors"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn health_stats_and_tunnel() {
        let state = state();
        let (code, body) = call(&state, Method::GET, "/health", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["database"], "memory");

        let (_, body) = call(&state, Method::GET, "/api/stats", None).await;
        assert_eq!(body["data"]["total_readings"], 0);

        let (_, body) = call(&state, Method::GET, "/cf_url", None).await;
        assert_eq!(body["success"], false);
        assert!(body["cf_url"].is_null());
    }

    #[tokio::test]
    async fn tunnel_url_from_secrets() {
        let path = std::env::temp_dir().join(format!("arduino-hub-tunnel-{}.toml", std::process::id()));
        std::fs::write(&path, "[cloudflare]\nurl = \"https://hub.example.trycloudflare.com\"\n").unwrap();
        assert_eq!(
            read_tunnel_url(&path).await.unwrap(),
            "https://hub.example.trycloudflare.com"
        );
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn dashboard_is_html() {
        let state = state();
        let res = router(state)
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let html = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(html.contains("<canvas"));
    }
}
