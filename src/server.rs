use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    collectors::HostDiscovery,
    monitor::Monitor,
    netdetect,
    orchestrator::Orchestrator,
    report::NetworkReport,
};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<RwLock<ServerState>>, // shared mutable state for status/report
    orchestrator: Arc<Orchestrator>,
    discovery: Arc<dyn HostDiscovery>,
    monitor: Option<Arc<Monitor>>,
}

#[derive(Debug, Default)]
struct ServerState {
    status: Status,
    report: Option<NetworkReport>,
    cancel: Option<CancellationToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Status {
    pub state: ScanState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    pub devices: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    #[default]
    Idle,
    Running,
    Done,
}

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    #[serde(default = "default_alert_limit")]
    pub limit: usize,
}

fn default_alert_limit() -> usize {
    20
}

#[derive(Debug, Deserialize, Default)]
pub struct ScanRequest {
    /// CIDR to sweep; the local /24 when absent.
    #[serde(default)]
    pub network: Option<String>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, discovery: Arc<dyn HostDiscovery>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ServerState::default())),
            orchestrator,
            discovery,
            monitor: None,
        }
    }

    /// Diff every finished scan against the monitor's baseline.
    pub fn with_monitor(mut self, monitor: Monitor) -> Self {
        self.monitor = Some(Arc::new(monitor));
        self
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/scan", post(post_scan))
        .route("/report", get(get_report))
        .route("/devices", get(get_devices))
        .route("/alerts", get(get_alerts))
        .with_state(state);

    Router::new().nest("/api", api).layer(TraceLayer::new_for_http())
}

pub async fn spawn_server(bind: &str, state: AppState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(%bind, "serving API");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    (StatusCode::OK, Json(s.status.clone()))
}

async fn get_report(State(app): State<AppState>) -> impl IntoResponse {
    let s = app.inner.read().await;
    if let Some(report) = s.report.as_ref() {
        (StatusCode::OK, Json(report.clone())).into_response()
    } else {
        StatusCode::NO_CONTENT.into_response()
    }
}

async fn get_devices(State(app): State<AppState>) -> impl IntoResponse {
    let store = app.orchestrator.store();
    let devices = store.lock().await.list_known_devices();
    (StatusCode::OK, Json(devices))
}

async fn get_alerts(State(app): State<AppState>, Query(q): Query<AlertsQuery>) -> impl IntoResponse {
    let alerts = app
        .monitor
        .as_ref()
        .map(|m| m.recent_alerts(q.limit))
        .unwrap_or_default();
    (StatusCode::OK, Json(alerts))
}

async fn post_scan(State(app): State<AppState>, body: Option<Json<ScanRequest>>) -> impl IntoResponse {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let network = match req.network.as_deref().map(netdetect::validate_network_cidr) {
        Some(Ok(n)) => Some(n),
        Some(Err(e)) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        None => None,
    };
    let status = start_scan(&app, network).await;
    (StatusCode::ACCEPTED, Json(status)).into_response()
}

/// Rescan the local network on the monitor's interval until `cancel` fires.
pub fn spawn_monitor_loop(app: AppState, cancel: CancellationToken) -> Option<tokio::task::JoinHandle<()>> {
    let every = app.monitor.as_ref().filter(|m| m.config().enabled)?.config().interval();
    info!(hours = every.as_secs() / 3600, "monitoring enabled");
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    start_scan(&app, None).await;
                }
            }
        }
    }))
}

/// Start a background scan, cancelling any running one.
async fn start_scan(app: &AppState, network: Option<IpNet>) -> Status {
    let cancel = CancellationToken::new();
    let label = network.map_or_else(|| "local".to_string(), |n| n.to_string());
    let status = Status {
        state: ScanState::Running,
        network: Some(label.clone()),
        devices: 0,
        error: None,
    };

    {
        let mut s = app.inner.write().await;
        // A new scan replaces the running one.
        if let Some(c) = s.cancel.take() {
            c.cancel();
        }
        s.status = status.clone();
        s.report = None;
        s.cancel = Some(cancel.clone());
    }

    let app2 = app.clone();
    tokio::spawn(async move {
        let hosts = app2.discovery.discover_devices(network).await;
        let outcome = match hosts {
            Ok(hosts) => Ok(app2.orchestrator.scan_network(&label, hosts, cancel.clone()).await),
            Err(e) => Err(e),
        };

        let mut s = app2.inner.write().await;
        // A newer scan owns the state now.
        if cancel.is_cancelled() && s.cancel.is_some() {
            return;
        }
        s.cancel = None;
        match outcome {
            Ok(report) => {
                if let Some(monitor) = &app2.monitor {
                    if let Err(e) = monitor.compare(&report) {
                        warn!(error = %e, "baseline comparison failed");
                    }
                }
                s.status.state = ScanState::Done;
                s.status.devices = report.total_devices;
                s.report = Some(report);
            }
            Err(e) => {
                warn!(error = %e, "scan failed");
                s.status.state = ScanState::Idle;
                s.status.error = Some(e.to_string());
            }
        }
    });

    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, MonitorConfig};
    use crate::monitor::{Alert, AlertKind};
    use crate::error::{Error, Result as CrateResult};
    use crate::types::DiscoveredHost;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    struct EmptyNetwork;

    #[async_trait]
    impl HostDiscovery for EmptyNetwork {
        async fn discover_devices(&self, _network: Option<IpNet>) -> CrateResult<Vec<DiscoveredHost>> {
            Ok(Vec::new())
        }
    }

    struct BrokenDiscovery;

    #[async_trait]
    impl HostDiscovery for BrokenDiscovery {
        async fn discover_devices(&self, _network: Option<IpNet>) -> CrateResult<Vec<DiscoveredHost>> {
            Err(Error::InvalidTarget("no local IPv4 network detected".into()))
        }
    }

    fn state(dir: &tempfile::TempDir, discovery: Arc<dyn HostDiscovery>) -> AppState {
        let mut cfg = AppConfig::default();
        cfg.fingerprint.store_path = dir.path().join("fp.json");
        AppState::new(Arc::new(Orchestrator::from_config(&cfg).unwrap()), discovery)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<&str>) -> (StatusCode, Vec<u8>) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(b) => {
                req = req.header("content-type", "application/json");
                Body::from(b.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    async fn wait_for(app: &Router, want: ScanState) -> Status {
        for _ in 0..200 {
            let (_, body) = call(app, "GET", "/api/status", None).await;
            let status: Status = serde_json::from_slice(&body).unwrap();
            if status.state == want {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("scan never reached {want:?}");
    }

    #[tokio::test]
    async fn idle_server() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(&dir, Arc::new(EmptyNetwork)));

        let (code, body) = call(&app, "GET", "/api/status", None).await;
        assert_eq!(code, StatusCode::OK);
        let status: Status = serde_json::from_slice(&body).unwrap();
        assert_eq!(status.state, ScanState::Idle);

        let (code, _) = call(&app, "GET", "/api/report", None).await;
        assert_eq!(code, StatusCode::NO_CONTENT);

        let (code, body) = call(&app, "GET", "/api/devices", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body, b"[]");
    }

    #[tokio::test]
    async fn public_network_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(&dir, Arc::new(EmptyNetwork)));
        let (code, body) = call(&app, "POST", "/api/scan", Some(r#"{"network":"8.8.8.0/24"}"#)).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert!(String::from_utf8_lossy(&body).contains("only private networks"));
    }

    #[tokio::test]
    async fn scan_runs_to_a_report() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(&dir, Arc::new(EmptyNetwork)));
        let (code, _) = call(&app, "POST", "/api/scan", Some(r#"{"network":"192.168.50.0/24"}"#)).await;
        assert_eq!(code, StatusCode::ACCEPTED);

        let status = wait_for(&app, ScanState::Done).await;
        assert_eq!(status.network.as_deref(), Some("192.168.50.0/24"));

        let (code, body) = call(&app, "GET", "/api/report", None).await;
        assert_eq!(code, StatusCode::OK);
        let report: NetworkReport = serde_json::from_slice(&body).unwrap();
        assert_eq!(report.total_devices, 0);
        assert_eq!(report.network, "192.168.50.0/24");
    }

    #[tokio::test]
    async fn finished_scans_feed_the_alert_log() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = Monitor::new(MonitorConfig::in_dir(dir.path()));
        let app = router(state(&dir, Arc::new(EmptyNetwork)).with_monitor(monitor));

        let (code, body) = call(&app, "GET", "/api/alerts", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body, b"[]");

        call(&app, "POST", "/api/scan", Some(r#"{"network":"192.168.50.0/24"}"#)).await;
        wait_for(&app, ScanState::Done).await;

        let (code, body) = call(&app, "GET", "/api/alerts?limit=5", None).await;
        assert_eq!(code, StatusCode::OK);
        let alerts: Vec<Alert> = serde_json::from_slice(&body).unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::BaselineCreated);
        assert!(dir.path().join("baseline.json").exists());
    }

    #[tokio::test]
    async fn monitor_loop_needs_monitoring_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        assert!(spawn_monitor_loop(state(&dir, Arc::new(EmptyNetwork)), cancel.clone()).is_none());

        let idle = Monitor::new(MonitorConfig::in_dir(dir.path()));
        let app = state(&dir, Arc::new(EmptyNetwork)).with_monitor(idle);
        assert!(spawn_monitor_loop(app, cancel.clone()).is_none());

        let enabled = Monitor::new(MonitorConfig {
            enabled: true,
            ..MonitorConfig::in_dir(dir.path())
        });
        let app = state(&dir, Arc::new(EmptyNetwork)).with_monitor(enabled);
        let handle = spawn_monitor_loop(app.clone(), cancel.clone()).unwrap();

        // The first tick scans right away.
        let api = router(app);
        wait_for(&api, ScanState::Done).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(Monitor::new(MonitorConfig::in_dir(dir.path())).recent_alerts(5).len(), 1);
    }

    #[tokio::test]
    async fn discovery_failure_is_reported_in_status() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(state(&dir, Arc::new(BrokenDiscovery)));
        let (code, _) = call(&app, "POST", "/api/scan", None).await;
        assert_eq!(code, StatusCode::ACCEPTED);

        for _ in 0..200 {
            let (_, body) = call(&app, "GET", "/api/status", None).await;
            let status: Status = serde_json::from_slice(&body).unwrap();
            if let Some(err) = status.error {
                assert_eq!(status.state, ScanState::Idle);
                assert!(err.contains("no local IPv4 network"));
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("discovery error never surfaced");
    }
}
