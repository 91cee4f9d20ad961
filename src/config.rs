//! Layered configuration: built-in defaults, an optional TOML file, then `HOMEGUARD_*` env vars.
//!
//! CLI flags are applied last by the binary.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::ports::validate_port;
use crate::types::Severity;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub identification: IdentificationWeights,
    #[serde(default)]
    pub fingerprint: FingerprintConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let cfg: Self =
            toml::from_str(content).map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;
        for &port in &cfg.scan.ports {
            validate_port(u32::from(port)).map_err(|e| Error::Config(format!("scan.ports: {e}")))?;
        }
        Ok(cfg)
    }

    /// Merge with environment variables (HOMEGUARD_ prefix).
    pub fn merge_env(self) -> Self {
        self.merge_vars(|key| std::env::var(key).ok())
    }

    /// Same as [`merge_env`](Self::merge_env) with an injectable lookup, so tests never touch
    /// the process environment.
    pub fn merge_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(val) = var("HOMEGUARD_BACKEND_URL") {
            self.backend.url = Some(val).filter(|v| !v.is_empty());
        }
        if let Some(v) = env_override(&var, "HOMEGUARD_AUGMENTED_LOOKUP", parse_bool) {
            self.backend.augmented_lookup = v;
        }
        if let Some(v) = env_override(&var, "HOMEGUARD_ONLINE_OUI", parse_bool) {
            self.backend.online_oui_lookup = v;
        }
        if let Some(val) = var("HOMEGUARD_STORE_PATH") {
            self.fingerprint.store_path = PathBuf::from(val);
        }
        if let Some(v) = env_override(&var, "HOMEGUARD_FUZZY_THRESHOLD", parse_number) {
            self.fingerprint.fuzzy_threshold = v;
        }
        if let Some(v) = env_override(&var, "HOMEGUARD_PORT_CONCURRENCY", parse_number) {
            self.scan.port_concurrency = v;
        }
        if let Some(v) = env_override(&var, "HOMEGUARD_DEVICE_CONCURRENCY", parse_number) {
            self.scan.device_concurrency = v;
        }
        if let Some(v) = env_override(&var, "HOMEGUARD_TIMEOUT_MS", parse_number) {
            self.scan.connect_timeout_ms = v;
        }
        if let Some(v) = env_override(&var, "HOMEGUARD_MONITOR", parse_bool) {
            self.monitor.enabled = v;
        }
        if let Some(val) = var("HOMEGUARD_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Some(val) = var("HOMEGUARD_LOG_FORMAT") {
            self.logging.format = val;
        }
        self
    }
}

/// Parse an env override; a malformed value is logged and the current setting kept.
fn env_override<T>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let raw = var(key)?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        warn!(%key, value = %raw, "ignoring unparsable environment override");
    }
    parsed
}

fn parse_number<T: FromStr>(s: &str) -> Option<T> {
    s.trim().parse().ok()
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Max concurrent TCP connect attempts per device.
    pub port_concurrency: usize,
    /// Max devices processed at once.
    pub device_concurrency: usize,
    pub connect_timeout_ms: u64,
    pub banner_timeout_ms: u64,
    /// Probe timeout for device HTTP pages.
    pub http_timeout_secs: u64,
    /// Overrides the built-in quick port set when non-empty.
    pub ports: Vec<u16>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            port_concurrency: 100,
            device_concurrency: 8,
            connect_timeout_ms: 1000,
            banner_timeout_ms: 500,
            http_timeout_secs: 10,
            ports: Vec::new(),
        }
    }
}

impl ScanConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn banner_timeout(&self) -> Duration {
        Duration::from_millis(self.banner_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the threat-intel / inference backend. Unset disables those stages.
    pub url: Option<String>,
    pub request_timeout_secs: u64,
    /// Ask the inference service when local identification stays unknown.
    pub augmented_lookup: bool,
    /// Fall back to an online OUI database for MACs missing from the embedded table.
    pub online_oui_lookup: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: None,
            request_timeout_secs: 60,
            augmented_lookup: false,
            online_oui_lookup: false,
        }
    }
}

/// Score weights of the identification engine. Calibration constants, not derived values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentificationWeights {
    pub port_signature_points: f64,
    pub vendor_points: f64,
    pub http_high_points: f64,
    pub http_medium_points: f64,
    pub http_low_points: f64,
    pub banner_points: f64,
    pub high_threshold: f64,
    pub medium_threshold: f64,
}

impl Default for IdentificationWeights {
    fn default() -> Self {
        Self {
            port_signature_points: 60.0,
            vendor_points: 50.0,
            http_high_points: 70.0,
            http_medium_points: 50.0,
            http_low_points: 30.0,
            banner_points: 60.0,
            high_threshold: 80.0,
            medium_threshold: 50.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    pub store_path: PathBuf,
    /// Fuzzy matches must be strictly above this similarity.
    pub fuzzy_threshold: f64,
    pub oui_weight: f64,
    pub port_weight: f64,
    pub http_weight: f64,
    pub confidence_mac: f64,
    pub confidence_ports: f64,
    pub confidence_http: f64,
    pub confidence_banner: f64,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            fuzzy_threshold: 0.7,
            oui_weight: 0.5,
            port_weight: 0.3,
            http_weight: 0.2,
            confidence_mac: 0.4,
            confidence_ports: 0.3,
            confidence_http: 0.2,
            confidence_banner: 0.1,
        }
    }
}

impl FingerprintConfig {
    pub fn with_store_path(path: impl Into<PathBuf>) -> Self {
        Self {
            store_path: path.into(),
            ..Self::default()
        }
    }
}

/// `$HOME/.homeguard`, or `./.homeguard` if `HOME` is unset.
pub fn data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".homeguard")
}

pub fn default_store_path() -> PathBuf {
    data_dir().join("fingerprints.json")
}

/// Baseline diffing between scans.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Rescan on a timer while serving the API.
    pub enabled: bool,
    pub interval_hours: u64,
    pub baseline_path: PathBuf,
    pub alerts_path: PathBuf,
    pub alert_new_devices: bool,
    pub alert_port_changes: bool,
    pub alert_vulnerabilities: bool,
    /// Alerts below this severity are dropped.
    pub min_severity: Severity,
    /// Size of the alert log; older alerts fall off.
    pub max_alerts: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_hours: 6,
            baseline_path: data_dir().join("baseline.json"),
            alerts_path: data_dir().join("alerts.json"),
            alert_new_devices: true,
            alert_port_changes: true,
            alert_vulnerabilities: true,
            min_severity: Severity::Medium,
            max_alerts: 100,
        }
    }
}

impl MonitorConfig {
    /// Defaults with both files under `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            baseline_path: dir.join("baseline.json"),
            alerts_path: dir.join("alerts.json"),
            ..Self::default()
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours.max(1) * 3600)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub scan_calls_per_sec: u32,
    pub http_calls_per_sec: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            scan_calls_per_sec: 10,
            http_calls_per_sec: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn or error
    pub level: String,
    /// pretty, compact or json
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_carry_calibration_constants() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.fingerprint.fuzzy_threshold, 0.7);
        assert_eq!(cfg.identification.port_signature_points, 60.0);
        assert_eq!(cfg.identification.http_high_points, 70.0);
        assert_eq!(cfg.rate_limit.scan_calls_per_sec, 10);
        assert_eq!(cfg.rate_limit.http_calls_per_sec, 5);
        assert!(cfg.fingerprint.store_path.ends_with(".homeguard/fingerprints.json"));
        assert!(cfg.monitor.alerts_path.ends_with(".homeguard/alerts.json"));
        assert_eq!(cfg.monitor.min_severity, Severity::Medium);
        assert_eq!(cfg.monitor.max_alerts, 100);
    }

    #[test]
    fn monitor_section_from_toml() {
        let cfg = AppConfig::from_toml(
            r#"
            [monitor]
            enabled = true
            interval_hours = 12
            min_severity = "high"
            "#,
        )
        .unwrap();
        assert!(cfg.monitor.enabled);
        assert_eq!(cfg.monitor.interval(), Duration::from_secs(12 * 3600));
        assert_eq!(cfg.monitor.min_severity, Severity::High);
        assert!(cfg.monitor.alert_port_changes);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = AppConfig::from_toml(
            r#"
            [fingerprint]
            store_path = "/tmp/fp.json"
            fuzzy_threshold = 0.8

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.fingerprint.store_path, PathBuf::from("/tmp/fp.json"));
        assert_eq!(cfg.fingerprint.fuzzy_threshold, 0.8);
        assert_eq!(cfg.fingerprint.oui_weight, 0.5);
        assert_eq!(cfg.logging.format, "json");
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.scan.device_concurrency, 8);
    }

    #[test]
    fn bad_toml_is_config_error() {
        let err = AppConfig::from_toml("[scan\nports = 1").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn port_zero_in_file_is_rejected() {
        let err = AppConfig::from_toml("[scan]\nports = [22, 0, 80]").unwrap_err();
        assert!(matches!(&err, Error::Config(msg) if msg.contains("scan.ports")));

        let cfg = AppConfig::from_toml("[scan]\nports = [22, 8080]").unwrap();
        assert_eq!(cfg.scan.ports, vec![22, 8080]);
    }

    #[test]
    fn malformed_env_values_keep_current_settings() {
        let vars: HashMap<&str, &str> = [
            ("HOMEGUARD_FUZZY_THRESHOLD", "high"),
            ("HOMEGUARD_PORT_CONCURRENCY", "-4"),
            ("HOMEGUARD_ONLINE_OUI", "maybe"),
            ("HOMEGUARD_DEVICE_CONCURRENCY", " 12 "),
        ]
        .into_iter()
        .collect();
        let cfg = AppConfig::default().merge_vars(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.fingerprint.fuzzy_threshold, 0.7);
        assert_eq!(cfg.scan.port_concurrency, 100);
        assert!(!cfg.backend.online_oui_lookup);
        assert_eq!(cfg.scan.device_concurrency, 12);
    }

    #[test]
    fn env_overrides_file_values() {
        let vars: HashMap<&str, &str> = [
            ("HOMEGUARD_BACKEND_URL", "http://127.0.0.1:8000"),
            ("HOMEGUARD_AUGMENTED_LOOKUP", "yes"),
            ("HOMEGUARD_DEVICE_CONCURRENCY", "3"),
            ("HOMEGUARD_TIMEOUT_MS", "not-a-number"),
            ("HOMEGUARD_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();
        let cfg = AppConfig::default().merge_vars(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.backend.url.as_deref(), Some("http://127.0.0.1:8000"));
        assert!(cfg.backend.augmented_lookup);
        assert_eq!(cfg.scan.device_concurrency, 3);
        assert_eq!(cfg.scan.connect_timeout_ms, 1000);
        assert_eq!(cfg.logging.level, "debug");
    }
}
