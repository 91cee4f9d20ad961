//! Change monitoring between scans.
//!
//! Each finished report is reduced to a [`Baseline`] and diffed against the previous one. The
//! resulting alerts are appended to a bounded JSON log.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::config::MonitorConfig;
use crate::error::Result;
use crate::report::NetworkReport;
use crate::types::Severity;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    BaselineCreated,
    NewDevice,
    DeviceRemoved,
    PortOpened,
    PortClosed,
    NewVulnerability,
}

impl AlertKind {
    pub fn severity(self) -> Severity {
        match self {
            AlertKind::NewDevice | AlertKind::NewVulnerability => Severity::High,
            AlertKind::PortOpened => Severity::Medium,
            AlertKind::BaselineCreated | AlertKind::DeviceRemoved | AlertKind::PortClosed => {
                Severity::Low
            }
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    #[serde(default)]
    pub ip: Option<String>,
    pub message: String,
    #[serde(default)]
    pub detail: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl Alert {
    fn new(
        kind: AlertKind,
        ip: Option<&str>,
        message: String,
        detail: impl Into<String>,
        at: OffsetDateTime,
    ) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            ip: ip.map(str::to_string),
            message,
            detail: detail.into(),
            timestamp: at,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct BaselineDevice {
    pub device_type: String,
    pub ports: BTreeSet<u16>,
    #[serde(default)]
    pub vulnerabilities: BTreeSet<String>,
}

/// What a scan saw, keyed by IP.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Baseline {
    pub scan_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub scan_time: OffsetDateTime,
    pub devices: BTreeMap<String, BaselineDevice>,
}

impl Baseline {
    pub fn from_report(report: &NetworkReport) -> Self {
        let devices = report
            .devices
            .iter()
            .map(|d| {
                let device = BaselineDevice {
                    device_type: d.device_type().to_string(),
                    ports: d.evidence.port_numbers().into_iter().collect(),
                    vulnerabilities: d
                        .fixable_vulnerabilities
                        .iter()
                        .map(|v| v.vuln_id.clone())
                        .collect(),
                };
                (d.ip().to_string(), device)
            })
            .collect();
        Self {
            scan_id: report.scan_id.clone(),
            scan_time: report.scan_time,
            devices,
        }
    }
}

/// Alerts for what changed from `old` to `new`, filtered by the configured minimum severity.
pub fn detect_changes(
    old: &Baseline,
    new: &Baseline,
    cfg: &MonitorConfig,
    at: OffsetDateTime,
) -> Vec<Alert> {
    let mut alerts = Vec::new();

    for (ip, dev) in &new.devices {
        let Some(prev) = old.devices.get(ip) else {
            if cfg.alert_new_devices {
                alerts.push(Alert::new(
                    AlertKind::NewDevice,
                    Some(ip.as_str()),
                    format!("New device detected: {ip}"),
                    format!("Device type: {}", dev.device_type),
                    at,
                ));
            }
            continue;
        };
        if cfg.alert_port_changes {
            for port in dev.ports.difference(&prev.ports) {
                alerts.push(Alert::new(
                    AlertKind::PortOpened,
                    Some(ip.as_str()),
                    format!("Port {port} opened on {ip}"),
                    "New service detected",
                    at,
                ));
            }
            for port in prev.ports.difference(&dev.ports) {
                alerts.push(Alert::new(
                    AlertKind::PortClosed,
                    Some(ip.as_str()),
                    format!("Port {port} closed on {ip}"),
                    "Service no longer listening",
                    at,
                ));
            }
        }
        if cfg.alert_vulnerabilities {
            for vuln in dev.vulnerabilities.difference(&prev.vulnerabilities) {
                alerts.push(Alert::new(
                    AlertKind::NewVulnerability,
                    Some(ip.as_str()),
                    format!("New vulnerability on {ip}: {vuln}"),
                    "",
                    at,
                ));
            }
        }
    }

    for ip in old.devices.keys().filter(|ip| !new.devices.contains_key(*ip)) {
        alerts.push(Alert::new(
            AlertKind::DeviceRemoved,
            Some(ip.as_str()),
            format!("Device offline: {ip}"),
            "Device no longer responding",
            at,
        ));
    }

    alerts.retain(|a| a.severity >= cfg.min_severity);
    alerts
}

/// Baseline and alert log on disk.
#[derive(Debug, Clone)]
pub struct Monitor {
    config: MonitorConfig,
}

impl Monitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// The saved baseline; a missing or unreadable file means there is none yet.
    pub fn load_baseline(&self) -> Option<Baseline> {
        read_json(&self.config.baseline_path)
    }

    /// Diff `report` against the saved baseline, then make it the new baseline.
    ///
    /// The first report only records a baseline. Cancelled reports are partial and ignored.
    pub fn compare(&self, report: &NetworkReport) -> Result<Vec<Alert>> {
        if report.cancelled {
            info!(scan_id = %report.scan_id, "cancelled scan not compared against baseline");
            return Ok(Vec::new());
        }
        let now = OffsetDateTime::now_utc();
        let current = Baseline::from_report(report);
        let alerts = match self.load_baseline() {
            Some(old) => detect_changes(&old, &current, &self.config, now),
            None => vec![Alert::new(
                AlertKind::BaselineCreated,
                None,
                format!("Baseline created: {} devices found", current.devices.len()),
                "Future scans will be compared against this one.",
                now,
            )],
        };

        write_json(&self.config.baseline_path, &current)?;
        if !alerts.is_empty() {
            self.append_alerts(&alerts)?;
        }
        info!(scan_id = %report.scan_id, alerts = alerts.len(), "scan compared against baseline");
        Ok(alerts)
    }

    fn append_alerts(&self, alerts: &[Alert]) -> Result<()> {
        let mut log: Vec<Alert> = read_json(&self.config.alerts_path).unwrap_or_default();
        log.extend_from_slice(alerts);
        if log.len() > self.config.max_alerts {
            log = log.split_off(log.len() - self.config.max_alerts);
        }
        write_json(&self.config.alerts_path, &log)
    }

    /// Up to `limit` alerts, most recent first.
    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        let log: Vec<Alert> = read_json(&self.config.alerts_path).unwrap_or_default();
        log.into_iter().rev().take(limit).collect()
    }

    pub fn clear_alerts(&self) -> Result<()> {
        write_json(&self.config.alerts_path, &Vec::<Alert>::new())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "monitor file unreadable");
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "monitor file corrupt, ignoring it");
            None
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = PathBuf::from(path);
    tmp.set_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeviceEvidence, DeviceRecord, FixableVulnerability, OpenPort};
    use tempfile::TempDir;
    use time::macros::datetime;

    fn device(ip: &str, ports: &[u16], vulns: &[&str]) -> DeviceRecord {
        let mut evidence = DeviceEvidence {
            ip: ip.to_string(),
            ..Default::default()
        };
        evidence.set_open_ports(
            ports
                .iter()
                .map(|&port| OpenPort {
                    port,
                    service: "unknown".to_string(),
                    risk: Severity::Low,
                    banner: None,
                })
                .collect(),
        );
        let mut record = DeviceRecord::new(evidence);
        record.fixable_vulnerabilities = vulns
            .iter()
            .map(|id| FixableVulnerability {
                vuln_id: id.to_string(),
                ip: ip.to_string(),
                port: 23,
                severity: Severity::High,
                description: String::new(),
                fix_type: String::new(),
            })
            .collect();
        record
    }

    fn report(scan_id: &str, devices: Vec<DeviceRecord>) -> NetworkReport {
        NetworkReport {
            scan_id: scan_id.to_string(),
            scan_time: datetime!(2024-05-01 10:00 UTC),
            network: "192.168.1.0/24".to_string(),
            total_devices: devices.len(),
            risk_summary: Default::default(),
            overall_risk: Severity::Low,
            findings: Vec::new(),
            recommendations: Vec::new(),
            ai_recommendations: Vec::new(),
            warnings: Vec::new(),
            cancelled: false,
            devices,
        }
    }

    fn everything() -> MonitorConfig {
        MonitorConfig {
            min_severity: Severity::Low,
            ..MonitorConfig::in_dir("/nonexistent")
        }
    }

    #[test]
    fn diff_covers_devices_ports_and_vulnerabilities() {
        let old = Baseline::from_report(&report(
            "a",
            vec![device("192.168.1.1", &[53, 80], &[]), device("192.168.1.9", &[22], &[])],
        ));
        let new = Baseline::from_report(&report(
            "b",
            vec![
                device("192.168.1.1", &[53, 443], &["telnet_open"]),
                device("192.168.1.30", &[554], &[]),
            ],
        ));
        let alerts = detect_changes(&old, &new, &everything(), datetime!(2024-05-02 10:00 UTC));
        let got: Vec<(AlertKind, Option<&str>)> = alerts.iter().map(|a| (a.kind, a.ip.as_deref())).collect();
        assert_eq!(
            got,
            vec![
                (AlertKind::PortOpened, Some("192.168.1.1")),
                (AlertKind::PortClosed, Some("192.168.1.1")),
                (AlertKind::NewVulnerability, Some("192.168.1.1")),
                (AlertKind::NewDevice, Some("192.168.1.30")),
                (AlertKind::DeviceRemoved, Some("192.168.1.9")),
            ]
        );
        assert_eq!(alerts[0].message, "Port 443 opened on 192.168.1.1");
        assert_eq!(alerts[3].severity, Severity::High);
    }

    #[test]
    fn minimum_severity_and_switches_filter_alerts() {
        let old = Baseline::from_report(&report("a", vec![device("192.168.1.1", &[80], &[])]));
        let new = Baseline::from_report(&report(
            "b",
            vec![device("192.168.1.1", &[80, 8080], &[]), device("192.168.1.2", &[80], &[])],
        ));
        let at = datetime!(2024-05-02 10:00 UTC);

        let mut cfg = MonitorConfig::in_dir("/nonexistent");
        let kinds: Vec<AlertKind> = detect_changes(&old, &new, &cfg, at).iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![AlertKind::PortOpened, AlertKind::NewDevice]);

        cfg.min_severity = Severity::High;
        cfg.alert_new_devices = false;
        assert!(detect_changes(&old, &new, &cfg, at).is_empty());
    }

    #[test]
    fn first_scan_records_a_baseline() {
        let dir = TempDir::new().unwrap();
        let monitor = Monitor::new(MonitorConfig::in_dir(dir.path()));
        assert!(monitor.load_baseline().is_none());

        let alerts = monitor
            .compare(&report("a", vec![device("192.168.1.1", &[80], &[])]))
            .unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::BaselineCreated);
        assert_eq!(alerts[0].message, "Baseline created: 1 devices found");
        assert_eq!(monitor.load_baseline().unwrap().scan_id, "a");

        let alerts = monitor
            .compare(&report("b", vec![device("192.168.1.1", &[80], &[])]))
            .unwrap();
        assert!(alerts.is_empty());
        assert_eq!(monitor.load_baseline().unwrap().scan_id, "b");
        assert_eq!(monitor.recent_alerts(10).len(), 1);
    }

    #[test]
    fn cancelled_scan_keeps_the_baseline() {
        let dir = TempDir::new().unwrap();
        let monitor = Monitor::new(MonitorConfig::in_dir(dir.path()));
        monitor
            .compare(&report("a", vec![device("192.168.1.1", &[80], &[])]))
            .unwrap();

        let mut partial = report("b", Vec::new());
        partial.cancelled = true;
        assert!(monitor.compare(&partial).unwrap().is_empty());
        assert_eq!(monitor.load_baseline().unwrap().devices.len(), 1);
    }

    #[test]
    fn alert_log_is_bounded_and_newest_first() {
        let dir = TempDir::new().unwrap();
        let monitor = Monitor::new(MonitorConfig {
            max_alerts: 3,
            ..MonitorConfig::in_dir(dir.path())
        });
        monitor.compare(&report("a", Vec::new())).unwrap();
        for (i, id) in ["b", "c", "d"].into_iter().enumerate() {
            let ip = format!("192.168.1.{}", i + 10);
            monitor.compare(&report(id, vec![device(&ip, &[80], &[])])).unwrap();
        }

        let recent = monitor.recent_alerts(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].kind, AlertKind::NewDevice);
        assert_eq!(recent[0].ip.as_deref(), Some("192.168.1.12"));
        assert!(recent.iter().all(|a| a.kind != AlertKind::BaselineCreated));
        assert_eq!(monitor.recent_alerts(1).len(), 1);

        monitor.clear_alerts().unwrap();
        assert!(monitor.recent_alerts(10).is_empty());
    }

    #[test]
    fn corrupt_baseline_starts_over() {
        let dir = TempDir::new().unwrap();
        let cfg = MonitorConfig::in_dir(dir.path());
        fs::write(&cfg.baseline_path, "{not json").unwrap();
        let monitor = Monitor::new(cfg);
        let alerts = monitor.compare(&report("a", Vec::new())).unwrap();
        assert_eq!(alerts[0].kind, AlertKind::BaselineCreated);
    }
}
