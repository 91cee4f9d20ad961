//! Network-level aggregation of finished device records.

use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::collectors::ReasoningService;
use crate::error::Result;
use crate::ports::DATABASE_PORTS;
use crate::types::{DeviceRecord, Severity};

/// Open-port counts per severity across the whole network.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RiskSummary {
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl RiskSummary {
    fn add(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
        }
    }

    pub fn count(&self, severity: Severity) -> usize {
        match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
        }
    }
}

pub const NO_CRITICAL_ISSUES: &str = "No critical security issues found";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NetworkReport {
    pub scan_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub scan_time: OffsetDateTime,
    pub network: String,
    pub total_devices: usize,
    pub risk_summary: RiskSummary,
    pub overall_risk: Severity,
    pub findings: Vec<String>,
    pub recommendations: Vec<String>,
    /// Free-text advice from the reasoning service; empty when it was unavailable.
    #[serde(default)]
    pub ai_recommendations: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub cancelled: bool,
    pub devices: Vec<DeviceRecord>,
}

/// `YYYYMMDD_HHMMSS` in the scan's own clock.
pub fn scan_id(at: OffsetDateTime) -> String {
    at.format(format_description!("[year][month][day]_[hour][minute][second]"))
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

/// `$HOME/.homeguard/reports/scan_<id>.json`.
pub fn default_report_path(scan_id: &str) -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".homeguard")
        .join("reports")
        .join(format!("scan_{scan_id}.json"))
}

impl NetworkReport {
    /// Aggregate per-device records. Fills each record's `risks` on the way and copies
    /// per-device warnings into the report.
    pub fn build(
        network: impl Into<String>,
        mut devices: Vec<DeviceRecord>,
        mut warnings: Vec<String>,
        cancelled: bool,
        now: OffsetDateTime,
    ) -> Self {
        let mut summary = RiskSummary::default();
        let mut findings = Vec::new();
        let mut recommendations: Vec<String> = Vec::new();

        for device in &mut devices {
            let ip = device.evidence.ip.clone();
            let device_type = device.identification.device_type.clone();
            let router = device_type.contains("Router");
            let mut risks = Vec::new();

            for port in &device.evidence.open_ports {
                summary.add(port.risk);
                match port.risk {
                    Severity::Critical => match port.port {
                        445 => findings.push(format!(
                            "CRITICAL: {device_type} ({ip}) has SMB exposed - ransomware risk"
                        )),
                        23 => findings.push(format!("CRITICAL: {device_type} ({ip}) has Telnet open")),
                        _ => {}
                    },
                    Severity::High if DATABASE_PORTS.contains(&port.port) => {
                        findings.push(format!("HIGH: {device_type} ({ip}) has database exposed"))
                    }
                    Severity::Medium if port.port == 80 && router => {
                        findings.push(format!("MEDIUM: Router ({ip}) has HTTP admin exposed"));
                        let rec = "Access router admin via HTTPS instead of HTTP";
                        if !recommendations.iter().any(|r| r == rec) {
                            recommendations.push(rec.to_string());
                        }
                    }
                    Severity::Medium if port.port == 22 => {
                        findings.push(format!("MEDIUM: {device_type} ({ip}) has SSH exposed"))
                    }
                    _ => {}
                }
                if port.risk > Severity::Low {
                    risks.push(port.risk);
                }
            }
            device.risks = risks;

            for w in &device.warnings {
                let line = format!("{ip}: {w}");
                if !warnings.contains(&line) {
                    warnings.push(line);
                }
            }
        }

        let overall_risk = Severity::ALL
            .into_iter()
            .rev()
            .find(|s| summary.count(*s) > 0)
            .unwrap_or(Severity::Low);

        if findings.is_empty() {
            findings.push(NO_CRITICAL_ISSUES.to_string());
        }

        Self {
            scan_id: scan_id(now),
            scan_time: now,
            network: network.into(),
            total_devices: devices.len(),
            risk_summary: summary,
            overall_risk,
            findings,
            recommendations,
            ai_recommendations: Vec::new(),
            warnings,
            cancelled,
            devices,
        }
    }

    /// Plain-text digest handed to the reasoning service.
    pub fn summary_text(&self) -> String {
        let mut out = String::from("Network scan results:\n\n");
        for d in &self.devices {
            let _ = writeln!(out, "Device: {} - {}", d.ip(), d.device_type());
            let _ = writeln!(out, "  Vendor: {}", d.vendor());
            if let Some(model) = &d.model {
                let _ = writeln!(out, "  Model: {model}");
            }
            if !d.evidence.open_ports.is_empty() {
                let ports: Vec<String> = d
                    .evidence
                    .open_ports
                    .iter()
                    .map(|p| format!("{}/{}", p.port, p.service))
                    .collect();
                let _ = writeln!(out, "  Ports: {}", ports.join(", "));
            }
            let advisories = &d.threat_intel.advisories;
            if !advisories.is_empty() {
                let critical = advisories
                    .iter()
                    .filter(|a| a.get("severity").and_then(|s| s.as_str()) == Some("CRITICAL"))
                    .count();
                let _ = writeln!(out, "  CVEs: {} ({critical} critical)", advisories.len());
            }
            out.push('\n');
        }
        out
    }

    /// Best effort: a failing service leaves `ai_recommendations` empty.
    pub async fn request_ai_recommendations(&mut self, service: &dyn ReasoningService) {
        match service.recommendations(&self.summary_text()).await {
            Ok(recs) => self.ai_recommendations = recs,
            Err(e) => warn!(error = %e, "could not generate recommendations"),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        info!(path = %path.display(), "report saved");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Device table followed by findings and recommendations.
    pub fn render_table(&self) -> String {
        let mut ip_w = "ip".len();
        let mut type_w = "type".len();
        let mut vendor_w = "vendor".len();
        for d in &self.devices {
            ip_w = ip_w.max(d.ip().len());
            type_w = type_w.max(d.device_type().len().min(32));
            vendor_w = vendor_w.max(d.vendor().len().min(24));
        }
        let risk_w = "critical".len();

        let mut out = String::new();
        let _ = writeln!(
            out,
            "Scan {}  network {}  devices {}  overall risk {}{}",
            self.scan_id,
            self.network,
            self.total_devices,
            self.overall_risk.as_str().to_uppercase(),
            if self.cancelled { "  (cancelled)" } else { "" }
        );
        let _ = writeln!(
            out,
            "{:<ip_w$}  {:<type_w$}  {:<vendor_w$}  {:<risk_w$}  ports",
            "ip", "type", "vendor", "risk"
        );
        let _ = writeln!(
            out,
            "{:-<ip_w$}  {:-<type_w$}  {:-<vendor_w$}  {:-<risk_w$}  -----",
            "", "", "", ""
        );
        for d in &self.devices {
            let risk = d.risks.iter().max().copied().unwrap_or_default();
            let ports: Vec<String> = d.evidence.open_ports.iter().map(|p| p.port.to_string()).collect();
            let device_type: String = d.device_type().chars().take(32).collect();
            let vendor: String = d.vendor().chars().take(24).collect();
            let _ = writeln!(
                out,
                "{:<ip_w$}  {:<type_w$}  {:<vendor_w$}  {:<risk_w$}  {}",
                d.ip(),
                device_type,
                vendor,
                risk.as_str(),
                ports.join(",")
            );
        }

        let sections = [
            ("Findings", &self.findings),
            ("Recommendations", &self.recommendations),
            ("AI recommendations", &self.ai_recommendations),
            ("Warnings", &self.warnings),
        ];
        for (title, lines) in sections {
            if lines.is_empty() {
                continue;
            }
            let _ = writeln!(out, "\n{title}:");
            for (i, line) in lines.iter().enumerate() {
                let _ = writeln!(out, "  {}. {line}", i + 1);
            }
        }
        out
    }
}
