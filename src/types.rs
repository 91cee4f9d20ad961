use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::threat_intel::ThreatIntel;

pub const UNKNOWN: &str = "Unknown";
pub const UNKNOWN_DEVICE: &str = "Unknown Device";

/// Coarse certainty of an identification. Ordered: `Low < Medium < High`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    #[default]
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }

    /// Lenient parse used for values coming back from external services.
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Confidence::High,
            "medium" => Confidence::Medium,
            _ => Confidence::Low,
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Risk severity with a total order: `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Low,
        Severity::Medium,
        Severity::High,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One open TCP port as seen by the port scanner.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct OpenPort {
    pub port: u16,
    pub service: String,
    pub risk: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
}

/// HTTP identification scraped from a device web interface.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
}

impl HttpInfo {
    pub fn is_empty(&self) -> bool {
        self.server.is_none() && self.title.is_none() && self.vendor.is_none()
    }
}

/// A host found by the network sweep.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredHost {
    pub ip: String,
    pub mac: String,
    #[serde(default)]
    pub ttl: Option<u8>,
    #[serde(default)]
    pub hostname: Option<String>,
    pub os_guess: String,
}

impl DiscoveredHost {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            mac: UNKNOWN.to_string(),
            ttl: None,
            hostname: None,
            os_guess: UNKNOWN.to_string(),
        }
    }
}

/// Raw per-scan evidence for one device.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceEvidence {
    pub ip: String,
    pub mac: String,
    /// Ordered by port number, no duplicates.
    pub open_ports: Vec<OpenPort>,
    /// Port → banner text, at most 100 chars each.
    pub banners: BTreeMap<u16, String>,
    pub http_info: HttpInfo,
    pub os_guess: String,
    pub hostname: Option<String>,
    /// Vendor hints extracted from deep-scan data.
    #[serde(default)]
    pub vendor_hints: Vec<String>,
}

impl DeviceEvidence {
    pub fn from_host(host: &DiscoveredHost) -> Self {
        Self {
            ip: host.ip.clone(),
            mac: host.mac.clone(),
            os_guess: host.os_guess.clone(),
            hostname: host.hostname.clone(),
            ..Default::default()
        }
    }

    pub fn port_numbers(&self) -> Vec<u16> {
        self.open_ports.iter().map(|p| p.port).collect()
    }

    /// Replace open ports, keeping them sorted and unique, and re-derive banners.
    pub fn set_open_ports(&mut self, mut ports: Vec<OpenPort>) {
        ports.sort_by_key(|p| p.port);
        ports.dedup_by_key(|p| p.port);
        self.banners = ports
            .iter()
            .filter_map(|p| p.banner.as_ref().map(|b| (p.port, truncate_chars(b, 100))))
            .collect();
        self.open_ports = ports;
    }
}

/// Output of the identification engine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IdentificationResult {
    pub device_type: String,
    pub vendor: String,
    pub confidence: Confidence,
    /// Evidence source → matched value, for explainability.
    pub indicators: BTreeMap<String, String>,
}

impl Default for IdentificationResult {
    fn default() -> Self {
        Self {
            device_type: UNKNOWN_DEVICE.to_string(),
            vendor: UNKNOWN.to_string(),
            confidence: Confidence::Low,
            indicators: BTreeMap::new(),
        }
    }
}

impl IdentificationResult {
    pub fn is_unknown(&self) -> bool {
        self.device_type == UNKNOWN_DEVICE
    }
}

/// Fingerprint match summary copied into the device record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FingerprintRef {
    pub fingerprint_id: String,
    /// `None` when the record was created by this scan.
    pub match_type: Option<crate::fingerprint::MatchType>,
    pub confidence: f64,
    pub seen_count: u64,
}

/// A remediable weakness found on a device.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FixableVulnerability {
    pub vuln_id: String,
    pub ip: String,
    pub port: u16,
    pub severity: Severity,
    pub description: String,
    pub fix_type: String,
}

/// The consolidated per-device output of one scan.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct DeviceRecord {
    pub evidence: DeviceEvidence,
    pub identification: IdentificationResult,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub firmware_version: Option<String>,
    #[serde(default)]
    pub fingerprint: Option<FingerprintRef>,
    /// Labels carried forward from the matched fingerprint record.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub user_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub deep_scan: Option<crate::deep_scan::DeepScanReport>,
    #[serde(default)]
    pub encryption_check: Option<crate::security::EncryptionCheck>,
    #[serde(default)]
    pub firmware_check: Option<crate::security::FirmwareCheck>,
    #[serde(default)]
    pub upnp_check: Option<crate::security::UpnpCheck>,
    #[serde(default)]
    pub dns_check: Option<crate::security::DnsCheck>,
    #[serde(default)]
    pub threat_intel: ThreatIntel,
    #[serde(default)]
    pub fixable_vulnerabilities: Vec<FixableVulnerability>,
    /// Per-port risks, filled during aggregation.
    #[serde(default)]
    pub risks: Vec<Severity>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl DeviceRecord {
    pub fn new(evidence: DeviceEvidence) -> Self {
        Self {
            evidence,
            ..Default::default()
        }
    }

    pub fn ip(&self) -> &str {
        &self.evidence.ip
    }

    pub fn device_type(&self) -> &str {
        &self.identification.device_type
    }

    pub fn vendor(&self) -> &str {
        &self.identification.vendor
    }

    pub fn has_port(&self, port: u16) -> bool {
        self.evidence.open_ports.iter().any(|p| p.port == port)
    }
}

pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
