//! Device-type specific deep scans, the generic probe for unidentified devices, vendor
//! extraction from deep-scan data and model detection.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::collectors::{HttpProber, PortScanner};
use crate::error::Result;
use crate::http_probe::HttpProbe;
use crate::netdetect::validate_target_ip;
use crate::security::ssdp_search;
use crate::types::{truncate_chars, Confidence, HttpInfo, Severity};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeepScanKind {
    Router,
    Iot,
    Storage,
    Generic,
}

impl DeepScanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeepScanKind::Router => "router",
            DeepScanKind::Iot => "iot",
            DeepScanKind::Storage => "storage",
            DeepScanKind::Generic => "generic",
        }
    }
}

impl fmt::Display for DeepScanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PortRule {
    pub port: u16,
    pub service: &'static str,
    pub note: &'static str,
    pub severity: Severity,
}

const fn rule(port: u16, service: &'static str, note: &'static str, severity: Severity) -> PortRule {
    PortRule { port, service, note, severity }
}

const ROUTER_PORTS: &[PortRule] = &[
    rule(23, "Telnet", "CRITICAL - Telnet is unencrypted, disable immediately", Severity::Critical),
    rule(80, "HTTP Admin", "Consider HTTPS-only access", Severity::Medium),
    rule(443, "HTTPS Admin", "Good - encrypted admin access", Severity::Low),
    rule(53, "DNS", "Router providing DNS - check for DNS rebinding protection", Severity::Low),
    rule(67, "DHCP", "DHCP server active", Severity::Low),
    rule(161, "SNMP", "HIGH - SNMP can leak network info, ensure SNMPv3 or disable", Severity::High),
    rule(1900, "UPnP", "MEDIUM - UPnP can be exploited, consider disabling", Severity::Medium),
    rule(5000, "UPnP/SSDP", "UPnP discovery active", Severity::Medium),
    rule(8080, "Alt HTTP", "Alternative admin port - ensure secured", Severity::Medium),
    rule(8443, "Alt HTTPS", "Alternative secure admin port", Severity::Low),
    rule(7547, "TR-069", "CRITICAL - ISP remote management, potential backdoor", Severity::Critical),
];

const IOT_PORTS: &[PortRule] = &[
    rule(23, "Telnet", "CRITICAL - Many IoT devices have default telnet credentials", Severity::Critical),
    rule(80, "HTTP", "Web interface - check for firmware updates", Severity::Medium),
    rule(443, "HTTPS", "Secure web interface", Severity::Low),
    rule(554, "RTSP", "Video streaming - ensure authentication enabled", Severity::High),
    rule(1883, "MQTT", "CRITICAL - Unencrypted MQTT, use 8883 with TLS", Severity::Critical),
    rule(8883, "MQTT-TLS", "Good - encrypted MQTT", Severity::Low),
    rule(5683, "CoAP", "IoT protocol - check authentication", Severity::Medium),
    rule(8080, "Alt HTTP", "Alternative web port", Severity::Medium),
    rule(9999, "Common IoT", "Generic IoT port - investigate", Severity::Medium),
    rule(49152, "UPnP", "UPnP port - common on IoT", Severity::Medium),
];

const STORAGE_PORTS: &[PortRule] = &[
    rule(21, "FTP", "HIGH - FTP is unencrypted, use SFTP instead", Severity::High),
    rule(22, "SSH/SFTP", "Good - secure file transfer", Severity::Low),
    rule(80, "HTTP Admin", "Web admin interface", Severity::Medium),
    rule(443, "HTTPS Admin", "Secure web admin", Severity::Low),
    rule(139, "NetBIOS", "Windows sharing - legacy protocol", Severity::Medium),
    rule(445, "SMB", "File sharing - ensure SMBv3, disable SMBv1", Severity::High),
    rule(548, "AFP", "Apple Filing Protocol", Severity::Low),
    rule(2049, "NFS", "Network File System - check export permissions", Severity::High),
    rule(5000, "Synology DSM", "Synology admin port", Severity::Medium),
    rule(5001, "Synology DSM SSL", "Synology secure admin", Severity::Low),
    rule(8080, "QNAP QTS", "QNAP admin port", Severity::Medium),
];

/// Ports checked by the generic probe, with the service each one hints at.
const PROBE_PORTS: &[(u16, &str)] = &[
    (80, "HTTP"),
    (443, "HTTPS"),
    (8080, "HTTP-Alt"),
    (8443, "HTTPS-Alt"),
    (22, "SSH"),
    (23, "Telnet"),
    (3389, "RDP"),
    (5900, "VNC"),
    (21, "FTP"),
    (445, "SMB"),
    (139, "NetBIOS"),
    (2049, "NFS"),
    (3306, "MySQL"),
    (5432, "PostgreSQL"),
    (27017, "MongoDB"),
    (6379, "Redis"),
    (1883, "MQTT"),
    (8883, "MQTT-TLS"),
    (5353, "mDNS"),
    (1900, "UPnP"),
    (554, "RTSP"),
    (8008, "Chromecast"),
    (9000, "Sonos"),
    (9100, "Print"),
    (631, "IPP"),
    (548, "AFP"),
    (62078, "iPhone-Sync"),
    (3074, "Xbox"),
    (9295, "PlayStation"),
];

/// Text protocols whose greeting is worth keeping.
const TEXT_BANNER_PORTS: &[u16] = &[21, 22, 23, 25, 110, 143];

pub fn port_rules(kind: DeepScanKind) -> &'static [PortRule] {
    match kind {
        DeepScanKind::Router => ROUTER_PORTS,
        DeepScanKind::Iot => IOT_PORTS,
        DeepScanKind::Storage => STORAGE_PORTS,
        DeepScanKind::Generic => &[],
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeepFinding {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub note: String,
    pub severity: Severity,
}

impl DeepFinding {
    fn note(note: impl Into<String>) -> Self {
        Self {
            port: None,
            service: None,
            note: note.into(),
            severity: Severity::Low,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AdminAuth {
    /// The admin page rendered without credentials.
    Open,
    PasswordProtected,
    Status(u16),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AdminPage {
    pub server: Option<String>,
    pub title: Option<String>,
    pub vendor: Option<String>,
    pub auth: AdminAuth,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PossibleType {
    pub device_type: String,
    pub confidence: Confidence,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeepScanReport {
    pub kind: DeepScanKind,
    pub open_ports: Vec<u16>,
    pub findings: Vec<DeepFinding>,
    #[serde(default)]
    pub http_info: HttpInfo,
    #[serde(default)]
    pub banners: BTreeMap<u16, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_page: Option<AdminPage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub possible_type: Option<PossibleType>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl DeepScanReport {
    fn new(kind: DeepScanKind) -> Self {
        Self {
            kind,
            open_ports: Vec::new(),
            findings: Vec::new(),
            http_info: HttpInfo::default(),
            banners: BTreeMap::new(),
            admin_page: None,
            possible_type: None,
            recommendations: Vec::new(),
        }
    }
}

/// Recommendations for a typed deep scan, most severe first.
pub fn recommendations(kind: DeepScanKind, open: &[u16]) -> Vec<String> {
    let has = |p: u16| open.contains(&p);
    let mut recs = Vec::new();
    let mut push = |cond: bool, text: &str| {
        if cond {
            recs.push(text.to_string());
        }
    };
    match kind {
        DeepScanKind::Router => {
            push(has(23), "CRITICAL: Disable Telnet immediately and use SSH instead");
            push(has(7547), "CRITICAL: TR-069 port open - contact ISP about disabling remote management");
            push(has(161), "HIGH: Disable SNMP or upgrade to SNMPv3 with authentication");
            push(has(1900) || has(5000), "MEDIUM: Consider disabling UPnP to prevent port forwarding exploits");
            push(has(80) && !has(443), "MEDIUM: Enable HTTPS for admin access and disable HTTP");
            push(true, "Change default admin password if not already done");
            push(true, "Keep router firmware updated");
        }
        DeepScanKind::Iot => {
            push(has(23), "CRITICAL: Disable Telnet - IoT devices are prime botnet targets");
            push(has(1883), "CRITICAL: Use MQTT over TLS (port 8883) instead of unencrypted MQTT");
            push(has(554), "HIGH: Ensure RTSP streaming requires authentication");
            push(true, "Check for firmware updates regularly");
            push(true, "Disable cloud features if not needed");
            push(true, "Place IoT devices on a separate network/VLAN");
        }
        DeepScanKind::Storage => {
            push(has(21), "CRITICAL: Disable FTP and use SFTP instead");
            push(has(445), "HIGH: Ensure SMBv1 is disabled, use SMBv3 only");
            push(has(139), "HIGH: Consider disabling NetBIOS if not needed");
            push(has(2049), "MEDIUM: Review NFS export permissions");
            push(true, "Enable encryption for data at rest");
            push(true, "Set up regular backup verification");
            push(true, "Keep NAS firmware updated");
        }
        DeepScanKind::Generic => {}
    }
    recs
}

/// Best guess at a device type from ports first, then banners.
pub fn infer_possible_type(
    ports: &[u16],
    banners: &BTreeMap<u16, String>,
) -> Option<(&'static str, Confidence, String)> {
    let has = |p: u16| ports.contains(&p);
    let rule = if has(3389) {
        Some(("Windows PC", Confidence::High, "RDP port open - likely Windows machine"))
    } else if has(548) || has(62078) {
        Some(("Apple Device", Confidence::High, "Apple-specific ports detected"))
    } else if has(3306) || has(5432) || has(27017) {
        Some(("Database Server", Confidence::High, "Database port exposed - security risk"))
    } else if has(9100) || has(631) {
        Some(("Printer", Confidence::High, "Printer ports detected"))
    } else if has(554) {
        Some(("IP Camera", Confidence::High, "RTSP streaming port - likely camera"))
    } else if has(8008) {
        Some(("Chromecast / Smart Display", Confidence::High, "Chromecast port detected"))
    } else if has(9000) {
        Some(("Sonos Speaker", Confidence::Medium, "Sonos control port detected"))
    } else if has(1883) || has(8883) {
        Some(("IoT Device", Confidence::Medium, "MQTT broker/client detected"))
    } else if has(3074) {
        Some(("Xbox Console", Confidence::High, "Xbox Live port detected"))
    } else if has(9295) {
        Some(("PlayStation Console", Confidence::Medium, "PlayStation port detected"))
    } else if has(22) && has(443) {
        Some(("Server", Confidence::Medium, "SSH + HTTPS - likely Linux server with web service"))
    } else if has(445) || has(139) {
        Some(("Windows PC or NAS", Confidence::Medium, "Windows file sharing ports detected"))
    } else {
        None
    };
    if let Some((t, c, why)) = rule {
        return Some((t, c, why.to_string()));
    }

    for (port, banner) in banners {
        let lower = banner.to_ascii_lowercase();
        if lower.contains("dropbear") {
            return Some(("IoT Device", Confidence::Medium, format!("Port {port}: Dropbear SSH (embedded device)")));
        }
        if lower.contains("mikrotik") {
            return Some(("Router/Gateway", Confidence::High, format!("Port {port}: MikroTik detected")));
        }
        if lower.contains("ubnt") || lower.contains("ubiquiti") {
            return Some(("Router/Gateway", Confidence::High, format!("Port {port}: Ubiquiti detected")));
        }
    }
    None
}

const SERVER_VENDORS: &[(&str, &str)] = &[
    ("mikrotik", "MikroTik"),
    ("tp-link", "TP-Link"),
    ("tplink", "TP-Link"),
    ("netgear", "NETGEAR"),
    ("linksys", "Linksys"),
    ("asus", "ASUS"),
    ("d-link", "D-Link"),
    ("dlink", "D-Link"),
    ("ubnt", "Ubiquiti"),
    ("ubiquiti", "Ubiquiti"),
    ("synology", "Synology"),
    ("qnap", "QNAP"),
    ("hikvision", "Hikvision"),
    ("dahua", "Dahua"),
    ("cisco", "Cisco"),
    ("huawei", "Huawei"),
    ("zyxel", "ZyXEL"),
    ("buffalo", "Buffalo"),
    ("western digital", "Western Digital"),
    ("wdmycloud", "Western Digital"),
    ("sonos", "Sonos"),
    ("philips", "Philips"),
    ("nest", "Google Nest"),
    ("ring", "Ring"),
    ("ecobee", "Ecobee"),
    ("roku", "Roku"),
    ("amazon", "Amazon"),
    ("apple", "Apple"),
];

fn vendor_in(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    SERVER_VENDORS
        .iter()
        .find(|(pattern, _)| lower.contains(pattern))
        .map(|(_, vendor)| *vendor)
}

/// Vendor named by deep-scan data: HTTP vendor, then server/title, then banners, then free-text
/// findings. Port-table notes are not searched since they name protocols, not vendors.
pub fn extract_vendor(report: &DeepScanReport) -> Option<String> {
    let http = &report.http_info;
    if let Some(v) = http.vendor.as_ref().filter(|v| !v.is_empty()) {
        return Some(v.clone());
    }
    for text in [http.server.as_deref(), http.title.as_deref()].into_iter().flatten() {
        if let Some(v) = vendor_in(text) {
            return Some(v.to_string());
        }
    }
    for banner in report.banners.values() {
        if let Some(v) = vendor_in(banner) {
            return Some(v.to_string());
        }
        if banner.to_ascii_lowercase().contains("dropbear") {
            return Some("Embedded Device".to_string());
        }
    }
    report
        .findings
        .iter()
        .filter(|f| f.port.is_none())
        .find_map(|f| vendor_in(&f.note))
        .map(str::to_string)
}

const VENDOR_URLS: &[(&str, &str)] = &[
    ("tp-link.com", "TP-Link"),
    ("netgear.com", "NETGEAR"),
    ("asus.com", "ASUS"),
    ("linksys.com", "Linksys"),
    ("dlink.com", "D-Link"),
    ("mikrotik.com", "MikroTik"),
    ("ubnt.com", "Ubiquiti"),
    ("ui.com", "Ubiquiti"),
    ("synology.com", "Synology"),
    ("qnap.com", "QNAP"),
];

pub fn vendor_from_page(body: &str) -> Option<&'static str> {
    let lower = body.to_lowercase();
    VENDOR_URLS
        .iter()
        .find(|(url, _)| lower.contains(url))
        .map(|(_, vendor)| *vendor)
}

fn meta_refresh_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)url=([^"'>\s]+)"#).expect("refresh regex"))
}

/// Relative target of a meta refresh on a short landing page.
pub fn meta_refresh_path(body: &str) -> Option<String> {
    if body.len() >= 500 {
        return None;
    }
    let target = meta_refresh_re().captures(body)?.get(1)?.as_str().trim();
    if target.is_empty() || target.to_ascii_lowercase().starts_with("http") {
        return None;
    }
    Some(if target.starts_with('/') {
        target.to_string()
    } else {
        format!("/{target}")
    })
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelSource {
    Upnp,
    Http,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelInfo {
    pub model: Option<String>,
    pub firmware: Option<String>,
    pub source: Option<ModelSource>,
}

enum DescriptionField {
    Model,
    Firmware,
}

/// `modelName` and `firmwareVersion` from a UPnP device description. The first occurrence
/// wins, which is the root device; embedded devices follow it.
pub fn parse_device_description(xml: &str) -> ModelInfo {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut buf = Vec::new();
    let mut field: Option<DescriptionField> = None;
    let mut text = String::new();
    let mut model: Option<String> = None;
    let mut firmware: Option<String> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                field = match e.local_name().as_ref() {
                    b"modelName" if model.is_none() => Some(DescriptionField::Model),
                    b"firmwareVersion" if firmware.is_none() => Some(DescriptionField::Firmware),
                    _ => None,
                };
                text.clear();
            }
            Ok(Event::Text(t)) if field.is_some() => match t.unescape() {
                Ok(v) => text.push_str(&v),
                Err(e) => debug!(error = %e, "bad escape in device description"),
            },
            Ok(Event::CData(c)) if field.is_some() => text.push_str(&String::from_utf8_lossy(&c)),
            Ok(Event::End(_)) => {
                let value = Some(text.trim().to_string()).filter(|v| !v.is_empty());
                match field.take() {
                    Some(DescriptionField::Model) => model = value,
                    Some(DescriptionField::Firmware) => firmware = value,
                    None => {}
                }
                text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                debug!(error = %e, "device description is not well-formed");
                break;
            }
            _ => {}
        }
        buf.clear();
    }

    ModelInfo {
        source: model.as_ref().map(|_| ModelSource::Upnp),
        model,
        firmware,
    }
}

fn model_res() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            r"(?i)model[:\s]+([A-Z0-9]+-?[A-Z0-9]+)",
            r"(?i)(Archer\s*[A-Z0-9]+)",
            r"(?i)(RT-[A-Z0-9]+)",
            r"(?i)(WRT[A-Z0-9]+)",
            r"(?i)(R[0-9]{4})",
            r"(?i)(DIR-[0-9]+)",
            r"(?i)(DS[0-9]{3,})",
            r"(?i)(TS-[0-9]+)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("model regex"))
        .collect()
    })
}

fn firmware_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)firmware[:\s]*v?([0-9]+\.[0-9]+[^\s<"']*)"#).expect("firmware regex")
    })
}

/// Model and firmware strings scraped from a device web page.
pub fn scrape_model(html: &str) -> ModelInfo {
    let model = model_res()
        .iter()
        .find_map(|re| re.captures(html).and_then(|c| c.get(1)))
        .map(|m| m.as_str().trim().to_string());
    ModelInfo {
        source: model.as_ref().map(|_| ModelSource::Http),
        model,
        firmware: firmware_re()
            .captures(html)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string()),
    }
}

/// Runs deep scans through the shared port scanner; HTTP work is skipped when no probe is set.
#[derive(Clone)]
pub struct DeepScanner {
    ports: Arc<dyn PortScanner>,
    http: Option<HttpProbe>,
    connect_timeout: Duration,
    probe_timeout: Duration,
    ssdp_timeout: Duration,
}

impl DeepScanner {
    pub fn new(ports: Arc<dyn PortScanner>, http: Option<HttpProbe>, connect_timeout: Duration) -> Self {
        Self {
            ports,
            http,
            connect_timeout,
            probe_timeout: Duration::from_millis(500),
            ssdp_timeout: Duration::from_secs(2),
        }
    }

    /// Router, IoT or storage scan over the kind's port table.
    pub async fn scan(&self, kind: DeepScanKind, ip: &str) -> Result<DeepScanReport> {
        let addr = validate_target_ip(ip)?;
        let rules = port_rules(kind);
        let wanted: Vec<u16> = rules.iter().map(|r| r.port).collect();
        let observed = self.ports.scan_ports(addr, &wanted, self.connect_timeout).await?;

        let mut report = DeepScanReport::new(kind);
        for r in rules {
            if observed.iter().any(|o| o.port == r.port && o.is_open) {
                report.open_ports.push(r.port);
                report.findings.push(DeepFinding {
                    port: Some(r.port),
                    service: Some(r.service.to_string()),
                    note: r.note.to_string(),
                    severity: r.severity,
                });
            }
        }

        if kind == DeepScanKind::Router {
            if let Some(admin) = self.check_admin_page(ip).await {
                let note = match admin.auth {
                    AdminAuth::Open => "WARNING - No authentication on admin page".to_string(),
                    AdminAuth::PasswordProtected => "Admin page is password protected".to_string(),
                    AdminAuth::Status(code) => format!("Admin page answered HTTP {code}"),
                };
                report.findings.push(DeepFinding {
                    port: None,
                    service: Some("http_auth".to_string()),
                    note,
                    severity: if admin.auth == AdminAuth::Open { Severity::High } else { Severity::Low },
                });
                report.http_info = HttpInfo {
                    server: admin.server.clone(),
                    title: admin.title.clone(),
                    vendor: admin.vendor.clone(),
                };
                report.admin_page = Some(admin);
            }
        }

        report.recommendations = recommendations(kind, &report.open_ports);
        info!(ip, %kind, open = report.open_ports.len(), "deep scan finished");
        Ok(report)
    }

    /// Identify a device nothing else recognised. `known_ports` are taken as open without
    /// probing again.
    pub async fn probe_unknown(
        &self,
        ip: &str,
        known_ports: &[u16],
        known_banners: &BTreeMap<u16, String>,
    ) -> Result<DeepScanReport> {
        let addr = validate_target_ip(ip)?;
        let to_probe: Vec<u16> = PROBE_PORTS
            .iter()
            .map(|(p, _)| *p)
            .filter(|p| !known_ports.contains(p))
            .collect();
        let observed = self.ports.scan_ports(addr, &to_probe, self.probe_timeout).await?;

        let mut report = DeepScanReport::new(DeepScanKind::Generic);
        report.open_ports = known_ports.to_vec();
        for o in observed.iter().filter(|o| o.is_open) {
            report.open_ports.push(o.port);
        }
        report.open_ports.sort_unstable();
        report.open_ports.dedup();

        for &port in TEXT_BANNER_PORTS.iter().filter(|p| report.open_ports.contains(p)) {
            let banner = observed
                .iter()
                .find(|o| o.port == port)
                .and_then(|o| o.banner.clone())
                .or_else(|| known_banners.get(&port).cloned());
            if let Some(b) = banner.filter(|b| !b.is_empty()) {
                report.banners.insert(port, truncate_chars(&b, 100));
            }
        }

        if let Some((device_type, confidence, why)) = infer_possible_type(&report.open_ports, &report.banners) {
            report.findings.push(DeepFinding::note(why));
            report.possible_type = Some(PossibleType {
                device_type: device_type.to_string(),
                confidence,
            });
        }

        if let Some(http) = &self.http {
            if let Some(port) = [80u16, 8080].into_iter().find(|p| report.open_ports.contains(p)) {
                report.http_info = http.probe_http(ip, port).await.unwrap_or_default();
            }
        }

        if report.findings.is_empty() {
            report
                .findings
                .push(DeepFinding::note("No identifying features found - device may be firewalled"));
        }
        debug!(ip, open = ?report.open_ports, possible = ?report.possible_type, "generic probe finished");
        Ok(report)
    }

    /// Admin page on port 80: server, title, vendor and whether it asks for credentials.
    async fn check_admin_page(&self, ip: &str) -> Option<AdminPage> {
        let http = self.http.as_ref()?;
        let mut page = match http.fetch(ip, &format!("http://{ip}/")).await {
            Ok(p) => p,
            Err(e) => {
                debug!(ip, error = %e, "admin page unreachable");
                return None;
            }
        };
        let server = page.server.clone();
        let auth = match page.status {
            200..=299 => AdminAuth::Open,
            401 => AdminAuth::PasswordProtected,
            code => AdminAuth::Status(code),
        };
        if let Some(path) = meta_refresh_path(&page.body) {
            if let Ok(next) = http.fetch(ip, &format!("http://{ip}{path}")).await {
                page = next;
            }
        }
        let title = page.title().map(|t| truncate_chars(&t, 100));
        Some(AdminPage {
            server,
            vendor: vendor_from_page(&page.body).map(str::to_string),
            title,
            auth,
        })
    }

    /// Model and firmware from UPnP first, then the root web page.
    pub async fn detect_model(&self, ip: &str) -> ModelInfo {
        let Ok(addr) = validate_target_ip(ip) else {
            return ModelInfo::default();
        };
        let Some(http) = &self.http else {
            return ModelInfo::default();
        };

        let mut info = ModelInfo::default();
        if let Some(location) = ssdp_search(addr, self.ssdp_timeout).await.and_then(|r| r.location) {
            match http.fetch(ip, &location).await {
                Ok(page) => info = parse_device_description(&page.body),
                Err(e) => debug!(ip, %location, error = %e, "device description fetch failed"),
            }
        }
        if info.model.is_some() {
            return info;
        }

        match http.fetch(ip, &format!("http://{ip}/")).await {
            Ok(page) => {
                let scraped = scrape_model(&page.body);
                ModelInfo {
                    firmware: scraped.firmware.or(info.firmware),
                    ..scraped
                }
            }
            Err(_) => info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::PortObservation;
    use crate::error::Error;
    use async_trait::async_trait;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakePorts {
        open: Vec<PortObservation>,
        calls: AtomicUsize,
    }

    impl FakePorts {
        fn new(open: Vec<PortObservation>) -> Arc<Self> {
            Arc::new(Self { open, calls: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl PortScanner for FakePorts {
        async fn scan_ports(&self, _ip: IpAddr, ports: &[u16], _t: Duration) -> Result<Vec<PortObservation>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .open
                .iter()
                .filter(|o| ports.contains(&o.port))
                .cloned()
                .collect())
        }
    }

    fn scanner(ports: Arc<FakePorts>) -> DeepScanner {
        DeepScanner::new(ports, None, Duration::from_millis(100))
    }

    #[tokio::test]
    async fn router_scan_reports_table_findings() {
        let ports = FakePorts::new(vec![
            PortObservation::open(23),
            PortObservation::open(80),
            PortObservation::open(7547),
            PortObservation::open(22),
        ]);
        let report = scanner(ports).scan(DeepScanKind::Router, "192.168.1.1").await.unwrap();
        assert_eq!(report.open_ports, vec![23, 80, 7547]);
        assert_eq!(report.findings[0].severity, Severity::Critical);
        assert_eq!(report.findings[2].service.as_deref(), Some("TR-069"));
        assert!(report.recommendations[0].starts_with("CRITICAL: Disable Telnet"));
        assert!(report
            .recommendations
            .iter()
            .any(|r| r.contains("Enable HTTPS for admin access")));
    }

    #[tokio::test]
    async fn invalid_target_is_rejected_before_scanning() {
        let ports = FakePorts::new(vec![]);
        let err = scanner(ports.clone())
            .scan(DeepScanKind::Iot, "8.8.8.8")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTarget(_)));
        assert_eq!(ports.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn generic_probe_merges_known_ports_and_banners() {
        let ports = FakePorts::new(vec![
            PortObservation::open(22).with_banner("SSH-2.0-dropbear_2019.78"),
            PortObservation::open(8080),
        ]);
        let known = BTreeMap::new();
        let report = scanner(ports)
            .probe_unknown("192.168.1.40", &[554], &known)
            .await
            .unwrap();
        assert_eq!(report.kind, DeepScanKind::Generic);
        assert_eq!(report.open_ports, vec![22, 554, 8080]);
        assert_eq!(report.banners.get(&22).map(String::as_str), Some("SSH-2.0-dropbear_2019.78"));
        let possible = report.possible_type.unwrap();
        assert_eq!(possible.device_type, "IP Camera");
        assert_eq!(possible.confidence, Confidence::High);
    }

    #[tokio::test]
    async fn generic_probe_with_nothing_open() {
        let report = scanner(FakePorts::new(vec![]))
            .probe_unknown("192.168.1.41", &[], &BTreeMap::new())
            .await
            .unwrap();
        assert!(report.open_ports.is_empty());
        assert!(report.possible_type.is_none());
        assert!(report.findings[0].note.contains("firewalled"));
    }

    #[test]
    fn possible_type_rules() {
        let none = BTreeMap::new();
        assert_eq!(infer_possible_type(&[3389, 554], &none).unwrap().0, "Windows PC");
        assert_eq!(infer_possible_type(&[22, 443], &none).unwrap().0, "Server");
        assert_eq!(infer_possible_type(&[80], &none), None);
        let banners = BTreeMap::from([(22, "RouterOS MikroTik".to_string())]);
        assert_eq!(infer_possible_type(&[22], &banners).unwrap().0, "Router/Gateway");
    }

    #[test]
    fn vendor_extraction_order() {
        let mut report = DeepScanReport::new(DeepScanKind::Generic);
        assert_eq!(extract_vendor(&report), None);

        report.findings.push(DeepFinding {
            port: Some(548),
            service: Some("AFP".into()),
            note: "Apple Filing Protocol".into(),
            severity: Severity::Low,
        });
        assert_eq!(extract_vendor(&report), None);

        report.banners.insert(22, "SSH-2.0-dropbear".into());
        assert_eq!(extract_vendor(&report).as_deref(), Some("Embedded Device"));

        report.http_info.title = Some("NETGEAR Router R7000".into());
        assert_eq!(extract_vendor(&report).as_deref(), Some("NETGEAR"));

        report.http_info.vendor = Some("TP-Link".into());
        assert_eq!(extract_vendor(&report).as_deref(), Some("TP-Link"));
    }

    #[test]
    fn admin_page_helpers() {
        assert_eq!(
            meta_refresh_path(r#"<meta http-equiv="refresh" content="0; URL=login.htm">"#).as_deref(),
            Some("/login.htm")
        );
        assert_eq!(meta_refresh_path(r#"<meta content="0; url=http://x/">"#), None);
        assert_eq!(vendor_from_page("see www.tp-link.com for help"), Some("TP-Link"));
    }

    #[test]
    fn model_from_description_and_page() {
        let xml = "<root><device><modelName>RT-AC68U</modelName>\
                   <firmwareVersion>3.0.0.4</firmwareVersion></device></root>";
        let info = parse_device_description(xml);
        assert_eq!(info.model.as_deref(), Some("RT-AC68U"));
        assert_eq!(info.firmware.as_deref(), Some("3.0.0.4"));
        assert_eq!(info.source, Some(ModelSource::Upnp));

        let html = "<html><title>TP-LINK</title><div>Archer C7</div><span>Firmware: v3.15.3_build</span>";
        let info = scrape_model(html);
        assert_eq!(info.model.as_deref(), Some("Archer C7"));
        assert_eq!(info.firmware.as_deref(), Some("3.15.3_build"));
        assert_eq!(info.source, Some(ModelSource::Http));

        assert_eq!(scrape_model("<html>hello</html>"), ModelInfo::default());
    }

    #[test]
    fn description_text_is_unescaped() {
        let entity = "<root><device><modelName>AT&amp;T Gateway</modelName></device></root>";
        assert_eq!(parse_device_description(entity).model.as_deref(), Some("AT&T Gateway"));

        let attr = r#"<root><device><modelName xml:lang="en">RT-AX88U</modelName></device></root>"#;
        assert_eq!(parse_device_description(attr).model.as_deref(), Some("RT-AX88U"));

        let cdata = "<root><device><modelName><![CDATA[Archer C7]]></modelName>\
                     <firmwareVersion><![CDATA[1.0 <beta>]]></firmwareVersion></device></root>";
        let info = parse_device_description(cdata);
        assert_eq!(info.model.as_deref(), Some("Archer C7"));
        assert_eq!(info.firmware.as_deref(), Some("1.0 <beta>"));
    }

    #[test]
    fn root_device_wins_over_embedded_ones() {
        let xml = r#"<root xmlns="urn:schemas-upnp-org:device-1-0"><device>
                       <modelName>Nighthawk R7000</modelName>
                       <deviceList><device><modelName>WANDevice</modelName></device></deviceList>
                     </device></root>"#;
        let info = parse_device_description(xml);
        assert_eq!(info.model.as_deref(), Some("Nighthawk R7000"));
        assert_eq!(info.firmware, None);
        assert_eq!(parse_device_description("<root><modelName>x").model, None);
    }
}
