use anyhow::{bail, Context};
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::types::Severity;

/// Service name, transport and exposure risk of a well-known port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: &'static str,
    pub protocol: &'static str,
    pub risk: Severity,
}

const fn svc(name: &'static str, protocol: &'static str, risk: Severity) -> ServiceInfo {
    ServiceInfo { name, protocol, risk }
}

const CATALOG: &[(u16, ServiceInfo)] = &[
    (21, svc("FTP", "tcp", Severity::High)),
    (22, svc("SSH", "tcp", Severity::Medium)),
    (23, svc("Telnet", "tcp", Severity::Critical)),
    (25, svc("SMTP", "tcp", Severity::Medium)),
    (53, svc("DNS", "udp", Severity::Low)),
    (80, svc("HTTP", "tcp", Severity::Medium)),
    (110, svc("POP3", "tcp", Severity::High)),
    (111, svc("RPC", "tcp", Severity::High)),
    (135, svc("MSRPC", "tcp", Severity::High)),
    (139, svc("NetBIOS", "tcp", Severity::High)),
    (143, svc("IMAP", "tcp", Severity::High)),
    (443, svc("HTTPS", "tcp", Severity::Low)),
    (445, svc("SMB", "tcp", Severity::Critical)),
    (993, svc("IMAPS", "tcp", Severity::Low)),
    (995, svc("POP3S", "tcp", Severity::Low)),
    (1433, svc("MSSQL", "tcp", Severity::High)),
    (1521, svc("Oracle", "tcp", Severity::High)),
    (3306, svc("MySQL", "tcp", Severity::High)),
    (3389, svc("RDP", "tcp", Severity::High)),
    (5432, svc("PostgreSQL", "tcp", Severity::High)),
    (5900, svc("VNC", "tcp", Severity::High)),
    (6379, svc("Redis", "tcp", Severity::High)),
    (8080, svc("HTTP-Alt", "tcp", Severity::Medium)),
    (8443, svc("HTTPS-Alt", "tcp", Severity::Low)),
    (27017, svc("MongoDB", "tcp", Severity::High)),
];

const UNKNOWN_SERVICE: ServiceInfo = svc("Unknown", "tcp", Severity::Medium);

/// Ports scanned per device by default: basic services, admin/NAS, IoT/streaming/Apple.
pub const QUICK_PORTS: &[u16] = &[
    21, 22, 23, 80, 443, 445, 548, 3389, 5000, 5001, 8080, 8443, 554, 1883, 8008, 9000, 62078,
];

/// Database listeners worth a finding when reachable.
pub const DATABASE_PORTS: &[u16] = &[1433, 1521, 3306, 5432, 6379, 27017];

/// Catalog entry for `port`; unknown ports are reported as medium risk.
pub fn service_info(port: u16) -> ServiceInfo {
    CATALOG
        .iter()
        .find(|(p, _)| *p == port)
        .map(|(_, info)| *info)
        .unwrap_or(UNKNOWN_SERVICE)
}

pub fn quick_ports() -> Vec<u16> {
    QUICK_PORTS.to_vec()
}

/// Every port in the service catalog.
pub fn full_ports() -> Vec<u16> {
    CATALOG.iter().map(|(p, _)| *p).collect()
}

/// Reject ports outside 1..=65535 before any I/O.
pub fn validate_port(port: u32) -> Result<u16> {
    if port == 0 || port > 65535 {
        return Err(Error::InvalidPort(format!("{port} out of range (1-65535)")));
    }
    Ok(port as u16)
}

/// Parse a ports file content into a deduplicated list of TCP ports (1..=65535).
///
/// Supported formats per line:
/// - single port number: `80`
/// - inclusive range: `8000-8010`
/// - comments: everything after `#` is ignored
/// - whitespace and blank lines are ignored
pub fn parse_ports_str(s: &str) -> anyhow::Result<Vec<u16>> {
    let mut out: Vec<u16> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().map(str::trim).unwrap_or("");
        if line.is_empty() {
            continue;
        }

        if let Some((a, b)) = line.split_once('-') {
            let start = parse_port_str(a.trim())
                .with_context(|| format!("line {line_no}: invalid start in range: {a}"))?;
            let end = parse_port_str(b.trim())
                .with_context(|| format!("line {line_no}: invalid end in range: {b}"))?;
            if start > end {
                bail!("line {line_no}: invalid range {start}-{end} (start > end)");
            }
            out.extend((start..=end).filter(|p| seen.insert(*p)));
            continue;
        }

        let p = parse_port_str(line)
            .with_context(|| format!("line {line_no}: invalid port value: {line}"))?;
        if seen.insert(p) {
            out.push(p);
        }
    }

    Ok(out)
}

pub fn load_ports_from_path(path: impl AsRef<Path>) -> anyhow::Result<Vec<u16>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read ports file: {}", path.as_ref().display()))?;
    parse_ports_str(&content)
}

fn parse_port_str(s: &str) -> anyhow::Result<u16> {
    let val: u32 = s.parse::<u32>()?;
    Ok(validate_port(val)?)
}
