//! Device security checks: transport encryption, firmware age, UPnP exposure and DNS hijack
//! indicators. Every check degrades to a finding instead of failing.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use native_tls::{Protocol, TlsConnector};
use serde::{Deserialize, Serialize};
use time::format_description::FormatItem;
use time::{OffsetDateTime, PrimitiveDateTime};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;
use trust_dns_resolver::config::{NameServerConfig, Protocol as DnsProtocol, ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::TokioAsyncResolver;

use crate::error::{Error, Result};
use crate::http_probe::HttpProbe;
use crate::rate_limit::RateLimiter;
use crate::types::Severity;

pub const SSDP_SEARCH: &str = "M-SEARCH * HTTP/1.1\r\n\
                               HOST: 239.255.255.250:1900\r\n\
                               MAN: \"ssdp:discover\"\r\n\
                               MX: 1\r\n\
                               ST: upnp:rootdevice\r\n\r\n";

/// Headers of interest from an SSDP search reply.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SsdpReply {
    pub location: Option<String>,
    pub server: Option<String>,
    pub st: Option<String>,
}

pub fn parse_ssdp_reply(text: &str) -> SsdpReply {
    let mut reply = SsdpReply::default();
    for line in text.lines() {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = Some(value.trim().to_string()).filter(|v| !v.is_empty());
        match name.trim().to_ascii_lowercase().as_str() {
            "location" => reply.location = value,
            "server" => reply.server = value,
            "st" => reply.st = value,
            _ => {}
        }
    }
    reply
}

/// Unicast `upnp:rootdevice` search against one host.
pub async fn ssdp_search(ip: IpAddr, wait: Duration) -> Option<SsdpReply> {
    let bind: SocketAddr = match ip {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (std::net::Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind).await.ok()?;
    socket.send_to(SSDP_SEARCH.as_bytes(), (ip, 1900)).await.ok()?;
    let mut buf = [0u8; 4096];
    match timeout(wait, socket.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) if len > 0 => Some(parse_ssdp_reply(&String::from_utf8_lossy(&buf[..len]))),
        _ => None,
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateStatus {
    /// `Some(true)` when the chain verified against the system roots.
    pub valid: Option<bool>,
    pub self_signed: Option<bool>,
    pub not_after: Option<String>,
    pub days_until_expiry: Option<i64>,
    pub error: Option<String>,
}

/// What the TLS handshakes against one port revealed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsObservation {
    pub verified: bool,
    pub modern: bool,
    pub legacy: bool,
    pub not_after: Option<OffsetDateTime>,
    pub self_signed: Option<bool>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptionCheck {
    pub accepts_unencrypted: bool,
    pub tls_port: Option<u16>,
    pub tls_version: Option<String>,
    pub legacy_tls: bool,
    pub certificate: CertificateStatus,
    pub findings: Vec<String>,
    pub risk: Severity,
}

impl EncryptionCheck {
    pub fn evaluate(
        accepts_unencrypted: bool,
        tls_port: Option<u16>,
        tls: Option<TlsObservation>,
        now: OffsetDateTime,
    ) -> Self {
        let mut check = EncryptionCheck {
            accepts_unencrypted,
            tls_port,
            ..Default::default()
        };
        if accepts_unencrypted {
            check
                .findings
                .push("Device accepts unencrypted HTTP connections".to_string());
            check.risk = Severity::Medium;
        }
        let Some(tls) = tls.filter(|t| t.modern || t.legacy) else {
            return check;
        };

        check.certificate.valid = Some(tls.verified);
        check.certificate.self_signed = tls.self_signed;
        if !tls.verified {
            check.certificate.error = Some("Self-signed or invalid certificate".to_string());
            check
                .findings
                .push("Self-signed or invalid SSL certificate".to_string());
        }
        if let Some(not_after) = tls.not_after {
            let days = (not_after - now).whole_days();
            check.certificate.not_after = not_after
                .format(&time::format_description::well_known::Rfc3339)
                .ok();
            check.certificate.days_until_expiry = Some(days);
            if not_after < now {
                check
                    .findings
                    .push(format!("Certificate expired {} days ago", -days));
                check.risk = check.risk.max(Severity::Medium);
            } else if days <= 30 {
                check.findings.push(format!("Certificate expires in {days} days"));
            }
        }

        check.legacy_tls = tls.legacy;
        if tls.legacy {
            check.tls_version = Some(if tls.modern { "TLSv1.2+" } else { "TLSv1.0/1.1" }.to_string());
            check
                .findings
                .push("Accepts outdated TLS 1.0/1.1 - vulnerable to downgrade attacks".to_string());
            check.risk = Severity::High;
        } else {
            check.tls_version = Some("TLSv1.2+".to_string());
            check.findings.push("Using TLS 1.2 or newer - acceptable".to_string());
        }
        check
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct FirmwareCheck {
    pub last_modified: Option<String>,
    pub age_days: Option<i64>,
    pub versions_found: Vec<String>,
    pub findings: Vec<String>,
    pub risk: Severity,
}

const OUTDATED_SOFTWARE: &[(&str, &str)] = &[
    ("apache/2.0", "Apache 2.0"),
    ("apache/2.2", "Apache 2.2"),
    ("nginx/1.0", "nginx 1.0"),
    ("nginx/1.1", "nginx 1.1"),
    ("openssh_5", "OpenSSH 5.x"),
    ("openssh_6", "OpenSSH 6.x"),
    ("php/5", "PHP 5.x"),
    ("dropbear_0", "Dropbear 0.x"),
];

const UNDETERMINED_FIRMWARE: &str = "Could not determine firmware/software versions";

fn http_date_format() -> &'static [FormatItem<'static>] {
    static FMT: OnceLock<Vec<FormatItem<'static>>> = OnceLock::new();
    FMT.get_or_init(|| {
        time::format_description::parse(
            "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT",
        )
        .expect("http date format")
    })
}

/// Parse an IMF-fixdate (`Wed, 21 Oct 2015 07:28:00 GMT`).
pub fn parse_http_date(value: &str) -> Option<OffsetDateTime> {
    PrimitiveDateTime::parse(value.trim(), http_date_format())
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

impl FirmwareCheck {
    pub fn evaluate(last_modified: Option<&str>, server: Option<&str>, now: OffsetDateTime) -> Self {
        let mut check = FirmwareCheck {
            last_modified: last_modified.map(str::to_string),
            ..Default::default()
        };
        if let Some(modified) = last_modified.and_then(parse_http_date) {
            let days = (now - modified).whole_days();
            check.age_days = Some(days);
            if days > 365 {
                check.findings.push(format!(
                    "Content last modified {days} days ago - may indicate outdated firmware"
                ));
                check.risk = Severity::Medium;
            } else if days > 180 {
                check
                    .findings
                    .push(format!("Content last modified {days} days ago - check for updates"));
            }
        }
        let server = server.unwrap_or_default().to_ascii_lowercase();
        for (pattern, name) in OUTDATED_SOFTWARE {
            if server.contains(pattern) {
                check.versions_found.push(name.to_string());
                check.findings.push(format!("Outdated software detected: {name}"));
                check.risk = Severity::High;
            }
        }
        if check.findings.is_empty() {
            check.findings.push(UNDETERMINED_FIRMWARE.to_string());
        }
        check
    }

    fn undetermined() -> Self {
        FirmwareCheck {
            findings: vec![UNDETERMINED_FIRMWARE.to_string()],
            ..Default::default()
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct UpnpCheck {
    pub upnp_enabled: bool,
    pub server: Option<String>,
    pub location: Option<String>,
    pub findings: Vec<String>,
    pub risk: Severity,
}

impl UpnpCheck {
    pub fn evaluate(reply: Option<SsdpReply>) -> Self {
        match reply {
            Some(reply) => UpnpCheck {
                upnp_enabled: true,
                server: reply.server,
                location: reply.location,
                findings: vec![
                    "UPnP is enabled - devices can automatically open ports".to_string(),
                    "Consider disabling UPnP to prevent unauthorized port forwarding".to_string(),
                ],
                risk: Severity::Medium,
            },
            None => UpnpCheck {
                findings: vec!["UPnP not detected or disabled".to_string()],
                ..Default::default()
            },
        }
    }
}

/// Public name the router resolver is asked about.
pub const DNS_CHECK_NAME: &str = "google.com";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsCheck {
    pub responding: bool,
    pub answers: Vec<Ipv4Addr>,
    pub hijacking_detected: bool,
    pub findings: Vec<String>,
    pub risk: Severity,
}

fn is_suspicious_answer(ip: &Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_unspecified() || ip.is_link_local()
}

impl DnsCheck {
    /// `answers` is `None` when the resolver never replied.
    pub fn evaluate(answers: Option<Vec<Ipv4Addr>>) -> Self {
        let Some(answers) = answers else {
            return DnsCheck {
                findings: vec!["Router DNS not responding - may be disabled or filtered".to_string()],
                ..Default::default()
            };
        };
        let bad: Vec<String> = answers
            .iter()
            .filter(|ip| is_suspicious_answer(ip))
            .map(Ipv4Addr::to_string)
            .collect();
        let mut check = DnsCheck {
            responding: true,
            answers,
            ..Default::default()
        };
        if bad.is_empty() {
            check.findings.push("Router DNS is responding normally".to_string());
        } else {
            check.hijacking_detected = true;
            check.risk = Severity::High;
            check.findings.push(format!(
                "Router resolves {DNS_CHECK_NAME} to local address {} - possible DNS hijacking",
                bad.join(", ")
            ));
        }
        check
    }
}

/// A resolver that asks only `server` on port 53 over UDP, with no cache and one attempt.
pub fn router_resolver(server: IpAddr, query_timeout: Duration) -> TokioAsyncResolver {
    let mut config = ResolverConfig::new();
    config.add_name_server(NameServerConfig::new(SocketAddr::new(server, 53), DnsProtocol::Udp));
    let mut opts = ResolverOpts::default();
    opts.timeout = query_timeout;
    opts.attempts = 1;
    opts.cache_size = 0;
    TokioAsyncResolver::tokio(config, opts)
}

pub fn cert_details(der: &[u8]) -> (Option<OffsetDateTime>, Option<bool>) {
    match x509_parser::parse_x509_certificate(der) {
        Ok((_, cert)) => {
            let not_after = OffsetDateTime::from_unix_timestamp(cert.validity().not_after.timestamp()).ok();
            let self_signed = cert.subject().to_string() == cert.issuer().to_string();
            (not_after, Some(self_signed))
        }
        Err(e) => {
            debug!(error = %e, "certificate did not parse");
            (None, None)
        }
    }
}

/// Runs the checks against a single device. Socket work goes through the scan rate limiter.
#[derive(Clone)]
pub struct SecurityChecker {
    http: Option<HttpProbe>,
    limiter: Arc<RateLimiter>,
    socket_timeout: Duration,
    udp_timeout: Duration,
}

impl SecurityChecker {
    pub fn new(http: Option<HttpProbe>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            http,
            limiter,
            socket_timeout: Duration::from_secs(3),
            udp_timeout: Duration::from_secs(2),
        }
    }

    async fn handshake(&self, ip: &str, port: u16, connector: TlsConnector) -> Result<Option<Vec<u8>>> {
        self.limiter.acquire(ip).await;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let attempt = async {
            let tcp = TcpStream::connect((ip, port)).await?;
            let tls = connector
                .connect(ip, tcp)
                .await
                .map_err(|e| Error::Collector(format!("tls handshake with {ip}:{port}: {e}")))?;
            let der = tls
                .get_ref()
                .peer_certificate()
                .ok()
                .flatten()
                .and_then(|c| c.to_der().ok());
            Ok::<_, Error>(der)
        };
        timeout(self.socket_timeout, attempt)
            .await
            .map_err(|_| Error::Collector(format!("tls handshake with {ip}:{port} timed out")))?
    }

    async fn observe_tls(&self, ip: &str, port: u16) -> Result<TlsObservation> {
        let tls_err = |e: native_tls::Error| Error::Collector(format!("tls connector: {e}"));
        let lenient = |min: Protocol, max: Option<Protocol>| {
            TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .min_protocol_version(Some(min))
                .max_protocol_version(max)
                .build()
        };

        let verified = self
            .handshake(ip, port, TlsConnector::new().map_err(tls_err)?)
            .await
            .is_ok();
        let modern = self
            .handshake(ip, port, lenient(Protocol::Tlsv12, None).map_err(tls_err)?)
            .await;
        let legacy = self
            .handshake(ip, port, lenient(Protocol::Tlsv10, Some(Protocol::Tlsv11)).map_err(tls_err)?)
            .await;

        let der = modern.as_ref().ok().or(legacy.as_ref().ok()).cloned().flatten();
        let (not_after, self_signed) = der.as_deref().map(cert_details).unwrap_or((None, None));
        Ok(TlsObservation {
            verified,
            modern: modern.is_ok(),
            legacy: legacy.is_ok(),
            not_after,
            self_signed,
        })
    }

    pub async fn check_encryption(&self, ip: &str, open_ports: &[u16]) -> EncryptionCheck {
        let plain = open_ports.iter().any(|p| matches!(p, 80 | 8080));
        let tls_port = [443u16, 8443].into_iter().find(|p| open_ports.contains(p));
        let tls = match tls_port {
            Some(port) => match self.observe_tls(ip, port).await {
                Ok(obs) => Some(obs),
                Err(e) => {
                    debug!(ip, port, error = %e, "tls observation failed");
                    None
                }
            },
            None => None,
        };
        EncryptionCheck::evaluate(plain, tls_port, tls, OffsetDateTime::now_utc())
    }

    pub async fn check_firmware_age(&self, ip: &str, open_ports: &[u16]) -> FirmwareCheck {
        let Some(http) = &self.http else {
            return FirmwareCheck::undetermined();
        };
        let Some(port) = [80u16, 8080, 443, 8443].into_iter().find(|p| open_ports.contains(p)) else {
            return FirmwareCheck::undetermined();
        };
        match http.fetch_root(ip, port).await {
            Ok(page) => FirmwareCheck::evaluate(
                page.last_modified.as_deref(),
                page.server.as_deref(),
                OffsetDateTime::now_utc(),
            ),
            Err(e) => {
                debug!(ip, port, error = %e, "firmware check fetch failed");
                FirmwareCheck::undetermined()
            }
        }
    }

    pub async fn check_upnp(&self, ip: &str) -> UpnpCheck {
        let Ok(addr) = ip.parse::<IpAddr>() else {
            return UpnpCheck::evaluate(None);
        };
        self.limiter.acquire(ip).await;
        UpnpCheck::evaluate(ssdp_search(addr, self.udp_timeout).await)
    }

    pub async fn check_dns_hijack(&self, ip: &str) -> DnsCheck {
        let Ok(addr) = ip.parse::<IpAddr>() else {
            return DnsCheck::evaluate(None);
        };
        self.limiter.acquire(ip).await;
        DnsCheck::evaluate(self.resolve_check_name(addr).await)
    }

    async fn resolve_check_name(&self, addr: IpAddr) -> Option<Vec<Ipv4Addr>> {
        let resolver = router_resolver(addr, self.udp_timeout);
        match resolver.ipv4_lookup(format!("{DNS_CHECK_NAME}.")).await {
            Ok(lookup) => Some(lookup.iter().map(|a| a.0).collect()),
            Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => Some(Vec::new()),
            Err(e) => {
                debug!(%addr, error = %e, "router DNS lookup failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-06-01 12:00 UTC);

    #[test]
    fn plain_http_is_medium() {
        let check = EncryptionCheck::evaluate(true, None, None, NOW);
        assert!(check.accepts_unencrypted);
        assert_eq!(check.risk, Severity::Medium);
        assert_eq!(check.tls_version, None);
    }

    #[test]
    fn legacy_tls_and_bad_cert() {
        let obs = TlsObservation {
            verified: false,
            modern: false,
            legacy: true,
            not_after: Some(datetime!(2024-05-01 0:00 UTC)),
            self_signed: Some(true),
        };
        let check = EncryptionCheck::evaluate(false, Some(443), Some(obs), NOW);
        assert_eq!(check.risk, Severity::High);
        assert!(check.legacy_tls);
        assert_eq!(check.tls_version.as_deref(), Some("TLSv1.0/1.1"));
        assert_eq!(check.certificate.valid, Some(false));
        assert!(check.certificate.days_until_expiry.unwrap() < 0);
        assert!(check.findings.iter().any(|f| f.contains("expired")));
    }

    #[test]
    fn modern_tls_with_valid_cert_is_low() {
        let obs = TlsObservation {
            verified: true,
            modern: true,
            legacy: false,
            not_after: Some(datetime!(2025-06-01 0:00 UTC)),
            self_signed: Some(false),
        };
        let check = EncryptionCheck::evaluate(false, Some(443), Some(obs), NOW);
        assert_eq!(check.risk, Severity::Low);
        assert_eq!(check.tls_version.as_deref(), Some("TLSv1.2+"));
        assert_eq!(check.certificate.error, None);
    }

    #[test]
    fn http_dates() {
        assert_eq!(
            parse_http_date("Wed, 21 Oct 2015 07:28:00 GMT"),
            Some(datetime!(2015-10-21 07:28:00 UTC))
        );
        assert_eq!(parse_http_date("yesterday"), None);
    }

    #[test]
    fn firmware_age_thresholds() {
        let old = FirmwareCheck::evaluate(Some("Mon, 01 May 2023 00:00:00 GMT"), None, NOW);
        assert_eq!(old.risk, Severity::Medium);
        assert!(old.age_days.unwrap() > 365);

        let aging = FirmwareCheck::evaluate(Some("Fri, 01 Dec 2023 00:00:00 GMT"), None, NOW);
        assert_eq!(aging.risk, Severity::Low);
        assert!(aging.findings[0].contains("check for updates"));

        let outdated = FirmwareCheck::evaluate(None, Some("Apache/2.2.15 (Unix)"), NOW);
        assert_eq!(outdated.risk, Severity::High);
        assert_eq!(outdated.versions_found, vec!["Apache 2.2"]);

        let nothing = FirmwareCheck::evaluate(None, Some("lighttpd"), NOW);
        assert_eq!(nothing.findings, vec![UNDETERMINED_FIRMWARE]);
    }

    #[test]
    fn ssdp_reply_headers() {
        let text = "HTTP/1.1 200 OK\r\nCACHE-CONTROL: max-age=120\r\n\
                    LOCATION: http://192.168.1.1:5000/rootDesc.xml\r\n\
                    SERVER: Linux/3.14 UPnP/1.0 MiniUPnPd/2.1\r\nST: upnp:rootdevice\r\n\r\n";
        let reply = parse_ssdp_reply(text);
        assert_eq!(reply.location.as_deref(), Some("http://192.168.1.1:5000/rootDesc.xml"));
        assert_eq!(reply.st.as_deref(), Some("upnp:rootdevice"));

        let check = UpnpCheck::evaluate(Some(reply));
        assert!(check.upnp_enabled);
        assert_eq!(check.risk, Severity::Medium);
        assert!(!UpnpCheck::evaluate(None).upnp_enabled);
    }

    #[test]
    fn public_answers_are_normal() {
        let check = DnsCheck::evaluate(Some(vec![Ipv4Addr::new(142, 250, 1, 100)]));
        assert!(check.responding);
        assert!(!check.hijacking_detected);
        assert_eq!(check.risk, Severity::Low);
        assert_eq!(check.findings, vec!["Router DNS is responding normally"]);
    }

    #[test]
    fn local_answers_flag_hijacking() {
        let check = DnsCheck::evaluate(Some(vec![
            Ipv4Addr::new(142, 250, 1, 100),
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::LOCALHOST,
        ]));
        assert!(check.hijacking_detected);
        assert_eq!(check.risk, Severity::High);
        assert!(check.findings[0].contains("192.168.1.1, 127.0.0.1"));
    }

    #[test]
    fn empty_or_missing_answers() {
        let empty = DnsCheck::evaluate(Some(Vec::new()));
        assert!(empty.responding);
        assert!(!empty.hijacking_detected);

        let silent = DnsCheck::evaluate(None);
        assert!(!silent.responding);
        assert!(silent.findings[0].contains("not responding"));
    }

    #[tokio::test]
    async fn unparseable_router_address_is_not_queried() {
        let checker = SecurityChecker::new(None, Arc::new(RateLimiter::per_second(100)));
        assert!(!checker.check_dns_hijack("not-an-ip").await.responding);
    }
}
