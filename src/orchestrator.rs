//! Per-device scan pipeline and network fan-out.
//!
//! Stages run strictly in order for one device; devices run concurrently up to a bound.
//! A failing stage leaves its field at the default and the pipeline moves on. Cancellation
//! is checked between stages, never inside a socket operation.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::BackendClient;
use crate::collectors::{DeviceInference, PortScanner, ReasoningService, ThreatIntelSource, VendorLookup};
use crate::config::{AppConfig, ScanConfig};
use crate::deep_scan::{extract_vendor, DeepScanner};
use crate::error::{Error, Result};
use crate::fingerprint::{DeviceInfo, FingerprintStore};
use crate::http_probe::HttpProbe;
use crate::identify::{IdentificationEngine, IOT_LIKE, NAS_STORAGE, SERVER};
use crate::netdetect::validate_target_ip;
use crate::oui::OuiVendorLookup;
use crate::ports::{self, service_info};
use crate::rate_limit::Limiters;
use crate::remediation::identify_vulnerabilities;
use crate::report::NetworkReport;
use crate::scanner::TcpPortScanner;
use crate::security::SecurityChecker;
use crate::threat_intel::{normalize_vendor, search_term, ThreatIntel, ThreatIntelCache, ThreatKind};
use crate::tools::{ToolInput, ToolName, ToolOutput, ToolRegistry};
use crate::types::{DeviceEvidence, DeviceRecord, DiscoveredHost, FingerprintRef, OpenPort, UNKNOWN, UNKNOWN_DEVICE};

/// Ports that make a device worth the encryption and firmware checks.
const WEB_PORTS: &[u16] = &[80, 443, 8080, 8443];

/// Deep-scan tool for a device type, if any.
pub fn deep_scan_tool(device_type: &str) -> Option<ToolName> {
    if device_type.contains("Router") || device_type.contains("Gateway") {
        Some(ToolName::RouterScan)
    } else if IOT_LIKE.contains(&device_type) {
        Some(ToolName::IotScan)
    } else if device_type == NAS_STORAGE || device_type == SERVER {
        Some(ToolName::StorageScan)
    } else if device_type == UNKNOWN_DEVICE {
        Some(ToolName::GenericProbe)
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub ports: Vec<u16>,
    pub port_timeout: Duration,
    pub device_concurrency: usize,
    /// Ask the inference service when local identification stays unknown.
    pub augmented: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self::from_config(&ScanConfig::default(), false)
    }
}

impl ScanOptions {
    pub fn from_config(cfg: &ScanConfig, augmented: bool) -> Self {
        Self {
            ports: if cfg.ports.is_empty() {
                ports::quick_ports()
            } else {
                cfg.ports.clone()
            },
            port_timeout: cfg.connect_timeout(),
            device_concurrency: cfg.device_concurrency,
            augmented,
        }
    }
}

/// Records that finished, plus what went wrong on the way.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub records: Vec<DeviceRecord>,
    pub warnings: Vec<String>,
    pub cancelled: bool,
}

pub struct Orchestrator {
    ports: Arc<dyn PortScanner>,
    engine: IdentificationEngine,
    store: Arc<Mutex<FingerprintStore>>,
    tools: ToolRegistry,
    threat_intel: Option<Arc<dyn ThreatIntelSource>>,
    cache: ThreatIntelCache,
    reasoning: Option<Arc<dyn ReasoningService>>,
    options: ScanOptions,
}

impl Orchestrator {
    /// Fails when the tool registry is missing a handler.
    pub fn new(
        ports: Arc<dyn PortScanner>,
        engine: IdentificationEngine,
        store: Arc<Mutex<FingerprintStore>>,
        tools: ToolRegistry,
        options: ScanOptions,
    ) -> Result<Self> {
        tools.validate()?;
        Ok(Self {
            ports,
            engine,
            store,
            tools,
            threat_intel: None,
            cache: ThreatIntelCache::new(),
            reasoning: None,
            options,
        })
    }

    /// Wire the network-backed collectors described by `cfg`. The backend, when configured,
    /// serves threat intel, inference and recommendations.
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        let limiters = Limiters::from_config(&cfg.rate_limit);
        let ports: Arc<dyn PortScanner> = Arc::new(TcpPortScanner::new(
            cfg.scan.port_concurrency,
            cfg.scan.banner_timeout(),
            limiters.scan.clone(),
        ));
        let http = HttpProbe::new(cfg.scan.http_timeout(), limiters.http.clone())?;
        let vendors: Arc<dyn VendorLookup> = if cfg.backend.online_oui_lookup {
            Arc::new(OuiVendorLookup::with_online(limiters.http.clone())?)
        } else {
            Arc::new(OuiVendorLookup::offline())
        };
        let backend = match &cfg.backend.url {
            Some(url) => Some(Arc::new(BackendClient::new(
                url,
                Duration::from_secs(cfg.backend.request_timeout_secs),
            )?)),
            None => None,
        };

        let inference = backend.clone().map(|b| b as Arc<dyn DeviceInference>);
        let engine = IdentificationEngine::new(
            vendors,
            Arc::new(http.clone()),
            inference,
            cfg.identification.clone(),
        );
        let deep = Arc::new(DeepScanner::new(
            ports.clone(),
            Some(http.clone()),
            cfg.scan.connect_timeout(),
        ));
        let security = Arc::new(SecurityChecker::new(Some(http), limiters.scan.clone()));
        let tools = ToolRegistry::standard(deep, security)?;
        let store = Arc::new(Mutex::new(FingerprintStore::open(cfg.fingerprint.clone())));

        let mut orch = Self::new(
            ports,
            engine,
            store,
            tools,
            ScanOptions::from_config(&cfg.scan, cfg.backend.augmented_lookup),
        )?;
        if let Some(backend) = backend {
            orch = orch
                .with_threat_intel(backend.clone())
                .with_reasoning(backend);
        }
        Ok(orch)
    }

    pub fn with_threat_intel(mut self, source: Arc<dyn ThreatIntelSource>) -> Self {
        self.threat_intel = Some(source);
        self
    }

    pub fn with_reasoning(mut self, service: Arc<dyn ReasoningService>) -> Self {
        self.reasoning = Some(service);
        self
    }

    pub fn store(&self) -> Arc<Mutex<FingerprintStore>> {
        self.store.clone()
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Run every stage for one host. Errors only for an invalid target or cancellation.
    pub async fn process_device(&self, host: &DiscoveredHost, cancel: &CancellationToken) -> Result<DeviceRecord> {
        let addr = validate_target_ip(&host.ip)?;
        let mut record = DeviceRecord::new(DeviceEvidence::from_host(host));
        let ip = host.ip.clone();

        checkpoint(cancel)?;
        self.scan_ports(addr, &mut record).await;

        checkpoint(cancel)?;
        let ident = self.engine.identify(&record.evidence, self.options.augmented).await;
        if let Some(http) = ident.http_info {
            record.evidence.http_info = http;
        }
        record.identification = ident.result;
        info!(
            ip = %ip,
            device_type = %record.identification.device_type,
            vendor = %record.identification.vendor,
            confidence = %record.identification.confidence,
            "identified"
        );

        checkpoint(cancel)?;
        self.fingerprint(&mut record).await;

        checkpoint(cancel)?;
        self.deep_scan(&mut record).await;

        checkpoint(cancel)?;
        if WEB_PORTS.iter().any(|p| record.has_port(*p)) {
            self.security_checks(&mut record).await;
        }

        checkpoint(cancel)?;
        if record.device_type().contains("Router") {
            self.router_checks(&mut record).await;
        }

        checkpoint(cancel)?;
        self.threat_intel(&mut record).await;

        checkpoint(cancel)?;
        record.fixable_vulnerabilities = identify_vulnerabilities(&record);
        debug!(ip = %ip, fixable = record.fixable_vulnerabilities.len(), "device done");
        Ok(record)
    }

    /// Process hosts concurrently. Finished records survive cancellation; in-flight ones are
    /// dropped. Records come back ordered by address.
    pub async fn process_network(
        self: &Arc<Self>,
        hosts: Vec<DiscoveredHost>,
        cancel: CancellationToken,
    ) -> ScanOutcome {
        let sem = Arc::new(Semaphore::new(self.options.device_concurrency.max(1)));
        let mut set = JoinSet::new();
        let mut outcome = ScanOutcome::default();

        for host in hosts {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = sem.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let this = Arc::clone(self);
            let cancel = cancel.clone();
            set.spawn(async move {
                let _permit = permit;
                let res = this.process_device(&host, &cancel).await;
                (host.ip, res)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(record))) => outcome.records.push(record),
                Ok((_, Err(Error::Cancelled))) => {}
                Ok((ip, Err(e))) => {
                    warn!(%ip, error = %e, "device skipped");
                    outcome.warnings.push(format!("{ip}: {e}"));
                }
                Err(e) => {
                    warn!(error = %e, "device task failed");
                    outcome.warnings.push(format!("device task failed: {e}"));
                }
            }
        }

        outcome.cancelled = cancel.is_cancelled();
        outcome.records.sort_by_key(|r| r.ip().parse::<IpAddr>().ok());
        info!(
            devices = outcome.records.len(),
            cancelled = outcome.cancelled,
            "network processing finished"
        );
        outcome
    }

    /// Process the network and aggregate the report, with recommendations when a reasoning
    /// service is configured.
    pub async fn scan_network(
        self: &Arc<Self>,
        network: &str,
        hosts: Vec<DiscoveredHost>,
        cancel: CancellationToken,
    ) -> NetworkReport {
        let outcome = self.process_network(hosts, cancel).await;
        let mut report = NetworkReport::build(
            network,
            outcome.records,
            outcome.warnings,
            outcome.cancelled,
            OffsetDateTime::now_utc(),
        );
        if let Some(reasoning) = &self.reasoning {
            if !report.cancelled {
                report.request_ai_recommendations(reasoning.as_ref()).await;
            }
        }
        report
    }

    async fn scan_ports(&self, addr: IpAddr, record: &mut DeviceRecord) {
        let observed = match self
            .ports
            .scan_ports(addr, &self.options.ports, self.options.port_timeout)
            .await
        {
            Ok(o) => o,
            Err(e) => {
                debug!(ip = %addr, error = %e, "port scan failed");
                return;
            }
        };
        let open = observed
            .into_iter()
            .filter(|o| o.is_open)
            .map(|o| {
                let svc = service_info(o.port);
                OpenPort {
                    port: o.port,
                    service: svc.name.to_string(),
                    risk: svc.risk,
                    banner: o.banner,
                }
            })
            .collect();
        record.evidence.set_open_ports(open);
    }

    async fn fingerprint(&self, record: &mut DeviceRecord) {
        let info = DeviceInfo::new(record.ip(), record.device_type(), record.vendor());
        let mut store = self.store.lock().await;

        let res = match store.match_device(&record.evidence) {
            Some(m) => store
                .update(&m.fingerprint_id, &record.evidence, &info)
                .map(|updated| {
                    let seen_count = updated.map_or(m.record.seen_count, |r| r.seen_count);
                    record.model = m.record.device_info.model.clone().filter(|s| !s.is_empty());
                    record.user_labels = m.record.user_labels.clone();
                    record.fingerprint = Some(FingerprintRef {
                        fingerprint_id: m.fingerprint_id.clone(),
                        match_type: Some(m.match_type),
                        confidence: m.confidence,
                        seen_count,
                    });
                }),
            None => store
                .store(&record.evidence, &info, BTreeMap::new())
                .map(|id| {
                    let confidence = store.get(&id).map_or(0.0, |r| r.confidence);
                    record.fingerprint = Some(FingerprintRef {
                        fingerprint_id: id,
                        match_type: None,
                        confidence,
                        seen_count: 1,
                    });
                }),
        };

        if let Err(e) = res {
            warn!(ip = %record.evidence.ip, error = %e, "fingerprint not persisted");
            record.warnings.push(e.to_string());
        }
    }

    fn tool_input(record: &DeviceRecord) -> ToolInput {
        ToolInput::from(record)
    }

    async fn run_tool(&self, name: ToolName, input: &ToolInput) -> Option<ToolOutput> {
        debug!(ip = %input.ip, tool = %name, "running tool");
        match self.tools.run(name, input).await {
            Ok(out) => Some(out),
            Err(e) => {
                debug!(ip = %input.ip, tool = %name, error = %e, "tool failed");
                None
            }
        }
    }

    async fn deep_scan(&self, record: &mut DeviceRecord) {
        let Some(tool) = deep_scan_tool(record.device_type()) else {
            return;
        };
        let input = Self::tool_input(record);
        let Some(ToolOutput::DeepScan(report)) = self.run_tool(tool, &input).await else {
            return;
        };
        if let Some(vendor) = extract_vendor(&report) {
            if record.identification.vendor == UNKNOWN {
                record.identification.vendor = vendor.clone();
                record
                    .identification
                    .indicators
                    .insert("deep_scan".to_string(), vendor.clone());
            }
            if let Some(fp) = &record.fingerprint {
                let res = self.store.lock().await.backfill_vendor(&fp.fingerprint_id, &vendor);
                if let Err(e) = res {
                    warn!(ip = %record.evidence.ip, error = %e, "vendor back-fill not persisted");
                    record.warnings.push(e.to_string());
                }
            }
            if !record.evidence.vendor_hints.contains(&vendor) {
                record.evidence.vendor_hints.push(vendor);
            }
        }
        record.deep_scan = Some(report);
    }

    async fn security_checks(&self, record: &mut DeviceRecord) {
        let input = Self::tool_input(record);

        if let Some(ToolOutput::Model(model)) = self.run_tool(ToolName::DetectModel, &input).await {
            if let Some(found) = model.model.filter(|m| !m.is_empty()) {
                if record.model.is_none() {
                    record.model = Some(found.clone());
                }
                if let Some(fp) = &record.fingerprint {
                    let res = self.store.lock().await.backfill_model(&fp.fingerprint_id, &found);
                    if let Err(e) = res {
                        warn!(ip = %input.ip, error = %e, "model back-fill not persisted");
                        record.warnings.push(e.to_string());
                    }
                }
            }
            if model.firmware.is_some() {
                record.firmware_version = model.firmware;
            }
        }

        if let Some(ToolOutput::Encryption(check)) = self.run_tool(ToolName::CheckEncryption, &input).await {
            record.encryption_check = Some(check);
        }
        if let Some(ToolOutput::Firmware(check)) = self.run_tool(ToolName::CheckFirmwareAge, &input).await {
            record.firmware_check = Some(check);
        }
    }

    async fn router_checks(&self, record: &mut DeviceRecord) {
        let input = Self::tool_input(record);
        if let Some(ToolOutput::Upnp(check)) = self.run_tool(ToolName::CheckUpnp, &input).await {
            record.upnp_check = Some(check);
        }
        if let Some(ToolOutput::Dns(check)) = self.run_tool(ToolName::CheckDnsHijack, &input).await {
            record.dns_check = Some(check);
        }
    }

    async fn threat_intel(&self, record: &mut DeviceRecord) {
        let Some(source) = &self.threat_intel else {
            return;
        };
        let vendor = record.vendor().to_string();
        let model = record.model.clone();
        let mut intel = ThreatIntel::default();

        if vendor != UNKNOWN && !vendor.is_empty() {
            let term = search_term(&normalize_vendor(&vendor), model.as_deref());
            intel = self.cache.query(source.as_ref(), &term, ThreatKind::Vendor).await;
        }

        if IOT_LIKE.contains(&record.device_type()) {
            let base = if vendor == UNKNOWN || vendor.is_empty() {
                "generic".to_string()
            } else {
                normalize_vendor(&vendor)
            };
            let term = search_term(&base, model.as_deref());
            let iot = self.cache.query(source.as_ref(), &term, ThreatKind::Iot).await;
            intel.merge_iot(iot);
        }
        record.threat_intel = intel;
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::{HttpProber, PortObservation, VendorLookup};
    use crate::config::{FingerprintConfig, IdentificationWeights};
    use crate::deep_scan::{DeepScanKind, DeepScanReport, ModelInfo};
    use crate::fingerprint::MatchType;
    use crate::security::{DnsCheck, EncryptionCheck, FirmwareCheck, UpnpCheck};
    use crate::tools::Tool;
    use crate::types::{Confidence, HttpInfo, Severity};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Ports per IP; optionally cancels a token when a given IP is scanned.
    struct FakePorts {
        open: HashMap<IpAddr, Vec<u16>>,
        cancel_on: Option<(IpAddr, CancellationToken)>,
    }

    #[async_trait]
    impl PortScanner for FakePorts {
        async fn scan_ports(&self, ip: IpAddr, _p: &[u16], _t: Duration) -> Result<Vec<PortObservation>> {
            if let Some((target, token)) = &self.cancel_on {
                if *target == ip {
                    token.cancel();
                }
            }
            Ok(self
                .open
                .get(&ip)
                .map(|ports| ports.iter().map(|&p| PortObservation::open(p)).collect())
                .unwrap_or_default())
        }
    }

    struct Vendors(HashMap<String, String>);

    #[async_trait]
    impl VendorLookup for Vendors {
        async fn lookup_mac_vendor(&self, mac: &str) -> String {
            self.0.get(mac).cloned().unwrap_or_else(|| UNKNOWN.to_string())
        }
    }

    struct NoHttp;

    #[async_trait]
    impl HttpProber for NoHttp {
        async fn probe_http(&self, _ip: &str, _port: u16) -> Option<HttpInfo> {
            None
        }
    }

    /// Answers every declared tool with a canned result and records the call order.
    struct CannedTool {
        name: ToolName,
        calls: Arc<StdMutex<Vec<ToolName>>>,
    }

    #[async_trait]
    impl Tool for CannedTool {
        fn name(&self) -> ToolName {
            self.name
        }

        async fn run(&self, input: &ToolInput) -> Result<ToolOutput> {
            self.calls.lock().unwrap().push(self.name);
            let deep = |kind| DeepScanReport {
                kind,
                open_ports: input.open_ports.clone(),
                findings: Vec::new(),
                http_info: HttpInfo {
                    server: Some("lighttpd".into()),
                    title: Some("TP-Link Archer".into()),
                    vendor: None,
                },
                banners: BTreeMap::new(),
                admin_page: None,
                possible_type: None,
                recommendations: Vec::new(),
            };
            Ok(match self.name {
                ToolName::RouterScan => ToolOutput::DeepScan(deep(DeepScanKind::Router)),
                ToolName::IotScan => ToolOutput::DeepScan(deep(DeepScanKind::Iot)),
                ToolName::StorageScan => ToolOutput::DeepScan(deep(DeepScanKind::Storage)),
                ToolName::GenericProbe => ToolOutput::DeepScan(deep(DeepScanKind::Generic)),
                ToolName::DetectModel => ToolOutput::Model(ModelInfo {
                    model: Some("Archer C7".into()),
                    firmware: Some("3.15.3".into()),
                    source: None,
                }),
                ToolName::CheckEncryption => ToolOutput::Encryption(EncryptionCheck {
                    accepts_unencrypted: true,
                    risk: Severity::High,
                    ..Default::default()
                }),
                ToolName::CheckFirmwareAge => ToolOutput::Firmware(FirmwareCheck::default()),
                ToolName::CheckUpnp => ToolOutput::Upnp(UpnpCheck {
                    upnp_enabled: true,
                    ..Default::default()
                }),
                ToolName::CheckDnsHijack => ToolOutput::Dns(DnsCheck::default()),
            })
        }
    }

    fn canned_registry() -> (ToolRegistry, Arc<StdMutex<Vec<ToolName>>>) {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let mut reg = ToolRegistry::new();
        for name in ToolName::DECLARED {
            reg.register(Arc::new(CannedTool {
                name,
                calls: calls.clone(),
            }))
            .unwrap();
        }
        (reg, calls)
    }

    struct Intel {
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ThreatIntelSource for Intel {
        async fn query(&self, subject: &str, kind: ThreatKind) -> Result<ThreatIntel> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Collector("threat feed timed out".into()));
            }
            Ok(match kind {
                ThreatKind::Iot => ThreatIntel {
                    exploits: vec![json!({"title": format!("{subject} rce")})],
                    ..Default::default()
                },
                ThreatKind::Vendor => ThreatIntel {
                    advisories: vec![json!({"cve_id": "CVE-2023-1389", "subject": subject})],
                    ..Default::default()
                },
            })
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn host(addr: &str, mac: &str) -> DiscoveredHost {
        DiscoveredHost {
            mac: mac.into(),
            ..DiscoveredHost::new(addr)
        }
    }

    fn orchestrator(
        store_path: std::path::PathBuf,
        ports: FakePorts,
        vendors: &[(&str, &str)],
    ) -> (Orchestrator, Arc<StdMutex<Vec<ToolName>>>) {
        let vendors = Vendors(vendors.iter().map(|(m, v)| (m.to_string(), v.to_string())).collect());
        let engine = IdentificationEngine::new(
            Arc::new(vendors),
            Arc::new(NoHttp),
            None,
            IdentificationWeights::default(),
        );
        let store = Arc::new(Mutex::new(FingerprintStore::open(FingerprintConfig::with_store_path(
            store_path,
        ))));
        let (tools, calls) = canned_registry();
        let orch = Orchestrator::new(Arc::new(ports), engine, store, tools, ScanOptions::default()).unwrap();
        (orch, calls)
    }

    fn ports(entries: &[(&str, &[u16])]) -> FakePorts {
        FakePorts {
            open: entries.iter().map(|(a, p)| (ip(a), p.to_vec())).collect(),
            cancel_on: None,
        }
    }

    #[test]
    fn dispatch_table() {
        assert_eq!(deep_scan_tool("Router/Gateway"), Some(ToolName::RouterScan));
        assert_eq!(deep_scan_tool("MikroTik Router"), Some(ToolName::RouterScan));
        assert_eq!(deep_scan_tool("IP Camera"), Some(ToolName::IotScan));
        assert_eq!(deep_scan_tool("Smart TV / Streaming Device"), Some(ToolName::IotScan));
        assert_eq!(deep_scan_tool("NAS / Storage"), Some(ToolName::StorageScan));
        assert_eq!(deep_scan_tool("Server"), Some(ToolName::StorageScan));
        assert_eq!(deep_scan_tool("Unknown Device"), Some(ToolName::GenericProbe));
        assert_eq!(deep_scan_tool("Printer"), None);
    }

    #[test]
    fn wiring_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.fingerprint.store_path = dir.path().join("fp.json");
        cfg.backend.url = Some("http://127.0.0.1:8000".into());
        let orch = Orchestrator::from_config(&cfg).unwrap();
        assert_eq!(orch.options().ports, ports::quick_ports());
        assert!(orch.threat_intel.is_some() && orch.reasoning.is_some());

        cfg.backend.url = Some("not a url".into());
        assert!(matches!(Orchestrator::from_config(&cfg), Err(Error::Config(_))));
    }

    #[test]
    fn unvalidated_registry_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let engine = IdentificationEngine::new(
            Arc::new(Vendors(HashMap::new())),
            Arc::new(NoHttp),
            None,
            IdentificationWeights::default(),
        );
        let store = Arc::new(Mutex::new(FingerprintStore::open(FingerprintConfig::with_store_path(
            dir.path().join("fp.json"),
        ))));
        let res = Orchestrator::new(
            Arc::new(ports(&[])),
            engine,
            store,
            ToolRegistry::new(),
            ScanOptions::default(),
        );
        assert!(matches!(res, Err(Error::Registry(_))));
    }

    #[tokio::test]
    async fn gateway_runs_every_stage_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, calls) = orchestrator(
            dir.path().join("fp.json"),
            ports(&[("192.168.1.1", &[53, 80, 443])]),
            &[],
        );
        let orch = orch.with_threat_intel(Arc::new(Intel { fail: false, calls: AtomicUsize::new(0) }));
        let rec = orch
            .process_device(&host("192.168.1.1", "AA:BB:CC:00:00:01"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(rec.device_type(), "Router/Gateway");
        assert_eq!(rec.identification.confidence, Confidence::High);
        assert_eq!(rec.evidence.port_numbers(), vec![53, 80, 443]);
        assert_eq!(rec.evidence.open_ports[0].service, "DNS");

        // Deep scan upgraded the unknown vendor.
        assert_eq!(rec.vendor(), "TP-Link");
        assert_eq!(rec.model.as_deref(), Some("Archer C7"));
        assert_eq!(rec.firmware_version.as_deref(), Some("3.15.3"));
        assert!(rec.upnp_check.is_some() && rec.dns_check.is_some());

        let fp = rec.fingerprint.clone().unwrap();
        assert_eq!(fp.fingerprint_id, "5555526a17d8537f");
        assert_eq!(fp.match_type, None);
        assert_eq!(fp.seen_count, 1);

        assert_eq!(
            rec.threat_intel.advisories[0]["subject"],
            json!("tp-link Archer C7")
        );

        let ids: Vec<&str> = rec.fixable_vulnerabilities.iter().map(|v| v.vuln_id.as_str()).collect();
        assert_eq!(ids, vec!["weak_ssl", "upnp_enabled", "http_admin"]);

        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                ToolName::RouterScan,
                ToolName::DetectModel,
                ToolName::CheckEncryption,
                ToolName::CheckFirmwareAge,
                ToolName::CheckUpnp,
                ToolName::CheckDnsHijack,
            ]
        );

        let store = orch.store();
        let store = store.lock().await;
        assert_eq!(
            store.get("5555526a17d8537f").unwrap().device_info.model.as_deref(),
            Some("Archer C7")
        );
        let known = store.list_known_devices();
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].vendor, "TP-Link");
    }

    #[tokio::test]
    async fn rtsp_only_device_is_a_camera() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, calls) = orchestrator(
            dir.path().join("fp.json"),
            ports(&[("192.168.1.60", &[554])]),
            &[],
        );
        let intel = Arc::new(Intel { fail: false, calls: AtomicUsize::new(0) });
        let orch = orch.with_threat_intel(intel.clone());
        let rec = orch
            .process_device(&host("192.168.1.60", UNKNOWN), &CancellationToken::new())
            .await
            .unwrap();

        assert!(rec.device_type().contains("Camera"));
        assert!(rec.identification.confidence >= Confidence::Medium);
        assert_eq!(*calls.lock().unwrap(), vec![ToolName::IotScan]);
        assert!(rec.encryption_check.is_none());
        // The deep scan named a vendor, so both the vendor and the IoT query ran.
        assert_eq!(intel.calls.load(Ordering::SeqCst), 2);
        assert_eq!(rec.threat_intel.iot_exploits.len(), 1);
        assert_eq!(rec.threat_intel.advisories.len(), 1);
    }

    #[tokio::test]
    async fn port_change_still_matches_and_counts_sightings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fp.json");
        let mac = "AA:BB:CC:00:00:02";

        let (first, _) = orchestrator(path.clone(), ports(&[("192.168.1.20", &[80, 443])]), &[]);
        let rec1 = first
            .process_device(&host("192.168.1.20", mac), &CancellationToken::new())
            .await
            .unwrap();
        let id = rec1.fingerprint.unwrap().fingerprint_id;

        // Fresh orchestrator, same store file: the store reloads from disk.
        let (second, _) = orchestrator(path, ports(&[("192.168.1.20", &[22, 80, 443])]), &[]);
        let rec2 = second
            .process_device(&host("192.168.1.20", mac), &CancellationToken::new())
            .await
            .unwrap();
        let fp = rec2.fingerprint.unwrap();
        assert_eq!(fp.fingerprint_id, id);
        assert_eq!(fp.match_type, Some(MatchType::Fuzzy));
        assert!(fp.confidence > 0.7);
        assert_eq!(fp.seen_count, 2);
        // Model stored by the first scan's back-fill is carried forward.
        assert_eq!(rec2.model.as_deref(), Some("Archer C7"));
    }

    #[tokio::test]
    async fn threat_intel_failure_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, _) = orchestrator(
            dir.path().join("fp.json"),
            ports(&[("192.168.1.1", &[23, 80])]),
            &[("AA:BB:CC:00:00:01", "TP-LINK TECHNOLOGIES CO.,LTD.")],
        );
        let intel = Arc::new(Intel { fail: true, calls: AtomicUsize::new(0) });
        let orch = orch.with_threat_intel(intel.clone());
        let rec = orch
            .process_device(&host("192.168.1.1", "AA:BB:CC:00:00:01"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(intel.calls.load(Ordering::SeqCst), 1);
        assert!(rec.threat_intel.is_empty());
        assert_eq!(rec.vendor(), "TP-LINK TECHNOLOGIES CO.,LTD.");
        assert!(rec.deep_scan.is_some());
        assert!(rec.fingerprint.is_some());
        assert!(rec.fixable_vulnerabilities.iter().any(|v| v.vuln_id == "telnet_exposed"));
    }

    #[tokio::test]
    async fn unwritable_store_becomes_a_device_warning() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let (orch, _) = orchestrator(
            blocker.join("fp.json"),
            ports(&[("192.168.1.1", &[80])]),
            &[],
        );
        let rec = orch
            .process_device(&host("192.168.1.1", "AA:BB:CC:00:00:01"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(rec.fingerprint.is_none());
        assert!(!rec.warnings.is_empty());
        assert!(rec.warnings[0].contains("cannot write fingerprint store"));
        assert!(rec.deep_scan.is_some());
    }

    #[tokio::test]
    async fn invalid_target_is_rejected_before_io() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, calls) = orchestrator(dir.path().join("fp.json"), ports(&[]), &[]);
        let err = orch
            .process_device(&host("8.8.8.8", UNKNOWN), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTarget(_)));
        assert!(calls.lock().unwrap().is_empty());
        assert!(orch.store().lock().await.is_empty());
    }

    #[tokio::test]
    async fn network_scan_reports_every_device() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, _) = orchestrator(
            dir.path().join("fp.json"),
            ports(&[("192.168.1.1", &[53, 80, 443]), ("192.168.1.60", &[554])]),
            &[],
        );
        let orch = Arc::new(orch);
        let report = orch
            .scan_network(
                "192.168.1.0/24",
                vec![
                    host("192.168.1.60", "AA:BB:CC:00:00:60"),
                    host("192.168.1.1", "AA:BB:CC:00:00:01"),
                    host("1.1.1.1", UNKNOWN),
                ],
                CancellationToken::new(),
            )
            .await;
        assert_eq!(report.total_devices, 2);
        assert_eq!(report.devices[0].ip(), "192.168.1.1");
        assert_eq!(report.devices[1].ip(), "192.168.1.60");
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].starts_with("1.1.1.1"));
        assert!(!report.cancelled);
    }

    #[tokio::test]
    async fn cancellation_keeps_finished_devices() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let mut fake = ports(&[("192.168.1.10", &[22]), ("192.168.1.11", &[22])]);
        fake.cancel_on = Some((ip("192.168.1.11"), cancel.clone()));
        let (orch, _) = orchestrator(dir.path().join("fp.json"), fake, &[]);
        let mut orch = orch;
        orch.options.device_concurrency = 1;
        let orch = Arc::new(orch);

        let outcome = orch
            .process_network(
                vec![
                    host("192.168.1.10", "AA:BB:CC:00:00:10"),
                    host("192.168.1.11", "AA:BB:CC:00:00:11"),
                    host("192.168.1.12", "AA:BB:CC:00:00:12"),
                ],
                cancel,
            )
            .await;
        assert!(outcome.cancelled);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.records[0].ip(), "192.168.1.10");
        assert!(outcome.warnings.is_empty());
        // The abandoned device never reached the store.
        assert_eq!(orch.store().lock().await.len(), 1);
    }
}
