//! Typed tool registry. Every declared tool name must have exactly one handler; the registry
//! refuses to validate otherwise.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::deep_scan::{DeepScanKind, DeepScanReport, DeepScanner, ModelInfo};
use crate::error::{Error, Result};
use crate::security::{DnsCheck, EncryptionCheck, FirmwareCheck, SecurityChecker, UpnpCheck};
use crate::types::DeviceRecord;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum ToolName {
    RouterScan,
    IotScan,
    StorageScan,
    GenericProbe,
    CheckEncryption,
    CheckFirmwareAge,
    CheckUpnp,
    CheckDnsHijack,
    DetectModel,
}

impl ToolName {
    /// The closed set of tools the orchestrator may dispatch.
    pub const DECLARED: [ToolName; 9] = [
        ToolName::RouterScan,
        ToolName::IotScan,
        ToolName::StorageScan,
        ToolName::GenericProbe,
        ToolName::CheckEncryption,
        ToolName::CheckFirmwareAge,
        ToolName::CheckUpnp,
        ToolName::CheckDnsHijack,
        ToolName::DetectModel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::RouterScan => "router-scan",
            ToolName::IotScan => "iot-scan",
            ToolName::StorageScan => "storage-scan",
            ToolName::GenericProbe => "generic-probe",
            ToolName::CheckEncryption => "check-encryption",
            ToolName::CheckFirmwareAge => "check-firmware-age",
            ToolName::CheckUpnp => "check-upnp",
            ToolName::CheckDnsHijack => "check-dns-hijack",
            ToolName::DetectModel => "detect-model",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ToolName::RouterScan => "Deep scan a router: admin pages, UPnP description and services.",
            ToolName::IotScan => "Deep scan an IoT device, camera or smart TV.",
            ToolName::StorageScan => "Deep scan a NAS or server: file shares and admin consoles.",
            ToolName::GenericProbe => "Probe an unidentified device and guess what it is.",
            ToolName::CheckEncryption => "Check whether the web interface is served over valid TLS.",
            ToolName::CheckFirmwareAge => "Estimate firmware age from HTTP headers and version strings.",
            ToolName::CheckUpnp => "Check whether the device answers UPnP discovery.",
            ToolName::CheckDnsHijack => "Check whether the device's DNS resolver returns local answers for public names.",
            ToolName::DetectModel => "Read the model name and firmware version from the device.",
        }
    }

    /// Function-calling schema sent to the chat model.
    pub fn definition(&self) -> Value {
        let mut properties = json!({
            "ip": { "type": "string", "description": "Target IP address" }
        });
        if *self == ToolName::GenericProbe {
            properties["open_ports"] = json!({ "type": "array", "items": { "type": "integer" } });
        }
        json!({
            "type": "function",
            "function": {
                "name": self.as_str(),
                "description": self.description(),
                "parameters": { "type": "object", "properties": properties, "required": ["ip"] }
            }
        })
    }

    pub fn definitions() -> Vec<Value> {
        ToolName::DECLARED.iter().map(ToolName::definition).collect()
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        ToolName::DECLARED
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Registry(format!("unknown tool: {s}")))
    }
}

/// Arguments every tool receives.
#[derive(Debug, Clone, Default)]
pub struct ToolInput {
    pub ip: String,
    pub open_ports: Vec<u16>,
    pub banners: BTreeMap<u16, String>,
}

impl ToolInput {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            ..Default::default()
        }
    }
}

impl From<&DeviceRecord> for ToolInput {
    fn from(record: &DeviceRecord) -> Self {
        Self {
            ip: record.evidence.ip.clone(),
            open_ports: record.evidence.port_numbers(),
            banners: record.evidence.banners.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "result", rename_all = "snake_case")]
pub enum ToolOutput {
    DeepScan(DeepScanReport),
    Encryption(EncryptionCheck),
    Firmware(FirmwareCheck),
    Upnp(UpnpCheck),
    Dns(DnsCheck),
    Model(ModelInfo),
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> ToolName;
    async fn run(&self, input: &ToolInput) -> Result<ToolOutput>;
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    handlers: HashMap<ToolName, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler. A second handler for the same name is an error.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name();
        if self.handlers.contains_key(&name) {
            return Err(Error::Registry(format!("duplicate handler for {name}")));
        }
        self.handlers.insert(name, tool);
        Ok(())
    }

    /// Every declared tool has a handler.
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = ToolName::DECLARED
            .iter()
            .filter(|n| !self.handlers.contains_key(n))
            .map(ToolName::as_str)
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Registry(format!("no handler for: {}", missing.join(", "))))
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub async fn run(&self, name: ToolName, input: &ToolInput) -> Result<ToolOutput> {
        let tool = self
            .handlers
            .get(&name)
            .ok_or_else(|| Error::Registry(format!("no handler for {name}")))?;
        tool.run(input).await
    }

    /// Dispatch by wire name, as used for tool calls coming back from the chat model.
    pub async fn run_named(&self, name: &str, input: &ToolInput) -> Result<ToolOutput> {
        self.run(name.parse()?, input).await
    }

    /// The standard handlers backed by the deep scanner and the security checker.
    pub fn standard(deep: Arc<DeepScanner>, security: Arc<SecurityChecker>) -> Result<Self> {
        let mut reg = Self::new();
        for (name, kind) in [
            (ToolName::RouterScan, DeepScanKind::Router),
            (ToolName::IotScan, DeepScanKind::Iot),
            (ToolName::StorageScan, DeepScanKind::Storage),
            (ToolName::GenericProbe, DeepScanKind::Generic),
        ] {
            reg.register(Arc::new(DeepScanTool {
                name,
                kind,
                scanner: deep.clone(),
            }))?;
        }
        reg.register(Arc::new(ModelTool(deep)))?;
        for name in [
            ToolName::CheckEncryption,
            ToolName::CheckFirmwareAge,
            ToolName::CheckUpnp,
            ToolName::CheckDnsHijack,
        ] {
            reg.register(Arc::new(SecurityTool {
                name,
                checker: security.clone(),
            }))?;
        }
        reg.validate()?;
        Ok(reg)
    }
}

struct DeepScanTool {
    name: ToolName,
    kind: DeepScanKind,
    scanner: Arc<DeepScanner>,
}

#[async_trait]
impl Tool for DeepScanTool {
    fn name(&self) -> ToolName {
        self.name
    }

    async fn run(&self, input: &ToolInput) -> Result<ToolOutput> {
        let report = match self.kind {
            DeepScanKind::Generic => {
                self.scanner
                    .probe_unknown(&input.ip, &input.open_ports, &input.banners)
                    .await?
            }
            kind => self.scanner.scan(kind, &input.ip).await?,
        };
        Ok(ToolOutput::DeepScan(report))
    }
}

struct ModelTool(Arc<DeepScanner>);

#[async_trait]
impl Tool for ModelTool {
    fn name(&self) -> ToolName {
        ToolName::DetectModel
    }

    async fn run(&self, input: &ToolInput) -> Result<ToolOutput> {
        Ok(ToolOutput::Model(self.0.detect_model(&input.ip).await))
    }
}

struct SecurityTool {
    name: ToolName,
    checker: Arc<SecurityChecker>,
}

#[async_trait]
impl Tool for SecurityTool {
    fn name(&self) -> ToolName {
        self.name
    }

    async fn run(&self, input: &ToolInput) -> Result<ToolOutput> {
        let ip = input.ip.as_str();
        Ok(match self.name {
            ToolName::CheckEncryption => {
                ToolOutput::Encryption(self.checker.check_encryption(ip, &input.open_ports).await)
            }
            ToolName::CheckFirmwareAge => {
                ToolOutput::Firmware(self.checker.check_firmware_age(ip, &input.open_ports).await)
            }
            ToolName::CheckUpnp => ToolOutput::Upnp(self.checker.check_upnp(ip).await),
            ToolName::CheckDnsHijack => ToolOutput::Dns(self.checker.check_dns_hijack(ip).await),
            other => return Err(Error::Registry(format!("{other} is not a security check"))),
        })
    }
}
