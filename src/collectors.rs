//! Signal collectors the identification core consumes.
//!
//! Each trait has one network-backed implementation in this crate; tests swap in small
//! in-memory fakes.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use serde::Serialize;

use crate::error::Result;
use crate::threat_intel::{ThreatIntel, ThreatKind};
use crate::types::{DiscoveredHost, HttpInfo, IdentificationResult};

/// Result of probing a single TCP port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortObservation {
    pub port: u16,
    pub is_open: bool,
    pub banner: Option<String>,
}

impl PortObservation {
    pub fn open(port: u16) -> Self {
        Self { port, is_open: true, banner: None }
    }

    pub fn with_banner(mut self, banner: impl Into<String>) -> Self {
        self.banner = Some(banner.into());
        self
    }
}

#[async_trait]
pub trait HostDiscovery: Send + Sync {
    /// Sweep `network` (or the local /24 when `None`) for live hosts.
    async fn discover_devices(&self, network: Option<IpNet>) -> Result<Vec<DiscoveredHost>>;

    /// Host records for explicitly named targets, which are kept whether or not they answer.
    async fn describe_targets(&self, ips: Vec<IpAddr>) -> Result<Vec<DiscoveredHost>> {
        Ok(ips.into_iter().map(|ip| DiscoveredHost::new(ip.to_string())).collect())
    }
}

#[async_trait]
pub trait PortScanner: Send + Sync {
    async fn scan_ports(
        &self,
        ip: IpAddr,
        ports: &[u16],
        timeout: Duration,
    ) -> Result<Vec<PortObservation>>;
}

#[async_trait]
pub trait VendorLookup: Send + Sync {
    /// Vendor name for `mac`, or `"Unknown"`. Never fails.
    async fn lookup_mac_vendor(&self, mac: &str) -> String;
}

#[async_trait]
pub trait HttpProber: Send + Sync {
    /// Server header and page title of `http://ip:port/`, if anything answered.
    async fn probe_http(&self, ip: &str, port: u16) -> Option<HttpInfo>;
}

#[async_trait]
pub trait ThreatIntelSource: Send + Sync {
    async fn query(&self, subject: &str, kind: ThreatKind) -> Result<ThreatIntel>;
}

/// Raw evidence handed to the external inference service.
#[derive(Debug, Clone, Serialize)]
pub struct InferenceRequest {
    pub ip: String,
    pub mac: String,
    pub open_ports: Vec<u16>,
    pub os_guess: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub banners: BTreeMap<u16, String>,
}

#[async_trait]
pub trait DeviceInference: Send + Sync {
    async fn infer_device_type(
        &self,
        request: &InferenceRequest,
    ) -> Result<Option<IdentificationResult>>;
}

#[async_trait]
pub trait ReasoningService: Send + Sync {
    /// Prioritised free-text recommendations for a network summary.
    async fn recommendations(&self, summary: &str) -> Result<Vec<String>>;
}
