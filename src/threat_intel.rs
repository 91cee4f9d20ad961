//! Threat-intelligence result shape, a per-run cache, and vendor name normalisation.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::collectors::ThreatIntelSource;
use crate::types::UNKNOWN;

/// What a threat-intel query is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatKind {
    Vendor,
    Iot,
}

impl ThreatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatKind::Vendor => "vendor",
            ThreatKind::Iot => "iot",
        }
    }
}

impl fmt::Display for ThreatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Findings from threat-intel feeds. Every list defaults to empty, so a failed query
/// and a clean device look the same.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreatIntel {
    pub advisories: Vec<Value>,
    pub vulnerabilities: Vec<Value>,
    pub findings: Vec<Value>,
    /// Known IoT exploits; filled by the IoT query only.
    pub iot_exploits: Vec<Value>,
    /// Backend IoT responses carry their list under `exploits`.
    #[serde(skip_serializing)]
    pub exploits: Vec<Value>,
}

impl ThreatIntel {
    pub fn is_empty(&self) -> bool {
        self.advisories.is_empty()
            && self.vulnerabilities.is_empty()
            && self.findings.is_empty()
            && self.iot_exploits.is_empty()
    }

    /// Merge an IoT query result under `iot_exploits` without touching vendor advisories.
    pub fn merge_iot(&mut self, iot: ThreatIntel) {
        let mut exploits = iot.exploits;
        exploits.extend(iot.iot_exploits);
        self.iot_exploits = exploits;
    }

    pub fn total(&self) -> usize {
        self.advisories.len() + self.vulnerabilities.len() + self.findings.len() + self.iot_exploits.len()
    }
}

/// Caches threat-intel answers per `(kind, term)` for the lifetime of one orchestrator.
#[derive(Debug, Default)]
pub struct ThreatIntelCache {
    entries: Mutex<HashMap<(ThreatKind, String), ThreatIntel>>,
}

impl ThreatIntelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: ThreatKind, term: &str) -> Option<ThreatIntel> {
        let entries = match self.entries.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.get(&(kind, term.to_ascii_lowercase())).cloned()
    }

    pub fn insert(&self, kind: ThreatKind, term: &str, intel: ThreatIntel) {
        let mut entries = match self.entries.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries.insert((kind, term.to_ascii_lowercase()), intel);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Query through the cache. Failures yield an empty result and are not cached.
    pub async fn query(
        &self,
        source: &dyn ThreatIntelSource,
        subject: &str,
        kind: ThreatKind,
    ) -> ThreatIntel {
        if let Some(hit) = self.get(kind, subject) {
            debug!(%kind, subject, "threat intel cache hit");
            return hit;
        }
        match source.query(subject, kind).await {
            Ok(intel) => {
                self.insert(kind, subject, intel.clone());
                intel
            }
            Err(e) => {
                debug!(%kind, subject, error = %e, "threat intel unavailable");
                ThreatIntel::default()
            }
        }
    }
}

const VENDOR_ALIASES: &[(&str, &str)] = &[
    ("tp-link", "tp-link"),
    ("beijing xiaomi", "xiaomi"),
    ("xiaomi", "xiaomi"),
    ("gree electric", "gree"),
    ("asustek", "asus"),
    ("asus", "asus"),
    ("apple", "apple"),
    ("bsh hausgeraete", "bosch"),
    ("huawei", "huawei"),
    ("samsung", "samsung"),
    ("netgear", "netgear"),
    ("d-link", "dlink"),
    ("ubiquiti", "ubiquiti"),
    ("hikvision", "hikvision"),
    ("dahua", "dahua"),
    ("synology", "synology"),
    ("qnap", "qnap"),
    ("cisco", "cisco"),
    ("linksys", "linksys"),
    ("zyxel", "zyxel"),
    ("mikrotik", "mikrotik"),
    ("ring", "ring"),
    ("nest", "nest"),
    ("philips", "philips"),
    ("sonos", "sonos"),
    ("roku", "roku"),
    ("amazon", "amazon"),
];

/// Map a vendor label to the short name threat feeds index by.
///
/// Known aliases win (first match in table order), otherwise the first word lowercased.
pub fn normalize_vendor(vendor: &str) -> String {
    let vendor = vendor.trim();
    if vendor.is_empty() || vendor == UNKNOWN {
        return vendor.to_string();
    }
    let lower = vendor.to_lowercase();
    VENDOR_ALIASES
        .iter()
        .find(|(pattern, _)| lower.contains(pattern))
        .map(|(_, normalized)| normalized.to_string())
        .unwrap_or_else(|| lower.split_whitespace().next().unwrap_or_default().to_string())
}

/// `"<vendor> <model>"` when a model is known, else the vendor alone.
pub fn search_term(normalized_vendor: &str, model: Option<&str>) -> String {
    match model.filter(|m| !m.is_empty()) {
        Some(m) => format!("{normalized_vendor} {m}"),
        None => normalized_vendor.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn vendor_aliases() {
        assert_eq!(normalize_vendor("Beijing Xiaomi Electronics"), "xiaomi");
        assert_eq!(normalize_vendor("ASUSTek COMPUTER INC."), "asus");
        assert_eq!(normalize_vendor("BSH Hausgeraete GmbH"), "bosch");
        assert_eq!(normalize_vendor("D-Link International"), "dlink");
        assert_eq!(normalize_vendor("Espressif Inc."), "espressif");
        assert_eq!(normalize_vendor("Unknown"), "Unknown");
    }

    #[test]
    fn search_term_appends_model() {
        assert_eq!(search_term("tp-link", Some("Archer C7")), "tp-link Archer C7");
        assert_eq!(search_term("tp-link", Some("")), "tp-link");
        assert_eq!(search_term("tp-link", None), "tp-link");
    }

    #[test]
    fn only_vendor_and_iot_queries_exist() {
        assert_eq!(ThreatKind::Vendor.as_str(), "vendor");
        assert_eq!(serde_json::from_str::<ThreatKind>("\"iot\"").unwrap(), ThreatKind::Iot);
        assert!(serde_json::from_str::<ThreatKind>("\"ip\"").is_err());
        assert!(serde_json::from_str::<ThreatKind>("\"dns\"").is_err());
    }

    #[test]
    fn missing_fields_deserialize_empty() {
        let ti: ThreatIntel = serde_json::from_value(json!({"advisories": [{"id": "A1"}], "extra": 1})).unwrap();
        assert_eq!(ti.advisories.len(), 1);
        assert!(ti.vulnerabilities.is_empty());
    }

    #[test]
    fn iot_merge_keeps_vendor_advisories() {
        let mut ti = ThreatIntel {
            advisories: vec![json!("adv")],
            ..Default::default()
        };
        let iot: ThreatIntel = serde_json::from_value(json!({"exploits": ["e1", "e2"]})).unwrap();
        ti.merge_iot(iot);
        assert_eq!(ti.advisories, vec![json!("adv")]);
        assert_eq!(ti.iot_exploits.len(), 2);
    }

    struct CountingSource {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ThreatIntelSource for CountingSource {
        async fn query(&self, _subject: &str, _kind: ThreatKind) -> Result<ThreatIntel> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Collector("offline".into()));
            }
            Ok(ThreatIntel {
                findings: vec![json!("f")],
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn cache_hits_skip_the_source() {
        let src = CountingSource { calls: AtomicUsize::new(0), fail: false };
        let cache = ThreatIntelCache::new();
        let a = cache.query(&src, "netgear", ThreatKind::Vendor).await;
        let b = cache.query(&src, "NETGEAR", ThreatKind::Vendor).await;
        assert_eq!(a, b);
        assert_eq!(src.calls.load(Ordering::SeqCst), 1);
        cache.query(&src, "netgear", ThreatKind::Iot).await;
        assert_eq!(src.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failures_degrade_to_empty_and_are_not_cached() {
        let src = CountingSource { calls: AtomicUsize::new(0), fail: true };
        let cache = ThreatIntelCache::new();
        assert!(cache.query(&src, "netgear", ThreatKind::Vendor).await.is_empty());
        assert!(cache.is_empty());
    }
}
