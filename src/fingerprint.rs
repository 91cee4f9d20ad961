//! Persistent device fingerprints: a stable signature per device, a content-derived id,
//! and exact/fuzzy re-identification across scans.
//!
//! The store is a JSON map `fingerprint_id → FingerprintRecord`, read once when opened and
//! rewritten whole (temp file + rename) after every mutation.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::config::FingerprintConfig;
use crate::error::{Error, Result};
use crate::oui::{normalize_mac, parse_mac};
use crate::types::{DeviceEvidence, UNKNOWN, UNKNOWN_DEVICE};

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn short_hash(data: &str) -> String {
    sha256_hex(data.as_bytes())[..8].to_string()
}

/// Hash of empty input; a signature hash equal to this carries no evidence.
pub fn empty_hash() -> String {
    short_hash("")
}

/// Normalized, hashable summary of a device. Field order is part of the id derivation.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FingerprintSignature {
    pub mac_address: String,
    pub mac_oui: String,
    pub port_signature: Vec<u16>,
    pub http_hash: String,
    pub banner_hash: String,
    pub vendor_hints: Vec<String>,
    pub os_guess: String,
}

impl FingerprintSignature {
    pub fn from_evidence(evidence: &DeviceEvidence) -> Self {
        let raw_mac = evidence.mac.trim();
        let mac_address = if raw_mac.is_empty() || raw_mac.eq_ignore_ascii_case(UNKNOWN) {
            UNKNOWN.to_string()
        } else {
            normalize_mac(raw_mac)
        };
        let mac_oui = parse_mac(raw_mac)
            .map(|b| format!("{:02X}:{:02X}:{:02X}", b[0], b[1], b[2]))
            .unwrap_or_else(|| UNKNOWN.to_string());

        let port_signature: Vec<u16> = evidence
            .open_ports
            .iter()
            .map(|p| p.port)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let http = &evidence.http_info;
        let http_hash = short_hash(&format!(
            "{}{}",
            http.server.as_deref().unwrap_or_default(),
            http.title.as_deref().unwrap_or_default()
        ));

        let mut banners: Vec<&str> = evidence.banners.values().map(String::as_str).collect();
        banners.sort_unstable();
        let banner_hash = short_hash(&banners.concat());

        let vendor_hints: Vec<String> = evidence
            .vendor_hints
            .iter()
            .chain(http.vendor.iter())
            .filter(|v| !v.is_empty() && v.as_str() != UNKNOWN)
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let os_guess = if evidence.os_guess.is_empty() {
            UNKNOWN.to_string()
        } else {
            evidence.os_guess.clone()
        };

        Self {
            mac_address,
            mac_oui,
            port_signature,
            http_hash,
            banner_hash,
            vendor_hints,
            os_guess,
        }
    }

    /// First 16 hex digits of SHA-256 over the compact JSON form.
    pub fn fingerprint_id(&self) -> String {
        // a struct of strings and integers always serializes
        let canonical = serde_json::to_string(self).unwrap_or_default();
        sha256_hex(canonical.as_bytes())[..16].to_string()
    }

    fn has_oui(&self) -> bool {
        self.mac_oui != UNKNOWN && self.mac_oui.len() >= 8
    }

    /// Weighted presence score in `0.0..=1.0`.
    pub fn confidence(&self, cfg: &FingerprintConfig) -> f64 {
        let empty = empty_hash();
        let mut score = 0.0;
        if self.has_oui() {
            score += cfg.confidence_mac;
        }
        if !self.port_signature.is_empty() {
            score += cfg.confidence_ports;
        }
        if self.http_hash != empty {
            score += cfg.confidence_http;
        }
        if self.banner_hash != empty {
            score += cfg.confidence_banner;
        }
        round2(score.min(1.0))
    }

    /// `oui·[OUI equal] + port·jaccard + http·[HTTP hash equal]`.
    pub fn similarity(&self, other: &Self, cfg: &FingerprintConfig) -> f64 {
        let mut score = 0.0;
        if self.has_oui() && self.mac_oui == other.mac_oui {
            score += cfg.oui_weight;
        }
        let a: BTreeSet<u16> = self.port_signature.iter().copied().collect();
        let b: BTreeSet<u16> = other.port_signature.iter().copied().collect();
        let union = a.union(&b).count();
        if union > 0 {
            score += cfg.port_weight * a.intersection(&b).count() as f64 / union as f64;
        }
        if self.http_hash == other.http_hash {
            score += cfg.http_weight;
        }
        score
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Coarse grouping derived from the port set only.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Router,
    Iot,
    Media,
    Storage,
    Camera,
    #[default]
    Unknown,
}

impl DeviceClass {
    pub fn from_ports(ports: &[u16]) -> Self {
        let any = |set: &[u16]| ports.iter().any(|p| set.contains(p));
        if any(&[53, 67, 80, 443]) && ports.len() >= 3 {
            DeviceClass::Router
        } else if any(&[1883, 8883, 5683]) {
            DeviceClass::Iot
        } else if any(&[8008, 8009, 9000]) {
            DeviceClass::Media
        } else if any(&[445, 139, 2049, 5000]) {
            DeviceClass::Storage
        } else if ports.contains(&554) {
            DeviceClass::Camera
        } else {
            DeviceClass::Unknown
        }
    }
}

/// Best-known labels for a device.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub ip: String,
    pub device_type: String,
    pub vendor: String,
    #[serde(default)]
    pub model: Option<String>,
}

impl DeviceInfo {
    pub fn new(ip: impl Into<String>, device_type: impl Into<String>, vendor: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            device_type: device_type.into(),
            vendor: vendor.into(),
            model: None,
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model.filter(|m| !m.is_empty());
        self
    }

    /// Fill unset fields from `newer`. A set field is never replaced.
    fn backfill(&mut self, newer: &DeviceInfo) {
        if self.model.as_deref().map_or(true, str::is_empty) {
            if let Some(m) = newer.model.as_ref().filter(|m| !m.is_empty()) {
                self.model = Some(m.clone());
            }
        }
        if is_unset(&self.vendor) && !is_unset(&newer.vendor) {
            self.vendor = newer.vendor.clone();
        }
        if is_unset(&self.device_type) && !is_unset(&newer.device_type) {
            self.device_type = newer.device_type.clone();
        }
        if self.ip.is_empty() {
            self.ip = newer.ip.clone();
        }
    }
}

fn is_unset(v: &str) -> bool {
    v.is_empty() || v == UNKNOWN || v == UNKNOWN_DEVICE
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FingerprintRecord {
    pub fingerprint_id: String,
    pub signature: FingerprintSignature,
    pub confidence: f64,
    pub device_class: DeviceClass,
    pub device_info: DeviceInfo,
    #[serde(default)]
    pub user_labels: BTreeMap<String, String>,
    #[serde(with = "time::serde::rfc3339")]
    pub first_seen: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub seen_count: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    Fuzzy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub match_type: MatchType,
    /// 1.0 for exact hits, the similarity for fuzzy ones.
    pub confidence: f64,
    pub fingerprint_id: String,
    pub record: FingerprintRecord,
}

/// Row of the known-devices listing.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct KnownDevice {
    pub fingerprint_id: String,
    pub device_type: String,
    pub vendor: String,
    pub model: Option<String>,
    pub device_class: DeviceClass,
    pub seen_count: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub confidence: f64,
    pub user_labels: BTreeMap<String, String>,
}

/// One store per process. Callers sharing it across tasks wrap it in a mutex so writes
/// are serialized.
#[derive(Debug)]
pub struct FingerprintStore {
    config: FingerprintConfig,
    records: BTreeMap<String, FingerprintRecord>,
}

impl FingerprintStore {
    /// Load the store at `config.store_path`. A missing or unreadable file yields an empty store.
    pub fn open(config: FingerprintConfig) -> Self {
        let records = load_records(&config.store_path);
        info!(
            path = %config.store_path.display(),
            records = records.len(),
            "fingerprint store loaded"
        );
        Self { config, records }
    }

    pub fn path(&self) -> &Path {
        &self.config.store_path
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn create_signature(&self, evidence: &DeviceEvidence) -> FingerprintSignature {
        FingerprintSignature::from_evidence(evidence)
    }

    /// Exact id hit first, then the most similar record strictly above the fuzzy threshold.
    pub fn match_device(&self, evidence: &DeviceEvidence) -> Option<MatchResult> {
        let signature = self.create_signature(evidence);
        let id = signature.fingerprint_id();
        if let Some(record) = self.records.get(&id) {
            return Some(MatchResult {
                match_type: MatchType::Exact,
                confidence: 1.0,
                fingerprint_id: id,
                record: record.clone(),
            });
        }

        let mut best: Option<(f64, &FingerprintRecord)> = None;
        for record in self.records.values() {
            let sim = signature.similarity(&record.signature, &self.config);
            if best.map_or(true, |(b, _)| sim > b) {
                best = Some((sim, record));
            }
        }
        let (sim, record) = best?;
        if sim <= self.config.fuzzy_threshold {
            debug!(ip = %evidence.ip, best = sim, "no fingerprint above threshold");
            return None;
        }
        Some(MatchResult {
            match_type: MatchType::Fuzzy,
            confidence: round2(sim),
            fingerprint_id: record.fingerprint_id.clone(),
            record: record.clone(),
        })
    }

    /// Insert a new record and persist. An id that already exists is updated instead.
    pub fn store(
        &mut self,
        evidence: &DeviceEvidence,
        info: &DeviceInfo,
        user_labels: BTreeMap<String, String>,
    ) -> Result<String> {
        let signature = self.create_signature(evidence);
        let id = signature.fingerprint_id();
        if let Some(existing) = self.records.get_mut(&id) {
            existing.user_labels.extend(user_labels);
            self.update(&id, evidence, info)?;
            return Ok(id);
        }

        let now = OffsetDateTime::now_utc();
        let record = FingerprintRecord {
            fingerprint_id: id.clone(),
            confidence: signature.confidence(&self.config),
            device_class: DeviceClass::from_ports(&signature.port_signature),
            signature,
            device_info: DeviceInfo {
                ip: evidence.ip.clone(),
                ..info.clone()
            },
            user_labels,
            first_seen: now,
            last_seen: now,
            seen_count: 1,
        };
        self.records.insert(id.clone(), record);
        self.save()?;
        info!(fingerprint_id = %id, ip = %evidence.ip, "stored new fingerprint");
        Ok(id)
    }

    /// Record another sighting. Absent ids are ignored.
    pub fn update(
        &mut self,
        fingerprint_id: &str,
        evidence: &DeviceEvidence,
        info: &DeviceInfo,
    ) -> Result<Option<&FingerprintRecord>> {
        let Some(record) = self.records.get_mut(fingerprint_id) else {
            debug!(fingerprint_id, "update for unknown fingerprint ignored");
            return Ok(None);
        };
        record.last_seen = OffsetDateTime::now_utc();
        record.seen_count += 1;
        record.device_info.backfill(&DeviceInfo {
            ip: evidence.ip.clone(),
            ..info.clone()
        });
        debug!(fingerprint_id, seen_count = record.seen_count, "fingerprint updated");
        self.save()?;
        Ok(self.records.get(fingerprint_id))
    }

    /// Back-fill a model learned late in the pipeline without counting another sighting.
    pub fn backfill_model(&mut self, fingerprint_id: &str, model: &str) -> Result<bool> {
        let Some(record) = self.records.get_mut(fingerprint_id) else {
            return Ok(false);
        };
        if model.is_empty() || record.device_info.model.as_deref().is_some_and(|m| !m.is_empty()) {
            return Ok(false);
        }
        record.device_info.model = Some(model.to_string());
        self.save()?;
        Ok(true)
    }

    /// Back-fill a vendor learned late in the pipeline. A known vendor is never replaced.
    pub fn backfill_vendor(&mut self, fingerprint_id: &str, vendor: &str) -> Result<bool> {
        let Some(record) = self.records.get_mut(fingerprint_id) else {
            return Ok(false);
        };
        if is_unset(vendor) || !is_unset(&record.device_info.vendor) {
            return Ok(false);
        }
        record.device_info.vendor = vendor.to_string();
        self.save()?;
        Ok(true)
    }

    pub fn set_label(&mut self, fingerprint_id: &str, key: &str, value: &str) -> Result<bool> {
        let Some(record) = self.records.get_mut(fingerprint_id) else {
            return Ok(false);
        };
        record.user_labels.insert(key.to_string(), value.to_string());
        self.save()?;
        Ok(true)
    }

    pub fn get(&self, fingerprint_id: &str) -> Option<&FingerprintRecord> {
        self.records.get(fingerprint_id)
    }

    pub fn records(&self) -> &BTreeMap<String, FingerprintRecord> {
        &self.records
    }

    /// Known devices, most recently seen first.
    pub fn list_known_devices(&self) -> Vec<KnownDevice> {
        let mut out: Vec<KnownDevice> = self
            .records
            .values()
            .map(|r| KnownDevice {
                fingerprint_id: r.fingerprint_id.clone(),
                device_type: r.device_info.device_type.clone(),
                vendor: r.device_info.vendor.clone(),
                model: r.device_info.model.clone(),
                device_class: r.device_class,
                seen_count: r.seen_count,
                last_seen: r.last_seen,
                confidence: r.confidence,
                user_labels: r.user_labels.clone(),
            })
            .collect();
        out.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        out
    }

    fn save(&self) -> Result<()> {
        let path = &self.config.store_path;
        let write_err = |source: io::Error| Error::StoreWrite {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let json = serde_json::to_vec_pretty(&self.records).map_err(|e| write_err(e.into()))?;
        let tmp = tmp_path(path);
        fs::write(&tmp, json).map_err(write_err)?;
        fs::rename(&tmp, path).map_err(write_err)?;
        Ok(())
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn load_records(path: &Path) -> BTreeMap<String, FingerprintRecord> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "fingerprint store unreadable, starting empty");
            return BTreeMap::new();
        }
    };
    match serde_json::from_str(&content) {
        Ok(records) => records,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "fingerprint store corrupt, starting empty");
            BTreeMap::new()
        }
    }
}
