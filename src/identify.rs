//! Device identification: fuses MAC vendor, port signatures, HTTP and banner evidence into a
//! single `(device_type, vendor, confidence)` verdict.
//!
//! Scoring is additive per archetype. The gateway rule short-circuits everything else, and
//! ties resolve to the archetype that scored first.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::collectors::{DeviceInference, HttpProber, InferenceRequest, VendorLookup};
use crate::config::IdentificationWeights;
use crate::netdetect::is_gateway_address;
use crate::types::{Confidence, DeviceEvidence, HttpInfo, IdentificationResult, UNKNOWN, UNKNOWN_DEVICE};

pub const ROUTER_GATEWAY: &str = "Router/Gateway";
pub const IP_CAMERA: &str = "IP Camera";
pub const NAS_STORAGE: &str = "NAS / Storage";
pub const SERVER: &str = "Server";
pub const IOT_DEVICE: &str = "IoT Device";
pub const STREAMING_DEVICE: &str = "Smart TV / Streaming Device";

/// Device types that also get the IoT exploit query and the IoT deep scan.
pub const IOT_LIKE: &[&str] = &[IOT_DEVICE, STREAMING_DEVICE, IP_CAMERA];

const GATEWAY_PORTS: &[u16] = &[80, 443, 53, 8080];

/// Characteristic port sets per archetype, in tie-break order.
pub const PORT_SIGNATURES: &[(&str, &[u16])] = &[
    ("Apple TV", &[3689, 7000, 49152]),
    ("Sonos Speaker", &[1400, 1443, 3400, 3401, 3500, 9000]),
    ("Philips Hue", &[80, 443, 1900]),
    ("Nest Device", &[443, 11095]),
    ("Ring Device", &[443, 8883]),
    ("Amazon Echo", &[4070, 55442, 55443]),
    ("Google Home", &[8008, 8009, 8443, 9000]),
    ("Roku", &[8060, 8443]),
    ("Fire TV", &[8008, 8009]),
    ("Chromecast", &[8008, 8009, 8443]),
    ("Smart Bulb", &[80, 9999]),
    ("Raspberry Pi", &[22, 80, 443]),
];

/// Vendor substring → archetype. Every matching key scores.
const VENDOR_DEVICES: &[(&str, &str)] = &[
    ("apple", "Apple Device"),
    ("sonos", "Sonos Speaker"),
    ("roku", "Roku"),
    ("philips", "Philips Device"),
    ("nest", "Nest Device"),
    ("ring", "Ring Device"),
    ("amazon", "Amazon Device"),
    ("google", "Google Device"),
    ("synology", "Synology NAS"),
    ("qnap", "QNAP NAS"),
    ("raspberry pi", "Raspberry Pi"),
];

/// Ports that identify a device without touching it; a real HTTP identification replaces these.
const QUICK_PORT_HINTS: &[(u16, &str, Confidence)] = &[
    (5000, NAS_STORAGE, Confidence::Medium),
    (5001, NAS_STORAGE, Confidence::Medium),
    (62078, "Apple Device", Confidence::High),
    (8008, "Chromecast / Smart Display", Confidence::High),
    (9000, "Sonos Speaker", Confidence::High),
];

const HTTP_SERVER_RULES: &[(&[&str], &str, Confidence)] = &[
    (&["synology"], "Synology NAS", Confidence::High),
    (&["qnap"], "QNAP NAS", Confidence::High),
    (&["apache", "nginx"], "Web Server", Confidence::Medium),
    (&["mikrotik"], "MikroTik Router", Confidence::High),
];

const HTTP_TITLE_RULES: &[(&[&str], &str)] = &[
    (&["router", "gateway"], "Router"),
    (&["camera", "ipcam"], IP_CAMERA),
    (&["printer"], "Printer"),
    (&["nas", "storage"], "NAS"),
    (&["home assistant"], "Home Assistant"),
    (&["pi-hole"], "Pi-hole"),
    (&["unifi"], "UniFi Controller"),
];

const BANNER_RULES: &[(&[&str], &str)] = &[
    (&["dropbear"], "Embedded Device/Router"),
    (&["mikrotik"], "MikroTik Router"),
    (&["ubnt", "ubiquiti"], "Ubiquiti Device"),
    (&["synology"], "Synology NAS"),
    (&["qnap"], "QNAP NAS"),
];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Classify a device page by its `Server` header and title. Title rules refine the server
/// verdict; a generic "router" title never overrides a specific server match.
pub fn classify_http(info: &HttpInfo) -> Option<(String, Confidence)> {
    let mut verdict: Option<(String, Confidence)> = None;
    if let Some(server) = info.server.as_deref().map(str::to_lowercase) {
        verdict = HTTP_SERVER_RULES
            .iter()
            .find(|(keys, _, _)| contains_any(&server, keys))
            .map(|(_, t, c)| (t.to_string(), *c));
    }
    if let Some(title) = info.title.as_deref().map(str::to_lowercase) {
        if let Some((_, t)) = HTTP_TITLE_RULES.iter().find(|(keys, _)| contains_any(&title, keys)) {
            let device_type = match (&verdict, *t) {
                (Some((prev, _)), "Router") => prev.clone(),
                _ => t.to_string(),
            };
            verdict = Some((device_type, Confidence::High));
        }
    }
    verdict
}

/// First banner (in port order) that looks like a known embedded device.
pub fn classify_banners(banners: &BTreeMap<u16, String>) -> Option<(u16, &'static str)> {
    banners.iter().find_map(|(port, banner)| {
        let lower = banner.to_lowercase();
        BANNER_RULES
            .iter()
            .find(|(keys, _)| contains_any(&lower, keys))
            .map(|(_, t)| (*port, *t))
    })
}

/// Collected evidence before scoring.
#[derive(Debug, Clone, Default)]
pub struct Indicators {
    /// Archetype → (matched ports, signature size).
    pub port_matches: Vec<(String, usize, usize)>,
    pub vendor: Option<String>,
    pub http: Option<(String, Confidence)>,
    pub banner: Option<String>,
}

impl Indicators {
    pub fn from_ports(ports: &[u16]) -> Self {
        let port_matches = PORT_SIGNATURES
            .iter()
            .filter_map(|(name, sig)| {
                let matched = sig.iter().filter(|p| ports.contains(p)).count();
                (matched > 0).then(|| (name.to_string(), matched, sig.len()))
            })
            .collect();
        Self {
            port_matches,
            ..Default::default()
        }
    }
}

/// Score indicators into a device type and confidence. Pure; exposed for calibration tests.
pub fn score(ind: &Indicators, w: &IdentificationWeights) -> (String, Confidence, f64) {
    let mut scores: Vec<(String, f64)> = Vec::new();
    let mut add = |device_type: &str, points: f64| {
        match scores.iter_mut().find(|(t, _)| t == device_type) {
            Some((_, s)) => *s += points,
            None => scores.push((device_type.to_string(), points)),
        }
    };

    for (name, matched, size) in &ind.port_matches {
        add(name, *matched as f64 / *size as f64 * w.port_signature_points);
    }
    if let Some(vendor) = ind.vendor.as_deref().filter(|v| *v != UNKNOWN) {
        let lower = vendor.to_lowercase();
        for (key, device_type) in VENDOR_DEVICES {
            if lower.contains(key) {
                add(device_type, w.vendor_points);
            }
        }
    }
    if let Some((device_type, conf)) = &ind.http {
        let points = match conf {
            Confidence::High => w.http_high_points,
            Confidence::Medium => w.http_medium_points,
            Confidence::Low => w.http_low_points,
        };
        add(device_type, points);
    }
    if let Some(device_type) = &ind.banner {
        add(device_type, w.banner_points);
    }

    // an equal score never displaces the earlier archetype
    let best = scores.into_iter().fold(None::<(String, f64)>, |best, cand| match best {
        Some(b) if b.1 >= cand.1 => Some(b),
        _ => Some(cand),
    });
    match best {
        Some((device_type, s)) => {
            let conf = if s >= w.high_threshold {
                Confidence::High
            } else if s >= w.medium_threshold {
                Confidence::Medium
            } else {
                Confidence::Low
            };
            (device_type, conf, s)
        }
        None => (UNKNOWN_DEVICE.to_string(), Confidence::Low, 0.0),
    }
}

/// Rule-based guess from ports and OS alone, first match wins. Never above medium.
pub fn fallback_classify(ports: &[u16], os_guess: &str) -> Option<(&'static str, Confidence, &'static str)> {
    let has = |p: u16| ports.contains(&p);
    let any = |set: &[u16]| set.iter().any(|p| ports.contains(p));
    let count = |set: &[u16]| set.iter().filter(|p| ports.contains(p)).count();

    let rule = if any(&[554, 8554, 37777]) {
        Some((IP_CAMERA, Confidence::Medium, "rtsp/dvr port"))
    } else if any(&[9100, 631, 515]) {
        Some(("Printer", Confidence::Medium, "printing service port"))
    } else if count(&[5000, 5001, 445, 139, 548]) >= 2 {
        Some((NAS_STORAGE, Confidence::Medium, "file sharing ports"))
    } else if any(&[3074, 3478, 3479, 3480]) {
        Some(("Game Console", Confidence::Medium, "gaming network ports"))
    } else if any(&[8008, 8009, 8443, 9000]) {
        Some((STREAMING_DEVICE, Confidence::Medium, "casting/streaming ports"))
    } else if has(3389) {
        Some(("Windows PC", Confidence::Medium, "rdp"))
    } else if any(&[1883, 8883, 5683]) {
        Some((IOT_DEVICE, Confidence::Medium, "mqtt/coap"))
    } else if any(&[1433, 1521, 3306, 5432, 6379, 27017]) {
        Some(("Database Server", Confidence::Medium, "database port"))
    } else if has(22) && has(443) {
        Some((SERVER, Confidence::Medium, "ssh+https"))
    } else if os_guess.contains("Windows") {
        Some(("Windows Computer", Confidence::Medium, "os guess"))
    } else if os_guess.contains("Linux") || os_guess.contains("macOS") {
        Some(("Linux/Mac Computer", Confidence::Medium, "os guess"))
    } else if ports.len() <= 2 && (has(80) || has(23)) {
        Some((IOT_DEVICE, Confidence::Low, "minimal ports"))
    } else {
        None
    };
    rule.map(|(t, c, why)| (t, c.min(Confidence::Medium), why))
}

/// Output of [`IdentificationEngine::identify`]: the verdict plus any HTTP info probed on the way.
#[derive(Debug, Clone)]
pub struct Identification {
    pub result: IdentificationResult,
    pub http_info: Option<HttpInfo>,
}

pub struct IdentificationEngine {
    vendors: Arc<dyn VendorLookup>,
    http: Arc<dyn HttpProber>,
    inference: Option<Arc<dyn DeviceInference>>,
    weights: IdentificationWeights,
}

impl IdentificationEngine {
    pub fn new(
        vendors: Arc<dyn VendorLookup>,
        http: Arc<dyn HttpProber>,
        inference: Option<Arc<dyn DeviceInference>>,
        weights: IdentificationWeights,
    ) -> Self {
        Self {
            vendors,
            http,
            inference,
            weights,
        }
    }

    pub async fn identify(&self, evidence: &DeviceEvidence, use_augmented: bool) -> Identification {
        let ports = evidence.port_numbers();
        let vendor = self.vendors.lookup_mac_vendor(&evidence.mac).await;
        let mut indicators = BTreeMap::new();
        if vendor != UNKNOWN {
            indicators.insert("vendor".to_string(), vendor.clone());
        }

        if is_gateway_address(&evidence.ip) && GATEWAY_PORTS.iter().any(|p| ports.contains(p)) {
            indicators.insert("gateway_ip".to_string(), evidence.ip.clone());
            return Identification {
                result: IdentificationResult {
                    device_type: ROUTER_GATEWAY.to_string(),
                    vendor,
                    confidence: Confidence::High,
                    indicators,
                },
                http_info: None,
            };
        }

        let mut ind = Indicators::from_ports(&ports);
        for (name, matched, size) in &ind.port_matches {
            indicators.insert(format!("ports:{name}"), format!("{matched}/{size}"));
        }
        ind.vendor = (vendor != UNKNOWN).then(|| vendor.clone());

        if let Some((port, device_type, conf)) =
            QUICK_PORT_HINTS.iter().find(|(p, _, _)| ports.contains(p))
        {
            indicators.insert("port_hint".to_string(), format!("{port} -> {device_type}"));
            ind.http = Some((device_type.to_string(), *conf));
        }

        let mut http_info = None;
        if let Some(port) = [80u16, 8080].into_iter().find(|p| ports.contains(p)) {
            if let Some(info) = self.http.probe_http(&evidence.ip, port).await {
                if let Some((device_type, conf)) = classify_http(&info) {
                    indicators.insert("http".to_string(), format!("{device_type} ({conf})"));
                    ind.http = Some((device_type, conf));
                }
                http_info = Some(info);
            }
        }

        if let Some((port, device_type)) = classify_banners(&evidence.banners) {
            indicators.insert(format!("banner:{port}"), device_type.to_string());
            ind.banner = Some(device_type.to_string());
        }

        let (mut device_type, mut confidence, points) = score(&ind, &self.weights);
        debug!(ip = %evidence.ip, %device_type, %confidence, points, "scored");

        if device_type == UNKNOWN_DEVICE {
            if let Some((t, c, why)) = fallback_classify(&ports, &evidence.os_guess) {
                indicators.insert("fallback".to_string(), why.to_string());
                device_type = t.to_string();
                confidence = c;
            }
        }

        let mut result = IdentificationResult {
            device_type,
            vendor,
            confidence,
            indicators,
        };

        if result.is_unknown() && use_augmented {
            self.augment(evidence, &ports, &mut result).await;
        }

        Identification { result, http_info }
    }

    /// Ask the inference service; any failure keeps `result` as is.
    async fn augment(&self, evidence: &DeviceEvidence, ports: &[u16], result: &mut IdentificationResult) {
        let Some(inference) = &self.inference else {
            return;
        };
        let request = InferenceRequest {
            ip: evidence.ip.clone(),
            mac: evidence.mac.clone(),
            open_ports: ports.to_vec(),
            os_guess: evidence.os_guess.clone(),
            hostname: evidence.hostname.clone(),
            banners: evidence.banners.clone(),
        };
        match inference.infer_device_type(&request).await {
            Ok(Some(inferred)) if inferred.device_type != UNKNOWN_DEVICE => {
                result
                    .indicators
                    .insert("augmented".to_string(), inferred.device_type.clone());
                result.device_type = inferred.device_type;
                result.vendor = inferred.vendor;
                result.confidence = inferred.confidence;
            }
            Ok(_) => debug!(ip = %evidence.ip, "inference had no answer"),
            Err(e) => debug!(ip = %evidence.ip, error = %e, "inference failed"),
        }
    }
}
