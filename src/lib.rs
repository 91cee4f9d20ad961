//! Library crate for homeguard-rs: home network discovery, device identification,
//! fingerprinting and security reporting.
pub mod agent;
pub mod backend;
pub mod collectors;
pub mod config;
pub mod deep_scan;
pub mod discovery;
pub mod error;
pub mod fingerprint;
pub mod http_probe;
pub mod identify;
pub mod logging;
pub mod monitor;
pub mod netdetect;
pub mod orchestrator;
pub mod oui;
pub mod ports;
pub mod rate_limit;
pub mod remediation;
pub mod report;
pub mod scanner;
pub mod security;
pub mod server;
pub mod threat_intel;
pub mod tools;
pub mod types;
