//! Ping sweep host discovery with MACs from the kernel ARP cache and names from reverse DNS.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::collectors::HostDiscovery;
use crate::error::{Error, Result};
use crate::netdetect;
use crate::types::{DiscoveredHost, UNKNOWN};

const ARP_TABLE: &str = "/proc/net/arp";
const PTR_TIMEOUT: Duration = Duration::from_secs(2);

/// Guess an OS family from an observed IP TTL.
pub fn guess_os_from_ttl(ttl: u8) -> &'static str {
    match ttl {
        0 => UNKNOWN,
        1..=64 => "Linux/macOS/Unix",
        65..=128 => "Windows",
        _ => "Network Device (Cisco/Router)",
    }
}

/// Pull `ttl=NN` out of ping output (case-insensitive).
pub fn parse_ttl(output: &str) -> Option<u8> {
    let lower = output.to_ascii_lowercase();
    let idx = lower.find("ttl=")?;
    let digits: String = lower[idx + 4..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Parse `/proc/net/arp` content into an IP → upper-case MAC map, skipping incomplete entries.
pub fn parse_arp_table(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            let (ip, mac) = (cols.first()?, cols.get(3)?);
            if *mac == "00:00:00:00:00:00" {
                return None;
            }
            Some((ip.to_string(), mac.to_ascii_uppercase()))
        })
        .collect()
}

/// PTR answers carry a trailing root dot; an empty name is no name.
pub fn clean_hostname(name: &str) -> Option<String> {
    let name = name.trim().trim_end_matches('.');
    (!name.is_empty()).then(|| name.to_string())
}

/// Assemble a host record from what the sweep learned about `ip`.
pub fn describe_host(
    ip: IpAddr,
    ttl: Option<u8>,
    arp: &HashMap<String, String>,
    hostname: Option<String>,
) -> DiscoveredHost {
    let ip_s = ip.to_string();
    DiscoveredHost {
        mac: arp.get(&ip_s).cloned().unwrap_or_else(|| UNKNOWN.to_string()),
        ttl,
        hostname,
        os_guess: ttl.map_or(UNKNOWN, guess_os_from_ttl).to_string(),
        ip: ip_s,
    }
}

async fn read_arp_table() -> HashMap<String, String> {
    match tokio::fs::read_to_string(ARP_TABLE).await {
        Ok(content) => parse_arp_table(&content),
        Err(e) => {
            debug!(error = %e, "ARP cache unavailable, MACs left unknown");
            HashMap::new()
        }
    }
}

fn system_resolver() -> TokioAsyncResolver {
    TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
        debug!(error = %e, "no system resolver config, using defaults");
        TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
    })
}

/// Sweeps a subnet with the system `ping` binary.
#[derive(Debug, Clone)]
pub struct PingSweep {
    concurrency: usize,
}

impl PingSweep {
    pub fn new(concurrency: usize) -> Self {
        Self { concurrency: concurrency.clamp(1, 256) }
    }
}

impl Default for PingSweep {
    fn default() -> Self {
        Self::new(50)
    }
}

impl PingSweep {
    /// Reverse DNS for every host, bounded like the sweep itself.
    async fn reverse_names(&self, ips: &[IpAddr]) -> Result<HashMap<IpAddr, String>> {
        let resolver = system_resolver();
        let sem = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();
        for &ip in ips {
            let permit = sem
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Collector(format!("discovery semaphore closed: {e}")))?;
            let resolver = resolver.clone();
            set.spawn(async move {
                let _permit = permit;
                let lookup = tokio::time::timeout(PTR_TIMEOUT, resolver.reverse_lookup(ip)).await;
                let name = match lookup {
                    Ok(Ok(answer)) => answer.iter().next().and_then(|n| clean_hostname(&n.to_string())),
                    _ => None,
                };
                name.map(|n| (ip, n))
            });
        }

        let mut names = HashMap::new();
        while let Some(res) = set.join_next().await {
            if let Ok(Some((ip, name))) = res {
                names.insert(ip, name);
            }
        }
        Ok(names)
    }
}

async fn ping_host(ip: IpAddr) -> Option<u8> {
    let ip_s = ip.to_string();
    let mut cmd = Command::new("ping");
    if cfg!(windows) {
        cmd.args(["-n", "1", "-w", "1000", &ip_s]);
    } else {
        cmd.args(["-c", "1", "-W", "1", &ip_s]);
    }
    let out = tokio::time::timeout(std::time::Duration::from_secs(2), cmd.output())
        .await
        .ok()?
        .ok()?;
    if !out.status.success() {
        return None;
    }
    parse_ttl(&String::from_utf8_lossy(&out.stdout))
}

#[async_trait]
impl HostDiscovery for PingSweep {
    async fn discover_devices(&self, network: Option<IpNet>) -> Result<Vec<DiscoveredHost>> {
        let network = match network {
            Some(n) => netdetect::validate_network_cidr(&n.to_string())?,
            None => netdetect::detect_local_cidrs()?
                .into_iter()
                .next()
                .ok_or_else(|| Error::InvalidTarget("no local IPv4 network detected".into()))?,
        };
        let targets = netdetect::expand_cidr_to_ips(network);
        info!(%network, hosts = targets.len(), "starting ping sweep");

        let sem = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();
        for ip in targets {
            let permit = sem
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Collector(format!("discovery semaphore closed: {e}")))?;
            set.spawn(async move {
                let _permit = permit;
                ping_host(ip).await.map(|ttl| (ip, ttl))
            });
        }

        let mut alive = Vec::new();
        while let Some(res) = set.join_next().await {
            if let Ok(Some(hit)) = res {
                alive.push(hit);
            }
        }

        if alive.is_empty() {
            warn!(%network, "ping sweep found no hosts");
        }
        alive.sort_by_key(|(ip, _)| *ip);

        let arp = read_arp_table().await;
        let ips: Vec<IpAddr> = alive.iter().map(|(ip, _)| *ip).collect();
        let mut names = self.reverse_names(&ips).await?;
        Ok(alive
            .into_iter()
            .map(|(ip, ttl)| describe_host(ip, Some(ttl), &arp, names.remove(&ip)))
            .collect())
    }

    async fn describe_targets(&self, ips: Vec<IpAddr>) -> Result<Vec<DiscoveredHost>> {
        // Pinging first puts each target into the ARP cache.
        let sem = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();
        for ip in ips.iter().copied() {
            let permit = sem
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::Collector(format!("discovery semaphore closed: {e}")))?;
            set.spawn(async move {
                let _permit = permit;
                (ip, ping_host(ip).await)
            });
        }
        let mut ttls = HashMap::new();
        while let Some(res) = set.join_next().await {
            if let Ok((ip, Some(ttl))) = res {
                ttls.insert(ip, ttl);
            }
        }

        let arp = read_arp_table().await;
        let mut names = self.reverse_names(&ips).await?;
        Ok(ips
            .into_iter()
            .map(|ip| {
                let host = describe_host(ip, ttls.get(&ip).copied(), &arp, names.remove(&ip));
                if host.ttl.is_none() {
                    debug!(ip = %host.ip, "target did not answer ping, scanning anyway");
                }
                host
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_buckets() {
        assert_eq!(guess_os_from_ttl(0), "Unknown");
        assert_eq!(guess_os_from_ttl(63), "Linux/macOS/Unix");
        assert_eq!(guess_os_from_ttl(64), "Linux/macOS/Unix");
        assert_eq!(guess_os_from_ttl(127), "Windows");
        assert_eq!(guess_os_from_ttl(254), "Network Device (Cisco/Router)");
    }

    #[test]
    fn ttl_from_ping_output() {
        let linux = "64 bytes from 192.168.1.1: icmp_seq=1 ttl=64 time=0.512 ms";
        let windows = "Reply from 192.168.1.5: bytes=32 time<1ms TTL=128";
        assert_eq!(parse_ttl(linux), Some(64));
        assert_eq!(parse_ttl(windows), Some(128));
        assert_eq!(parse_ttl("Request timed out."), None);
    }

    #[test]
    fn arp_table_parsing() {
        let content = "IP address       HW type     Flags       HW address            Mask     Device\n\
                       192.168.1.1      0x1         0x2         aa:bb:cc:00:00:01     *        eth0\n\
                       192.168.1.9      0x1         0x0         00:00:00:00:00:00     *        eth0\n";
        let map = parse_arp_table(content);
        assert_eq!(map.get("192.168.1.1").map(String::as_str), Some("AA:BB:CC:00:00:01"));
        assert!(!map.contains_key("192.168.1.9"));
    }

    #[test]
    fn host_record_from_sweep_results() {
        let mut arp = HashMap::new();
        arp.insert("192.168.1.1".to_string(), "AA:BB:CC:00:00:01".to_string());

        let router = describe_host("192.168.1.1".parse().unwrap(), Some(255), &arp, Some("router.lan".into()));
        assert_eq!(router.mac, "AA:BB:CC:00:00:01");
        assert_eq!(router.os_guess, "Network Device (Cisco/Router)");
        assert_eq!(router.hostname.as_deref(), Some("router.lan"));

        let silent = describe_host("192.168.1.7".parse().unwrap(), None, &arp, None);
        assert_eq!(silent.mac, "Unknown");
        assert_eq!(silent.ttl, None);
        assert_eq!(silent.os_guess, "Unknown");
    }

    #[test]
    fn ptr_names_lose_the_root_dot() {
        assert_eq!(clean_hostname("nas.home.arpa.").as_deref(), Some("nas.home.arpa"));
        assert_eq!(clean_hostname("printer").as_deref(), Some("printer"));
        assert_eq!(clean_hostname("."), None);
        assert_eq!(clean_hostname(""), None);
    }
}
