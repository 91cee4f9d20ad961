use if_addrs::{get_if_addrs, IfAddr};
use ipnet::{IpNet, Ipv4Net};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::{Error, Result};

/// Smallest prefix accepted for a sweep (/16 = 65k hosts).
pub const MIN_PREFIX_LEN: u8 = 16;

/// Detect local non-loopback IPv4 addresses and convert each to a default /24 CIDR network.
///
/// For example, an interface IP `192.168.1.42` becomes `192.168.1.0/24`.
/// Duplicates are removed.
pub fn detect_local_cidrs() -> Result<Vec<IpNet>> {
    let mut set = HashSet::<Ipv4Net>::new();
    for iface in get_if_addrs()? {
        if let IfAddr::V4(v4) = iface.addr {
            if v4.ip.is_loopback() {
                continue;
            }
            set.insert(ipv4_to_default_cidr(v4.ip));
        }
    }
    let mut cidrs: Vec<IpNet> = set.into_iter().map(IpNet::V4).collect();
    cidrs.sort_by_key(|n| match n {
        IpNet::V4(n4) => (u32::from(n4.network()), n4.prefix_len()),
        IpNet::V6(_) => (0, 0),
    });
    Ok(cidrs)
}

/// Expand a CIDR into individual host addresses.
///
/// For IPv4, excludes the network and broadcast addresses. IPv6 is never swept and
/// returns an empty list.
pub fn expand_cidr_to_ips(cidr: IpNet) -> Vec<IpAddr> {
    match cidr {
        IpNet::V4(n4) => expand_ipv4net_hosts(n4)
            .into_iter()
            .map(IpAddr::V4)
            .collect(),
        IpNet::V6(_) => Vec::new(),
    }
}

pub fn ipv4_to_default_cidr(ip: Ipv4Addr) -> Ipv4Net {
    let o = ip.octets();
    Ipv4Net::new(Ipv4Addr::new(o[0], o[1], o[2], 0), 24).unwrap_or_else(|_| Ipv4Net::from(ip))
}

fn expand_ipv4net_hosts(net: Ipv4Net) -> Vec<Ipv4Addr> {
    let start = u32::from(net.network());
    let end = u32::from(net.broadcast());
    if end <= start + 1 {
        return Vec::new();
    }
    (start + 1..end).map(Ipv4Addr::from).collect()
}

/// Parse and check that `ip` is a private, non-loopback, non-multicast address.
pub fn validate_target_ip(ip: &str) -> Result<IpAddr> {
    let addr: IpAddr = ip
        .trim()
        .parse()
        .map_err(|_| Error::InvalidTarget(format!("{ip}: invalid IP format")))?;
    if addr.is_loopback() {
        return Err(Error::InvalidTarget(format!("{ip}: loopback addresses not allowed")));
    }
    if addr.is_multicast() {
        return Err(Error::InvalidTarget(format!("{ip}: multicast addresses not allowed")));
    }
    if !is_private(&addr) {
        return Err(Error::InvalidTarget(format!("{ip}: only private network addresses allowed")));
    }
    Ok(addr)
}

/// Parse a sweep CIDR; it must be private and no larger than a /16.
pub fn validate_network_cidr(network: &str) -> Result<IpNet> {
    let net: IpNet = network
        .trim()
        .parse()
        .map_err(|_| Error::InvalidTarget(format!("{network}: invalid CIDR format")))?;
    let net = net.trunc();
    if !is_private(&net.network()) {
        return Err(Error::InvalidTarget(format!("{network}: only private networks allowed")));
    }
    if net.prefix_len() < MIN_PREFIX_LEN {
        return Err(Error::InvalidTarget(format!(
            "{network}: network too large (min /{MIN_PREFIX_LEN})"
        )));
    }
    Ok(net)
}

/// True when the last octet is a typical gateway suffix (`.1` or `.254`).
pub fn is_gateway_address(ip: &str) -> bool {
    ip.ends_with(".1") || ip.ends_with(".254")
}

fn is_private(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => is_unique_local_v6(v6) || is_unicast_link_local_v6(v6),
    }
}

fn is_unique_local_v6(v6: &Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xfe00) == 0xfc00
}

fn is_unicast_link_local_v6(v6: &Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xffc0) == 0xfe80
}
