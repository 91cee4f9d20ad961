//! Fixable-vulnerability listing over a finished device record.

use crate::types::{DeviceRecord, FixableVulnerability, Severity};

struct VulnRule {
    vuln_id: &'static str,
    port: u16,
    severity: Severity,
    description: &'static str,
    fix_type: &'static str,
}

const TELNET_EXPOSED: VulnRule = VulnRule {
    vuln_id: "telnet_exposed",
    port: 23,
    severity: Severity::Critical,
    description: "Telnet service is exposed (unencrypted)",
    fix_type: "disable_service",
};

const SMB_V1_ENABLED: VulnRule = VulnRule {
    vuln_id: "smb_v1_enabled",
    port: 445,
    severity: Severity::Critical,
    description: "SMBv1 protocol enabled (ransomware risk)",
    fix_type: "disable_protocol",
};

const WEAK_SSL: VulnRule = VulnRule {
    vuln_id: "weak_ssl",
    port: 443,
    severity: Severity::High,
    description: "Weak SSL/TLS configuration detected",
    fix_type: "update_config",
};

const UPNP_ENABLED: VulnRule = VulnRule {
    vuln_id: "upnp_enabled",
    port: 1900,
    severity: Severity::Medium,
    description: "UPnP is enabled (port forwarding risk)",
    fix_type: "disable_service",
};

const HTTP_ADMIN: VulnRule = VulnRule {
    vuln_id: "http_admin",
    port: 80,
    severity: Severity::Medium,
    description: "Admin interface accessible over HTTP",
    fix_type: "redirect_https",
};

impl VulnRule {
    fn instance(&self, ip: &str) -> FixableVulnerability {
        FixableVulnerability {
            vuln_id: self.vuln_id.to_string(),
            ip: ip.to_string(),
            port: self.port,
            severity: self.severity,
            description: self.description.to_string(),
            fix_type: self.fix_type.to_string(),
        }
    }
}

/// Vulnerabilities with a known fix, judged from open ports and earlier check results.
pub fn identify_vulnerabilities(record: &DeviceRecord) -> Vec<FixableVulnerability> {
    let ip = record.ip();
    let weak_tls = record
        .encryption_check
        .as_ref()
        .is_some_and(|c| c.risk >= Severity::High);
    let upnp = record.upnp_check.as_ref().is_some_and(|c| c.upnp_enabled);
    let router = record.device_type().to_ascii_lowercase().contains("router");

    [
        (record.has_port(23), &TELNET_EXPOSED),
        (record.has_port(445), &SMB_V1_ENABLED),
        (weak_tls, &WEAK_SSL),
        (upnp, &UPNP_ENABLED),
        (router && record.has_port(80), &HTTP_ADMIN),
    ]
    .into_iter()
    .filter(|(hit, _)| *hit)
    .map(|(_, rule)| rule.instance(ip))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{EncryptionCheck, UpnpCheck};
    use crate::types::{DeviceEvidence, OpenPort};

    fn record(device_type: &str, ports: &[u16]) -> DeviceRecord {
        let mut ev = DeviceEvidence {
            ip: "192.168.1.1".into(),
            ..Default::default()
        };
        ev.set_open_ports(
            ports
                .iter()
                .map(|&port| OpenPort {
                    port,
                    service: String::new(),
                    risk: Severity::Low,
                    banner: None,
                })
                .collect(),
        );
        let mut rec = DeviceRecord::new(ev);
        rec.identification.device_type = device_type.into();
        rec
    }

    #[test]
    fn clean_device_has_nothing_to_fix() {
        assert!(identify_vulnerabilities(&record("Printer", &[631, 9100])).is_empty());
    }

    #[test]
    fn router_with_everything_wrong() {
        let mut rec = record("Router/Gateway", &[23, 80, 445]);
        rec.encryption_check = Some(EncryptionCheck {
            risk: Severity::High,
            ..Default::default()
        });
        rec.upnp_check = Some(UpnpCheck {
            upnp_enabled: true,
            ..Default::default()
        });
        let ids: Vec<String> = identify_vulnerabilities(&rec)
            .into_iter()
            .map(|v| v.vuln_id)
            .collect();
        assert_eq!(
            ids,
            vec!["telnet_exposed", "smb_v1_enabled", "weak_ssl", "upnp_enabled", "http_admin"]
        );
    }

    #[test]
    fn http_admin_only_for_routers() {
        let vulns = identify_vulnerabilities(&record("IP Camera", &[80]));
        assert!(vulns.is_empty());
        let vulns = identify_vulnerabilities(&record("Router/Gateway", &[80]));
        assert_eq!(vulns[0].port, 80);
        assert_eq!(vulns[0].severity, Severity::Medium);
    }
}
