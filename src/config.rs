use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Settings for the `tunnel` transport, parsed from JSON.
///
/// `name` doubles as the seed for the deterministic adapter GUID on Windows,
/// so keeping it stable across restarts reuses the same adapter.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct TunnelConfig {
    /// Policy level applied to inbound flows.
    pub user_level: u32,
    /// IPv4 address assigned to the TUN interface.
    pub address: Ipv4Addr,
    /// Gateway the default route points at once the tunnel is up.
    pub gateway: Ipv4Addr,
    /// Dotted-quad netmask for the TUN interface.
    pub mask: Ipv4Addr,
    /// Per-link DNS servers (IPv4 only).
    pub dns: Vec<Ipv4Addr>,
    /// TUN interface name.
    pub name: String,
    /// Install the Windows DNS-leak firewall filters while the tunnel runs.
    pub fix_dns_leak: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            user_level: 0,
            address: Ipv4Addr::new(10, 0, 0, 2),
            gateway: Ipv4Addr::new(10, 0, 0, 1),
            mask: Ipv4Addr::new(255, 255, 255, 0),
            dns: vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1)],
            name: "tunbridge0".to_string(),
            fix_dns_leak: false,
        }
    }
}

impl TunnelConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Prefix length of the configured netmask.
    pub fn mask_prefix(&self) -> u8 {
        self.mask
            .octets()
            .iter()
            .map(|octet| octet.count_ones() as u8)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let cfg = TunnelConfig::default();
        assert_eq!(cfg.address, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(cfg.gateway, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(cfg.mask_prefix(), 24);
        assert_eq!(cfg.name, "tunbridge0");
        assert!(!cfg.fix_dns_leak);
    }

    #[test]
    fn parses_recognised_keys() {
        let cfg: TunnelConfig = serde_json::from_str(
            r#"{
                "userLevel": 3,
                "address": "198.18.0.2",
                "gateway": "198.18.0.1",
                "mask": "255.254.0.0",
                "dns": ["9.9.9.9"],
                "name": "wg-bridge",
                "fixDnsLeak": true
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.user_level, 3);
        assert_eq!(cfg.address, Ipv4Addr::new(198, 18, 0, 2));
        assert_eq!(cfg.mask_prefix(), 15);
        assert_eq!(cfg.dns, vec![Ipv4Addr::new(9, 9, 9, 9)]);
        assert_eq!(cfg.name, "wg-bridge");
        assert!(cfg.fix_dns_leak);
    }

    #[test]
    fn rejects_unknown_keys() {
        let err = serde_json::from_str::<TunnelConfig>(r#"{"tunName": "x"}"#).unwrap_err();
        assert!(err.to_string().contains("tunName"));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"name": "t0", "dns": []}}"#).unwrap();
        let cfg = TunnelConfig::load(file.path()).unwrap();
        assert_eq!(cfg.name, "t0");
        assert!(cfg.dns.is_empty());
    }

    #[test]
    fn load_missing_file_fails() {
        assert!(TunnelConfig::load("/nonexistent/tunbridge.json").is_err());
    }
}
