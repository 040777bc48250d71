//! DNS-leak suppression.
//!
//! On Windows a dynamic (session-scoped) WFP sublayer drops DNS and any
//! non-TUN traffic while the tunnel is active, except traffic from this
//! process itself. The filters live until the process exits. Other
//! platforms rely on routing alone, so this is a no-op there.

#[cfg(target_os = "windows")]
mod windows;

use anyhow::Result;

pub fn fix_dns_leak(tun_name: &str) -> Result<()> {
    #[cfg(target_os = "windows")]
    {
        return windows::fix_dns_leak(tun_name);
    }

    #[allow(unreachable_code)]
    {
        let _ = tun_name;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #[test]
    #[cfg(not(target_os = "windows"))]
    fn noop_on_non_windows() {
        assert!(super::fix_dns_leak("tunbridge0").is_ok());
    }
}
