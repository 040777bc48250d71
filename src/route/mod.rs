//! Default-route management.
//!
//! The listener owns a [`RouteManager`]. It captures the current default
//! gateway and interface once (cached until process exit), installs the TUN
//! as the system default path, and restores the original configuration as a
//! deterministic teardown step when the listener closes. Restoring twice
//! leaves the system in the same state as restoring once.

#[cfg(target_os = "macos")]
mod darwin;
#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "windows")]
mod windows;

use std::net::Ipv4Addr;
use std::process::Command;

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::tun::LinkId;

/// Snapshot of the default route before the TUN takes over.
#[derive(Debug, Clone)]
pub struct DefaultRoute {
    pub gateway: Ipv4Addr,
    pub interface_ip: Ipv4Addr,
    pub interface: String,
}

enum Restore {
    #[cfg(any(target_os = "linux", target_os = "macos"))]
    Snapshot(DefaultRoute),
    #[cfg(target_os = "windows")]
    Luid(u64),
}

#[derive(Default)]
pub struct RouteManager {
    snapshot: Option<DefaultRoute>,
    installed: Option<Restore>,
}

impl RouteManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current default gateway, queried once and cached.
    pub fn default_gateway(&mut self) -> Result<Ipv4Addr> {
        Ok(self.snapshot()?.gateway)
    }

    /// Current default interface address and name, queried once and cached.
    pub fn default_interface(&mut self) -> Result<(Ipv4Addr, String)> {
        let snapshot = self.snapshot()?;
        Ok((snapshot.interface_ip, snapshot.interface.clone()))
    }

    fn snapshot(&mut self) -> Result<&DefaultRoute> {
        if self.snapshot.is_none() {
            let snapshot = query_default_route()?;
            debug!(
                gateway = %snapshot.gateway,
                interface = %snapshot.interface,
                "captured default route"
            );
            self.snapshot = Some(snapshot);
        }
        Ok(self.snapshot.as_ref().unwrap())
    }

    /// Make the TUN the system default path while keeping the original
    /// route reachable for the process's own upstream traffic.
    pub fn install(&mut self, tun_gateway: Ipv4Addr, link: &LinkId) -> Result<()> {
        if self.installed.is_some() {
            bail!("default route already installed");
        }

        #[cfg(target_os = "linux")]
        {
            let _ = link;
            let snapshot = self.snapshot()?.clone();
            linux::install(&snapshot, tun_gateway)?;
            self.installed = Some(Restore::Snapshot(snapshot));
            return Ok(());
        }

        #[cfg(target_os = "macos")]
        {
            let _ = link;
            let snapshot = self.snapshot()?.clone();
            darwin::install(&snapshot, tun_gateway)?;
            self.installed = Some(Restore::Snapshot(snapshot));
            return Ok(());
        }

        #[cfg(target_os = "windows")]
        {
            let LinkId::Luid(luid) = link else {
                bail!("windows route install requires the link luid");
            };
            windows::install(*luid, tun_gateway)?;
            self.installed = Some(Restore::Luid(*luid));
            return Ok(());
        }

        #[allow(unreachable_code)]
        {
            let _ = (tun_gateway, link);
            bail!("route management is not supported on this platform");
        }
    }

    /// Undo [`RouteManager::install`]. A second call is a no-op.
    pub fn restore(&mut self) -> Result<()> {
        let Some(restore) = self.installed.take() else {
            return Ok(());
        };
        match restore {
            #[cfg(target_os = "linux")]
            Restore::Snapshot(snapshot) => linux::restore(&snapshot),
            #[cfg(target_os = "macos")]
            Restore::Snapshot(snapshot) => darwin::restore(&snapshot),
            #[cfg(target_os = "windows")]
            Restore::Luid(luid) => windows::flush_v4(luid),
        }
    }

    pub fn is_installed(&self) -> bool {
        self.installed.is_some()
    }
}

fn query_default_route() -> Result<DefaultRoute> {
    #[cfg(target_os = "linux")]
    {
        return linux::query_default_route();
    }

    #[cfg(target_os = "macos")]
    {
        return darwin::query_default_route();
    }

    #[cfg(target_os = "windows")]
    {
        return windows::query_default_route();
    }

    #[allow(unreachable_code)]
    {
        bail!("route management is not supported on this platform");
    }
}

/// Run a system command, returning stdout. A failure carries the command's
/// combined output.
#[allow(dead_code)]
pub(crate) fn run_command(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("failed to execute: {} {}", program, args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "{} {} failed: {}{}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stdout).trim(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restore_without_install_is_noop() {
        let mut manager = RouteManager::new();
        assert!(!manager.is_installed());
        assert!(manager.restore().is_ok());
        assert!(manager.restore().is_ok());
    }
}
