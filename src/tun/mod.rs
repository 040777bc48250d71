//! TUN device adapters.
//!
//! A device delivers raw IP packets (no link-layer header) on read and
//! accepts raw IP packets on write. Each platform backend also handles
//! address assignment and per-link DNS when the device is opened.

pub mod mem;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "windows")]
mod windows;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::config::TunnelConfig;

/// Device MTU; frames never exceed this on either direction.
pub const MTU: usize = 1500;

/// Opaque link identifier consumed by the route manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkId {
    /// Interface name (Linux, macOS).
    Name(String),
    /// Interface LUID (Windows).
    Luid(u64),
}

#[async_trait]
pub trait TunDevice: Send + Sync {
    fn name(&self) -> &str;

    fn identifier(&self) -> LinkId;

    /// Read one IP packet. Blocks until a packet arrives, the device is
    /// closed, or an unrecoverable error occurs.
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write one IP packet as a single frame.
    async fn write_packet(&self, buf: &[u8]) -> Result<usize>;

    /// Close the device, releasing addresses assigned on open. Unblocks any
    /// pending read with an error.
    async fn close(&self) -> Result<()>;
}

/// Open the platform TUN device described by `config`: create the interface,
/// assign the IPv4 address/mask, install per-link DNS servers and flush any
/// IPv6 routes on the link.
pub async fn open(config: &TunnelConfig) -> Result<Arc<dyn TunDevice>> {
    #[cfg(target_os = "linux")]
    {
        return Ok(Arc::new(linux::LinuxTun::open(config)?));
    }

    #[cfg(target_os = "macos")]
    {
        return Ok(Arc::new(macos::UtunDevice::open(config)?));
    }

    #[cfg(target_os = "windows")]
    {
        return Ok(Arc::new(windows::WintunDevice::open(config)?));
    }

    #[allow(unreachable_code)]
    {
        let _ = config;
        anyhow::bail!("tun devices are not supported on this platform");
    }
}
