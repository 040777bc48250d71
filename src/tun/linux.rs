//! Linux TUN backend.
//!
//! Creates the device through `/dev/net/tun` with `TUNSETIFF`
//! (`IFF_TUN | IFF_NO_PI`, non-blocking) and configures addressing with the
//! system `ip` tool, surfacing the tool's stderr on failure.

use std::ffi::c_void;
use std::net::Ipv4Addr;
use std::process::Command;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use super::{LinkId, TunDevice, MTU};
use crate::config::TunnelConfig;

const IFF_TUN: i16 = 0x0001;
const IFF_NO_PI: i16 = 0x1000;
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const IFNAMSIZ: usize = 16;

#[repr(C)]
struct IfReq {
    ifr_name: [u8; IFNAMSIZ],
    ifr_flags: i16,
    _pad: [u8; 22],
}

pub struct LinuxTun {
    name: String,
    fd: Mutex<Option<i32>>,
}

impl LinuxTun {
    pub fn open(config: &TunnelConfig) -> Result<Self> {
        let fd = create_tun(&config.name)?;

        let device = Self {
            name: config.name.clone(),
            fd: Mutex::new(Some(fd)),
        };
        if let Err(e) = device.configure(config) {
            let _ = device.close_fd();
            return Err(e);
        }
        Ok(device)
    }

    fn configure(&self, config: &TunnelConfig) -> Result<()> {
        let addr = format!("{}/{}", config.address, config.mask_prefix());

        if let Err(e) = run_ip(&["addr", "add", &addr, "dev", &self.name]) {
            // A stale address from a previous run is cleaned and retried once.
            if !e.to_string().contains("File exists") {
                return Err(e);
            }
            run_ip(&["addr", "flush", "dev", &self.name])?;
            run_ip(&["addr", "add", &addr, "dev", &self.name])?;
        }

        run_ip(&["link", "set", "dev", &self.name, "up"])?;
        let mtu = MTU.to_string();
        run_ip(&["link", "set", "dev", &self.name, "mtu", &mtu])?;

        // The traffic plane is IPv4-only; leftover v6 routes would bypass it.
        if let Err(e) = run_ip(&["-6", "route", "flush", "dev", &self.name]) {
            debug!(error = %e, "ipv6 route flush failed");
        }

        if !config.dns.is_empty() {
            if let Err(e) = set_link_dns(&self.name, &config.dns) {
                warn!(error = %e, "failed to set per-link dns servers");
            }
        }
        Ok(())
    }

    fn current_fd(&self) -> Result<i32> {
        self.fd
            .lock()
            .map_err(|_| anyhow::anyhow!("tun fd mutex poisoned"))?
            .ok_or_else(|| anyhow::anyhow!("tun device closed"))
    }

    fn close_fd(&self) -> Result<()> {
        let mut guard = self
            .fd
            .lock()
            .map_err(|_| anyhow::anyhow!("tun fd mutex poisoned"))?;
        if let Some(fd) = guard.take() {
            let ret = unsafe { libc::close(fd) };
            if ret < 0 {
                bail!("close(tun) failed: {}", std::io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TunDevice for LinuxTun {
    fn name(&self) -> &str {
        &self.name
    }

    fn identifier(&self) -> LinkId {
        LinkId::Name(self.name.clone())
    }

    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            bail!("tun read buffer is empty");
        }
        loop {
            let fd = self.current_fd()?;
            let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast::<c_void>(), buf.len()) };
            if n > 0 {
                return Ok(n as usize);
            }
            if n == 0 {
                sleep(Duration::from_millis(2)).await;
                continue;
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => sleep(Duration::from_millis(2)).await,
                _ => bail!("read(tun) failed: {}", err),
            }
        }
    }

    async fn write_packet(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut written = 0usize;
        while written < buf.len() {
            let fd = self.current_fd()?;
            let n = unsafe {
                libc::write(
                    fd,
                    buf[written..].as_ptr().cast::<c_void>(),
                    buf.len() - written,
                )
            };
            if n > 0 {
                written += n as usize;
                continue;
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => sleep(Duration::from_millis(2)).await,
                _ => bail!("write(tun) failed: {}", err),
            }
        }
        Ok(written)
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = run_ip(&["addr", "flush", "dev", &self.name]) {
            debug!(error = %e, "address flush on close failed");
        }
        self.close_fd()
    }
}

fn create_tun(name: &str) -> Result<i32> {
    if name.len() >= IFNAMSIZ {
        bail!("tun interface name too long: {}", name);
    }

    let fd = unsafe {
        libc::open(
            b"/dev/net/tun\0".as_ptr().cast(),
            libc::O_RDWR | libc::O_NONBLOCK,
        )
    };
    if fd < 0 {
        bail!(
            "open(/dev/net/tun) failed: {}",
            std::io::Error::last_os_error()
        );
    }

    let mut ifr = IfReq {
        ifr_name: [0u8; IFNAMSIZ],
        ifr_flags: IFF_TUN | IFF_NO_PI,
        _pad: [0u8; 22],
    };
    ifr.ifr_name[..name.len()].copy_from_slice(name.as_bytes());

    let ret = unsafe { libc::ioctl(fd, TUNSETIFF as _, &mut ifr) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        bail!("ioctl(TUNSETIFF) failed for {}: {}", name, err);
    }
    Ok(fd)
}

fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .with_context(|| format!("failed to execute: ip {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

fn set_link_dns(name: &str, servers: &[Ipv4Addr]) -> Result<()> {
    let mut args = vec!["dns".to_string(), name.to_string()];
    args.extend(servers.iter().map(|ip| ip.to_string()));
    let output = Command::new("resolvectl")
        .args(&args)
        .output()
        .context("failed to execute resolvectl")?;
    if !output.status.success() {
        bail!(
            "resolvectl dns failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
