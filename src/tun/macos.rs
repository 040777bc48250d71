//! macOS utun backend.
//!
//! Opens a `utun` kernel-control socket (`SYSPROTO_CONTROL`). The kernel
//! prefixes every packet with a 4-byte protocol-family header, which is
//! stripped on read and prepended on write. Addressing goes through
//! `ifconfig` as a point-to-point link.

use std::ffi::c_void;
use std::process::Command;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::time::{sleep, Duration};
use tracing::debug;

use super::{LinkId, TunDevice, MTU};
use crate::config::TunnelConfig;

const PF_SYSTEM: i32 = 32;
const AF_SYS_CONTROL: u16 = 2;
const SYSPROTO_CONTROL: i32 = 2;
const CTLIOCGINFO: libc::c_ulong = 0xc064_4e03;
const UTUN_CONTROL_NAME: &[u8] = b"com.apple.net.utun_control";

#[repr(C)]
struct CtlInfo {
    ctl_id: u32,
    ctl_name: [u8; 96],
}

#[repr(C)]
struct SockaddrCtl {
    sc_len: u8,
    sc_family: u8,
    ss_sysaddr: u16,
    sc_id: u32,
    sc_unit: u32,
    sc_reserved: [u32; 5],
}

pub struct UtunDevice {
    name: String,
    fd: Mutex<Option<i32>>,
}

impl UtunDevice {
    pub fn open(config: &TunnelConfig) -> Result<Self> {
        let unit = parse_utun_unit(&config.name)?;
        let fd = create_utun(unit)?;

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
        let output = Command::new("ifconfig")
            .args([
                &self.name,
                &config.address.to_string(),
                &config.gateway.to_string(),
                "netmask",
                &config.mask.to_string(),
                "mtu",
                &MTU.to_string(),
                "up",
            ])
            .output()
            .context("failed to execute ifconfig")?;
        if !output.status.success() {
            bail!(
                "ifconfig {} failed: {}",
                self.name,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        if !config.dns.is_empty() {
            // Scoped resolvers need the SystemConfiguration store; the
            // DNS-leak protection relies on routing alone here.
            debug!(link = %self.name, "per-link dns is not configured on macos");
        }
        Ok(())
    }

    fn current_fd(&self) -> Result<i32> {
        self.fd
            .lock()
            .map_err(|_| anyhow::anyhow!("utun fd mutex poisoned"))?
            .ok_or_else(|| anyhow::anyhow!("tun device closed"))
    }

    fn close_fd(&self) -> Result<()> {
        let mut guard = self
            .fd
            .lock()
            .map_err(|_| anyhow::anyhow!("utun fd mutex poisoned"))?;
        if let Some(fd) = guard.take() {
            let ret = unsafe { libc::close(fd) };
            if ret < 0 {
                bail!("close(utun) failed: {}", std::io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TunDevice for UtunDevice {
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
        let mut frame = vec![0u8; buf.len() + 4];
        loop {
            let fd = self.current_fd()?;
            let n = unsafe { libc::read(fd, frame.as_mut_ptr().cast::<c_void>(), frame.len()) };
            if n > 4 {
                let n = (n as usize) - 4;
                buf[..n].copy_from_slice(&frame[4..4 + n]);
                return Ok(n);
            }
            if n >= 0 {
                sleep(Duration::from_millis(2)).await;
                continue;
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => sleep(Duration::from_millis(2)).await,
                _ => bail!("read(utun) failed: {}", err),
            }
        }
    }

    async fn write_packet(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut frame = Vec::with_capacity(buf.len() + 4);
        frame.extend_from_slice(&(libc::AF_INET as u32).to_be_bytes());
        frame.extend_from_slice(buf);
        loop {
            let fd = self.current_fd()?;
            let n = unsafe { libc::write(fd, frame.as_ptr().cast::<c_void>(), frame.len()) };
            if n > 0 {
                return Ok(buf.len());
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => sleep(Duration::from_millis(2)).await,
                _ => bail!("write(utun) failed: {}", err),
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.close_fd()
    }
}

fn parse_utun_unit(name: &str) -> Result<u32> {
    let n = name
        .strip_prefix("utun")
        .and_then(|suffix| suffix.parse::<u32>().ok())
        .ok_or_else(|| anyhow::anyhow!("macos tun name must look like utunN, got {}", name))?;
    Ok(n + 1)
}

fn create_utun(unit: u32) -> Result<i32> {
    let fd = unsafe { libc::socket(PF_SYSTEM, libc::SOCK_DGRAM, SYSPROTO_CONTROL) };
    if fd < 0 {
        bail!(
            "socket(PF_SYSTEM) failed: {}",
            std::io::Error::last_os_error()
        );
    }

    let mut info = CtlInfo {
        ctl_id: 0,
        ctl_name: [0u8; 96],
    };
    info.ctl_name[..UTUN_CONTROL_NAME.len()].copy_from_slice(UTUN_CONTROL_NAME);
    if unsafe { libc::ioctl(fd, CTLIOCGINFO as _, &mut info) } < 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        bail!("ioctl(CTLIOCGINFO) failed: {}", err);
    }

    let addr = SockaddrCtl {
        sc_len: std::mem::size_of::<SockaddrCtl>() as u8,
        sc_family: PF_SYSTEM as u8,
        ss_sysaddr: AF_SYS_CONTROL,
        sc_id: info.ctl_id,
        sc_unit: unit,
        sc_reserved: [0; 5],
    };
    let ret = unsafe {
        libc::connect(
            fd,
            (&addr as *const SockaddrCtl).cast(),
            std::mem::size_of::<SockaddrCtl>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        bail!("connect(utun) failed: {}", err);
    }

    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        bail!("fcntl(O_NONBLOCK) failed: {}", err);
    }
    Ok(fd)
}
