//! Windows TUN backend over wintun.dll.
//!
//! The adapter GUID is derived deterministically from the interface name
//! (16 bytes of HKDF over MD5 keyed by the name), so the same config reuses
//! the same adapter across restarts. Addressing and per-link DNS go through
//! `netsh`; the route manager addresses the link by its LUID.

use std::process::Command;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use hkdf::Hkdf;
use md5::Md5;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

use super::{LinkId, TunDevice, MTU};
use crate::config::TunnelConfig;

const ERROR_NO_MORE_ITEMS: i32 = 259;
const ERROR_BUFFER_OVERFLOW: i32 = 111;
const RING_CAPACITY: u32 = 0x40_0000;

pub struct WintunDevice {
    name: String,
    luid: u64,
    address: String,
    runtime: Mutex<Option<WintunRuntime>>,
}

impl WintunDevice {
    pub fn open(config: &TunnelConfig) -> Result<Self> {
        let api = WintunApi::load()?;
        let guid = determine_guid(&config.name);
        let adapter = api.create_adapter(&config.name, "tunbridge", &guid)?;

        let mut luid = 0u64;
        unsafe { (api.get_adapter_luid)(adapter, &mut luid) };

        let session = match api.start_session(adapter, RING_CAPACITY) {
            Ok(session) => session,
            Err(e) => {
                unsafe { (api.close_adapter)(adapter) };
                return Err(e);
            }
        };

        let device = Self {
            name: config.name.clone(),
            luid,
            address: config.address.to_string(),
            runtime: Mutex::new(Some(WintunRuntime {
                api,
                adapter,
                session,
            })),
        };
        if let Err(e) = device.configure(config) {
            device.teardown();
            return Err(e);
        }
        Ok(device)
    }

    fn configure(&self, config: &TunnelConfig) -> Result<()> {
        let addr = config.address.to_string();
        let mask = config.mask.to_string();

        if let Err(e) = set_address(&self.name, &addr, &mask) {
            // A stale assignment from an earlier run is cleaned and retried
            // once; anything else is fatal.
            warn!(error = %e, "address assignment failed, cleaning and retrying");
            let _ = run_netsh(&[
                "interface",
                "ip",
                "delete",
                "address",
                &format!("name={}", self.name),
                &format!("addr={}", addr),
            ]);
            set_address(&self.name, &addr, &mask)?;
        }

        for (index, server) in config.dns.iter().enumerate() {
            let result = if index == 0 {
                run_netsh(&[
                    "interface",
                    "ip",
                    "set",
                    "dns",
                    &format!("name={}", self.name),
                    "source=static",
                    &format!("addr={}", server),
                    "validate=no",
                ])
            } else {
                run_netsh(&[
                    "interface",
                    "ip",
                    "add",
                    "dns",
                    &format!("name={}", self.name),
                    &format!("addr={}", server),
                    &format!("index={}", index + 1),
                    "validate=no",
                ])
            };
            if let Err(e) = result {
                warn!(server = %server, error = %e, "failed to set per-link dns");
            }
        }

        // The traffic plane is IPv4-only; drop any v6 routes on the link.
        if let Err(e) = run_netsh(&[
            "interface",
            "ipv6",
            "delete",
            "route",
            "prefix=::/0",
            &format!("interface={}", self.name),
        ]) {
            debug!(error = %e, "ipv6 route flush failed");
        }
        Ok(())
    }

    fn teardown(&self) {
        let mut guard = match self.runtime.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if let Some(runtime) = guard.take() {
            unsafe {
                (runtime.api.end_session)(runtime.session);
                (runtime.api.close_adapter)(runtime.adapter);
                FreeLibrary(runtime.api.module);
            }
        }
    }
}

#[async_trait]
impl TunDevice for WintunDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn identifier(&self) -> LinkId {
        LinkId::Luid(self.luid)
    }

    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            bail!("tun read buffer is empty");
        }
        loop {
            let result = {
                let guard = self
                    .runtime
                    .lock()
                    .map_err(|_| anyhow::anyhow!("wintun runtime mutex poisoned"))?;
                let runtime = guard
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("tun device closed"))?;

                let mut packet_len = 0u32;
                let packet =
                    unsafe { (runtime.api.receive_packet)(runtime.session, &mut packet_len) };
                if packet.is_null() {
                    let err = std::io::Error::last_os_error();
                    if err.raw_os_error() == Some(ERROR_NO_MORE_ITEMS) {
                        Ok(None)
                    } else {
                        Err(anyhow::anyhow!("WintunReceivePacket failed: {}", err))
                    }
                } else {
                    let len = packet_len as usize;
                    if len > buf.len() {
                        unsafe { (runtime.api.release_receive_packet)(runtime.session, packet) };
                        Err(anyhow::anyhow!(
                            "received packet too large: {} > {}",
                            len,
                            buf.len()
                        ))
                    } else {
                        unsafe {
                            std::ptr::copy_nonoverlapping(packet, buf.as_mut_ptr(), len);
                            (runtime.api.release_receive_packet)(runtime.session, packet);
                        }
                        Ok(Some(len))
                    }
                }
            };
            match result {
                Ok(Some(len)) => return Ok(len),
                Ok(None) => sleep(Duration::from_millis(5)).await,
                Err(e) => return Err(e),
            }
        }
    }

    async fn write_packet(&self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if buf.len() > MTU {
            bail!("packet exceeds mtu: {} bytes", buf.len());
        }
        loop {
            let result = {
                let guard = self
                    .runtime
                    .lock()
                    .map_err(|_| anyhow::anyhow!("wintun runtime mutex poisoned"))?;
                let runtime = guard
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("tun device closed"))?;

                let packet = unsafe {
                    (runtime.api.allocate_send_packet)(runtime.session, buf.len() as u32)
                };
                if packet.is_null() {
                    let err = std::io::Error::last_os_error();
                    if err.raw_os_error() == Some(ERROR_BUFFER_OVERFLOW) {
                        Ok(None)
                    } else {
                        Err(anyhow::anyhow!("WintunAllocateSendPacket failed: {}", err))
                    }
                } else {
                    unsafe {
                        std::ptr::copy_nonoverlapping(buf.as_ptr(), packet, buf.len());
                        (runtime.api.send_packet)(runtime.session, packet);
                    }
                    Ok(Some(buf.len()))
                }
            };
            match result {
                Ok(Some(len)) => return Ok(len),
                Ok(None) => sleep(Duration::from_millis(2)).await,
                Err(e) => return Err(e),
            }
        }
    }

    async fn close(&self) -> Result<()> {
        // Delete the address assigned on open before dropping the adapter.
        if let Err(e) = run_netsh(&[
            "interface",
            "ip",
            "delete",
            "address",
            &format!("name={}", self.name),
            &format!("addr={}", self.address),
        ]) {
            debug!(error = %e, "address delete on close failed");
        }
        self.teardown();
        Ok(())
    }
}

fn set_address(name: &str, addr: &str, mask: &str) -> Result<()> {
    run_netsh(&[
        "interface",
        "ip",
        "set",
        "address",
        &format!("name={}", name),
        "source=static",
        &format!("addr={}", addr),
        &format!("mask={}", mask),
        "gateway=none",
    ])
}

fn run_netsh(args: &[&str]) -> Result<()> {
    let output = Command::new("netsh")
        .args(args)
        .output()
        .with_context(|| format!("failed to execute: netsh {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "netsh {} failed: {}{}",
            args.join(" "),
            String::from_utf8_lossy(&output.stdout).trim(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Guid {
    data1: u32,
    data2: u16,
    data3: u16,
    data4: [u8; 8],
}

/// Derive a name-stable GUID: 16 bytes of HKDF(MD5, name).
fn determine_guid(name: &str) -> Guid {
    let hk = Hkdf::<Md5>::new(None, name.as_bytes());
    let mut okm = [0u8; 16];
    hk.expand(&[], &mut okm)
        .expect("16 bytes is a valid hkdf-md5 output length");
    Guid {
        data1: u32::from_ne_bytes([okm[0], okm[1], okm[2], okm[3]]),
        data2: u16::from_ne_bytes([okm[4], okm[5]]),
        data3: u16::from_ne_bytes([okm[6], okm[7]]),
        data4: [
            okm[8], okm[9], okm[10], okm[11], okm[12], okm[13], okm[14], okm[15],
        ],
    }
}

type HModule = *mut std::ffi::c_void;
type AdapterHandle = *mut std::ffi::c_void;
type SessionHandle = *mut std::ffi::c_void;

type CreateAdapterFn =
    unsafe extern "system" fn(*const u16, *const u16, *const Guid) -> AdapterHandle;
type CloseAdapterFn = unsafe extern "system" fn(AdapterHandle);
type GetAdapterLuidFn = unsafe extern "system" fn(AdapterHandle, *mut u64);
type StartSessionFn = unsafe extern "system" fn(AdapterHandle, u32) -> SessionHandle;
type EndSessionFn = unsafe extern "system" fn(SessionHandle);
type AllocateSendPacketFn = unsafe extern "system" fn(SessionHandle, u32) -> *mut u8;
type SendPacketFn = unsafe extern "system" fn(SessionHandle, *const u8);
type ReceivePacketFn = unsafe extern "system" fn(SessionHandle, *mut u32) -> *mut u8;
type ReleaseReceivePacketFn = unsafe extern "system" fn(SessionHandle, *const u8);

#[derive(Clone, Copy)]
struct WintunApi {
    module: HModule,
    create_adapter: CreateAdapterFn,
    close_adapter: CloseAdapterFn,
    get_adapter_luid: GetAdapterLuidFn,
    start_session: StartSessionFn,
    end_session: EndSessionFn,
    allocate_send_packet: AllocateSendPacketFn,
    send_packet: SendPacketFn,
    receive_packet: ReceivePacketFn,
    release_receive_packet: ReleaseReceivePacketFn,
}

impl WintunApi {
    fn load() -> Result<Self> {
        let library = to_utf16_null("wintun.dll");
        let module = unsafe { LoadLibraryW(library.as_ptr()) };
        if module.is_null() {
            bail!(
                "failed to load wintun.dll: {}",
                std::io::Error::last_os_error()
            );
        }
        unsafe {
            Ok(Self {
                module,
                create_adapter: load_proc(module, b"WintunCreateAdapter\0")?,
                close_adapter: load_proc(module, b"WintunCloseAdapter\0")?,
                get_adapter_luid: load_proc(module, b"WintunGetAdapterLUID\0")?,
                start_session: load_proc(module, b"WintunStartSession\0")?,
                end_session: load_proc(module, b"WintunEndSession\0")?,
                allocate_send_packet: load_proc(module, b"WintunAllocateSendPacket\0")?,
                send_packet: load_proc(module, b"WintunSendPacket\0")?,
                receive_packet: load_proc(module, b"WintunReceivePacket\0")?,
                release_receive_packet: load_proc(module, b"WintunReleaseReceivePacket\0")?,
            })
        }
    }

    fn create_adapter(&self, name: &str, tunnel_type: &str, guid: &Guid) -> Result<AdapterHandle> {
        let name_w = to_utf16_null(name);
        let type_w = to_utf16_null(tunnel_type);
        let adapter = unsafe { (self.create_adapter)(name_w.as_ptr(), type_w.as_ptr(), guid) };
        if adapter.is_null() {
            bail!(
                "WintunCreateAdapter({}) failed: {}",
                name,
                std::io::Error::last_os_error()
            );
        }
        Ok(adapter)
    }

    fn start_session(&self, adapter: AdapterHandle, capacity: u32) -> Result<SessionHandle> {
        let session = unsafe { (self.start_session)(adapter, capacity) };
        if session.is_null() {
            bail!(
                "WintunStartSession failed: {}",
                std::io::Error::last_os_error()
            );
        }
        Ok(session)
    }
}

struct WintunRuntime {
    api: WintunApi,
    adapter: AdapterHandle,
    session: SessionHandle,
}

// SAFETY: wintun session handles are documented as safe for concurrent use
// from multiple threads.
unsafe impl Send for WintunRuntime {}
unsafe impl Sync for WintunRuntime {}

fn to_utf16_null(value: &str) -> Vec<u16> {
    value.encode_utf16().chain(std::iter::once(0)).collect()
}

unsafe fn load_proc<T: Copy>(module: HModule, name: &[u8]) -> Result<T> {
    let proc = GetProcAddress(module, name.as_ptr());
    if proc.is_null() {
        bail!(
            "GetProcAddress({}) failed: {}",
            String::from_utf8_lossy(&name[..name.len().saturating_sub(1)]),
            std::io::Error::last_os_error()
        );
    }
    Ok(std::mem::transmute_copy(&proc))
}

extern "system" {
    fn LoadLibraryW(lp_lib_file_name: *const u16) -> HModule;
    fn GetProcAddress(h_module: HModule, lp_proc_name: *const u8) -> *mut std::ffi::c_void;
    fn FreeLibrary(h_lib_module: HModule) -> i32;
}
