//! Windows backend over the kernel IP-forward table (iphlpapi).
//!
//! Installing writes a `0.0.0.0/0` entry with metric 0 on the TUN's LUID;
//! restoring flushes every IPv4 route carried by that LUID.

use std::net::Ipv4Addr;

use anyhow::{bail, Result};

use super::DefaultRoute;

const AF_INET: u16 = 2;
const NO_ERROR: u32 = 0;

#[repr(C)]
#[derive(Clone, Copy)]
struct SockaddrInet {
    family: u16,
    port: u16,
    addr: [u8; 4],
    zero: [u8; 20],
}

impl SockaddrInet {
    fn v4(addr: Ipv4Addr) -> Self {
        Self {
            family: AF_INET,
            port: 0,
            addr: addr.octets(),
            zero: [0; 20],
        }
    }

    fn ipv4(&self) -> Option<Ipv4Addr> {
        (self.family == AF_INET).then(|| Ipv4Addr::from(self.addr))
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct IpAddressPrefix {
    prefix: SockaddrInet,
    prefix_length: u8,
    _pad: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct MibIpforwardRow2 {
    interface_luid: u64,
    interface_index: u32,
    _pad0: u32,
    destination_prefix: IpAddressPrefix,
    next_hop: SockaddrInet,
    site_prefix_length: u8,
    _pad1: [u8; 3],
    valid_lifetime: u32,
    preferred_lifetime: u32,
    metric: u32,
    protocol: u32,
    loopback: u8,
    autoconfigure_address: u8,
    publish: u8,
    immortal: u8,
    age: u32,
    origin: u32,
}

#[repr(C)]
struct MibIpforwardTable2 {
    num_entries: u32,
    _pad: u32,
    table: [MibIpforwardRow2; 1],
}

extern "system" {
    fn GetIpForwardTable2(family: u16, table: *mut *mut MibIpforwardTable2) -> u32;
    fn FreeMibTable(memory: *mut std::ffi::c_void);
    fn InitializeIpForwardEntry(row: *mut MibIpforwardRow2);
    fn CreateIpForwardEntry2(row: *const MibIpforwardRow2) -> u32;
    fn DeleteIpForwardEntry2(row: *const MibIpforwardRow2) -> u32;
}

fn with_forward_table<T>(visit: impl FnOnce(&[MibIpforwardRow2]) -> T) -> Result<T> {
    let mut table: *mut MibIpforwardTable2 = std::ptr::null_mut();
    let status = unsafe { GetIpForwardTable2(AF_INET, &mut table) };
    if status != NO_ERROR || table.is_null() {
        bail!("GetIpForwardTable2 failed: {}", status);
    }
    let result = unsafe {
        let rows = std::slice::from_raw_parts(
            (*table).table.as_ptr(),
            (*table).num_entries as usize,
        );
        visit(rows)
    };
    unsafe { FreeMibTable(table.cast()) };
    Ok(result)
}

pub(super) fn query_default_route() -> Result<DefaultRoute> {
    let gateway = with_forward_table(|rows| {
        rows.iter()
            .filter(|row| row.destination_prefix.prefix_length == 0)
            .find_map(|row| row.next_hop.ipv4())
            .filter(|gw| !gw.is_unspecified())
    })?;
    let Some(gateway) = gateway else {
        bail!("no ipv4 default route found");
    };
    // The LUID addresses the link on this platform; interface details are
    // not needed for install or restore.
    Ok(DefaultRoute {
        gateway,
        interface_ip: Ipv4Addr::UNSPECIFIED,
        interface: String::new(),
    })
}

pub(super) fn install(luid: u64, tun_gateway: Ipv4Addr) -> Result<()> {
    let mut row: MibIpforwardRow2 = unsafe { std::mem::zeroed() };
    unsafe { InitializeIpForwardEntry(&mut row) };
    row.interface_luid = luid;
    row.destination_prefix = IpAddressPrefix {
        prefix: SockaddrInet::v4(Ipv4Addr::UNSPECIFIED),
        prefix_length: 0,
        _pad: [0; 3],
    };
    row.next_hop = SockaddrInet::v4(tun_gateway);
    row.metric = 0;

    let status = unsafe { CreateIpForwardEntry2(&row) };
    if status != NO_ERROR {
        bail!("CreateIpForwardEntry2 failed: {}", status);
    }
    Ok(())
}

/// Delete every IPv4 route on the given LUID. Deleting an already-flushed
/// table is a no-op.
pub(super) fn flush_v4(luid: u64) -> Result<()> {
    let rows = with_forward_table(|rows| {
        rows.iter()
            .filter(|row| row.interface_luid == luid)
            .copied()
            .collect::<Vec<_>>()
    })?;
    for row in rows {
        let status = unsafe { DeleteIpForwardEntry2(&row) };
        if status != NO_ERROR {
            bail!("DeleteIpForwardEntry2 failed: {}", status);
        }
    }
    Ok(())
}
