//! Windows Filtering Platform filters plugging DNS leaks.
//!
//! One sublayer at maximum weight carries four filters, in descending
//! weight: block all IPv6 connects (the traffic plane is IPv4-only), permit
//! IPv4 connects from this process, permit IPv4 connects on the TUN
//! interface, and block IPv4/UDP connects to remote port 53.

use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use tracing::debug;

const FWPM_SESSION_FLAG_DYNAMIC: u32 = 1;
const FWPM_FILTER_FLAG_CLEAR_ACTION_RIGHT: u32 = 8;
const RPC_C_AUTHN_DEFAULT: u32 = 0xffff_ffff;
const NO_ERROR: u32 = 0;

const FWP_ACTION_BLOCK: u32 = 0x1001;
const FWP_ACTION_PERMIT: u32 = 0x1002;

const FWP_UINT8: u32 = 1;
const FWP_UINT16: u32 = 2;
const FWP_UINT32: u32 = 3;
const FWP_BYTE_BLOB_TYPE: u32 = 12;
const FWP_MATCH_EQUAL: u32 = 0;

const IPPROTO_UDP: u8 = 17;
const DNS_PORT: u16 = 53;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct Guid {
    data1: u32,
    data2: u16,
    data3: u16,
    data4: [u8; 8],
}

const fn guid(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Guid {
    Guid {
        data1,
        data2,
        data3,
        data4,
    }
}

// FWPM_LAYER_ALE_AUTH_CONNECT_V4
const LAYER_ALE_AUTH_CONNECT_V4: Guid = guid(
    0xc38d57d1,
    0x05a7,
    0x4c33,
    [0x90, 0x4f, 0x7f, 0xbc, 0xee, 0xe6, 0x0e, 0x82],
);
// FWPM_LAYER_ALE_AUTH_CONNECT_V6
const LAYER_ALE_AUTH_CONNECT_V6: Guid = guid(
    0x4a72393b,
    0x319f,
    0x44bc,
    [0x84, 0xc3, 0xba, 0x54, 0xdc, 0xb3, 0xb6, 0xb4],
);
// FWPM_CONDITION_ALE_APP_ID
const CONDITION_ALE_APP_ID: Guid = guid(
    0xd78e1e87,
    0x8644,
    0x4ea5,
    [0x94, 0x37, 0xd8, 0x09, 0xec, 0xef, 0xc9, 0x71],
);
// FWPM_CONDITION_IP_PROTOCOL
const CONDITION_IP_PROTOCOL: Guid = guid(
    0x3971ef2b,
    0x623e,
    0x4f9a,
    [0x8c, 0xb1, 0x6e, 0x79, 0xb8, 0x06, 0xb9, 0xa7],
);
// FWPM_CONDITION_IP_REMOTE_PORT
const CONDITION_IP_REMOTE_PORT: Guid = guid(
    0xc35a604d,
    0xd22b,
    0x482e,
    [0x99, 0x80, 0x41, 0xcd, 0xd0, 0xc3, 0xae, 0xd4],
);
// FWPM_CONDITION_LOCAL_INTERFACE_INDEX
const CONDITION_LOCAL_INTERFACE_INDEX: Guid = guid(
    0x667fd755,
    0xd695,
    0x434a,
    [0x8a, 0xf5, 0xd3, 0x83, 0x5a, 0x12, 0x59, 0xbc],
);

#[repr(C)]
struct FwpmDisplayData0 {
    name: *mut u16,
    description: *mut u16,
}

#[repr(C)]
struct FwpmSession0 {
    session_key: Guid,
    display_data: FwpmDisplayData0,
    flags: u32,
    txn_wait_timeout_ms: u32,
    process_id: u32,
    sid: *mut std::ffi::c_void,
    username: *mut u16,
    kernel_mode: i32,
}

#[repr(C)]
struct FwpByteBlob {
    size: u32,
    data: *mut u8,
}

#[repr(C)]
struct FwpmSublayer0 {
    sublayer_key: Guid,
    display_data: FwpmDisplayData0,
    flags: u32,
    provider_key: *mut Guid,
    provider_data: FwpByteBlob,
    weight: u16,
}

#[repr(C)]
struct FwpValue0 {
    value_type: u32,
    value: usize,
}

#[repr(C)]
struct FwpmFilterCondition0 {
    field_key: Guid,
    match_type: u32,
    condition_value: FwpValue0,
}

#[repr(C)]
struct FwpmAction0 {
    action_type: u32,
    filter_type: Guid,
}

#[repr(C)]
struct FwpmFilter0 {
    filter_key: Guid,
    display_data: FwpmDisplayData0,
    flags: u32,
    provider_key: *mut Guid,
    provider_data: FwpByteBlob,
    layer_key: Guid,
    sublayer_key: Guid,
    weight: FwpValue0,
    num_filter_conditions: u32,
    filter_condition: *mut FwpmFilterCondition0,
    action: FwpmAction0,
    context: u64,
    reserved: *mut Guid,
    filter_id: u64,
    effective_weight: FwpValue0,
}

#[link(name = "fwpuclnt")]
extern "system" {
    fn FwpmEngineOpen0(
        server_name: *const u16,
        authn_service: u32,
        auth_identity: *mut std::ffi::c_void,
        session: *const FwpmSession0,
        engine_handle: *mut usize,
    ) -> u32;
    fn FwpmSubLayerAdd0(
        engine_handle: usize,
        sublayer: *const FwpmSublayer0,
        sd: *mut std::ffi::c_void,
    ) -> u32;
    fn FwpmFilterAdd0(
        engine_handle: usize,
        filter: *const FwpmFilter0,
        sd: *mut std::ffi::c_void,
        id: *mut u64,
    ) -> u32;
    fn FwpmGetAppIdFromFileName0(file_name: *const u16, app_id: *mut *mut FwpByteBlob) -> u32;
    fn FwpmFreeMemory0(p: *mut *mut std::ffi::c_void);
}

#[link(name = "ole32")]
extern "system" {
    fn CoCreateGuid(guid: *mut Guid) -> i32;
}

#[link(name = "iphlpapi")]
extern "system" {
    fn ConvertInterfaceAliasToLuid(alias: *const u16, luid: *mut u64) -> u32;
    fn ConvertInterfaceLuidToIndex(luid: *const u64, index: *mut u32) -> u32;
}

/// Keeps the dynamic WFP session alive; the filters disappear when the
/// process exits and the engine handle is reclaimed.
static ENGINE: OnceLock<usize> = OnceLock::new();

pub(super) fn fix_dns_leak(tun_name: &str) -> Result<()> {
    if ENGINE.get().is_some() {
        return Ok(());
    }

    let session = FwpmSession0 {
        session_key: Guid::default(),
        display_data: display_data("tunbridge", "Session"),
        flags: FWPM_SESSION_FLAG_DYNAMIC,
        txn_wait_timeout_ms: 0,
        process_id: 0,
        sid: std::ptr::null_mut(),
        username: std::ptr::null_mut(),
        kernel_mode: 0,
    };
    let mut engine = 0usize;
    let status = unsafe {
        FwpmEngineOpen0(
            std::ptr::null(),
            RPC_C_AUTHN_DEFAULT,
            std::ptr::null_mut(),
            &session,
            &mut engine,
        )
    };
    if status != NO_ERROR {
        bail!("FwpmEngineOpen0 failed: {:#x}", status);
    }

    let mut sublayer_key = Guid::default();
    if unsafe { CoCreateGuid(&mut sublayer_key) } != 0 {
        bail!("failed to generate sublayer guid");
    }
    let sublayer = FwpmSublayer0 {
        sublayer_key,
        display_data: display_data("tunbridge", "Sublayer"),
        flags: 0,
        provider_key: std::ptr::null_mut(),
        provider_data: FwpByteBlob {
            size: 0,
            data: std::ptr::null_mut(),
        },
        weight: u16::MAX,
    };
    let status = unsafe { FwpmSubLayerAdd0(engine, &sublayer, std::ptr::null_mut()) };
    if status != NO_ERROR {
        bail!("FwpmSubLayerAdd0 failed: {:#x}", status);
    }

    // 1. Block all IPv6 connects.
    add_filter(
        engine,
        &sublayer_key,
        "Block all IPv6 traffic",
        LAYER_ALE_AUTH_CONNECT_V6,
        FWP_ACTION_BLOCK,
        13,
        0,
        &mut [],
    )?;

    // 2. Permit IPv4 connects from this process.
    let exe = std::env::current_exe().context("failed to resolve current executable")?;
    let exe_w = to_utf16_null(&exe.to_string_lossy());
    let mut app_id: *mut FwpByteBlob = std::ptr::null_mut();
    let status = unsafe { FwpmGetAppIdFromFileName0(exe_w.as_ptr(), &mut app_id) };
    if status != NO_ERROR {
        bail!("FwpmGetAppIdFromFileName0 failed: {:#x}", status);
    }
    let mut own_process = [FwpmFilterCondition0 {
        field_key: CONDITION_ALE_APP_ID,
        match_type: FWP_MATCH_EQUAL,
        condition_value: FwpValue0 {
            value_type: FWP_BYTE_BLOB_TYPE,
            value: app_id as usize,
        },
    }];
    let result = add_filter(
        engine,
        &sublayer_key,
        "Permit all traffic from this process",
        LAYER_ALE_AUTH_CONNECT_V4,
        FWP_ACTION_PERMIT,
        12,
        FWPM_FILTER_FLAG_CLEAR_ACTION_RIGHT,
        &mut own_process,
    );
    unsafe { FwpmFreeMemory0((&mut app_id as *mut *mut FwpByteBlob).cast()) };
    result?;

    // 3. Permit IPv4 connects whose local interface is the TUN.
    let index = interface_index(tun_name)?;
    let mut on_tun = [FwpmFilterCondition0 {
        field_key: CONDITION_LOCAL_INTERFACE_INDEX,
        match_type: FWP_MATCH_EQUAL,
        condition_value: FwpValue0 {
            value_type: FWP_UINT32,
            value: index as usize,
        },
    }];
    add_filter(
        engine,
        &sublayer_key,
        "Permit all traffic to the TUN device",
        LAYER_ALE_AUTH_CONNECT_V4,
        FWP_ACTION_PERMIT,
        11,
        0,
        &mut on_tun,
    )?;

    // 4. Block IPv4/UDP connects to remote port 53.
    let mut udp_53 = [
        FwpmFilterCondition0 {
            field_key: CONDITION_IP_PROTOCOL,
            match_type: FWP_MATCH_EQUAL,
            condition_value: FwpValue0 {
                value_type: FWP_UINT8,
                value: IPPROTO_UDP as usize,
            },
        },
        FwpmFilterCondition0 {
            field_key: CONDITION_IP_REMOTE_PORT,
            match_type: FWP_MATCH_EQUAL,
            condition_value: FwpValue0 {
                value_type: FWP_UINT16,
                value: DNS_PORT as usize,
            },
        },
    ];
    add_filter(
        engine,
        &sublayer_key,
        "Block all UDP traffic targeting port 53",
        LAYER_ALE_AUTH_CONNECT_V4,
        FWP_ACTION_BLOCK,
        10,
        0,
        &mut udp_53,
    )?;

    debug!(tun = tun_name, "dns-leak filters installed");
    let _ = ENGINE.set(engine);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn add_filter(
    engine: usize,
    sublayer_key: &Guid,
    description: &str,
    layer_key: Guid,
    action_type: u32,
    weight: u8,
    flags: u32,
    conditions: &mut [FwpmFilterCondition0],
) -> Result<()> {
    let filter = FwpmFilter0 {
        filter_key: Guid::default(),
        display_data: display_data("tunbridge", description),
        flags,
        provider_key: std::ptr::null_mut(),
        provider_data: FwpByteBlob {
            size: 0,
            data: std::ptr::null_mut(),
        },
        layer_key,
        sublayer_key: *sublayer_key,
        weight: FwpValue0 {
            value_type: FWP_UINT8,
            value: weight as usize,
        },
        num_filter_conditions: conditions.len() as u32,
        filter_condition: if conditions.is_empty() {
            std::ptr::null_mut()
        } else {
            conditions.as_mut_ptr()
        },
        action: FwpmAction0 {
            action_type,
            filter_type: Guid::default(),
        },
        context: 0,
        reserved: std::ptr::null_mut(),
        filter_id: 0,
        effective_weight: FwpValue0 {
            value_type: 0,
            value: 0,
        },
    };
    let mut filter_id = 0u64;
    let status = unsafe { FwpmFilterAdd0(engine, &filter, std::ptr::null_mut(), &mut filter_id) };
    if status != NO_ERROR {
        bail!("FwpmFilterAdd0({}) failed: {:#x}", description, status);
    }
    Ok(())
}

fn interface_index(alias: &str) -> Result<u32> {
    let alias_w = to_utf16_null(alias);
    let mut luid = 0u64;
    let status = unsafe { ConvertInterfaceAliasToLuid(alias_w.as_ptr(), &mut luid) };
    if status != NO_ERROR {
        bail!("ConvertInterfaceAliasToLuid({}) failed: {}", alias, status);
    }
    let mut index = 0u32;
    let status = unsafe { ConvertInterfaceLuidToIndex(&luid, &mut index) };
    if status != NO_ERROR {
        bail!("ConvertInterfaceLuidToIndex failed: {}", status);
    }
    Ok(index)
}

fn display_data(name: &str, description: &str) -> FwpmDisplayData0 {
    // WFP copies the strings during the add call; leaking keeps them valid
    // for the call regardless of scope.
    FwpmDisplayData0 {
        name: Box::leak(to_utf16_null(name).into_boxed_slice()).as_mut_ptr(),
        description: Box::leak(to_utf16_null(description).into_boxed_slice()).as_mut_ptr(),
    }
}

fn to_utf16_null(value: &str) -> Vec<u16> {
    value.encode_utf16().chain(std::iter::once(0)).collect()
}
