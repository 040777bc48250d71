//! Raw IPv4 frame parsing and synthesis.
//!
//! Inbound frames are parsed into header views over the original buffer;
//! outbound packets are produced as a [`PacketBuffer`] (network header,
//! transport header, payload views) that the link endpoint flattens into a
//! single TUN write.

use std::net::{Ipv4Addr, SocketAddrV4};

use anyhow::{bail, Result};
use bytes::Bytes;

pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
/// Largest payload an IPv4/UDP datagram can carry: 65535 minus both headers.
pub const MAX_UDP_PAYLOAD: usize = 65_507;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

pub const FLAG_FIN: u8 = 0x01;
pub const FLAG_SYN: u8 = 0x02;
pub const FLAG_RST: u8 = 0x04;
pub const FLAG_PSH: u8 = 0x08;
pub const FLAG_ACK: u8 = 0x10;

/// IP version from the first nibble, if the buffer is non-empty.
pub fn ip_version(frame: &[u8]) -> Option<u8> {
    frame.first().map(|b| b >> 4)
}

#[derive(Debug, Clone, Copy)]
pub struct Ipv4Header {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub ttl: u8,
    pub header_len: usize,
    pub total_len: usize,
}

/// Parse an IPv4 header, returning it together with the transport slice
/// (trimmed to the header's total-length field).
pub fn parse_ipv4(frame: &[u8]) -> Result<(Ipv4Header, &[u8])> {
    if frame.len() < IPV4_HEADER_LEN {
        bail!("ipv4 frame too short: {} bytes", frame.len());
    }
    if frame[0] >> 4 != 4 {
        bail!("not an ipv4 frame");
    }
    let header_len = ((frame[0] & 0x0f) as usize) * 4;
    if header_len < IPV4_HEADER_LEN || frame.len() < header_len {
        bail!("invalid ipv4 header length: {}", header_len);
    }
    let total_len = u16::from_be_bytes([frame[2], frame[3]]) as usize;
    if total_len < header_len || total_len > frame.len() {
        bail!("invalid ipv4 total length: {}", total_len);
    }

    let header = Ipv4Header {
        src: Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]),
        dst: Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]),
        protocol: frame[9],
        ttl: frame[8],
        header_len,
        total_len,
    };
    Ok((header, &frame[header_len..total_len]))
}

#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub payload: &'a [u8],
}

pub fn parse_tcp(l4: &[u8]) -> Result<TcpSegment<'_>> {
    if l4.len() < TCP_HEADER_LEN {
        bail!("tcp segment too short: {} bytes", l4.len());
    }
    let data_offset = ((l4[12] >> 4) as usize) * 4;
    if data_offset < TCP_HEADER_LEN || data_offset > l4.len() {
        bail!("invalid tcp data offset: {}", data_offset);
    }
    Ok(TcpSegment {
        src_port: u16::from_be_bytes([l4[0], l4[1]]),
        dst_port: u16::from_be_bytes([l4[2], l4[3]]),
        seq: u32::from_be_bytes([l4[4], l4[5], l4[6], l4[7]]),
        ack: u32::from_be_bytes([l4[8], l4[9], l4[10], l4[11]]),
        flags: l4[13],
        window: u16::from_be_bytes([l4[14], l4[15]]),
        payload: &l4[data_offset..],
    })
}

#[derive(Debug, Clone, Copy)]
pub struct UdpDatagram<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    /// The header's length field (header + payload).
    pub length: u16,
    pub checksum: u16,
    pub payload: &'a [u8],
}

pub fn parse_udp(l4: &[u8]) -> Result<UdpDatagram<'_>> {
    if l4.len() < UDP_HEADER_LEN {
        bail!("udp datagram too short: {} bytes", l4.len());
    }
    let length = u16::from_be_bytes([l4[4], l4[5]]);
    let payload_end = (length as usize).clamp(UDP_HEADER_LEN, l4.len());
    Ok(UdpDatagram {
        src_port: u16::from_be_bytes([l4[0], l4[1]]),
        dst_port: u16::from_be_bytes([l4[2], l4[3]]),
        length,
        checksum: u16::from_be_bytes([l4[6], l4[7]]),
        payload: &l4[UDP_HEADER_LEN..payload_end],
    })
}

/// Verify a UDP checksum against the pseudo-header. A zero checksum means
/// the sender did not compute one and is accepted.
pub fn udp_checksum_valid(src: Ipv4Addr, dst: Ipv4Addr, l4: &[u8]) -> bool {
    if l4.len() < UDP_HEADER_LEN {
        return false;
    }
    if u16::from_be_bytes([l4[6], l4[7]]) == 0 {
        return true;
    }
    let mut sum = pseudo_header_sum(src, dst, PROTO_UDP, l4.len() as u16);
    sum = sum_words(l4, sum);
    fold(sum) == 0xffff
}

/// Outbound packet as header and payload views. The link endpoint flattens
/// `network || transport || payload` into one contiguous TUN write.
#[derive(Debug, Clone)]
pub struct PacketBuffer {
    pub network: Vec<u8>,
    pub transport: Vec<u8>,
    pub payload: Vec<Bytes>,
}

impl PacketBuffer {
    pub fn len(&self) -> usize {
        self.network.len()
            + self.transport.len()
            + self.payload.iter().map(|view| view.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn build_ipv4_header(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    ttl: u8,
    payload_len: usize,
) -> Vec<u8> {
    let total_len = (IPV4_HEADER_LEN + payload_len) as u16;
    let mut header = vec![0u8; IPV4_HEADER_LEN];
    header[0] = 0x45;
    header[2..4].copy_from_slice(&total_len.to_be_bytes());
    header[8] = ttl;
    header[9] = protocol;
    header[12..16].copy_from_slice(&src.octets());
    header[16..20].copy_from_slice(&dst.octets());
    let checksum = ipv4_header_checksum(&header);
    header[10..12].copy_from_slice(&checksum.to_be_bytes());
    header
}

/// Synthesise a TCP segment from `src` to `dst`.
pub fn build_tcp(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    ttl: u8,
    payload: Bytes,
) -> Result<PacketBuffer> {
    let l4_len = TCP_HEADER_LEN + payload.len();
    if IPV4_HEADER_LEN + l4_len > u16::MAX as usize {
        bail!("tcp segment too large: {} bytes", l4_len);
    }

    let mut transport = vec![0u8; TCP_HEADER_LEN];
    transport[0..2].copy_from_slice(&src.port().to_be_bytes());
    transport[2..4].copy_from_slice(&dst.port().to_be_bytes());
    transport[4..8].copy_from_slice(&seq.to_be_bytes());
    transport[8..12].copy_from_slice(&ack.to_be_bytes());
    transport[12] = ((TCP_HEADER_LEN / 4) as u8) << 4;
    transport[13] = flags;
    transport[14..16].copy_from_slice(&window.to_be_bytes());

    let mut sum = pseudo_header_sum(*src.ip(), *dst.ip(), PROTO_TCP, l4_len as u16);
    sum = sum_words(&transport, sum);
    sum = sum_words(&payload, sum);
    let checksum = !fold(sum);
    transport[16..18].copy_from_slice(&checksum.to_be_bytes());

    Ok(PacketBuffer {
        network: build_ipv4_header(*src.ip(), *dst.ip(), PROTO_TCP, ttl, l4_len),
        transport,
        payload: if payload.is_empty() {
            Vec::new()
        } else {
            vec![payload]
        },
    })
}

/// Synthesise a UDP datagram from `src` to `dst`.
pub fn build_udp(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    ttl: u8,
    payload: Bytes,
) -> Result<PacketBuffer> {
    if payload.len() > MAX_UDP_PAYLOAD {
        bail!("message too long: {} bytes", payload.len());
    }
    let l4_len = UDP_HEADER_LEN + payload.len();

    let mut transport = vec![0u8; UDP_HEADER_LEN];
    transport[0..2].copy_from_slice(&src.port().to_be_bytes());
    transport[2..4].copy_from_slice(&dst.port().to_be_bytes());
    transport[4..6].copy_from_slice(&(l4_len as u16).to_be_bytes());

    let mut sum = pseudo_header_sum(*src.ip(), *dst.ip(), PROTO_UDP, l4_len as u16);
    sum = sum_words(&transport, sum);
    sum = sum_words(&payload, sum);
    let mut checksum = !fold(sum);
    // A computed zero must be transmitted as all-ones; zero means unchecked.
    if checksum == 0 {
        checksum = 0xffff;
    }
    transport[6..8].copy_from_slice(&checksum.to_be_bytes());

    Ok(PacketBuffer {
        network: build_ipv4_header(*src.ip(), *dst.ip(), PROTO_UDP, ttl, l4_len),
        transport,
        payload: if payload.is_empty() {
            Vec::new()
        } else {
            vec![payload]
        },
    })
}

/// Synthesise an ICMP echo reply mirroring the request body.
pub fn build_icmp_echo_reply(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    ttl: u8,
    request: &[u8],
) -> Result<PacketBuffer> {
    if request.len() < 8 {
        bail!("icmp message too short: {} bytes", request.len());
    }
    let mut message = request.to_vec();
    message[0] = 0; // echo reply
    message[1] = 0;
    message[2] = 0;
    message[3] = 0;
    let checksum = !fold(sum_words(&message, 0));
    message[2..4].copy_from_slice(&checksum.to_be_bytes());

    Ok(PacketBuffer {
        network: build_ipv4_header(src, dst, PROTO_ICMP, ttl, message.len()),
        transport: message,
        payload: Vec::new(),
    })
}

pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut i = 0;
    while i + 1 < header.len() {
        if i != 10 {
            sum += u16::from_be_bytes([header[i], header[i + 1]]) as u32;
        }
        i += 2;
    }
    !fold(sum)
}

fn pseudo_header_sum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, l4_len: u16) -> u32 {
    let mut sum = 0u32;
    sum = sum_words(&src.octets(), sum);
    sum = sum_words(&dst.octets(), sum);
    sum += protocol as u32;
    sum += l4_len as u32;
    sum
}

fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut i = 0;
    while i + 1 < data.len() {
        sum += u16::from_be_bytes([data[i], data[i + 1]]) as u32;
        i += 2;
    }
    if i < data.len() {
        sum += (data[i] as u32) << 8;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}
