use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// A single UDP datagram together with its destination (on send) or
/// source (on receive) address.
pub struct UdpPacket {
    pub addr: SocketAddr,
    pub data: Bytes,
}

/// Upstream UDP transport produced by a dispatcher.
#[async_trait]
pub trait UdpTransport: Send + Sync {
    async fn send(&self, packet: UdpPacket) -> Result<()>;
    async fn recv(&self) -> Result<UdpPacket>;
}

pub type BoxUdpTransport = Box<dyn UdpTransport>;
