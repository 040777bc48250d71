//! Upstream dispatch.
//!
//! Every reconstructed flow is paired with an upstream link produced by a
//! [`Dispatcher`]. The outer proxy framework supplies its own
//! implementation; [`DirectDispatcher`] dials destinations straight from
//! the local host and is what the CLI uses.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::{TcpStream, UdpSocket};

use crate::common::{BoxUdpTransport, ProxyStream, UdpPacket, UdpTransport};

#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Dial a stream link to the destination.
    async fn dispatch_stream(&self, destination: SocketAddr) -> Result<ProxyStream>;

    /// Open a packet link for a UDP flow addressed at the destination.
    async fn dispatch_packets(&self, destination: SocketAddr) -> Result<BoxUdpTransport>;
}

/// Dials every destination directly.
#[derive(Debug, Default)]
pub struct DirectDispatcher;

#[async_trait]
impl Dispatcher for DirectDispatcher {
    async fn dispatch_stream(&self, destination: SocketAddr) -> Result<ProxyStream> {
        let stream = TcpStream::connect(destination)
            .await
            .with_context(|| format!("failed to dial {}", destination))?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    async fn dispatch_packets(&self, _destination: SocketAddr) -> Result<BoxUdpTransport> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("failed to bind udp socket")?;
        Ok(Box::new(DirectUdpTransport { socket }))
    }
}

struct DirectUdpTransport {
    socket: UdpSocket,
}

#[async_trait]
impl UdpTransport for DirectUdpTransport {
    async fn send(&self, packet: UdpPacket) -> Result<()> {
        self.socket
            .send_to(&packet.data, packet.addr)
            .await
            .with_context(|| format!("udp send to {} failed", packet.addr))?;
        Ok(())
    }

    async fn recv(&self) -> Result<UdpPacket> {
        let mut buf = vec![0u8; 64 * 1024];
        let (n, addr) = self.socket.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok(UdpPacket {
            addr,
            data: Bytes::from(buf),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn direct_stream_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(&buf[..n]).await.unwrap();
        });

        let mut stream = DirectDispatcher.dispatch_stream(addr).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[tokio::test]
    async fn direct_packets_echo() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&buf[..n], from).await.unwrap();
        });

        let transport = DirectDispatcher.dispatch_packets(addr).await.unwrap();
        transport
            .send(UdpPacket {
                addr,
                data: Bytes::from_static(b"query"),
            })
            .await
            .unwrap();
        let reply = transport.recv().await.unwrap();
        assert_eq!(&reply.data[..], b"query");
        assert_eq!(reply.addr, addr);
    }

    #[tokio::test]
    async fn dial_refused_destination_fails() {
        // Bind then drop to find a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = match DirectDispatcher.dispatch_stream(addr).await {
            Ok(_) => panic!("expected dispatch_stream to fail"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("failed to dial"));
    }
}
