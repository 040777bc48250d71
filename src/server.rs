//! Per-flow processing.
//!
//! The server pairs every accepted flow with an upstream link from the
//! dispatcher. TCP flows run two copiers in parallel with activity-timer
//! updates on every buffer; once one direction finishes, the inactivity
//! window shrinks to the remaining direction's timeout. UDP flows run a
//! read loop that dispatches each datagram upstream and writes responses
//! back through the session.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::common::{ActivityTimer, BoxUdpTransport, UdpPacket};
use crate::dispatcher::Dispatcher;
use crate::listener::{FlowHandler, InboundFlow, UdpFlow};
use crate::stack::TcpFlow;

/// Inactivity windows supplied by the outer policy layer.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    /// Window while both directions are live.
    pub connection_idle: Duration,
    /// Window once the uplink has finished and only downlink traffic remains.
    pub downlink_only: Duration,
    /// Window once the downlink has finished and only uplink traffic remains.
    pub uplink_only: Duration,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            connection_idle: Duration::from_secs(300),
            downlink_only: Duration::from_secs(5),
            uplink_only: Duration::from_secs(2),
        }
    }
}

pub struct Server {
    dispatcher: Arc<dyn Dispatcher>,
    timeouts: TimeoutPolicy,
    user_level: u32,
}

impl Server {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, timeouts: TimeoutPolicy) -> Self {
        Self {
            dispatcher,
            timeouts,
            user_level: 0,
        }
    }

    pub fn with_user_level(mut self, user_level: u32) -> Self {
        self.user_level = user_level;
        self
    }
}

impl FlowHandler for Server {
    fn handle(&self, flow: InboundFlow) {
        let dispatcher = self.dispatcher.clone();
        let timeouts = self.timeouts;
        let user_level = self.user_level;
        match flow {
            InboundFlow::Stream(flow) => {
                tokio::spawn(async move {
                    debug!(
                        client = %flow.client(),
                        destination = %flow.destination(),
                        user_level,
                        "processing tcp flow"
                    );
                    if let Err(e) = process_stream(dispatcher, timeouts, flow).await {
                        debug!(error = %e, "tcp flow ended");
                    }
                });
            }
            InboundFlow::Datagrams(flow) => {
                tokio::spawn(async move {
                    debug!(
                        client = %flow.client(),
                        destination = %flow.destination(),
                        user_level,
                        "processing udp flow"
                    );
                    if let Err(e) = process_datagrams(dispatcher, timeouts, flow.clone()).await {
                        debug!(error = %e, "udp flow ended");
                    }
                    flow.close();
                });
            }
        }
    }
}

async fn process_stream(
    dispatcher: Arc<dyn Dispatcher>,
    timeouts: TimeoutPolicy,
    flow: TcpFlow,
) -> Result<()> {
    let destination = flow.destination();
    let upstream = dispatcher
        .dispatch_stream(destination)
        .await
        .context("failed to dispatch request")?;

    let cancel = CancellationToken::new();
    let timer = ActivityTimer::new(cancel.clone(), timeouts.connection_idle);

    let (mut client_r, mut client_w) = tokio::io::split(flow);
    let (mut upstream_r, mut upstream_w) = tokio::io::split(upstream);

    let uplink = async {
        copy_with_activity(&mut client_r, &mut upstream_w, &timer)
            .await
            .context("failed to transport request")?;
        timer.set_timeout(timeouts.downlink_only);
        let _ = upstream_w.shutdown().await;
        Ok::<_, anyhow::Error>(())
    };
    let downlink = async {
        copy_with_activity(&mut upstream_r, &mut client_w, &timer)
            .await
            .context("failed to transport response")?;
        timer.set_timeout(timeouts.uplink_only);
        let _ = client_w.shutdown().await;
        Ok::<_, anyhow::Error>(())
    };

    // Dropping the copiers on timeout or error closes both halves and the
    // upstream link with them.
    tokio::select! {
        _ = cancel.cancelled() => Err(anyhow::anyhow!("connection idle timed out")),
        result = async { tokio::try_join!(uplink, downlink) } => {
            result?;
            Ok(())
        }
    }
}

async fn copy_with_activity<R, W>(
    reader: &mut R,
    writer: &mut W,
    timer: &ActivityTimer,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 16 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        timer.update();
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    writer.flush().await?;
    Ok(total)
}

async fn process_datagrams(
    dispatcher: Arc<dyn Dispatcher>,
    timeouts: TimeoutPolicy,
    flow: UdpFlow,
) -> Result<()> {
    let transport: Arc<BoxUdpTransport> = Arc::new(
        dispatcher
            .dispatch_packets(flow.destination())
            .await
            .context("failed to dispatch udp flow")?,
    );

    let cancel = CancellationToken::new();
    let timer = ActivityTimer::new(cancel.clone(), timeouts.connection_idle);

    // Responses from upstream flow back through the session, tagged with the
    // address they came from.
    let response_task = {
        let transport = transport.clone();
        let flow = flow.clone();
        let timer = timer.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let packet = tokio::select! {
                    _ = cancel.cancelled() => break,
                    packet = transport.recv() => match packet {
                        Ok(packet) => packet,
                        Err(_) => break,
                    },
                };
                timer.update();
                if flow
                    .write_datagram(&packet.data, packet.addr)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        })
    };

    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = flow.read_datagram(&mut buf) => read,
        };
        let Ok((n, destination)) = read else {
            break;
        };
        timer.update();
        if let Err(e) = transport
            .send(UdpPacket {
                addr: destination,
                data: Bytes::copy_from_slice(&buf[..n]),
            })
            .await
        {
            debug!(error = %e, "udp dispatch failed");
            break;
        }
    }

    cancel.cancel();
    let _ = response_task.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use tokio::sync::Mutex;

    use crate::common::{ProxyStream, UdpTransport};

    /// Upstream that answers any stream with a canned response after
    /// echoing nothing, and any datagram with a canned reply.
    struct CannedDispatcher {
        response: &'static [u8],
    }

    #[async_trait]
    impl Dispatcher for CannedDispatcher {
        async fn dispatch_stream(&self, _destination: SocketAddr) -> Result<ProxyStream> {
            let (client, mut server) = tokio::io::duplex(4096);
            let response = self.response;
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = server.read(&mut buf).await;
                let _ = server.write_all(response).await;
                let _ = server.shutdown().await;
            });
            Ok(Box::new(client))
        }

        async fn dispatch_packets(&self, _destination: SocketAddr) -> Result<BoxUdpTransport> {
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            Ok(Box::new(CannedUdp {
                response: self.response,
                pending: Mutex::new(rx),
                sender: tx,
            }))
        }
    }

    struct CannedUdp {
        response: &'static [u8],
        pending: Mutex<tokio::sync::mpsc::UnboundedReceiver<SocketAddr>>,
        sender: tokio::sync::mpsc::UnboundedSender<SocketAddr>,
    }

    #[async_trait]
    impl UdpTransport for CannedUdp {
        async fn send(&self, packet: UdpPacket) -> Result<()> {
            let _ = self.sender.send(packet.addr);
            Ok(())
        }

        async fn recv(&self) -> Result<UdpPacket> {
            let addr = self
                .pending
                .lock()
                .await
                .recv()
                .await
                .ok_or_else(|| anyhow::anyhow!("closed"))?;
            Ok(UdpPacket {
                addr,
                data: Bytes::from_static(self.response),
            })
        }
    }

    #[test]
    fn timeout_policy_defaults() {
        let policy = TimeoutPolicy::default();
        assert_eq!(policy.connection_idle, Duration::from_secs(300));
        assert_eq!(policy.downlink_only, Duration::from_secs(5));
        assert_eq!(policy.uplink_only, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn canned_dispatcher_round_trip() {
        let dispatcher = CannedDispatcher { response: b"pong" };
        let mut stream = dispatcher
            .dispatch_stream("1.2.3.4:80".parse().unwrap())
            .await
            .unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }
}
