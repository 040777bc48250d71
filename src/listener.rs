//! The `tunnel` transport listener.
//!
//! Ties the pieces together: opens the TUN, installs the DNS-leak filters
//! (Windows, opt-in), builds the stack with default options, drives the
//! accept loop, and makes the TUN the system default route. Closing the
//! listener is the deterministic teardown step: it stops the accept loop,
//! wakes blocked session readers, restores the original default route and
//! closes the TUN.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::blockdns;
use crate::config::TunnelConfig;
use crate::route::RouteManager;
use crate::stack::{Stack, StackHandler, StackOptions, TcpFlow, UdpSession};
use crate::tun::{self, TunDevice};

/// Name this transport registers under with the outer framework.
pub const TRANSPORT_NAME: &str = "tunnel";

/// Accept channel capacity. TCP accepts block the stack when the consumer
/// lags; that backpressure is intentional.
const ACCEPT_QUEUE: usize = 10;

/// A flow accepted from the TUN, either a reconstructed TCP stream or a UDP
/// session.
pub enum InboundFlow {
    Stream(TcpFlow),
    Datagrams(UdpFlow),
}

/// UDP flow adapter pairing a session with the destination of its first
/// packet.
#[derive(Clone)]
pub struct UdpFlow {
    session: Arc<UdpSession>,
    destination: SocketAddr,
}

impl UdpFlow {
    pub fn client(&self) -> SocketAddr {
        self.session.client()
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// Next datagram from the client: copied length plus the destination the
    /// client addressed.
    pub async fn read_datagram(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.session.read_to(buf).await
    }

    /// Send a datagram back to the client, sourced from `from`.
    pub async fn write_datagram(&self, buf: &[u8], from: SocketAddr) -> std::io::Result<usize> {
        self.session.write_from(buf, from).await
    }

    pub fn close(&self) {
        self.session.close()
    }

    pub fn session(&self) -> &Arc<UdpSession> {
        &self.session
    }
}

/// Callback invoked by the accept loop for every inbound flow. Must hand the
/// flow off quickly (typically by spawning a task).
pub trait FlowHandler: Send + Sync {
    fn handle(&self, flow: InboundFlow);
}

impl<F: Fn(InboundFlow) + Send + Sync> FlowHandler for F {
    fn handle(&self, flow: InboundFlow) {
        self(flow)
    }
}

/// Stack-facing side of the listener: forwards flows into the accept
/// channel, never after the done signal has fired.
struct AcceptBridge {
    conn_tx: mpsc::Sender<InboundFlow>,
    done: CancellationToken,
}

impl AcceptBridge {
    async fn accept(&self, flow: InboundFlow) -> Result<()> {
        if self.done.is_cancelled() {
            return Ok(());
        }
        tokio::select! {
            _ = self.done.cancelled() => {}
            result = self.conn_tx.send(flow) => {
                let _ = result;
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StackHandler for AcceptBridge {
    async fn handle_stream(&self, flow: TcpFlow) -> Result<()> {
        debug!(destination = %flow.destination(), "handle tcp connect");
        self.accept(InboundFlow::Stream(flow)).await
    }

    async fn handle_packet(
        &self,
        session: Arc<UdpSession>,
        destination: SocketAddr,
    ) -> Result<()> {
        debug!(%destination, "handle udp flow");
        self.accept(InboundFlow::Datagrams(UdpFlow {
            session,
            destination,
        }))
        .await
    }
}

pub struct Listener {
    device: Arc<dyn TunDevice>,
    stack: Arc<Stack>,
    routes: std::sync::Mutex<RouteManager>,
    done: CancellationToken,
}

impl Listener {
    /// Open the TUN described by `config` and bridge it to `handler`,
    /// taking over the system default route.
    pub async fn listen(config: &TunnelConfig, handler: Arc<dyn FlowHandler>) -> Result<Self> {
        let device = tun::open(config)
            .await
            .context("failed to start tun device")?;

        if cfg!(target_os = "windows") && config.fix_dns_leak {
            blockdns::fix_dns_leak(&config.name).context("failed to fix dns leak")?;
        }
        info!(device = device.name(), "tun started");

        let listener = Self::with_device(device.clone(), StackOptions::default(), handler)?;

        let mut routes = RouteManager::new();
        routes.install(config.gateway, &device.identifier())?;
        *listener
            .routes
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = routes;

        Ok(listener)
    }

    /// Bridge an already-open device to `handler` without touching OS
    /// routing state.
    pub fn with_device(
        device: Arc<dyn TunDevice>,
        options: StackOptions,
        handler: Arc<dyn FlowHandler>,
    ) -> Result<Self> {
        let done = CancellationToken::new();
        let (conn_tx, mut conn_rx) = mpsc::channel(ACCEPT_QUEUE);

        let bridge = Arc::new(AcceptBridge {
            conn_tx,
            done: done.clone(),
        });
        let stack = Stack::new(device.clone(), bridge, options)?;

        let loop_done = done.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_done.cancelled() => break,
                    flow = conn_rx.recv() => match flow {
                        Some(flow) => handler.handle(flow),
                        None => break,
                    },
                }
            }
        });

        Ok(Self {
            device,
            stack,
            routes: std::sync::Mutex::new(RouteManager::new()),
            done,
        })
    }

    pub fn stack(&self) -> &Arc<Stack> {
        &self.stack
    }

    /// Shut down: stop accepting, wake blocked readers, restore the original
    /// default route (best-effort) and close the TUN.
    pub async fn close(&self) -> Result<()> {
        self.done.cancel();
        self.stack.close();

        {
            let mut routes = self.routes.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = routes.restore() {
                warn!(error = %e, "failed to restore default route");
            }
        }

        self.device
            .close()
            .await
            .context("cannot close tun device")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tun::mem::MemTunDevice;

    #[tokio::test]
    async fn close_is_clean_without_routes() {
        let (device, _handle) = MemTunDevice::new();
        let handler: Arc<dyn FlowHandler> = Arc::new(|_flow: InboundFlow| {});
        let listener =
            Listener::with_device(device, StackOptions::default(), handler).unwrap();
        listener.close().await.unwrap();
    }

    #[test]
    fn transport_name() {
        assert_eq!(TRANSPORT_NAME, "tunnel");
    }
}
