//! In-memory TUN device.
//!
//! Backs the end-to-end tests and embedders that want to feed the stack
//! without a real interface: frames injected through the handle appear on
//! `read_packet`, frames the stack writes come out of the handle.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{LinkId, TunDevice};

pub struct MemTunDevice {
    name: String,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    closed: CancellationToken,
}

/// Test-side handle: inject frames into the device, observe frames written
/// by the stack.
pub struct MemTunHandle {
    inject_tx: mpsc::UnboundedSender<Vec<u8>>,
    outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    closed: CancellationToken,
}

impl MemTunDevice {
    pub fn new() -> (Arc<Self>, MemTunHandle) {
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        let device = Arc::new(Self {
            name: "tun-mem".to_string(),
            inbound: tokio::sync::Mutex::new(inject_rx),
            outbound: outbound_tx,
            closed: closed.clone(),
        });
        let handle = MemTunHandle {
            inject_tx,
            outbound_rx,
            closed,
        };
        (device, handle)
    }
}

#[async_trait]
impl TunDevice for MemTunDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn identifier(&self) -> LinkId {
        LinkId::Name(self.name.clone())
    }

    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => bail!("tun device closed"),
            frame = inbound.recv() => match frame {
                Some(frame) => {
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    Ok(n)
                }
                None => bail!("tun device closed"),
            },
        }
    }

    async fn write_packet(&self, buf: &[u8]) -> Result<usize> {
        if self.closed.is_cancelled() {
            bail!("tun device closed");
        }
        self.outbound
            .send(buf.to_vec())
            .map_err(|_| anyhow::anyhow!("tun device closed"))?;
        Ok(buf.len())
    }

    async fn close(&self) -> Result<()> {
        self.closed.cancel();
        Ok(())
    }
}

impl MemTunHandle {
    /// Feed a raw frame into the device's read side.
    pub fn inject(&self, frame: Vec<u8>) {
        let _ = self.inject_tx.send(frame);
    }

    /// Next frame the stack wrote to the device, or `None` once closed and
    /// drained.
    pub async fn next_outbound(&mut self) -> Option<Vec<u8>> {
        self.outbound_rx.recv().await
    }

    /// Non-blocking variant of [`MemTunHandle::next_outbound`].
    pub fn try_next_outbound(&mut self) -> Option<Vec<u8>> {
        self.outbound_rx.try_recv().ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
