//! Link endpoint bridging the TUN device and the stack.
//!
//! Inbound: a single reader task pulls raw frames from the device, checks the
//! IP version nibble and forwards IPv4 frames into a bounded queue in arrival
//! order. Anything that is not IPv4 is dropped silently.
//!
//! Outbound: packet buffers are flattened into one reusable buffer and
//! written to the device in a single call. A mutex serialises writers so a
//! frame is never interleaved with another.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::stack::wire::{self, PacketBuffer};
use crate::stack::StackStats;
use crate::tun::TunDevice;

/// Capacity of the inbound frame queue.
const INBOUND_QUEUE: usize = 512;

pub struct LinkEndpoint {
    device: Arc<dyn TunDevice>,
    mtu: usize,
    write_buf: tokio::sync::Mutex<Vec<u8>>,
    stats: Arc<StackStats>,
}

impl LinkEndpoint {
    pub fn new(device: Arc<dyn TunDevice>, mtu: usize, stats: Arc<StackStats>) -> Self {
        Self {
            device,
            mtu,
            write_buf: tokio::sync::Mutex::new(Vec::with_capacity(mtu)),
            stats,
        }
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Spawn the inbound reader task and return the receive side of the
    /// frame queue. Must be called after all transport handlers are in
    /// place, otherwise early frames would race handler registration.
    pub fn attach(self: &Arc<Self>, cancel: CancellationToken) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel::<Bytes>(INBOUND_QUEUE);
        let endpoint = self.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; endpoint.mtu];
            loop {
                let n = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = endpoint.device.read_packet(&mut buf) => match result {
                        Ok(n) => n,
                        Err(e) => {
                            // Closing the device unblocks the reader; the
                            // error is expected during shutdown.
                            debug!(error = %e, "tun read ended");
                            break;
                        }
                    },
                };
                if n == 0 {
                    continue;
                }

                match wire::ip_version(&buf[..n]) {
                    Some(4) => {
                        endpoint.stats.inc_frames_received();
                        if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            break;
                        }
                    }
                    version => {
                        trace!(?version, len = n, "dropping non-ipv4 frame");
                    }
                }
            }
        });
        rx
    }

    /// Flatten `network || transport || payload` and write it to the device
    /// as one frame. At most one write is in flight at a time.
    pub async fn write_packet(&self, pkt: &PacketBuffer) -> Result<()> {
        let mut buf = self.write_buf.lock().await;
        buf.clear();
        buf.extend_from_slice(&pkt.network);
        buf.extend_from_slice(&pkt.transport);
        for view in &pkt.payload {
            buf.extend_from_slice(view);
        }
        self.device.write_packet(&buf).await?;
        self.stats.inc_frames_sent();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tun::mem::MemTunDevice;

    #[tokio::test]
    async fn inbound_keeps_ipv4_only() {
        let (device, handle) = MemTunDevice::new();
        let stats = Arc::new(StackStats::default());
        let endpoint = Arc::new(LinkEndpoint::new(device, 1500, stats.clone()));
        let mut rx = endpoint.attach(CancellationToken::new());

        let mut v6 = vec![0u8; 40];
        v6[0] = 0x60;
        handle.inject(v6);

        let mut v4 = vec![0u8; 20];
        v4[0] = 0x45;
        v4[2..4].copy_from_slice(&20u16.to_be_bytes());
        handle.inject(v4.clone());

        let frame = rx.recv().await.unwrap();
        assert_eq!(&frame[..], &v4[..]);
        assert_eq!(stats.frames_received(), 1);
    }

    #[tokio::test]
    async fn outbound_flattens_views() {
        let (device, mut handle) = MemTunDevice::new();
        let stats = Arc::new(StackStats::default());
        let endpoint = LinkEndpoint::new(device, 1500, stats);

        let pkt = PacketBuffer {
            network: vec![1, 2],
            transport: vec![3, 4],
            payload: vec![Bytes::from_static(&[5]), Bytes::from_static(&[6, 7])],
        };
        endpoint.write_packet(&pkt).await.unwrap();

        let frame = handle.next_outbound().await.unwrap();
        assert_eq!(frame, vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn reader_stops_on_cancel() {
        let (device, _handle) = MemTunDevice::new();
        let stats = Arc::new(StackStats::default());
        let endpoint = Arc::new(LinkEndpoint::new(device, 1500, stats));
        let cancel = CancellationToken::new();
        let mut rx = endpoint.attach(cancel.clone());
        cancel.cancel();
        assert!(rx.recv().await.is_none());
    }
}
