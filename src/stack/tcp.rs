//! TCP forwarder.
//!
//! Every SYN the stack receives, for any destination, becomes a [`TcpFlow`]:
//! the forwarder answers the handshake itself, reassembles in-order payload
//! into the flow's read side, and turns writes on the flow into synthesised
//! segments back to the client. Retransmission and out-of-order reassembly
//! are deliberately out of scope; duplicate segments are re-acknowledged and
//! future segments dropped.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::wire::{self, Ipv4Header, TcpSegment};
use super::{NetContext, StackHandler};

/// Per-connection channel depth between the stack and the flow handle.
const CONN_CHANNEL: usize = 256;

/// Keep-alive schedule applied to every accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub idle: Duration,
    pub interval: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(60),
            interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey {
    client: SocketAddrV4,
    destination: SocketAddrV4,
}

struct ConnState {
    client_seq_next: u32,
    server_seq_next: u32,
}

#[derive(Clone)]
struct ConnEntry {
    to_flow: mpsc::Sender<Bytes>,
    state: Arc<tokio::sync::Mutex<ConnState>>,
}

pub struct TcpForwarder {
    net: Arc<NetContext>,
    window: u16,
    max_in_flight: usize,
    keepalive: KeepaliveConfig,
    connections: tokio::sync::Mutex<HashMap<FlowKey, ConnEntry>>,
    active: AtomicUsize,
}

impl TcpForwarder {
    pub(crate) fn new(net: Arc<NetContext>, window: u16, max_in_flight: usize) -> Arc<Self> {
        Arc::new(Self {
            net,
            window,
            max_in_flight,
            keepalive: KeepaliveConfig::default(),
            connections: tokio::sync::Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
        })
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub(crate) async fn handle_segment(
        self: &Arc<Self>,
        ip: &Ipv4Header,
        seg: &TcpSegment<'_>,
        handler: &Arc<dyn StackHandler>,
    ) {
        let client = SocketAddrV4::new(ip.src, seg.src_port);
        let destination = SocketAddrV4::new(ip.dst, seg.dst_port);
        let key = FlowKey {
            client,
            destination,
        };

        let existing = { self.connections.lock().await.get(&key).cloned() };
        if let Some(entry) = existing {
            self.handle_established(&key, &entry, seg).await;
            return;
        }

        // New connections start with a bare SYN; everything else is a stray
        // segment from a flow already torn down.
        if seg.flags & wire::FLAG_SYN == 0 || seg.flags & wire::FLAG_ACK != 0 {
            if seg.flags & wire::FLAG_RST == 0 {
                debug!(%client, %destination, flags = seg.flags, "stray tcp segment dropped");
            }
            return;
        }

        // Endpoint creation: refuse with RST when the handshake budget is
        // exhausted, so half-open connections cannot accumulate.
        if self.active.load(Ordering::Relaxed) >= self.max_in_flight {
            warn!(%client, %destination, "failed to create endpoint: handshake budget exhausted");
            self.send_rst(client, destination, seg.seq.wrapping_add(1))
                .await;
            return;
        }

        let (to_flow, flow_rx) = mpsc::channel::<Bytes>(CONN_CHANNEL);
        let (flow_tx, stack_rx) = mpsc::channel::<Bytes>(CONN_CHANNEL);

        let iss = initial_sequence();
        let state = Arc::new(tokio::sync::Mutex::new(ConnState {
            client_seq_next: seg.seq.wrapping_add(1),
            server_seq_next: iss,
        }));

        // Finish the handshake before the flow is exposed to the handler.
        {
            let mut st = state.lock().await;
            self.send_segment(
                client,
                destination,
                st.server_seq_next,
                st.client_seq_next,
                wire::FLAG_SYN | wire::FLAG_ACK,
                Bytes::new(),
            )
            .await;
            st.server_seq_next = st.server_seq_next.wrapping_add(1);
        }

        {
            let mut conns = self.connections.lock().await;
            conns.insert(
                key,
                ConnEntry {
                    to_flow,
                    state: state.clone(),
                },
            );
        }
        self.active.fetch_add(1, Ordering::Relaxed);
        self.net.stats.inc_tcp_accepted();

        self.spawn_writer(key, state, stack_rx);

        let flow = TcpFlow {
            rx: flow_rx,
            tx: flow_tx,
            read_buf: Bytes::new(),
            read_closed: false,
            client,
            destination,
            keepalive: self.keepalive,
        };
        if let Err(e) = handler.handle_stream(flow).await {
            warn!(%client, %destination, error = %e, "stream handler failed");
        }
    }

    async fn handle_established(self: &Arc<Self>, key: &FlowKey, entry: &ConnEntry, seg: &TcpSegment<'_>) {
        if seg.flags & wire::FLAG_RST != 0 {
            let _ = entry.to_flow.send(Bytes::new()).await;
            self.remove(key).await;
            return;
        }

        if seg.flags & wire::FLAG_FIN != 0 {
            {
                let mut st = entry.state.lock().await;
                let fin_seq = seg.seq.wrapping_add(seg.payload.len() as u32);
                st.client_seq_next = fin_seq.wrapping_add(1);
                self.send_segment(
                    key.client,
                    key.destination,
                    st.server_seq_next,
                    st.client_seq_next,
                    wire::FLAG_ACK,
                    Bytes::new(),
                )
                .await;
            }
            let _ = entry.to_flow.send(Bytes::new()).await;
            self.remove(key).await;
            return;
        }

        if seg.payload.is_empty() {
            return;
        }

        let mut st = entry.state.lock().await;
        if seg.seq == st.client_seq_next {
            st.client_seq_next = st.client_seq_next.wrapping_add(seg.payload.len() as u32);
            let ack = st.client_seq_next;
            let seq = st.server_seq_next;
            drop(st);

            // Backpressure: the flow's read queue bounds how far the client
            // can run ahead.
            let _ = entry.to_flow.send(Bytes::copy_from_slice(seg.payload)).await;
            self.send_segment(
                key.client,
                key.destination,
                seq,
                ack,
                wire::FLAG_ACK,
                Bytes::new(),
            )
            .await;
        } else if seq_before(seg.seq, st.client_seq_next) {
            // Duplicate data: acknowledge again. Delayed ACK is disabled.
            let ack = st.client_seq_next;
            let seq = st.server_seq_next;
            drop(st);
            self.send_segment(
                key.client,
                key.destination,
                seq,
                ack,
                wire::FLAG_ACK,
                Bytes::new(),
            )
            .await;
        } else {
            debug!(client = %key.client, seq = seg.seq, "out-of-order tcp segment dropped");
        }
    }

    /// Drain flow writes into segments back to the client; probe the peer on
    /// the keep-alive schedule while the flow is quiet.
    fn spawn_writer(
        self: &Arc<Self>,
        key: FlowKey,
        state: Arc<tokio::sync::Mutex<ConnState>>,
        mut stack_rx: mpsc::Receiver<Bytes>,
    ) {
        let forwarder = self.clone();
        let mss = forwarder.net.endpoint.mtu() - wire::IPV4_HEADER_LEN - wire::TCP_HEADER_LEN;
        tokio::spawn(async move {
            let mut deadline = forwarder.keepalive.idle;
            loop {
                match tokio::time::timeout(deadline, stack_rx.recv()).await {
                    Ok(Some(data)) if !data.is_empty() => {
                        deadline = forwarder.keepalive.idle;
                        let mut st = state.lock().await;
                        let mut offset = 0;
                        while offset < data.len() {
                            let end = (offset + mss).min(data.len());
                            let chunk = data.slice(offset..end);
                            let len = chunk.len() as u32;
                            forwarder
                                .send_segment(
                                    key.client,
                                    key.destination,
                                    st.server_seq_next,
                                    st.client_seq_next,
                                    wire::FLAG_PSH | wire::FLAG_ACK,
                                    chunk,
                                )
                                .await;
                            st.server_seq_next = st.server_seq_next.wrapping_add(len);
                            offset = end;
                        }
                    }
                    // Empty write or dropped handle: close towards the client.
                    Ok(_) => {
                        let mut st = state.lock().await;
                        forwarder
                            .send_segment(
                                key.client,
                                key.destination,
                                st.server_seq_next,
                                st.client_seq_next,
                                wire::FLAG_FIN | wire::FLAG_ACK,
                                Bytes::new(),
                            )
                            .await;
                        st.server_seq_next = st.server_seq_next.wrapping_add(1);
                        break;
                    }
                    Err(_) => {
                        let st = state.lock().await;
                        forwarder
                            .send_segment(
                                key.client,
                                key.destination,
                                st.server_seq_next.wrapping_sub(1),
                                st.client_seq_next,
                                wire::FLAG_ACK,
                                Bytes::new(),
                            )
                            .await;
                        deadline = forwarder.keepalive.interval;
                    }
                }
            }
            forwarder.remove(&key).await;
        });
    }

    async fn remove(&self, key: &FlowKey) {
        let removed = { self.connections.lock().await.remove(key) };
        if removed.is_some() {
            self.active.fetch_sub(1, Ordering::Relaxed);
        }
    }

    async fn send_segment(
        &self,
        client: SocketAddrV4,
        destination: SocketAddrV4,
        seq: u32,
        ack: u32,
        flags: u8,
        payload: Bytes,
    ) {
        match wire::build_tcp(
            destination,
            client,
            seq,
            ack,
            flags,
            self.window,
            self.net.ttl,
            payload,
        ) {
            Ok(pkt) => {
                if let Err(e) = self.net.endpoint.write_packet(&pkt).await {
                    debug!(error = %e, "tcp segment write failed");
                }
            }
            Err(e) => debug!(error = %e, "tcp segment build failed"),
        }
    }

    async fn send_rst(&self, client: SocketAddrV4, destination: SocketAddrV4, ack: u32) {
        self.net.stats.inc_tcp_rst_sent();
        self.send_segment(
            client,
            destination,
            0,
            ack,
            wire::FLAG_RST | wire::FLAG_ACK,
            Bytes::new(),
        )
        .await;
    }
}

fn initial_sequence() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(1)
}

fn seq_before(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// Stream handle for one intercepted TCP connection.
///
/// `destination` is the address the client was trying to reach and is what a
/// dispatcher dials upstream; `client` is the TUN-side peer. Reads yield the
/// client's payload in order; writes are segmented back to the client.
pub struct TcpFlow {
    rx: mpsc::Receiver<Bytes>,
    tx: mpsc::Sender<Bytes>,
    read_buf: Bytes,
    read_closed: bool,
    client: SocketAddrV4,
    destination: SocketAddrV4,
    keepalive: KeepaliveConfig,
}

impl TcpFlow {
    pub fn client(&self) -> SocketAddr {
        SocketAddr::V4(self.client)
    }

    pub fn destination(&self) -> SocketAddr {
        SocketAddr::V4(self.destination)
    }

    pub fn keepalive(&self) -> KeepaliveConfig {
        self.keepalive
    }
}

impl tokio::io::AsyncRead for TcpFlow {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.read_buf.is_empty() {
            let n = self.read_buf.len().min(buf.remaining());
            buf.put_slice(&self.read_buf[..n]);
            let rest = self.read_buf.slice(n..);
            self.read_buf = rest;
            return Poll::Ready(Ok(()));
        }
        if self.read_closed {
            return Poll::Ready(Ok(()));
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(data)) => {
                if data.is_empty() {
                    self.read_closed = true;
                    return Poll::Ready(Ok(()));
                }
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    self.read_buf = data.slice(n..);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => {
                self.read_closed = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl tokio::io::AsyncWrite for TcpFlow {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let len = buf.len();
        match self.tx.try_send(Bytes::copy_from_slice(buf)) {
            Ok(()) => Poll::Ready(Ok(len)),
            Err(mpsc::error::TrySendError::Full(_)) => {
                cx.waker().wake_by_ref();
                Poll::Pending
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "tcp flow closed",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // Empty payload signals FIN to the writer task.
        let _ = self.tx.try_send(Bytes::new());
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_flow() -> (TcpFlow, mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
        let (to_flow, flow_rx) = mpsc::channel(16);
        let (flow_tx, stack_rx) = mpsc::channel(16);
        let flow = TcpFlow {
            rx: flow_rx,
            tx: flow_tx,
            read_buf: Bytes::new(),
            read_closed: false,
            client: "10.0.0.2:50000".parse().unwrap(),
            destination: "93.184.216.34:80".parse().unwrap(),
            keepalive: KeepaliveConfig::default(),
        };
        (flow, to_flow, stack_rx)
    }

    #[test]
    fn keepalive_defaults() {
        let ka = KeepaliveConfig::default();
        assert_eq!(ka.idle, Duration::from_secs(60));
        assert_eq!(ka.interval, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn flow_exposes_swapped_view() {
        let (flow, _to_flow, _stack_rx) = test_flow();
        assert_eq!(flow.destination(), "93.184.216.34:80".parse().unwrap());
        assert_eq!(flow.client(), "10.0.0.2:50000".parse().unwrap());
        assert_eq!(flow.keepalive(), KeepaliveConfig::default());
    }

    #[tokio::test]
    async fn flow_read_write() {
        let (mut flow, to_flow, mut stack_rx) = test_flow();

        flow.write_all(b"request").await.unwrap();
        assert_eq!(&stack_rx.recv().await.unwrap()[..], b"request");

        to_flow.send(Bytes::from_static(b"response")).await.unwrap();
        let mut buf = [0u8; 64];
        let n = flow.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"response");
    }

    #[tokio::test]
    async fn flow_partial_reads_preserve_bytes() {
        let (mut flow, to_flow, _stack_rx) = test_flow();
        to_flow.send(Bytes::from_static(b"abcdef")).await.unwrap();

        let mut buf = [0u8; 4];
        let n = flow.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        let n = flow.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ef");
    }

    #[tokio::test]
    async fn flow_eof_on_empty_marker() {
        let (mut flow, to_flow, _stack_rx) = test_flow();
        to_flow.send(Bytes::new()).await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(flow.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn flow_eof_on_channel_close() {
        let (mut flow, to_flow, _stack_rx) = test_flow();
        drop(to_flow);
        let mut buf = [0u8; 8];
        assert_eq!(flow.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn shutdown_emits_fin_marker() {
        let (mut flow, _to_flow, mut stack_rx) = test_flow();
        flow.shutdown().await.unwrap();
        assert!(stack_rx.recv().await.unwrap().is_empty());
    }

    #[test]
    fn sequence_comparison_wraps() {
        assert!(seq_before(1, 2));
        assert!(seq_before(u32::MAX, 1));
        assert!(!seq_before(2, 1));
    }
}
