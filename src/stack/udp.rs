//! UDP session tracking.
//!
//! Inbound IPv4/UDP datagrams are demultiplexed by their *client* address
//! alone: the session key deliberately excludes the destination, so one
//! session fans out to every destination the client contacts and tags each
//! queued packet with the destination it was sent to. Sessions are created on
//! the first packet, removed on close, and evicted after an idle TTL by a
//! periodic sweep.

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::wire;
use super::NetContext;

/// Packet queue capacity per session; the newest packet is dropped when the
/// queue is full and the consumer is not keeping up.
const SESSION_QUEUE: usize = 64;

/// Session key: client IPv4 address and port, big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey([u8; 6]);

impl SessionKey {
    pub fn new(client: SocketAddrV4) -> Self {
        let mut key = [0u8; 6];
        key[..4].copy_from_slice(&client.ip().octets());
        key[4..6].copy_from_slice(&client.port().to_be_bytes());
        Self(key)
    }
}

type QueuedPacket = (Bytes, SocketAddrV4);

/// One UDP flow, keyed by the client address.
pub struct UdpSession {
    key: SessionKey,
    client: SocketAddrV4,
    destination: SocketAddrV4,
    closed: CancellationToken,
    queue_tx: mpsc::Sender<QueuedPacket>,
    queue_rx: tokio::sync::Mutex<mpsc::Receiver<QueuedPacket>>,
    table: Weak<SessionTable>,
    net: Arc<NetContext>,
    last_active_ms: AtomicU64,
}

impl UdpSession {
    fn new(
        key: SessionKey,
        client: SocketAddrV4,
        destination: SocketAddrV4,
        table: &Arc<SessionTable>,
        net: Arc<NetContext>,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::channel(SESSION_QUEUE);
        Arc::new(Self {
            key,
            client,
            destination,
            closed: CancellationToken::new(),
            queue_tx,
            queue_rx: tokio::sync::Mutex::new(queue_rx),
            table: Arc::downgrade(table),
            net,
            last_active_ms: AtomicU64::new(table.uptime_ms()),
        })
    }

    /// Client address, as seen on the TUN side.
    pub fn client(&self) -> SocketAddr {
        SocketAddr::V4(self.client)
    }

    /// Destination the client addressed with its first packet.
    pub fn destination(&self) -> SocketAddr {
        SocketAddr::V4(self.destination)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Enqueue an inbound packet. Non-blocking; the packet is dropped (and
    /// counted) when the queue is full.
    pub fn handle_packet(&self, payload: Bytes, destination: SocketAddrV4) {
        if self.is_closed() {
            return;
        }
        self.touch();
        if self.queue_tx.try_send((payload, destination)).is_err() {
            self.net.stats.inc_udp_overflow_drops();
        }
    }

    /// Wait for the next packet. Returns the copied length and the
    /// destination address the client sent the packet to, or EOF once the
    /// session is closed.
    pub async fn read_to(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        let mut queue = self.queue_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "udp session closed",
            )),
            packet = queue.recv() => match packet {
                Some((payload, addr)) => {
                    let n = payload.len().min(buf.len());
                    buf[..n].copy_from_slice(&payload[..n]);
                    Ok((n, SocketAddr::V4(addr)))
                }
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "udp session closed",
                )),
            },
        }
    }

    /// Synthesise a datagram from `src` back to the client.
    pub async fn write_from(&self, buf: &[u8], src: SocketAddr) -> std::io::Result<usize> {
        if self.is_closed() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "udp session closed",
            ));
        }
        if buf.len() > wire::MAX_UDP_PAYLOAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "message too long",
            ));
        }
        let SocketAddr::V4(src) = src else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "source address must be ipv4",
            ));
        };
        self.net
            .find_route(*src.ip())
            .map_err(std::io::Error::other)?;

        let pkt = wire::build_udp(
            src,
            self.client,
            self.net.ttl,
            Bytes::copy_from_slice(buf),
        )
        .map_err(std::io::Error::other)?;
        self.net
            .endpoint
            .write_packet(&pkt)
            .await
            .map_err(std::io::Error::other)?;
        self.touch();
        Ok(buf.len())
    }

    /// Close the session and remove it from the table. Safe to call any
    /// number of times.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        self.closed.cancel();
        if let Some(table) = self.table.upgrade() {
            table.remove(&self.key);
        }
    }

    fn touch(&self) {
        if let Some(table) = self.table.upgrade() {
            self.last_active_ms
                .store(table.uptime_ms(), Ordering::Relaxed);
        }
    }

    fn idle_for(&self, table: &SessionTable) -> Duration {
        let idle = table
            .uptime_ms()
            .saturating_sub(self.last_active_ms.load(Ordering::Relaxed));
        Duration::from_millis(idle)
    }
}

/// Concurrent map from session key to session. Lookup-then-insert is atomic,
/// so racing first packets cannot create duplicate sessions.
pub struct SessionTable {
    sessions: Mutex<HashMap<SessionKey, Arc<UdpSession>>>,
    base: Instant,
}

impl SessionTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            base: Instant::now(),
        })
    }

    /// Existing session for `key`, or a freshly inserted one. The boolean is
    /// true when the session was created by this call.
    pub(crate) fn get_or_insert(
        self: &Arc<Self>,
        client: SocketAddrV4,
        destination: SocketAddrV4,
        net: &Arc<NetContext>,
    ) -> (Arc<UdpSession>, bool) {
        let key = SessionKey::new(client);
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = sessions.get(&key) {
            return (session.clone(), false);
        }
        let session = UdpSession::new(key, client, destination, self, net.clone());
        sessions.insert(key, session.clone());
        (session, true)
    }

    pub fn get(&self, client: SocketAddrV4) -> Option<Arc<UdpSession>> {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.get(&SessionKey::new(client)).cloned()
    }

    pub fn remove(&self, key: &SessionKey) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.remove(key);
    }

    pub fn len(&self) -> usize {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every session, waking blocked readers with EOF.
    pub fn close_all(&self) {
        let drained: Vec<Arc<UdpSession>> = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            sessions.drain().map(|(_, session)| session).collect()
        };
        for session in drained {
            session.closed.cancel();
        }
    }

    /// Remove and close sessions idle longer than `ttl`. Returns how many
    /// were evicted.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let expired: Vec<Arc<UdpSession>> = {
            let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
            let expired: Vec<SessionKey> = sessions
                .iter()
                .filter(|(_, session)| session.idle_for(self) >= ttl)
                .map(|(key, _)| *key)
                .collect();
            expired
                .iter()
                .filter_map(|key| sessions.remove(key))
                .collect()
        };
        for session in &expired {
            session.closed.cancel();
            debug!(client = %session.client, "udp session evicted");
        }
        expired.len()
    }

    /// Periodic eviction sweep, stopped by `cancel`.
    pub fn spawn_cleanup_task(self: &Arc<Self>, ttl: Duration, cancel: CancellationToken) {
        let table = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let removed = table.evict_idle(ttl);
                        if removed > 0 {
                            debug!(removed, remaining = table.len(), "udp session sweep");
                        }
                    }
                }
            }
        });
    }

    fn uptime_ms(&self) -> u64 {
        self.base.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::StackStats;
    use crate::tun::mem::MemTunDevice;

    fn test_net() -> Arc<NetContext> {
        let (device, _handle) = MemTunDevice::new();
        NetContext::for_tests(device)
    }

    fn client() -> SocketAddrV4 {
        "10.0.0.2:53000".parse().unwrap()
    }

    fn dest() -> SocketAddrV4 {
        "8.8.8.8:53".parse().unwrap()
    }

    #[tokio::test]
    async fn session_key_is_client_only() {
        let table = SessionTable::new();
        let net = test_net();
        let (first, is_new) = table.get_or_insert(client(), dest(), &net);
        assert!(is_new);
        let other_dest = "1.1.1.1:443".parse().unwrap();
        let (second, is_new) = table.get_or_insert(client(), other_dest, &net);
        assert!(!is_new);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn packets_keep_arrival_order() {
        let table = SessionTable::new();
        let net = test_net();
        let (session, _) = table.get_or_insert(client(), dest(), &net);

        for i in 0u8..5 {
            session.handle_packet(Bytes::from(vec![i]), dest());
        }
        let mut buf = [0u8; 16];
        for i in 0u8..5 {
            let (n, addr) = session.read_to(&mut buf).await.unwrap();
            assert_eq!(buf[..n], [i]);
            assert_eq!(addr, SocketAddr::V4(dest()));
        }
    }

    #[tokio::test]
    async fn overflow_drops_newest_and_counts() {
        let table = SessionTable::new();
        let net = test_net();
        let (session, _) = table.get_or_insert(client(), dest(), &net);

        for i in 0..100u16 {
            session.handle_packet(Bytes::from(i.to_be_bytes().to_vec()), dest());
        }
        assert_eq!(net.stats.udp_overflow_drops(), 100 - SESSION_QUEUE as u64);

        let mut buf = [0u8; 16];
        for i in 0..SESSION_QUEUE as u16 {
            let (n, _) = session.read_to(&mut buf).await.unwrap();
            assert_eq!(buf[..n], i.to_be_bytes());
        }
    }

    #[tokio::test]
    async fn close_is_idempotent_and_unblocks_reader() {
        let table = SessionTable::new();
        let net = test_net();
        let (session, _) = table.get_or_insert(client(), dest(), &net);

        let reader = {
            let session = session.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                session.read_to(&mut buf).await
            })
        };
        tokio::task::yield_now().await;

        session.close();
        session.close();
        session.close();

        let err = reader.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn write_from_rejects_oversize_payload() {
        let table = SessionTable::new();
        let net = test_net();
        let (session, _) = table.get_or_insert(client(), dest(), &net);

        let payload = vec![0u8; wire::MAX_UDP_PAYLOAD + 1];
        let err = session
            .write_from(&payload, SocketAddr::V4(dest()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
        assert!(err.to_string().contains("message too long"));
    }

    #[tokio::test]
    async fn write_from_requires_spoofing() {
        let (device, _handle) = MemTunDevice::new();
        let mut net = NetContext::for_tests(device);
        Arc::get_mut(&mut net).unwrap().spoofing = false;

        let table = SessionTable::new();
        let (session, _) = table.get_or_insert(client(), dest(), &net);
        let err = session
            .write_from(b"x", SocketAddr::V4(dest()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("spoofing"));
    }

    #[tokio::test]
    async fn idle_sessions_are_evicted() {
        let table = SessionTable::new();
        let net = test_net();
        let (session, _) = table.get_or_insert(client(), dest(), &net);

        assert_eq!(table.evict_idle(Duration::from_secs(60)), 0);
        assert_eq!(table.evict_idle(Duration::ZERO), 1);
        assert!(session.is_closed());
        assert!(table.is_empty());
    }

    #[test]
    fn stats_default_to_zero() {
        let stats = StackStats::default();
        assert_eq!(stats.udp_overflow_drops(), 0);
        assert_eq!(stats.udp_malformed(), 0);
    }
}
