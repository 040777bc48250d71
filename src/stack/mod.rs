//! Userspace IPv4 stack over a TUN link endpoint.
//!
//! The stack decodes frames delivered by the link endpoint and terminates
//! TCP, UDP and ICMP in user space: TCP SYNs become [`TcpFlow`] stream
//! handles via the forwarder, UDP datagrams are demultiplexed into
//! [`UdpSession`]s, and ICMP echo requests are answered under a rate limit.
//!
//! The NIC runs in promiscuous mode so packets for *any* destination are
//! accepted (the TUN carries traffic for every address the client dials) and
//! with spoofing enabled so synthesised replies can carry those arbitrary
//! destinations as their source.

pub mod endpoint;
pub mod icmp;
pub mod tcp;
pub mod udp;
pub mod wire;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::tun::{TunDevice, MTU};
use endpoint::LinkEndpoint;
use icmp::IcmpRateLimiter;
pub use tcp::{KeepaliveConfig, TcpFlow, TcpForwarder};
pub use udp::{SessionKey, SessionTable, UdpSession};

/// Stack tuning knobs, applied when the stack is built.
#[derive(Debug, Clone)]
pub struct StackOptions {
    /// TTL stamped on synthesised IPv4 packets.
    pub default_ttl: u8,
    /// Forward between NICs. The bridge runs a single NIC, so this is part
    /// of the option surface only.
    pub forwarding: bool,
    /// ICMP reply budget, packets per second.
    pub icmp_limit: u32,
    /// ICMP reply burst size.
    pub icmp_burst: u32,
    /// TCP receive buffer range (min, default, max).
    pub tcp_receive_buffer: (usize, usize, usize),
    /// TCP send buffer range (min, default, max).
    pub tcp_send_buffer: (usize, usize, usize),
    /// Congestion control algorithm. The option takes a string, but only
    /// `reno` is implemented; anything else is accepted with a warning.
    pub congestion_control: String,
    /// Delayed ACK. Off: every in-order data segment is acknowledged
    /// immediately.
    pub tcp_delayed_ack: bool,
    /// Automatic receive-buffer moderation.
    pub moderate_receive_buffer: bool,
    /// Selective acknowledgements.
    pub sack: bool,
    /// Accept inbound packets for any destination address.
    pub promiscuous: bool,
    /// Allow synthesised packets to use source addresses not bound to the
    /// NIC.
    pub spoofing: bool,
    /// Receive window advertised by the TCP forwarder.
    pub tcp_receive_window: u16,
    /// In-flight handshake budget; SYNs beyond it are refused with RST.
    pub tcp_max_in_flight: usize,
    /// Idle TTL after which a UDP session is evicted.
    pub udp_session_ttl: Duration,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            default_ttl: 64,
            forwarding: true,
            icmp_limit: 1000,
            icmp_burst: 50,
            tcp_receive_buffer: (4 << 10, 212 << 10, 4 << 20),
            tcp_send_buffer: (4 << 10, 212 << 10, 4 << 20),
            congestion_control: "reno".to_string(),
            tcp_delayed_ack: false,
            moderate_receive_buffer: true,
            sack: true,
            promiscuous: true,
            spoofing: true,
            tcp_receive_window: 16 << 10,
            tcp_max_in_flight: 1 << 15,
            udp_session_ttl: Duration::from_secs(120),
        }
    }
}

/// Counters kept by the stack. Validation failures are counted here rather
/// than logged.
#[derive(Debug, Default)]
pub struct StackStats {
    frames_received: AtomicU64,
    frames_sent: AtomicU64,
    udp_packets_received: AtomicU64,
    udp_malformed: AtomicU64,
    udp_checksum_errors: AtomicU64,
    udp_overflow_drops: AtomicU64,
    tcp_accepted: AtomicU64,
    tcp_rst_sent: AtomicU64,
    icmp_rate_limited: AtomicU64,
}

macro_rules! counter {
    ($inc:ident, $get:ident, $field:ident) => {
        pub(crate) fn $inc(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl StackStats {
    counter!(inc_frames_received, frames_received, frames_received);
    counter!(inc_frames_sent, frames_sent, frames_sent);
    counter!(
        inc_udp_packets_received,
        udp_packets_received,
        udp_packets_received
    );
    counter!(inc_udp_malformed, udp_malformed, udp_malformed);
    counter!(
        inc_udp_checksum_errors,
        udp_checksum_errors,
        udp_checksum_errors
    );
    counter!(inc_udp_overflow_drops, udp_overflow_drops, udp_overflow_drops);
    counter!(inc_tcp_accepted, tcp_accepted, tcp_accepted);
    counter!(inc_tcp_rst_sent, tcp_rst_sent, tcp_rst_sent);
    counter!(inc_icmp_rate_limited, icmp_rate_limited, icmp_rate_limited);
}

/// Shared pieces the transport handlers need to synthesise packets.
pub(crate) struct NetContext {
    pub(crate) endpoint: Arc<LinkEndpoint>,
    pub(crate) ttl: u8,
    pub(crate) spoofing: bool,
    pub(crate) stats: Arc<StackStats>,
}

impl NetContext {
    /// Route lookup for an outbound packet with the given source address.
    /// The single NIC carries a catch-all route, so the destination always
    /// resolves; the source is only usable when spoofing is enabled, since
    /// no addresses are bound to the NIC.
    pub(crate) fn find_route(&self, src: Ipv4Addr) -> Result<()> {
        if !self.spoofing {
            bail!(
                "no route from {}: spoofing disabled and address not bound to the nic",
                src
            );
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn for_tests(device: Arc<dyn TunDevice>) -> Arc<Self> {
        let stats = Arc::new(StackStats::default());
        Arc::new(Self {
            endpoint: Arc::new(LinkEndpoint::new(device, MTU, stats.clone())),
            ttl: 64,
            spoofing: true,
            stats,
        })
    }
}

/// Consumer of the flows the stack produces. Implementations must return
/// quickly or hand the flow off; they run on the dispatch task.
#[async_trait]
pub trait StackHandler: Send + Sync {
    async fn handle_stream(&self, flow: TcpFlow) -> Result<()>;

    async fn handle_packet(
        &self,
        session: Arc<UdpSession>,
        destination: SocketAddr,
    ) -> Result<()>;
}

pub struct Stack {
    options: StackOptions,
    stats: Arc<StackStats>,
    endpoint: Arc<LinkEndpoint>,
    tcp: Arc<TcpForwarder>,
    udp: Arc<SessionTable>,
    net: Arc<NetContext>,
    icmp: IcmpRateLimiter,
    cancel: CancellationToken,
}

impl Stack {
    /// Build the stack with the standard option set.
    pub fn with_defaults(
        device: Arc<dyn TunDevice>,
        handler: Arc<dyn StackHandler>,
    ) -> Result<Arc<Self>> {
        Self::new(device, handler, StackOptions::default())
    }

    pub fn new(
        device: Arc<dyn TunDevice>,
        handler: Arc<dyn StackHandler>,
        options: StackOptions,
    ) -> Result<Arc<Self>> {
        if options.congestion_control != "reno" {
            warn!(
                requested = %options.congestion_control,
                "only reno congestion control is implemented"
            );
        }
        if options.tcp_receive_window == 0 {
            bail!("tcp receive window must be non-zero");
        }

        let stats = Arc::new(StackStats::default());
        let endpoint = Arc::new(LinkEndpoint::new(device, MTU, stats.clone()));
        let net = Arc::new(NetContext {
            endpoint: endpoint.clone(),
            ttl: options.default_ttl,
            spoofing: options.spoofing,
            stats: stats.clone(),
        });
        let cancel = CancellationToken::new();

        // Transport handlers must exist before the endpoint starts reading;
        // frames arriving mid-construction would otherwise race handler
        // registration.
        let tcp = TcpForwarder::new(
            net.clone(),
            options.tcp_receive_window,
            options.tcp_max_in_flight,
        );
        let udp = SessionTable::new();
        let icmp = IcmpRateLimiter::new(options.icmp_limit, options.icmp_burst);

        let inbound = endpoint.attach(cancel.child_token());
        udp.spawn_cleanup_task(options.udp_session_ttl, cancel.child_token());

        let stack = Arc::new(Self {
            options,
            stats,
            endpoint,
            tcp,
            udp,
            net,
            icmp,
            cancel,
        });
        stack.clone().spawn_dispatch(inbound, handler);
        Ok(stack)
    }

    fn spawn_dispatch(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<Bytes>,
        handler: Arc<dyn StackHandler>,
    ) {
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    frame = inbound.recv() => match frame {
                        Some(frame) => frame,
                        None => break,
                    },
                };
                self.dispatch(&frame, &handler).await;
            }
        });
    }

    async fn dispatch(self: &Arc<Self>, frame: &Bytes, handler: &Arc<dyn StackHandler>) {
        let (ip, l4) = match wire::parse_ipv4(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, "undecodable frame dropped");
                return;
            }
        };

        // Without promiscuous mode only packets for NIC-bound addresses
        // would be accepted, and the bridge binds none.
        if !self.options.promiscuous {
            trace!(dst = %ip.dst, "packet dropped: promiscuous mode disabled");
            return;
        }

        match ip.protocol {
            wire::PROTO_TCP => match wire::parse_tcp(l4) {
                Ok(seg) => self.tcp.handle_segment(&ip, &seg, handler).await,
                Err(e) => debug!(error = %e, "undecodable tcp segment dropped"),
            },
            wire::PROTO_UDP => self.handle_udp(&ip, l4, handler).await,
            wire::PROTO_ICMP => self.handle_icmp(&ip, l4).await,
            protocol => trace!(protocol, "unsupported protocol dropped"),
        }
    }

    async fn handle_udp(
        self: &Arc<Self>,
        ip: &wire::Ipv4Header,
        l4: &[u8],
        handler: &Arc<dyn StackHandler>,
    ) {
        let datagram = match wire::parse_udp(l4) {
            Ok(datagram) => datagram,
            Err(e) => {
                self.stats.inc_udp_malformed();
                debug!(error = %e, "malformed udp datagram dropped");
                return;
            }
        };

        // The length field may not claim more than the header plus the bytes
        // actually present; equal passes.
        let claimed = datagram.length as usize;
        if claimed < wire::UDP_HEADER_LEN || claimed > l4.len() {
            self.stats.inc_udp_malformed();
            debug!(src = %ip.src, claimed, actual = l4.len(), "udp length mismatch");
            return;
        }
        if !wire::udp_checksum_valid(ip.src, ip.dst, &l4[..claimed]) {
            self.stats.inc_udp_checksum_errors();
            debug!(src = %ip.src, dst = %ip.dst, "udp checksum error");
            return;
        }
        self.stats.inc_udp_packets_received();

        let client = SocketAddrV4::new(ip.src, datagram.src_port);
        let destination = SocketAddrV4::new(ip.dst, datagram.dst_port);

        let (session, is_new) = self.udp.get_or_insert(client, destination, &self.net);
        session.handle_packet(Bytes::copy_from_slice(datagram.payload), destination);

        if is_new {
            if let Err(e) = handler
                .handle_packet(session, SocketAddr::V4(destination))
                .await
            {
                debug!(error = %e, "packet handler failed");
            }
        }
    }

    async fn handle_icmp(&self, ip: &wire::Ipv4Header, l4: &[u8]) {
        if l4.first() != Some(&icmp::ECHO_REQUEST) {
            trace!(src = %ip.src, "icmp message ignored");
            return;
        }
        if !self.icmp.allow() {
            self.stats.inc_icmp_rate_limited();
            return;
        }
        match wire::build_icmp_echo_reply(ip.dst, ip.src, self.options.default_ttl, l4) {
            Ok(pkt) => {
                if let Err(e) = self.endpoint.write_packet(&pkt).await {
                    debug!(error = %e, "icmp reply write failed");
                }
            }
            Err(e) => debug!(error = %e, "icmp reply build failed"),
        }
    }

    pub fn stats(&self) -> &Arc<StackStats> {
        &self.stats
    }

    pub fn options(&self) -> &StackOptions {
        &self.options
    }

    pub fn tcp(&self) -> &Arc<TcpForwarder> {
        &self.tcp
    }

    pub fn udp_sessions(&self) -> &Arc<SessionTable> {
        &self.udp
    }

    /// Stop the dispatch loop and close every UDP session. The TUN device
    /// itself is closed by the owner.
    pub fn close(&self) {
        self.cancel.cancel();
        self.udp.close_all();
    }
}
