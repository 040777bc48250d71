//! End-to-end bridge tests.
//!
//! Each test drives the full path through an in-memory TUN device: raw IPv4
//! frames go in, the stack reconstructs flows, and synthesised frames come
//! back out. The "client" side of every exchange is hand-built frames, so
//! the tests observe exactly what a TUN-side host would.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use tunbridge::dispatcher::Dispatcher;
use tunbridge::listener::{FlowHandler, InboundFlow, Listener};
use tunbridge::server::{Server, TimeoutPolicy};
use tunbridge::stack::wire::{self, PacketBuffer};
use tunbridge::stack::StackOptions;
use tunbridge::tun::mem::{MemTunDevice, MemTunHandle};

fn flatten(pkt: &PacketBuffer) -> Vec<u8> {
    let mut frame = pkt.network.clone();
    frame.extend_from_slice(&pkt.transport);
    for view in &pkt.payload {
        frame.extend_from_slice(view);
    }
    frame
}

fn tcp_frame(src: &str, dst: &str, seq: u32, ack: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
    flatten(
        &wire::build_tcp(
            src.parse().unwrap(),
            dst.parse().unwrap(),
            seq,
            ack,
            flags,
            65535,
            64,
            Bytes::copy_from_slice(payload),
        )
        .unwrap(),
    )
}

fn udp_frame(src: &str, dst: &str, payload: &[u8]) -> Vec<u8> {
    flatten(
        &wire::build_udp(
            src.parse().unwrap(),
            dst.parse().unwrap(),
            64,
            Bytes::copy_from_slice(payload),
        )
        .unwrap(),
    )
}

fn collector() -> (Arc<dyn FlowHandler>, UnboundedReceiver<InboundFlow>) {
    let (tx, rx) = unbounded_channel();
    let handler: Arc<dyn FlowHandler> = Arc::new(move |flow: InboundFlow| {
        let _ = tx.send(flow);
    });
    (handler, rx)
}

async fn next_frame(handle: &mut MemTunHandle) -> Vec<u8> {
    tokio::time::timeout(Duration::from_secs(5), handle.next_outbound())
        .await
        .expect("timed out waiting for an outbound frame")
        .expect("device closed")
}

/// HTTP-style upstream: reads one request, answers with a fixed response,
/// then closes. Records the destination it was asked to dial.
struct HttpUpstream {
    response: &'static [u8],
    dialed: std::sync::Mutex<Option<SocketAddr>>,
}

#[async_trait::async_trait]
impl Dispatcher for HttpUpstream {
    async fn dispatch_stream(
        &self,
        destination: SocketAddr,
    ) -> anyhow::Result<tunbridge::common::ProxyStream> {
        *self.dialed.lock().unwrap() = Some(destination);
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        let response = self.response;
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            let _ = server.read(&mut buf).await;
            let _ = server.write_all(response).await;
            let _ = server.shutdown().await;
        });
        Ok(Box::new(client))
    }

    async fn dispatch_packets(
        &self,
        _destination: SocketAddr,
    ) -> anyhow::Result<tunbridge::common::BoxUdpTransport> {
        anyhow::bail!("not used in this test")
    }
}

// ── S1: TCP HTTP GET through the whole bridge ──

#[tokio::test]
async fn tcp_http_get_round_trip() {
    const RESPONSE: &[u8] = b"HTTP/1.0 200 OK\r\nContent-Length: 2\r\n\r\nhi";

    let (device, mut handle) = MemTunDevice::new();
    let dispatcher = Arc::new(HttpUpstream {
        response: RESPONSE,
        dialed: std::sync::Mutex::new(None),
    });
    let server = Server::new(dispatcher.clone(), TimeoutPolicy::default());
    let listener =
        Listener::with_device(device, StackOptions::default(), Arc::new(server)).unwrap();

    let client = "10.0.0.2:50000";
    let destination = "93.184.216.34:80";

    // Handshake.
    handle.inject(tcp_frame(client, destination, 1000, 0, wire::FLAG_SYN, b""));
    let syn_ack = next_frame(&mut handle).await;
    let (ip, l4) = wire::parse_ipv4(&syn_ack).unwrap();
    assert_eq!(ip.src.to_string(), "93.184.216.34");
    assert_eq!(ip.dst.to_string(), "10.0.0.2");
    let seg = wire::parse_tcp(l4).unwrap();
    assert_eq!(seg.flags, wire::FLAG_SYN | wire::FLAG_ACK);
    assert_eq!(seg.ack, 1001);
    let iss = seg.seq;

    handle.inject(tcp_frame(
        client,
        destination,
        1001,
        iss.wrapping_add(1),
        wire::FLAG_ACK,
        b"",
    ));

    // Request.
    let request = b"GET / HTTP/1.0\r\n\r\n";
    handle.inject(tcp_frame(
        client,
        destination,
        1001,
        iss.wrapping_add(1),
        wire::FLAG_PSH | wire::FLAG_ACK,
        request,
    ));

    // Collect the response bytes until the bridge closes with FIN.
    let mut received = Vec::new();
    let mut saw_fin = false;
    let mut saw_request_ack = false;
    for _ in 0..32 {
        let frame = next_frame(&mut handle).await;
        let (_, l4) = wire::parse_ipv4(&frame).unwrap();
        let seg = wire::parse_tcp(l4).unwrap();
        if seg.ack == 1001 + request.len() as u32 {
            saw_request_ack = true;
        }
        received.extend_from_slice(seg.payload);
        if seg.flags & wire::FLAG_FIN != 0 {
            saw_fin = true;
            break;
        }
    }

    assert_eq!(received, RESPONSE);
    assert!(saw_request_ack, "request bytes were never acknowledged");
    assert!(saw_fin, "no FIN after the upstream closed");
    assert_eq!(
        *dispatcher.dialed.lock().unwrap(),
        Some(destination.parse().unwrap())
    );

    listener.close().await.unwrap();
}

// ── S2 / R1: UDP DNS exchange ──

#[tokio::test]
async fn udp_dns_round_trip() {
    let (device, mut handle) = MemTunDevice::new();
    let (handler, mut flows) = collector();
    let listener = Listener::with_device(device, StackOptions::default(), handler).unwrap();

    let mut query = vec![0u8; 40];
    query[0] = 0x12;
    query[1] = 0x34;
    handle.inject(udp_frame("10.0.0.2:53000", "8.8.8.8:53", &query));

    let InboundFlow::Datagrams(flow) = flows.recv().await.unwrap() else {
        panic!("expected a udp flow");
    };
    assert_eq!(flow.destination(), "8.8.8.8:53".parse::<SocketAddr>().unwrap());
    assert_eq!(flow.client(), "10.0.0.2:53000".parse::<SocketAddr>().unwrap());

    let mut buf = [0u8; 1500];
    let (n, addr) = flow.read_datagram(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], &query[..]);
    assert_eq!(addr, "8.8.8.8:53".parse::<SocketAddr>().unwrap());

    let mut response = vec![0u8; 60];
    response[0] = 0x12;
    response[1] = 0x34;
    response[2] = 0x81;
    let written = flow
        .write_datagram(&response, "8.8.8.8:53".parse().unwrap())
        .await
        .unwrap();
    assert_eq!(written, 60);

    let frame = next_frame(&mut handle).await;
    let (ip, l4) = wire::parse_ipv4(&frame).unwrap();
    assert_eq!(ip.src.to_string(), "8.8.8.8");
    assert_eq!(ip.dst.to_string(), "10.0.0.2");
    assert!(wire::udp_checksum_valid(ip.src, ip.dst, l4));
    let datagram = wire::parse_udp(l4).unwrap();
    assert_eq!(datagram.src_port, 53);
    assert_eq!(datagram.dst_port, 53000);
    assert_eq!(datagram.payload, &response[..]);

    listener.close().await.unwrap();
}

// ── S3: IPv6 is silently dropped ──

#[tokio::test]
async fn ipv6_syn_is_silently_dropped() {
    let (device, mut handle) = MemTunDevice::new();
    let (handler, mut flows) = collector();
    let listener = Listener::with_device(device, StackOptions::default(), handler).unwrap();

    // A plausible IPv6 TCP SYN to [2606:2800::1]:80.
    let mut frame = vec![0u8; 60];
    frame[0] = 0x60;
    frame[4..6].copy_from_slice(&20u16.to_be_bytes());
    frame[6] = 6;
    frame[8..24].copy_from_slice(&[0x26, 0x06, 0x28, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);
    frame[24..40].copy_from_slice(&[0x26, 0x06, 0x28, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2]);
    frame[40..42].copy_from_slice(&50000u16.to_be_bytes());
    frame[42..44].copy_from_slice(&80u16.to_be_bytes());
    frame[53] = wire::FLAG_SYN;
    handle.inject(frame);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(flows.try_recv().is_err(), "ipv6 must not produce a flow");
    assert!(handle.try_next_outbound().is_none(), "no reply expected");
    assert_eq!(listener.stack().stats().frames_received(), 0);

    listener.close().await.unwrap();
}

// ── S4: UDP queue overflow ──

#[tokio::test]
async fn udp_overflow_keeps_first_64_in_order() {
    let (device, handle) = MemTunDevice::new();
    let (handler, mut flows) = collector();
    let listener = Listener::with_device(device, StackOptions::default(), handler).unwrap();

    for i in 0..100u16 {
        let mut payload = vec![0u8; 100];
        payload[..2].copy_from_slice(&i.to_be_bytes());
        handle.inject(udp_frame("10.0.0.2:40000", "203.0.113.7:9999", &payload));
    }

    let InboundFlow::Datagrams(flow) = flows.recv().await.unwrap() else {
        panic!("expected a udp flow");
    };

    // Give the dispatch loop time to work through all 100 frames.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(listener.stack().stats().udp_packets_received(), 100);
    assert_eq!(listener.stack().stats().udp_overflow_drops(), 100 - 64);

    let mut buf = [0u8; 1500];
    for i in 0..64u16 {
        let (n, _) = flow.read_datagram(&mut buf).await.unwrap();
        assert_eq!(n, 100);
        assert_eq!(buf[..2], i.to_be_bytes());
    }

    // The 65th read blocks until new traffic arrives.
    let pending = tokio::time::timeout(Duration::from_millis(100), flow.read_datagram(&mut buf));
    assert!(pending.await.is_err(), "read should block on an empty queue");

    handle.inject(udp_frame("10.0.0.2:40000", "203.0.113.7:9999", b"later"));
    let (n, _) = flow.read_datagram(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"later");

    listener.close().await.unwrap();
}

// ── S5: endpoint-creation failure answers with RST ──

#[tokio::test]
async fn exhausted_handshake_budget_sends_rst() {
    let options = StackOptions {
        tcp_max_in_flight: 1,
        ..StackOptions::default()
    };
    let (device, mut handle) = MemTunDevice::new();
    let (handler, mut flows) = collector();
    let listener = Listener::with_device(device, options, handler).unwrap();

    handle.inject(tcp_frame(
        "10.0.0.2:50000",
        "93.184.216.34:80",
        100,
        0,
        wire::FLAG_SYN,
        b"",
    ));
    let syn_ack = next_frame(&mut handle).await;
    let (_, l4) = wire::parse_ipv4(&syn_ack).unwrap();
    assert_eq!(
        wire::parse_tcp(l4).unwrap().flags,
        wire::FLAG_SYN | wire::FLAG_ACK
    );
    // Hold the accepted flow so the budget stays spent.
    let first = flows.recv().await.unwrap();
    assert_eq!(listener.stack().tcp().active_connections(), 1);

    // The budget is spent; the next SYN is refused within one round trip.
    handle.inject(tcp_frame(
        "10.0.0.2:50001",
        "93.184.216.34:80",
        200,
        0,
        wire::FLAG_SYN,
        b"",
    ));
    let rst = next_frame(&mut handle).await;
    let (ip, l4) = wire::parse_ipv4(&rst).unwrap();
    assert_eq!(ip.dst.to_string(), "10.0.0.2");
    let seg = wire::parse_tcp(l4).unwrap();
    assert!(seg.flags & wire::FLAG_RST != 0, "expected RST, got {:#x}", seg.flags);
    assert_eq!(seg.ack, 201);
    assert_eq!(listener.stack().stats().tcp_rst_sent(), 1);
    assert!(flows.try_recv().is_err(), "refused SYN must not produce a flow");

    drop(first);
    listener.close().await.unwrap();
}

// ── S6: shutdown semantics ──

#[tokio::test]
async fn close_unblocks_readers_and_stops_accepting() {
    let (device, handle) = MemTunDevice::new();
    let (handler, mut flows) = collector();
    let listener = Listener::with_device(device, StackOptions::default(), handler).unwrap();

    handle.inject(udp_frame("10.0.0.2:50000", "8.8.8.8:53", b"query"));
    let InboundFlow::Datagrams(flow) = flows.recv().await.unwrap() else {
        panic!("expected a udp flow");
    };
    let mut buf = [0u8; 64];
    let _ = flow.read_datagram(&mut buf).await.unwrap();

    // Block a reader, then close underneath it.
    let blocked = {
        let flow = flow.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            flow.read_datagram(&mut buf).await
        })
    };
    tokio::task::yield_now().await;

    listener.close().await.unwrap();

    let err = blocked.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    assert!(handle.is_closed(), "tun device must be closed");

    // New traffic after close produces nothing.
    handle.inject(udp_frame("10.0.0.3:50000", "8.8.8.8:53", b"late"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(flows.try_recv().is_err());
}
