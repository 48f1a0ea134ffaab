//! Integration tests for Cellgate
//!
//! Tests the gateway end to end over loopback:
//! - HTTP CONNECT and SOCKS5 proxies relaying to a local echo server
//! - Tunnel client against a fake relay, with the forwarder turning
//!   tunnelled TCP/UDP into real sockets

use bytes::Bytes;
use cellgate::config::{ForwarderConfig, ProxyConfig, TunnelConfig};
use cellgate::forwarder::packet::{self, TcpFlags, Transport};
use cellgate::network::{DnsResolver, NetworkSelector, StaticMonitor};
use cellgate::proxy::{HttpProxyServer, Socks5Server};
use cellgate::tunnel::{ChannelPlatform, HostPort, RelayFrame, TunnelClient};
use cellgate::{CredentialStore, GatewayContext};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

/// Gateway context on system routing, plus the host side of created interfaces
fn gateway() -> (GatewayContext, mpsc::UnboundedReceiver<HostPort>) {
    let selector = NetworkSelector::new(
        Arc::new(StaticMonitor::default()),
        DnsResolver::new(Vec::new(), Duration::from_secs(2)),
    );
    selector.acquire().unwrap();
    let (platform, ports) = ChannelPlatform::new(64);
    (
        GatewayContext::new(Arc::new(selector), Arc::new(platform)),
        ports,
    )
}

/// Echo server answering every connection until it closes
async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// A loopback port with nothing listening
async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

async fn read_exactly(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    timeout(WAIT, stream.read_exact(&mut buf))
        .await
        .expect("read timed out")
        .unwrap();
    buf
}

#[tokio::test]
async fn test_http_connect_relay() {
    let echo = echo_server().await;
    let (ctx, _ports) = gateway();
    let server = HttpProxyServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        ctx,
        Arc::new(CredentialStore::new()),
        ProxyConfig::default(),
    )
    .await
    .unwrap();
    let proxy = server.local_addr().unwrap();
    let stats = server.stats();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move { server.run(token).await });

    let mut client = TcpStream::connect(proxy).await.unwrap();
    // payload bytes ride along with the request head
    client
        .write_all(format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\nhello", echo, echo).as_bytes())
        .await
        .unwrap();

    let established = b"HTTP/1.1 200 Connection Established\r\n\r\n";
    assert_eq!(read_exactly(&mut client, established.len()).await, established);
    assert_eq!(read_exactly(&mut client, 5).await, b"hello");

    client.write_all(b" world").await.unwrap();
    assert_eq!(read_exactly(&mut client, 6).await, b" world");

    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    timeout(WAIT, client.read_to_end(&mut rest)).await.unwrap().unwrap();
    assert!(rest.is_empty());

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.bytes_out, 11);
    assert_eq!(snapshot.bytes_in, 11);
    shutdown.cancel();
}

#[tokio::test]
async fn test_http_connect_unreachable() {
    let target = closed_port().await;
    let (ctx, _ports) = gateway();
    let server = HttpProxyServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        ctx,
        Arc::new(CredentialStore::new()),
        ProxyConfig::default(),
    )
    .await
    .unwrap();
    let proxy = server.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move { server.run(token).await });

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client
        .write_all(format!("CONNECT {} HTTP/1.1\r\n\r\n", target).as_bytes())
        .await
        .unwrap();

    let mut response = Vec::new();
    timeout(WAIT, client.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, b"HTTP/1.1 502 Bad Gateway\r\n\r\n");
    shutdown.cancel();
}

#[tokio::test]
async fn test_socks5_connect_relay_and_refusal() {
    let echo = echo_server().await;
    let refused = closed_port().await;
    let (ctx, _ports) = gateway();
    let server = Socks5Server::bind(
        "127.0.0.1:0".parse().unwrap(),
        ctx,
        Arc::new(CredentialStore::new()),
        ProxyConfig::default(),
    )
    .await
    .unwrap();
    let proxy = server.local_addr().unwrap();
    let stats = server.stats();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move { server.run(token).await });

    let connect_request = |addr: SocketAddr| {
        let SocketAddr::V4(addr) = addr else { unreachable!() };
        let mut request = vec![0x05, 0x01, 0x00, 0x01];
        request.extend_from_slice(&addr.ip().octets());
        request.extend_from_slice(&addr.port().to_be_bytes());
        request
    };

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
    assert_eq!(read_exactly(&mut client, 2).await, [0x05, 0x00]);
    client.write_all(&connect_request(echo)).await.unwrap();
    assert_eq!(
        read_exactly(&mut client, 10).await,
        [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
    );
    client.write_all(b"ping").await.unwrap();
    assert_eq!(read_exactly(&mut client, 4).await, b"ping");
    drop(client);

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    read_exactly(&mut client, 2).await;
    client.write_all(&connect_request(refused)).await.unwrap();
    assert_eq!(read_exactly(&mut client, 10).await[1], 0x05);

    let snapshot = stats.snapshot();
    assert_eq!(snapshot.bytes_out, 4);
    shutdown.cancel();
}

struct FakeRelay {
    socket: UdpSocket,
    client: Option<SocketAddr>,
}

impl FakeRelay {
    async fn bind() -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            client: None,
        }
    }

    /// Next DATA payload from the client, skipping PINGs
    async fn recv_data(&mut self) -> Vec<u8> {
        loop {
            let frame = self.recv().await;
            if frame[0] == 0x02 {
                return frame[1..].to_vec();
            }
        }
    }

    async fn recv(&mut self) -> Vec<u8> {
        let mut buf = vec![0u8; 65535];
        let (n, from) = timeout(WAIT, self.socket.recv_from(&mut buf))
            .await
            .expect("relay receive timed out")
            .unwrap();
        self.client = Some(from);
        buf.truncate(n);
        buf
    }

    async fn send(&self, frame: RelayFrame) {
        self.socket
            .send_to(&frame.encode(), self.client.unwrap())
            .await
            .unwrap();
    }

    async fn accept_client(&mut self, virtual_ip: Ipv4Addr) {
        let auth = self.recv().await;
        assert_eq!(auth[0], 0x01);
        assert_eq!(auth.len(), 17);
        self.send(RelayFrame::AuthOk(virtual_ip)).await;
    }
}

struct TcpReply {
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    payload: Vec<u8>,
}

fn parse_tcp_reply(packet: &[u8]) -> TcpReply {
    assert_eq!(packet::checksum(&packet[..20]), 0, "IPv4 header checksum");
    let parsed = packet::parse(packet).unwrap();
    let Transport::Tcp(segment) = parsed.transport else {
        panic!("expected TCP, got {:?}", parsed.transport)
    };
    assert_eq!(
        packet::transport_checksum(parsed.ip.src, parsed.ip.dst, packet::PROTO_TCP, &packet[20..]),
        0,
        "TCP checksum"
    );
    TcpReply {
        seq: segment.seq,
        ack: segment.ack,
        flags: segment.flags,
        payload: segment.payload.to_vec(),
    }
}

async fn start_tunnel(relay: &FakeRelay) -> (Arc<TunnelClient>, mpsc::UnboundedReceiver<HostPort>) {
    let (ctx, ports) = gateway();
    let config = TunnelConfig {
        relay: relay.socket.local_addr().unwrap().to_string(),
        device_id: "5a1e0c6e-8f3b-4d2a-9c71-0e4b6d8f2a13".to_string(),
        ..TunnelConfig::default()
    };
    let client = Arc::new(TunnelClient::new(config, ForwarderConfig::default(), ctx).unwrap());
    let runner = client.clone();
    tokio::spawn(async move { runner.run().await });
    (client, ports)
}

#[tokio::test]
async fn test_tunnel_forwards_tcp_flow() {
    let echo = echo_server().await;
    let SocketAddr::V4(echo) = echo else { unreachable!() };
    let mut relay = FakeRelay::bind().await;
    let (client, _ports) = start_tunnel(&relay).await;

    let virtual_ip = Ipv4Addr::new(10, 8, 0, 2);
    relay.accept_client(virtual_ip).await;
    assert_eq!(client.wait_connected(WAIT).await, Some(virtual_ip));

    // a remote client behind the relay opens a connection to the echo server
    let remote_client = SocketAddrV4::new(Ipv4Addr::new(10, 8, 0, 77), 40000);
    let isn = 1_000u32;
    let syn = packet::build_tcp(remote_client, echo, isn, 0, TcpFlags::SYN, &[]);
    relay.send(RelayFrame::Data(syn)).await;

    let syn_ack = parse_tcp_reply(&relay.recv_data().await);
    assert!(syn_ack.flags.contains(TcpFlags::SYN | TcpFlags::ACK));
    assert_eq!(syn_ack.ack, isn + 1);
    let mut local_seq = syn_ack.seq.wrapping_add(1);

    let request = b"GET / HTTP/1.1\r\n\r\n";
    let data = packet::build_tcp(
        remote_client,
        echo,
        isn + 1,
        local_seq,
        TcpFlags::PSH | TcpFlags::ACK,
        request,
    );
    relay.send(RelayFrame::Data(data)).await;

    // one ACK for the request, then the echoed bytes
    let mut echoed = Vec::new();
    let mut acked = false;
    while echoed.len() < request.len() {
        let reply = parse_tcp_reply(&relay.recv_data().await);
        if reply.payload.is_empty() {
            assert_eq!(reply.ack, isn + 1 + request.len() as u32);
            acked = true;
            continue;
        }
        assert!(reply.flags.contains(TcpFlags::PSH | TcpFlags::ACK));
        assert_eq!(reply.seq, local_seq);
        local_seq = local_seq.wrapping_add(reply.payload.len() as u32);
        echoed.extend_from_slice(&reply.payload);
    }
    assert!(acked);
    assert_eq!(echoed, request);

    client.disconnect();
}

#[tokio::test]
async fn test_tunnel_forwards_udp_and_local_traffic() {
    let udp_server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let SocketAddr::V4(server_addr) = udp_server.local_addr().unwrap() else { unreachable!() };
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((n, from)) = udp_server.recv_from(&mut buf).await {
            let mut reply = b"re:".to_vec();
            reply.extend_from_slice(&buf[..n]);
            let _ = udp_server.send_to(&reply, from).await;
        }
    });

    let mut relay = FakeRelay::bind().await;
    let (client, mut ports) = start_tunnel(&relay).await;
    let virtual_ip = Ipv4Addr::new(10, 8, 0, 2);
    relay.accept_client(virtual_ip).await;
    let mut port = timeout(WAIT, ports.recv()).await.unwrap().unwrap();
    assert_eq!(port.config.address, virtual_ip);
    assert_eq!(port.config.dns.len(), 2);

    // foreign destination: forwarded through a real socket
    let remote_client = SocketAddrV4::new(Ipv4Addr::new(10, 8, 0, 77), 5353);
    let query = packet::build_udp(remote_client, server_addr, b"query");
    relay.send(RelayFrame::Data(query)).await;

    let response = relay.recv_data().await;
    let parsed = packet::parse(&response).unwrap();
    assert_eq!(parsed.ip.src, *server_addr.ip());
    assert_eq!(parsed.ip.dst, *remote_client.ip());
    let Transport::Udp(datagram) = parsed.transport else { panic!("expected UDP") };
    assert_eq!(datagram.src_port, server_addr.port());
    assert_eq!(datagram.dst_port, remote_client.port());
    assert_eq!(datagram.payload, b"re:query");

    // the device's own address: delivered to the virtual interface
    let local = packet::build_udp(remote_client, SocketAddrV4::new(virtual_ip, 9999), b"local");
    relay.send(RelayFrame::Data(local.clone())).await;
    let delivered = timeout(WAIT, port.delivered.recv()).await.unwrap().unwrap();
    assert_eq!(Bytes::from(delivered), local);

    client.disconnect();
}
