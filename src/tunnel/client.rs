//! Tunnel session supervisor
//!
//! One [`TunnelClient`] keeps a session with the relay alive: it
//! authenticates, brings up the virtual interface with the assigned address,
//! runs the packet/keepalive/watchdog loops and reconnects with backoff
//! whenever the session dies.

use super::device::{InterfaceConfig, VirtualInterface};
use super::frame::{encode_data, ClientFrame, DeviceId, Phase, RelayFrame};
use super::{Backoff, TunnelError};
use crate::command::DeviceCommand;
use crate::config::{ForwarderConfig, TunnelConfig};
use crate::context::GatewayContext;
use crate::forwarder::{packet, IpForwarder};
use crate::protocol::SOCKET_BUFFER_SIZE;
use bytes::Bytes;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Largest datagram / interface packet handled
const MAX_PACKET: usize = 65535;

/// Forwarder responses waiting for the outbound loop
const RESPONSE_QUEUE: usize = 1024;

/// Connection status of the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Disconnected,
    Connecting,
    Connected { virtual_ip: Ipv4Addr },
}

/// Session lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// First session established
    Connected(Ipv4Addr),
    /// Service resumed after a lost session
    Reconnected(Ipv4Addr),
    /// Established session died; a reconnect follows
    Lost(String),
}

/// An authenticated relay session
struct Session {
    socket: Arc<UdpSocket>,
    virtual_ip: Ipv4Addr,
    interface: Arc<dyn VirtualInterface>,
}

/// Tunnel client
pub struct TunnelClient {
    config: TunnelConfig,
    forwarder: ForwarderConfig,
    ctx: GatewayContext,
    device_id: DeviceId,
    backoff: Backoff,
    status: watch::Sender<TunnelStatus>,
    events: broadcast::Sender<TunnelEvent>,
    commands: Option<mpsc::Sender<DeviceCommand>>,
    shutdown: CancellationToken,
}

impl TunnelClient {
    pub fn new(
        config: TunnelConfig,
        forwarder: ForwarderConfig,
        ctx: GatewayContext,
    ) -> Result<Self, TunnelError> {
        let device_id: DeviceId = config.device_id.parse()?;
        let backoff = Backoff::new(config.reconnect_base(), config.reconnect_max());
        let (status, _) = watch::channel(TunnelStatus::Disconnected);
        let (events, _) = broadcast::channel(16);

        Ok(Self {
            config,
            forwarder,
            ctx,
            device_id,
            backoff,
            status,
            events,
            commands: None,
            shutdown: CancellationToken::new(),
        })
    }

    /// Hand relay-pushed commands to `commands`
    pub fn with_commands(mut self, commands: mpsc::Sender<DeviceCommand>) -> Self {
        self.commands = Some(commands);
        self
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn status(&self) -> TunnelStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<TunnelStatus> {
        self.status.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<TunnelEvent> {
        self.events.subscribe()
    }

    /// Stop the client; the running session is torn down. Safe to call repeatedly.
    pub fn disconnect(&self) {
        if !self.shutdown.is_cancelled() {
            info!("Tunnel disconnect requested");
            self.shutdown.cancel();
        }
    }

    /// Wait until a session is up, returning its virtual address
    pub async fn wait_connected(&self, within: Duration) -> Option<Ipv4Addr> {
        let mut status = self.status.subscribe();
        let connected = timeout(
            within,
            status.wait_for(|s| matches!(s, TunnelStatus::Connected { .. })),
        )
        .await;
        match connected {
            Ok(Ok(status)) => match *status {
                TunnelStatus::Connected { virtual_ip } => Some(virtual_ip),
                _ => None,
            },
            _ => None,
        }
    }

    /// Connect and keep reconnecting until [`disconnect`](Self::disconnect)
    pub async fn run(&self) {
        let mut failures: u32 = 0;
        let mut resumed = false;

        while !self.shutdown.is_cancelled() {
            self.status.send_replace(TunnelStatus::Connecting);
            info!("Connecting to relay {}", self.config.relay);

            let attempt = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                attempt = self.establish() => attempt,
            };

            match attempt {
                Ok(session) => {
                    failures = 0;
                    let virtual_ip = session.virtual_ip;
                    self.status
                        .send_replace(TunnelStatus::Connected { virtual_ip });
                    let event = if resumed {
                        info!("Tunnel reconnected, virtual address {}", virtual_ip);
                        TunnelEvent::Reconnected(virtual_ip)
                    } else {
                        info!("Tunnel connected, virtual address {}", virtual_ip);
                        TunnelEvent::Connected(virtual_ip)
                    };
                    let _ = self.events.send(event);
                    resumed = true;

                    let lost = self.run_session(session).await;
                    self.status.send_replace(TunnelStatus::Disconnected);
                    match lost {
                        Some(reason) => {
                            warn!("Tunnel lost: {}", reason);
                            let _ = self.events.send(TunnelEvent::Lost(reason));
                        }
                        None => break,
                    }
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    self.status.send_replace(TunnelStatus::Disconnected);
                    warn!("Tunnel connect attempt failed ({} in a row): {}", failures, e);
                }
            }

            let delay = self.backoff.delay(failures);
            debug!("Reconnecting in {:?}", delay);
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }

        self.status.send_replace(TunnelStatus::Disconnected);
        info!("Tunnel client stopped");
    }

    /// AUTH handshake, then socket protection and interface setup
    async fn establish(&self) -> Result<Session, TunnelError> {
        let relay = self.resolve_relay().await?;
        let socket = open_socket(relay)?;
        socket.connect(relay).await?;

        socket
            .send(&ClientFrame::Auth(self.device_id).encode())
            .await?;
        debug!("AUTH sent to {} as {}", relay, self.device_id);

        let mut buf = [0u8; 64];
        let n = timeout(self.config.auth_timeout(), socket.recv(&mut buf))
            .await
            .map_err(|_| TunnelError::AuthTimeout)??;

        let virtual_ip = match RelayFrame::decode(Phase::Authenticating, &buf[..n])? {
            RelayFrame::AuthOk(ip) => ip,
            RelayFrame::AuthFail => return Err(TunnelError::AuthRejected),
            other => {
                return Err(TunnelError::InvalidFrame(format!(
                    "unexpected AUTH reply {:?}",
                    other
                )))
            }
        };

        // only now: the interface about to appear takes the default route
        self.ctx.platform().protect_socket(SockRef::from(&socket))?;

        let interface_config =
            InterfaceConfig::new(virtual_ip, self.config.mtu, self.config.dns.clone());
        let interface = self
            .ctx
            .platform()
            .create_virtual_interface(&interface_config)
            .await?;

        Ok(Session {
            socket: Arc::new(socket),
            virtual_ip,
            interface,
        })
    }

    async fn resolve_relay(&self) -> Result<SocketAddr, TunnelError> {
        let relay = &self.config.relay;
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(relay.as_str())
            .await
            .map_err(|e| TunnelError::InvalidRelay(format!("{}: {}", relay, e)))?
            .collect();
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| TunnelError::InvalidRelay(format!("{}: no addresses", relay)))
    }

    /// Run the session loops; `None` when stopped by [`disconnect`](Self::disconnect)
    async fn run_session(&self, session: Session) -> Option<String> {
        let token = self.shutdown.child_token();
        let (dead_tx, mut dead_rx) = mpsc::channel::<String>(4);
        let (responses_tx, responses_rx) = mpsc::channel::<Bytes>(RESPONSE_QUEUE);

        let forwarder = IpForwarder::new(
            self.ctx.clone(),
            self.forwarder.clone(),
            self.config.mtu,
            responses_tx,
        );
        forwarder.start();

        let started = Instant::now();
        let last_pong = Arc::new(AtomicU64::new(0));

        let mut tasks = JoinSet::new();
        tasks.spawn(outbound_loop(
            session.socket.clone(),
            session.interface.clone(),
            responses_rx,
            token.clone(),
            dead_tx.clone(),
        ));
        tasks.spawn(inbound_loop(
            Inbound {
                socket: session.socket.clone(),
                interface: session.interface.clone(),
                forwarder: forwarder.clone(),
                virtual_ip: session.virtual_ip,
                commands: self.commands.clone(),
                started,
                last_pong: last_pong.clone(),
            },
            token.clone(),
            dead_tx.clone(),
        ));
        tasks.spawn(keepalive_loop(
            session.socket.clone(),
            self.config.keepalive(),
            token.clone(),
            dead_tx.clone(),
        ));
        tasks.spawn(watchdog_loop(
            started,
            last_pong,
            self.config.pong_timeout(),
            token.clone(),
            dead_tx,
        ));

        let lost = tokio::select! {
            _ = token.cancelled() => None,
            reason = dead_rx.recv() => reason,
        };

        token.cancel();
        forwarder.stop();
        while tasks.join_next().await.is_some() {}
        debug!("Session for {} torn down", session.virtual_ip);

        lost
    }
}

impl Drop for TunnelClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Unbound UDP socket for the relay with enlarged buffers
fn open_socket(relay: SocketAddr) -> Result<UdpSocket, TunnelError> {
    let socket = Socket::new(Domain::for_address(relay), Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(e) = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        debug!("Failed to set send buffer size: {}", e);
    }
    if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        debug!("Failed to set receive buffer size: {}", e);
    }
    socket.set_nonblocking(true)?;

    let local: SocketAddr = match relay {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    socket.bind(&local.into())?;

    Ok(UdpSocket::from_std(socket.into())?)
}

fn declare_dead(dead: &mpsc::Sender<String>, reason: String) {
    let _ = dead.try_send(reason);
}

/// Virtual interface and forwarder responses → relay
async fn outbound_loop(
    socket: Arc<UdpSocket>,
    interface: Arc<dyn VirtualInterface>,
    mut responses: mpsc::Receiver<Bytes>,
    token: CancellationToken,
    dead: mpsc::Sender<String>,
) {
    let mut buf = vec![0u8; MAX_PACKET];
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => return,
            read = interface.recv(&mut buf) => match read {
                Ok(0) => continue,
                Ok(n) => encode_data(&buf[..n]),
                Err(e) => {
                    declare_dead(&dead, format!("virtual interface read failed: {}", e));
                    return;
                }
            },
            Some(packet) = responses.recv() => encode_data(&packet),
        };

        if let Err(e) = socket.send(&frame).await {
            declare_dead(&dead, format!("send to relay failed: {}", e));
            return;
        }
    }
}

struct Inbound {
    socket: Arc<UdpSocket>,
    interface: Arc<dyn VirtualInterface>,
    forwarder: Arc<IpForwarder>,
    virtual_ip: Ipv4Addr,
    commands: Option<mpsc::Sender<DeviceCommand>>,
    started: Instant,
    last_pong: Arc<AtomicU64>,
}

/// Relay → virtual interface, forwarder or command executor
async fn inbound_loop(session: Inbound, token: CancellationToken, dead: mpsc::Sender<String>) {
    let mut buf = vec![0u8; MAX_PACKET];
    loop {
        let received = tokio::select! {
            _ = token.cancelled() => return,
            received = session.socket.recv(&mut buf) => received,
        };
        let n = match received {
            Ok(n) => n,
            Err(e) => {
                declare_dead(&dead, format!("receive from relay failed: {}", e));
                return;
            }
        };

        match RelayFrame::decode(Phase::Established, &buf[..n]) {
            Ok(RelayFrame::Pong) => {
                let now = session.started.elapsed().as_millis() as u64;
                session.last_pong.store(now, Ordering::Release);
                trace!("PONG");
            }
            Ok(RelayFrame::Data(packet)) => match packet::ipv4_destination(&packet) {
                Some(dst) if dst != session.virtual_ip => session.forwarder.forward(&packet),
                _ => {
                    if let Err(e) = session.interface.send(&packet).await {
                        declare_dead(&dead, format!("virtual interface write failed: {}", e));
                        return;
                    }
                }
            },
            Ok(RelayFrame::Command(json)) => dispatch_command(&session.commands, &json),
            Ok(other) => trace!("Ignoring {:?} in established session", other),
            Err(e) => trace!("Dropping frame: {}", e),
        }
    }
}

fn dispatch_command(commands: &Option<mpsc::Sender<DeviceCommand>>, json: &[u8]) {
    let command = match DeviceCommand::parse(json) {
        Ok(command) => command,
        Err(e) => {
            warn!("Dropping relay command: {}", e);
            return;
        }
    };
    info!("Relay command {} ({})", command.id, command.kind);
    match commands {
        Some(commands) => {
            if let Err(e) = commands.try_send(command) {
                warn!("Command queue unavailable: {}", e);
            }
        }
        None => debug!("No command executor, ignoring {}", command.kind),
    }
}

async fn keepalive_loop(
    socket: Arc<UdpSocket>,
    period: Duration,
    token: CancellationToken,
    dead: mpsc::Sender<String>,
) {
    let ping = ClientFrame::Ping.encode();
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(e) = socket.send(&ping).await {
                    declare_dead(&dead, format!("PING failed: {}", e));
                    return;
                }
                trace!("PING");
            }
        }
    }
}

/// Declares the session dead once no PONG arrived within `pong_timeout`
async fn watchdog_loop(
    started: Instant,
    last_pong: Arc<AtomicU64>,
    pong_timeout: Duration,
    token: CancellationToken,
    dead: mpsc::Sender<String>,
) {
    let check = pong_timeout.min(Duration::from_secs(1));
    let limit = pong_timeout.as_millis() as u64;
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = sleep(check) => {}
        }
        let now = started.elapsed().as_millis() as u64;
        let silent = now.saturating_sub(last_pong.load(Ordering::Acquire));
        if silent > limit {
            declare_dead(&dead, format!("no PONG for {} ms", silent));
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{DnsResolver, NetworkSelector, StaticMonitor};
    use crate::tunnel::{ChannelPlatform, HostPort};
    use std::net::SocketAddrV4;

    const DEVICE: &str = "0f6e3c1a-2b4d-4e8f-9a1b-2c3d4e5f6a7b";

    struct Relay {
        socket: UdpSocket,
        client: Option<SocketAddr>,
    }

    impl Relay {
        async fn bind() -> Self {
            Self {
                socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
                client: None,
            }
        }

        fn addr(&self) -> SocketAddr {
            self.socket.local_addr().unwrap()
        }

        async fn recv(&mut self) -> Vec<u8> {
            let mut buf = vec![0u8; MAX_PACKET];
            let (n, from) = timeout(Duration::from_secs(5), self.socket.recv_from(&mut buf))
                .await
                .expect("relay receive timed out")
                .unwrap();
            self.client = Some(from);
            buf.truncate(n);
            buf
        }

        /// Skip PINGs until a frame of `kind` arrives
        async fn recv_kind(&mut self, kind: u8) -> Vec<u8> {
            loop {
                let frame = self.recv().await;
                if frame[0] == kind {
                    return frame;
                }
            }
        }

        async fn send(&self, frame: RelayFrame) {
            self.socket
                .send_to(&frame.encode(), self.client.unwrap())
                .await
                .unwrap();
        }
    }

    fn tunnel_config(relay: SocketAddr) -> TunnelConfig {
        TunnelConfig {
            relay: relay.to_string(),
            device_id: DEVICE.to_string(),
            reconnect_base_ms: 50,
            reconnect_max_ms: 200,
            auth_timeout_secs: 2,
            ..TunnelConfig::default()
        }
    }

    fn setup(config: TunnelConfig) -> (TunnelClient, mpsc::UnboundedReceiver<HostPort>) {
        let selector = NetworkSelector::new(
            Arc::new(StaticMonitor::default()),
            DnsResolver::new(Vec::new(), Duration::from_secs(2)),
        );
        selector.acquire().unwrap();
        let (platform, ports) = ChannelPlatform::new(16);
        let ctx = GatewayContext::new(Arc::new(selector), Arc::new(platform));
        let client = TunnelClient::new(config, ForwarderConfig::default(), ctx).unwrap();
        (client, ports)
    }

    fn spawn_run(client: &Arc<TunnelClient>) -> tokio::task::JoinHandle<()> {
        let client = client.clone();
        tokio::spawn(async move { client.run().await })
    }

    #[test]
    fn test_invalid_device_id() {
        let config = TunnelConfig {
            device_id: "not-a-uuid".to_string(),
            ..TunnelConfig::default()
        };
        let selector = NetworkSelector::new(
            Arc::new(StaticMonitor::default()),
            DnsResolver::new(Vec::new(), Duration::from_secs(1)),
        );
        let (platform, _ports) = ChannelPlatform::new(1);
        let ctx = GatewayContext::new(Arc::new(selector), Arc::new(platform));
        assert!(matches!(
            TunnelClient::new(config, ForwarderConfig::default(), ctx),
            Err(TunnelError::InvalidDeviceId(_))
        ));
    }

    #[tokio::test]
    async fn test_session_carries_packets() {
        let mut relay = Relay::bind().await;
        let (client, mut ports) = setup(tunnel_config(relay.addr()));
        let client = Arc::new(client);
        let handle = spawn_run(&client);

        let auth = relay.recv().await;
        assert_eq!(auth.len(), 17);
        assert_eq!(auth[0], 0x01);
        assert_eq!(&auth[1..], client.device_id().as_bytes());

        let virtual_ip = Ipv4Addr::new(10, 8, 0, 2);
        relay.send(RelayFrame::AuthOk(virtual_ip)).await;

        let mut port = timeout(Duration::from_secs(5), ports.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(port.config.address, virtual_ip);
        assert_eq!(port.config.prefix_len, 24);
        assert_eq!(port.config.mtu, 1400);
        assert_eq!(port.protected_sockets, 1);
        assert_eq!(
            client.wait_connected(Duration::from_secs(5)).await,
            Some(virtual_ip)
        );

        // relay → device address goes to the interface
        let inbound = packet::build_udp(
            SocketAddrV4::new(Ipv4Addr::new(10, 8, 0, 1), 53),
            SocketAddrV4::new(virtual_ip, 40000),
            b"answer",
        );
        relay.send(RelayFrame::Data(inbound.clone())).await;
        let delivered = timeout(Duration::from_secs(5), port.delivered.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered, inbound.to_vec());

        // interface → relay as DATA
        port.inject.send(b"\x45outbound".to_vec()).await.unwrap();
        let frame = relay.recv_kind(0x02).await;
        assert_eq!(&frame[1..], b"\x45outbound");

        client.disconnect();
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(client.status(), TunnelStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_auth_fail_retries() {
        let mut relay = Relay::bind().await;
        let (client, _ports) = setup(tunnel_config(relay.addr()));
        let client = Arc::new(client);
        let handle = spawn_run(&client);

        relay.recv_kind(0x01).await;
        relay.send(RelayFrame::AuthFail).await;

        // a fresh socket authenticates again after the backoff
        let retry = relay.recv_kind(0x01).await;
        assert_eq!(&retry[1..], client.device_id().as_bytes());
        assert!(!matches!(client.status(), TunnelStatus::Connected { .. }));

        client.disconnect();
        client.disconnect();
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_missing_pong_reconnects() {
        let mut relay = Relay::bind().await;
        let config = TunnelConfig {
            keepalive_secs: 1,
            pong_timeout_secs: 1,
            ..tunnel_config(relay.addr())
        };
        let (client, _ports) = setup(config);
        let client = Arc::new(client);
        let mut events = client.events();
        let handle = spawn_run(&client);

        relay.recv_kind(0x01).await;
        relay.send(RelayFrame::AuthOk(Ipv4Addr::new(10, 8, 0, 2))).await;
        assert_eq!(
            events.recv().await.unwrap(),
            TunnelEvent::Connected(Ipv4Addr::new(10, 8, 0, 2))
        );

        // PINGs go unanswered
        let lost = timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(lost, TunnelEvent::Lost(_)));

        relay.recv_kind(0x01).await;
        relay.send(RelayFrame::AuthOk(Ipv4Addr::new(10, 8, 0, 3))).await;
        assert_eq!(
            timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap(),
            TunnelEvent::Reconnected(Ipv4Addr::new(10, 8, 0, 3))
        );

        client.disconnect();
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_command_frame_dispatched() {
        let mut relay = Relay::bind().await;
        let (client, _ports) = setup(tunnel_config(relay.addr()));
        let (commands_tx, mut commands_rx) = mpsc::channel(4);
        let client = Arc::new(client.with_commands(commands_tx));
        let handle = spawn_run(&client);

        relay.recv_kind(0x01).await;
        relay.send(RelayFrame::AuthOk(Ipv4Addr::new(10, 8, 0, 2))).await;
        client.wait_connected(Duration::from_secs(5)).await.unwrap();

        relay
            .send(RelayFrame::Command(Bytes::from_static(
                br#"{"id":"c9","type":"rotate_ip","payload":{}}"#,
            )))
            .await;
        let command = timeout(Duration::from_secs(5), commands_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(command.id, "c9");
        assert_eq!(command.kind, "rotate_ip");

        client.disconnect();
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
    }
}
