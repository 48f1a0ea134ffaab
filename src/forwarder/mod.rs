//! Userspace IP forwarder
//!
//! Turns IPv4 packets arriving through the tunnel into real TCP/UDP sockets
//! on the cellular network and synthesizes the response packets. TCP is
//! emulated by hand (sequence/ack bookkeeping only, no retransmission or
//! congestion control); UDP is a NAT-style 1:1 datagram mapping.
//!
//! Sessions are keyed by `(client port, destination ip, destination port)`
//! and live in sharded maps so unrelated flows never contend.

pub mod packet;
mod tcp;
mod udp;

use crate::config::ForwarderConfig;
use crate::context::GatewayContext;
use crate::network::NetworkError;
use crate::protocol;
use bytes::Bytes;
use dashmap::DashMap;
use packet::Transport;
use std::fmt;
use std::net::SocketAddrV4;
use std::sync::Arc;
use tcp::TcpSession;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use udp::UdpSession;

/// Forwarder errors
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Packet too short: {0} bytes")]
    PacketTooShort(usize),

    #[error("Not an IPv4 packet (version {0})")]
    NotIpv4(u8),

    #[error("Malformed packet: {0}")]
    Malformed(String),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}

/// Flow identity: client source port plus real destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub client_port: u16,
    pub remote: SocketAddrV4,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.client_port, self.remote)
    }
}

/// Sessions removed by one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub tcp: usize,
    pub udp: usize,
}

/// The forwarder for one tunnel session
pub struct IpForwarder {
    ctx: GatewayContext,
    config: ForwarderConfig,
    max_payload: usize,
    responses: mpsc::Sender<Bytes>,
    tcp: DashMap<FlowKey, Arc<TcpSession>>,
    udp: DashMap<FlowKey, Arc<UdpSession>>,
    epoch: Instant,
    shutdown: CancellationToken,
}

impl IpForwarder {
    /// `responses` receives every synthesized packet, ready to be framed as DATA
    pub fn new(
        ctx: GatewayContext,
        config: ForwarderConfig,
        mtu: u16,
        responses: mpsc::Sender<Bytes>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            config,
            max_payload: protocol::max_tcp_payload(mtu),
            responses,
            tcp: DashMap::new(),
            udp: DashMap::new(),
            epoch: Instant::now(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Start the periodic idle sweep
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            let period = this.config.sweep_interval();
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = this.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let swept = this.sweep();
                        if swept.tcp + swept.udp > 0 {
                            debug!("Evicted {} TCP / {} UDP idle sessions", swept.tcp, swept.udp);
                        }
                    }
                }
            }
        });
    }

    /// Close every session; later packets are dropped
    pub fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let (tcp, udp) = (self.tcp.len(), self.udp.len());
        self.tcp.clear();
        self.udp.clear();
        info!("Forwarder stopped, closed {} TCP / {} UDP sessions", tcp, udp);
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Handle one packet from the tunnel. Anything but IPv4 TCP/UDP is dropped.
    pub fn forward(self: &Arc<Self>, packet: &[u8]) {
        if !self.is_running() {
            return;
        }
        match packet::parse(packet) {
            Ok(parsed) => match parsed.transport {
                Transport::Tcp(segment) => tcp::handle_segment(self, &parsed.ip, &segment),
                Transport::Udp(datagram) => udp::handle_datagram(self, &parsed.ip, &datagram),
                Transport::Other(protocol) => {
                    trace!("Dropping protocol {} packet to {}", protocol, parsed.ip.dst)
                }
            },
            Err(e) => trace!("Dropping packet: {}", e),
        }
    }

    /// Evict sessions idle for longer than their timeout
    pub fn sweep(&self) -> SweepStats {
        let now = self.now_millis();
        let tcp_idle = self.config.tcp_idle().as_millis() as u64;
        let udp_idle = self.config.udp_idle().as_millis() as u64;
        let mut stats = SweepStats::default();

        self.tcp.retain(|key, session| {
            if session.idle_for(now) > tcp_idle {
                trace!("TCP {} idle, evicting", key);
                session.close();
                stats.tcp += 1;
                false
            } else {
                true
            }
        });
        self.udp.retain(|key, session| {
            if session.idle_for(now) > udp_idle {
                trace!("UDP {} idle, evicting", key);
                session.close();
                stats.udp += 1;
                false
            } else {
                true
            }
        });

        stats
    }

    pub fn tcp_sessions(&self) -> usize {
        self.tcp.len()
    }

    pub fn udp_sessions(&self) -> usize {
        self.udp.len()
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Queue a synthesized packet for the tunnel; false once the tunnel is gone
    async fn emit(&self, packet: Bytes) -> bool {
        self.responses.send(packet).await.is_ok()
    }
}

impl Drop for IpForwarder {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
