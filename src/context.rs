//! Gateway context
//!
//! One value owning the network selector and the platform capability,
//! passed to every component at construction.

use crate::network::{NetworkError, NetworkSelector};
use crate::tunnel::VpnPlatform;
use socket2::SockRef;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Shared handles for every component
#[derive(Clone)]
pub struct GatewayContext {
    network: Arc<NetworkSelector>,
    platform: Arc<dyn VpnPlatform>,
}

impl GatewayContext {
    pub fn new(network: Arc<NetworkSelector>, platform: Arc<dyn VpnPlatform>) -> Self {
        Self { network, platform }
    }

    pub fn network(&self) -> &Arc<NetworkSelector> {
        &self.network
    }

    pub fn platform(&self) -> &Arc<dyn VpnPlatform> {
        &self.platform
    }

    /// Resolve through the cellular network
    pub async fn resolve(&self, host: &str) -> Result<IpAddr, NetworkError> {
        self.network.resolve(host).await
    }

    fn protect(&self, socket: SockRef<'_>) {
        if let Err(e) = self.platform.protect_socket(socket) {
            warn!("Failed to protect socket: {}", e);
        }
    }

    /// TCP connection over cellular, bounded by `connect_timeout`
    pub async fn connect_tcp(
        &self,
        addr: SocketAddr,
        connect_timeout: Duration,
    ) -> Result<TcpStream, NetworkError> {
        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4()?,
            SocketAddr::V6(_) => TcpSocket::new_v6()?,
        };
        self.protect(SockRef::from(&socket));
        self.network.bind(SockRef::from(&socket))?;

        let stream = timeout(connect_timeout, socket.connect(addr))
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {} timed out", addr),
                )
            })??;
        stream.set_nodelay(true)?;
        debug!("Connected to {} over cellular", addr);
        Ok(stream)
    }

    /// Datagram socket over cellular, connected to `remote`
    pub async fn connect_udp(&self, remote: SocketAddr) -> Result<UdpSocket, NetworkError> {
        let local: SocketAddr = match remote {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        self.protect(SockRef::from(&socket));
        self.network.bind(SockRef::from(&socket))?;
        socket.connect(remote).await?;
        Ok(socket)
    }
}

impl std::fmt::Debug for GatewayContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayContext")
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}
