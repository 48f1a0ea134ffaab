//! Local proxy servers
//!
//! Provides:
//! - SOCKS5 proxy server (RFC 1928 CONNECT, optional RFC 1929 auth)
//! - HTTP proxy server (CONNECT tunnels and absolute-URL requests)
//!
//! Upstream connections go through the [`GatewayContext`], so they always
//! leave over the cellular network.

mod relay;

#[cfg(feature = "socks5")]
mod socks5;

#[cfg(feature = "http-proxy")]
mod http;

#[cfg(feature = "socks5")]
pub use socks5::Socks5Server;

#[cfg(feature = "http-proxy")]
pub use http::HttpProxyServer;

use crate::config::ProxyConfig;
use crate::context::GatewayContext;
use crate::credentials::CredentialStore;
use crate::network::NetworkError;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::warn;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Address type not supported: {0}")]
    UnsupportedAddressType(u8),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Upstream connection failed: {0}")]
    Upstream(#[from] NetworkError),
}

/// Proxy target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ip(SocketAddr),
    /// Domain name and port, resolved over cellular
    Domain(String, u16),
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::Ip(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Parse `host:port`, `[v6]:port` or a bare host when `default_port` is given
    pub fn parse_authority(authority: &str, default_port: Option<u16>) -> Result<Self, ProxyError> {
        let invalid = || ProxyError::InvalidAddress(authority.to_string());

        if let Ok(addr) = authority.parse::<SocketAddr>() {
            return Ok(Address::Ip(addr));
        }

        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(invalid)?;
            let port = match after.strip_prefix(':') {
                Some(port) => Some(port.parse::<u16>().map_err(|_| invalid())?),
                None if after.is_empty() => None,
                None => return Err(invalid()),
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) if !host.contains(':') => {
                    (host, Some(port.parse::<u16>().map_err(|_| invalid())?))
                }
                _ => (authority, None),
            }
        };

        let port = port.or(default_port).ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        match host.parse::<IpAddr>() {
            Ok(ip) => Ok(Address::Ip(SocketAddr::new(ip, port))),
            Err(_) => Ok(Address::Domain(host.to_string(), port)),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ip(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

/// Cumulative byte counters of one proxy server
///
/// `bytes_in` counts upstream → client, `bytes_out` client → upstream.
/// Reading never resets them.
#[derive(Debug, Default)]
pub struct TrafficStats {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl TrafficStats {
    pub fn add_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl TrafficSnapshot {
    /// Sum of both servers, as reported in heartbeats
    pub fn combined(self, other: TrafficSnapshot) -> TrafficSnapshot {
        TrafficSnapshot {
            bytes_in: self.bytes_in.saturating_add(other.bytes_in),
            bytes_out: self.bytes_out.saturating_add(other.bytes_out),
        }
    }
}

/// State shared by every connection of one server
pub(crate) struct ProxyState {
    pub(crate) ctx: GatewayContext,
    pub(crate) credentials: Arc<CredentialStore>,
    pub(crate) config: ProxyConfig,
    pub(crate) stats: Arc<TrafficStats>,
}

impl ProxyState {
    pub(crate) fn new(
        ctx: GatewayContext,
        credentials: Arc<CredentialStore>,
        config: ProxyConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            credentials,
            config,
            stats: Arc::new(TrafficStats::default()),
        })
    }

    /// Open the upstream connection over cellular
    pub(crate) async fn connect(&self, target: &Address) -> Result<TcpStream, NetworkError> {
        let addr = match target {
            Address::Ip(addr) => *addr,
            Address::Domain(host, port) => SocketAddr::new(self.ctx.resolve(host).await?, *port),
        };
        self.ctx
            .connect_tcp(addr, self.config.connect_timeout())
            .await
    }
}

/// Accept the next client; transient accept errors are logged and retried
pub(crate) async fn accept(listener: &TcpListener, name: &str) -> (TcpStream, SocketAddr) {
    loop {
        match listener.accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                warn!("{} accept error: {}", name, e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn test_parse_authority() {
        assert_eq!(
            Address::parse_authority("example.com:443", None).unwrap(),
            Address::Domain("example.com".to_string(), 443)
        );
        assert_eq!(
            Address::parse_authority("93.184.216.34:80", None).unwrap(),
            Address::Ip(SocketAddr::new(Ipv4Addr::new(93, 184, 216, 34).into(), 80))
        );
        assert_eq!(
            Address::parse_authority("[::1]:8443", None).unwrap(),
            Address::Ip(SocketAddr::new(Ipv6Addr::LOCALHOST.into(), 8443))
        );
        assert_eq!(
            Address::parse_authority("example.com", Some(80)).unwrap(),
            Address::Domain("example.com".to_string(), 80)
        );
        assert_eq!(
            Address::parse_authority("[::1]", Some(80)).unwrap().port(),
            80
        );

        assert!(Address::parse_authority("example.com", None).is_err());
        assert!(Address::parse_authority("example.com:http", None).is_err());
        assert!(Address::parse_authority(":80", None).is_err());
        assert!(Address::parse_authority("[::1", Some(80)).is_err());
    }

    #[test]
    fn test_address_display() {
        assert_eq!(Address::Domain("a.b".to_string(), 1).to_string(), "a.b:1");
        assert_eq!(
            Address::Ip("[::1]:53".parse().unwrap()).to_string(),
            "[::1]:53"
        );
    }

    #[test]
    fn test_traffic_snapshot() {
        let http = TrafficStats::default();
        let socks = TrafficStats::default();
        http.add_in(100);
        http.add_out(7);
        socks.add_in(1);

        let total = http.snapshot().combined(socks.snapshot());
        assert_eq!(total, TrafficSnapshot { bytes_in: 101, bytes_out: 7 });
        // reading does not reset
        assert_eq!(http.snapshot().bytes_in, 100);
    }
}
