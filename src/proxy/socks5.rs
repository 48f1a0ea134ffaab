//! SOCKS5 proxy implementation (RFC 1928 CONNECT subset)
//!
//! NO-AUTH is selected for every greeting. With `socks5_require_auth` set
//! and credentials loaded, RFC 1929 username/password is negotiated instead.

use super::relay::relay;
use super::{accept, Address, ProxyError, ProxyState, TrafficStats};
use crate::config::ProxyConfig;
use crate::context::GatewayContext;
use crate::credentials::CredentialStore;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// SOCKS5 version
const SOCKS_VERSION: u8 = 0x05;

/// RFC 1929 sub-negotiation version
const AUTH_VERSION: u8 = 0x01;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AuthMethod {
    NoAuth = 0x00,
    UsernamePassword = 0x02,
    NoAcceptable = 0xFF,
}

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            _ => Err(ProxyError::UnsupportedCommand(value)),
        }
    }
}

/// Address types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
    Ipv6 = 0x04,
}

impl TryFrom<u8> for AddressType {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Domain),
            0x04 => Ok(AddressType::Ipv6),
            _ => Err(ProxyError::UnsupportedAddressType(value)),
        }
    }
}

/// Reply codes
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    /// Reply with a zeroed IPv4 bind address; the real one is never disclosed
    fn encode(self) -> [u8; 10] {
        [SOCKS_VERSION, self as u8, 0x00, AddressType::Ipv4 as u8, 0, 0, 0, 0, 0, 0]
    }
}

/// SOCKS5 proxy server
pub struct Socks5Server {
    listener: TcpListener,
    state: Arc<ProxyState>,
}

impl Socks5Server {
    pub async fn bind(
        addr: SocketAddr,
        ctx: GatewayContext,
        credentials: Arc<CredentialStore>,
        config: ProxyConfig,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("SOCKS5 server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            state: ProxyState::new(ctx, credentials, config),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> Arc<TrafficStats> {
        self.state.stats.clone()
    }

    /// Accept connections until `shutdown`
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = accept(&self.listener, "SOCKS5") => accepted,
            };
            debug!("New SOCKS5 connection from {}", peer_addr);

            let state = self.state.clone();
            let token = shutdown.child_token();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    result = handle_connection(stream, state) => {
                        if let Err(e) = result {
                            debug!("SOCKS5 connection from {} failed: {}", peer_addr, e);
                        }
                    }
                }
            });
        }
        info!("SOCKS5 server stopped");
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<ProxyState>) -> Result<(), ProxyError> {
    negotiate(&mut stream, &state).await?;

    let target = match read_request(&mut stream).await {
        Ok(target) => target,
        Err(e) => {
            let reply = match &e {
                ProxyError::UnsupportedCommand(_) => Some(Reply::CommandNotSupported),
                ProxyError::UnsupportedAddressType(_) => Some(Reply::AddressTypeNotSupported),
                ProxyError::InvalidAddress(_) => Some(Reply::GeneralFailure),
                _ => None,
            };
            if let Some(reply) = reply {
                stream.write_all(&reply.encode()).await?;
            }
            return Err(e);
        }
    };

    debug!("SOCKS5 CONNECT to {}", target);
    let upstream = match state.connect(&target).await {
        Ok(upstream) => upstream,
        Err(e) => {
            stream.write_all(&Reply::ConnectionRefused.encode()).await?;
            return Err(e.into());
        }
    };
    stream.write_all(&Reply::Succeeded.encode()).await?;

    let (out, inn) = relay(
        stream,
        upstream,
        &state.stats,
        state.config.buffer_size,
        state.config.idle_timeout(),
    )
    .await;
    debug!("SOCKS5 {} closed ({} bytes out, {} bytes in)", target, out, inn);
    Ok(())
}

/// Greeting, method selection and optional username/password check
async fn negotiate(stream: &mut TcpStream, state: &ProxyState) -> Result<(), ProxyError> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(header[0]));
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;

    let require_auth = state.config.socks5_require_auth && state.credentials.has_credentials();
    let method = if !require_auth {
        AuthMethod::NoAuth
    } else if methods.contains(&(AuthMethod::UsernamePassword as u8)) {
        AuthMethod::UsernamePassword
    } else {
        AuthMethod::NoAcceptable
    };

    stream.write_all(&[SOCKS_VERSION, method as u8]).await?;

    match method {
        AuthMethod::NoAuth => Ok(()),
        AuthMethod::NoAcceptable => Err(ProxyError::AuthenticationFailed),
        AuthMethod::UsernamePassword => {
            let mut version = [0u8; 1];
            stream.read_exact(&mut version).await?;
            if version[0] != AUTH_VERSION {
                return Err(ProxyError::InvalidRequest(format!(
                    "auth version {:#04x}",
                    version[0]
                )));
            }
            let username = read_short_string(stream).await?;
            let password = read_short_string(stream).await?;

            let success = state.credentials.validate(&username, &password);
            stream
                .write_all(&[AUTH_VERSION, if success { 0x00 } else { 0x01 }])
                .await?;
            if success {
                Ok(())
            } else {
                Err(ProxyError::AuthenticationFailed)
            }
        }
    }
}

/// Length-prefixed string (RFC 1929 fields, domain names)
async fn read_short_string(stream: &mut TcpStream) -> Result<String, ProxyError> {
    let mut len = [0u8; 1];
    stream.read_exact(&mut len).await?;
    let mut buf = vec![0u8; len[0] as usize];
    stream.read_exact(&mut buf).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

async fn read_request(stream: &mut TcpStream) -> Result<Address, ProxyError> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(header[0]));
    }

    // header[2] is reserved
    let command = Command::try_from(header[1])?;
    if command != Command::Connect {
        return Err(ProxyError::UnsupportedCommand(command as u8));
    }

    let address = match AddressType::try_from(header[3])? {
        AddressType::Ipv4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            let port = stream.read_u16().await?;
            Address::Ip(SocketAddr::new(Ipv4Addr::from(ip).into(), port))
        }
        AddressType::Domain => {
            let domain = read_short_string(stream).await?;
            let port = stream.read_u16().await?;
            if domain.is_empty() {
                return Err(ProxyError::InvalidAddress("empty domain".to_string()));
            }
            Address::Domain(domain, port)
        }
        AddressType::Ipv6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            let port = stream.read_u16().await?;
            Address::Ip(SocketAddr::new(Ipv6Addr::from(ip).into(), port))
        }
    };

    Ok(address)
}
