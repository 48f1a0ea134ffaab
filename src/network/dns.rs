//! DNS over the cellular link
//!
//! Queries go out on a UDP socket bound to the cellular interface so that
//! lookups never leak over WiFi. A handle without an interface falls back to
//! the system resolver.

use super::{NetworkError, NetworkHandle};
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use socket2::SockRef;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace};

const DNS_PORT: u16 = 53;

/// Resolver pinned to a network handle
#[derive(Debug, Clone)]
pub struct DnsResolver {
    servers: Vec<SocketAddr>,
    timeout: Duration,
}

impl DnsResolver {
    pub fn new(servers: Vec<IpAddr>, timeout: Duration) -> Self {
        Self {
            servers: servers
                .into_iter()
                .map(|ip| SocketAddr::new(ip, DNS_PORT))
                .collect(),
            timeout,
        }
    }

    /// Resolve `host` through `handle`
    pub async fn resolve(
        &self,
        handle: &NetworkHandle,
        host: &str,
    ) -> Result<Vec<IpAddr>, NetworkError> {
        if handle.interface().is_none() {
            return self.resolve_system(host).await;
        }

        let mut last_error = None;
        for server in &self.servers {
            for record_type in [RecordType::A, RecordType::AAAA] {
                match self.query(handle, *server, host, record_type).await {
                    Ok(addrs) if !addrs.is_empty() => return Ok(addrs),
                    Ok(_) => {}
                    Err(e) => {
                        debug!("DNS query to {} for {} failed: {}", server, host, e);
                        last_error = Some(e);
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| NetworkError::dns(host, "no addresses")))
    }

    async fn resolve_system(&self, host: &str) -> Result<Vec<IpAddr>, NetworkError> {
        let addrs = timeout(self.timeout, tokio::net::lookup_host((host, 0)))
            .await
            .map_err(|_| NetworkError::dns(host, "timed out"))?
            .map_err(|e| NetworkError::dns(host, e))?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }

    async fn query(
        &self,
        handle: &NetworkHandle,
        server: SocketAddr,
        host: &str,
        record_type: RecordType,
    ) -> Result<Vec<IpAddr>, NetworkError> {
        let message = build_query(host, record_type)?;
        let data = message.to_bytes().map_err(|e| NetworkError::dns(host, e))?;

        let local: SocketAddr = match server {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        handle.bind_socket(SockRef::from(&socket))?;
        socket.send_to(&data, server).await?;

        let mut buf = vec![0u8; 4096];
        loop {
            let (len, from) = timeout(self.timeout, socket.recv_from(&mut buf))
                .await
                .map_err(|_| NetworkError::dns(host, "timed out"))??;
            if from != server {
                continue;
            }
            let response =
                Message::from_bytes(&buf[..len]).map_err(|e| NetworkError::dns(host, e))?;
            if response.id() != message.id() {
                trace!("Discarding DNS response with stale id {}", response.id());
                continue;
            }
            return Ok(extract_addresses(&response));
        }
    }
}

fn build_query(host: &str, record_type: RecordType) -> Result<Message, NetworkError> {
    let name = Name::from_ascii(host).map_err(|e| NetworkError::dns(host, e))?;

    let mut message = Message::new();
    message.set_id(rand::random());
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(name, record_type));

    Ok(message)
}

fn extract_addresses(message: &Message) -> Vec<IpAddr> {
    message
        .answers()
        .iter()
        .filter_map(|answer| match answer.data() {
            RData::A(a) => Some(IpAddr::V4(a.0)),
            RData::AAAA(aaaa) => Some(IpAddr::V6(aaaa.0)),
            _ => None,
        })
        .collect()
}
