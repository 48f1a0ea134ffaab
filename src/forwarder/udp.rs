//! UDP sessions: one connected real socket per flow

use super::packet::{self, Ipv4Header, UdpDatagram};
use super::{FlowKey, IpForwarder};
use bytes::Bytes;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Datagrams queued per flow before new ones are dropped
const OUTBOUND_QUEUE: usize = 256;

const MAX_DATAGRAM: usize = 65535;

pub(super) struct UdpSession {
    key: FlowKey,
    client: SocketAddrV4,
    last_active: AtomicU64,
    token: CancellationToken,
    outbound: mpsc::Sender<Bytes>,
}

impl UdpSession {
    pub(super) fn close(&self) {
        self.token.cancel();
    }

    pub(super) fn idle_for(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_active.load(Ordering::Acquire))
    }

    fn touch(&self, now: u64) {
        self.last_active.fetch_max(now, Ordering::AcqRel);
    }
}

pub(super) fn handle_datagram(fwd: &Arc<IpForwarder>, ip: &Ipv4Header, datagram: &UdpDatagram<'_>) {
    if datagram.payload.is_empty() {
        return;
    }
    let key = FlowKey {
        client_port: datagram.src_port,
        remote: SocketAddrV4::new(ip.dst, datagram.dst_port),
    };

    let session = fwd
        .udp
        .entry(key)
        .or_insert_with(|| {
            let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
            let session = Arc::new(UdpSession {
                key,
                client: SocketAddrV4::new(ip.src, datagram.src_port),
                last_active: AtomicU64::new(fwd.now_millis()),
                token: fwd.shutdown.child_token(),
                outbound,
            });
            trace!("UDP {} new session", key);
            tokio::spawn(run(fwd.clone(), session.clone(), outbound_rx));
            session
        })
        .clone();

    session.touch(fwd.now_millis());
    if session
        .outbound
        .try_send(Bytes::copy_from_slice(datagram.payload))
        .is_err()
    {
        trace!("UDP {} queue full, dropping datagram", key);
    }
}

async fn run(fwd: Arc<IpForwarder>, session: Arc<UdpSession>, mut outbound: mpsc::Receiver<Bytes>) {
    let key = session.key;
    let connect = fwd.ctx.connect_udp(SocketAddr::V4(key.remote));
    let socket = tokio::select! {
        _ = session.token.cancelled() => return,
        socket = connect => socket,
    };

    match socket {
        Ok(socket) => {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    _ = session.token.cancelled() => break,
                    Some(datagram) = outbound.recv() => {
                        if let Err(e) = socket.send(&datagram).await {
                            debug!("UDP {} send error: {}", key, e);
                        }
                    }
                    received = socket.recv(&mut buf) => match received {
                        Ok(n) => {
                            session.touch(fwd.now_millis());
                            let response = packet::build_udp(key.remote, session.client, &buf[..n]);
                            if !fwd.emit(response).await {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!("UDP {} receive error: {}", key, e);
                            break;
                        }
                    },
                }
            }
        }
        Err(e) => debug!("UDP {} socket failed: {}", key, e),
    }

    fwd.udp
        .remove_if(&key, |_, current| Arc::ptr_eq(current, &session));
    session.close();
}
