//! TCP state emulation
//!
//! Each session owns one real socket. The client side is never a full TCP
//! stack: the forwarder only tracks two counters per flow.
//!
//! - `ack`: client stream position delivered to the real socket (ISN + 1 + bytes, +1 after FIN)
//! - `seq`: next local sequence number for synthesized segments
//!
//! Every synthesized segment is built, counted and queued under one lock, so
//! the client sees local sequence numbers in the order they were assigned.

use super::packet::{self, Ipv4Header, TcpFlags, TcpSegment};
use super::{FlowKey, IpForwarder};
use bytes::Bytes;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Work for the writer half
enum ClientInput {
    Data(Bytes),
    /// Trailing payload followed by FIN
    Fin(Bytes),
    /// Re-acknowledge a retransmitted segment
    Ack,
}

/// Position of both streams
struct Counters {
    seq: u32,
    ack: u32,
}

/// What an inbound segment adds to the client stream
enum Accepted<'a> {
    New { data: &'a [u8], fin: bool },
    Duplicate,
    Ahead,
}

pub(super) struct TcpSession {
    key: FlowKey,
    client: SocketAddrV4,
    counters: Mutex<Counters>,
    /// Next client sequence number accepted for delivery
    rcv_next: AtomicU32,
    last_active: AtomicU64,
    token: CancellationToken,
    /// Cancelled once the task owning the real socket is gone
    finished: CancellationToken,
    input: mpsc::UnboundedSender<ClientInput>,
}

impl TcpSession {
    pub(super) fn close(&self) {
        self.token.cancel();
    }

    pub(super) fn idle_for(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_active.load(Ordering::Acquire))
    }

    fn touch(&self, now: u64) {
        self.last_active.fetch_max(now, Ordering::AcqRel);
    }

    fn remote(&self) -> SocketAddrV4 {
        self.key.remote
    }

    /// Advance `ack` by `acked`, then queue a segment carrying both counters.
    /// SYN and FIN take one sequence number each.
    async fn send(&self, fwd: &IpForwarder, flags: TcpFlags, payload: &[u8], acked: u32) -> bool {
        let mut counters = self.counters.lock().await;
        counters.ack = counters.ack.wrapping_add(acked);
        let segment = packet::build_tcp(
            self.remote(),
            self.client,
            counters.seq,
            counters.ack,
            flags,
            payload,
        );

        let mut advance = payload.len() as u32;
        if flags.contains(TcpFlags::SYN) || flags.contains(TcpFlags::FIN) {
            advance += 1;
        }
        counters.seq = counters.seq.wrapping_add(advance);
        fwd.emit(segment).await
    }

    /// Trim an inbound segment to the bytes not seen yet
    fn accept<'a>(&self, seq: u32, payload: &'a [u8], fin: bool) -> Accepted<'a> {
        let expected = self.rcv_next.load(Ordering::Acquire);
        let behind = expected.wrapping_sub(seq) as i32;
        if behind < 0 {
            return Accepted::Ahead;
        }
        let behind = behind as usize;

        let span = payload.len() + fin as usize;
        if behind >= span && span > 0 {
            return Accepted::Duplicate;
        }
        if behind > payload.len() {
            // pure ACK from the past
            return Accepted::New { data: &[], fin: false };
        }

        let data = &payload[behind..];
        let advance = (data.len() + fin as usize) as u32;
        if advance > 0
            && self
                .rcv_next
                .compare_exchange(
                    expected,
                    expected.wrapping_add(advance),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
        {
            return Accepted::Ahead;
        }
        Accepted::New { data, fin }
    }
}

/// Route one client segment
pub(super) fn handle_segment(fwd: &Arc<IpForwarder>, ip: &Ipv4Header, segment: &TcpSegment<'_>) {
    let key = FlowKey {
        client_port: segment.src_port,
        remote: SocketAddrV4::new(ip.dst, segment.dst_port),
    };

    if segment.flags.contains(TcpFlags::RST) {
        if let Some((_, session)) = fwd.tcp.remove(&key) {
            debug!("TCP {} reset by client", key);
            session.close();
        }
        return;
    }

    if segment.flags.is_syn() {
        open(fwd, key, SocketAddrV4::new(ip.src, segment.src_port), segment.seq);
        return;
    }

    let Some(session) = fwd.tcp.get(&key).map(|entry| entry.value().clone()) else {
        trace!("TCP {} has no session, dropping segment", key);
        return;
    };
    session.touch(fwd.now_millis());

    let fin = segment.flags.contains(TcpFlags::FIN);
    let input = match session.accept(segment.seq, segment.payload, fin) {
        Accepted::New { data, fin: true } => ClientInput::Fin(Bytes::copy_from_slice(data)),
        Accepted::New { data, fin: false } if !data.is_empty() => {
            ClientInput::Data(Bytes::copy_from_slice(data))
        }
        Accepted::New { .. } => return,
        Accepted::Duplicate => ClientInput::Ack,
        Accepted::Ahead => {
            trace!("TCP {} segment beyond stream position, dropping", key);
            return;
        }
    };
    if let Err(mpsc::error::SendError(input)) = session.input.send(input) {
        // client side already closed; a retransmitted FIN still needs its ACK
        if matches!(input, ClientInput::Ack) && !session.token.is_cancelled() {
            trace!("TCP {} re-acknowledging after close", key);
            let fwd = fwd.clone();
            tokio::spawn(async move {
                session.send(&fwd, TcpFlags::ACK, &[], 0).await;
            });
        } else {
            trace!("TCP {} writer gone, dropping segment", key);
        }
    }
}

/// SYN: replace any session for `key` and connect the real socket
fn open(fwd: &Arc<IpForwarder>, key: FlowKey, client: SocketAddrV4, client_isn: u32) {
    let previous = fwd.tcp.remove(&key).map(|(_, old)| {
        debug!("TCP {} replaced by new SYN", key);
        old.close();
        old
    });

    let (input, input_rx) = mpsc::unbounded_channel();
    let next = client_isn.wrapping_add(1);
    let session = Arc::new(TcpSession {
        key,
        client,
        counters: Mutex::new(Counters {
            seq: rand::random(),
            ack: next,
        }),
        rcv_next: AtomicU32::new(next),
        last_active: AtomicU64::new(fwd.now_millis()),
        token: fwd.shutdown.child_token(),
        finished: CancellationToken::new(),
        input,
    });
    fwd.tcp.insert(key, session.clone());

    tokio::spawn(run(fwd.clone(), session, previous, input_rx));
}

fn remove(fwd: &IpForwarder, session: &Arc<TcpSession>) {
    fwd.tcp
        .remove_if(&session.key, |_, current| Arc::ptr_eq(current, session));
    session.close();
}

async fn run(
    fwd: Arc<IpForwarder>,
    session: Arc<TcpSession>,
    previous: Option<Arc<TcpSession>>,
    input: mpsc::UnboundedReceiver<ClientInput>,
) {
    let _finished = session.finished.clone().drop_guard();

    // the replaced socket must be gone before a new one opens
    if let Some(previous) = previous {
        previous.finished.cancelled().await;
    }

    let key = session.key;
    let connect = fwd
        .ctx
        .connect_tcp(SocketAddr::V4(session.remote()), fwd.config.connect_timeout());
    let result = tokio::select! {
        _ = session.token.cancelled() => return,
        result = connect => result,
    };

    let stream = match result {
        Ok(stream) => stream,
        Err(e) => {
            debug!("TCP {} connect failed: {}", key, e);
            session.send(&fwd, TcpFlags::RST | TcpFlags::ACK, &[], 0).await;
            remove(&fwd, &session);
            return;
        }
    };

    trace!("TCP {} connected", key);
    session.touch(fwd.now_millis());
    if !session.send(&fwd, TcpFlags::SYN | TcpFlags::ACK, &[], 0).await {
        remove(&fwd, &session);
        return;
    }

    let (reader, writer) = stream.into_split();
    tokio::join!(
        read_remote(&fwd, &session, reader),
        write_remote(&fwd, &session, writer, input),
    );

    trace!("TCP {} finished", key);
    remove(&fwd, &session);
}

/// Real socket → client, fragmented to the tunnel MTU
async fn read_remote(fwd: &IpForwarder, session: &TcpSession, mut reader: OwnedReadHalf) {
    let mut buf = vec![0u8; fwd.config.tcp_buffer_size.max(fwd.max_payload)];
    loop {
        let result = tokio::select! {
            _ = session.token.cancelled() => return,
            result = reader.read(&mut buf) => result,
        };

        match result {
            Ok(0) => {
                session.send(fwd, TcpFlags::FIN | TcpFlags::ACK, &[], 0).await;
                trace!("TCP {} remote closed", session.key);
                return;
            }
            Ok(n) => {
                session.touch(fwd.now_millis());
                for chunk in buf[..n].chunks(fwd.max_payload) {
                    if !session.send(fwd, TcpFlags::PSH | TcpFlags::ACK, chunk, 0).await {
                        session.close();
                        return;
                    }
                }
            }
            Err(e) => {
                debug!("TCP {} read error: {}", session.key, e);
                if !session.token.is_cancelled() {
                    session.send(fwd, TcpFlags::RST | TcpFlags::ACK, &[], 0).await;
                }
                session.close();
                return;
            }
        }
    }
}

/// Client → real socket
async fn write_remote(
    fwd: &IpForwarder,
    session: &TcpSession,
    mut writer: OwnedWriteHalf,
    mut input: mpsc::UnboundedReceiver<ClientInput>,
) {
    loop {
        let next = tokio::select! {
            _ = session.token.cancelled() => return,
            next = input.recv() => next,
        };
        let Some(next) = next else { return };

        let (data, fin) = match next {
            ClientInput::Data(data) => (data, false),
            ClientInput::Fin(data) => (data, true),
            ClientInput::Ack => {
                session.send(fwd, TcpFlags::ACK, &[], 0).await;
                continue;
            }
        };

        if !data.is_empty() {
            let written = tokio::select! {
                _ = session.token.cancelled() => return,
                written = writer.write_all(&data) => written,
            };
            if let Err(e) = written {
                debug!("TCP {} write error: {}", session.key, e);
                session.send(fwd, TcpFlags::RST | TcpFlags::ACK, &[], 0).await;
                session.close();
                return;
            }
        }

        let acked = data.len() as u32 + fin as u32;
        session.send(fwd, TcpFlags::ACK, &[], acked).await;
        if fin {
            let _ = writer.shutdown().await;
            trace!("TCP {} client closed", session.key);
            return;
        }
    }
}
