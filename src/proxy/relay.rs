//! Bidirectional byte relay between a proxy client and its upstream
//!
//! Each direction runs its own copy loop. When one side reaches EOF (or
//! fails), the write half of the other socket is shut down so the peer sees
//! a clean end of stream; the session ends once both loops are done.

use super::TrafficStats;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

/// Last moment either direction moved data
struct Activity {
    epoch: Instant,
    last: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last.load(Ordering::Relaxed)))
    }
}

#[derive(Clone, Copy)]
enum Direction {
    /// client → upstream
    Out,
    /// upstream → client
    In,
}

/// Relay until both directions finish; returns `(bytes_out, bytes_in)`
pub(crate) async fn relay(
    client: TcpStream,
    upstream: TcpStream,
    stats: &TrafficStats,
    buffer_size: usize,
    idle_timeout: Duration,
) -> (u64, u64) {
    let activity = Activity::new();
    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    tokio::join!(
        copy_half(client_read, upstream_write, Direction::Out, stats, &activity, buffer_size, idle_timeout),
        copy_half(upstream_read, client_write, Direction::In, stats, &activity, buffer_size, idle_timeout),
    )
}

async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    direction: Direction,
    stats: &TrafficStats,
    activity: &Activity,
    buffer_size: usize,
    idle_timeout: Duration,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;

    loop {
        let n = match timeout(idle_timeout, reader.read(&mut buf)).await {
            // the other direction may still be busy
            Err(_) if activity.idle_for() < idle_timeout => continue,
            Err(_) => {
                debug!("Relay idle for {:?}, closing", idle_timeout);
                break;
            }
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                trace!("Relay read error: {}", e);
                break;
            }
        };

        if let Err(e) = writer.write_all(&buf[..n]).await {
            trace!("Relay write error: {}", e);
            break;
        }
        activity.touch();
        total += n as u64;
        match direction {
            Direction::Out => stats.add_out(n as u64),
            Direction::In => stats.add_in(n as u64),
        }
    }

    let _ = writer.shutdown().await;
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_relay_half_close() {
        // client_app <-> client | relay | upstream <-> server_app
        let (mut client_app, client) = pair().await;
        let (upstream, mut server_app) = pair().await;
        let stats = std::sync::Arc::new(TrafficStats::default());

        let relay_stats = stats.clone();
        let task = tokio::spawn(async move {
            relay(client, upstream, &relay_stats, 1024, Duration::from_secs(5)).await
        });

        client_app.write_all(b"request").await.unwrap();
        client_app.shutdown().await.unwrap();

        // server sees the request, then EOF, and can still answer
        let mut request = Vec::new();
        server_app.read_to_end(&mut request).await.unwrap();
        assert_eq!(request, b"request");
        server_app.write_all(b"response body").await.unwrap();
        server_app.shutdown().await.unwrap();

        let mut response = Vec::new();
        client_app.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, b"response body");

        assert_eq!(task.await.unwrap(), (7, 13));
        let snapshot = stats.snapshot();
        assert_eq!((snapshot.bytes_out, snapshot.bytes_in), (7, 13));
    }

    #[tokio::test]
    async fn test_relay_idle_timeout() {
        let (_client_app, client) = pair().await;
        let (upstream, mut server_app) = pair().await;
        let stats = TrafficStats::default();

        let relayed = relay(client, upstream, &stats, 1024, Duration::from_millis(100)).await;
        assert_eq!(relayed, (0, 0));

        // upstream was half-closed by the relay
        let mut rest = Vec::new();
        server_app.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
