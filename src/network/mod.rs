//! Network selection
//!
//! Holds one live handle per transport (cellular, WiFi) and pins egress
//! sockets and DNS lookups to the cellular link. Handles come and go through
//! [`NetworkCallback`]s driven by a platform [`NetworkMonitor`]; readers only
//! ever see a cloned snapshot, so a handle vanishing between check and use
//! shows up as an ordinary retryable error.

mod dns;
mod monitor;

pub use dns::DnsResolver;
pub use monitor::StaticMonitor;
#[cfg(target_os = "linux")]
pub use monitor::SysfsMonitor;

use socket2::SockRef;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Network errors
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cellular network unavailable")]
    CellularUnavailable,

    #[error("Failed to bind socket to {interface}: {source}")]
    Bind {
        interface: String,
        source: std::io::Error,
    },

    #[error("DNS resolution failed for {host}: {reason}")]
    DnsResolution { host: String, reason: String },

    #[error("Monitor error: {0}")]
    Monitor(String),
}

impl NetworkError {
    /// Transient failures the caller may retry
    pub fn is_retryable(&self) -> bool {
        !matches!(self, NetworkError::Monitor(_))
    }

    pub(crate) fn dns(host: &str, reason: impl fmt::Display) -> Self {
        NetworkError::DnsResolution {
            host: host.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Transport a handle belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Cellular,
    Wifi,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Cellular => write!(f, "cellular"),
            TransportKind::Wifi => write!(f, "wifi"),
        }
    }
}

/// A live network as reported by the monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkHandle {
    id: u64,
    kind: TransportKind,
    /// `None` means system routing, no device binding
    interface: Option<String>,
}

impl NetworkHandle {
    pub fn new(id: u64, kind: TransportKind, interface: Option<String>) -> Self {
        Self {
            id,
            kind,
            interface,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    /// Route `socket`'s egress through this network
    pub fn bind_socket(&self, socket: SockRef<'_>) -> Result<(), NetworkError> {
        let Some(interface) = self.interface.as_deref() else {
            return Ok(());
        };
        bind_to_device(socket, interface).map_err(|source| NetworkError::Bind {
            interface: interface.to_string(),
            source,
        })
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_to_device(socket: SockRef<'_>, interface: &str) -> std::io::Result<()> {
    socket.bind_device(Some(interface.as_bytes()))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_to_device(_socket: SockRef<'_>, interface: &str) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        format!("binding to {} is not supported on this platform", interface),
    ))
}

/// Per-transport connectivity state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkState {
    Disconnected,
    Connected(NetworkHandle),
}

impl NetworkState {
    pub fn handle(&self) -> Option<&NetworkHandle> {
        match self {
            NetworkState::Connected(handle) => Some(handle),
            NetworkState::Disconnected => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, NetworkState::Connected(_))
    }
}

struct TransportSlot {
    kind: TransportKind,
    state: watch::Sender<NetworkState>,
    /// Bumped on every new request; callbacks from older requests are ignored
    generation: AtomicU64,
}

impl TransportSlot {
    fn new(kind: TransportKind) -> Self {
        let (state, _) = watch::channel(NetworkState::Disconnected);
        Self {
            kind,
            state,
            generation: AtomicU64::new(0),
        }
    }

    fn current(&self) -> Option<NetworkHandle> {
        self.state.borrow().handle().cloned()
    }

    fn next_callback(self: &Arc<Self>) -> NetworkCallback {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        NetworkCallback {
            slot: self.clone(),
            generation,
        }
    }

    fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.state.send_replace(NetworkState::Disconnected);
    }
}

/// Availability sink handed to a [`NetworkMonitor`] for one request
#[derive(Clone)]
pub struct NetworkCallback {
    slot: Arc<TransportSlot>,
    generation: u64,
}

impl NetworkCallback {
    pub fn kind(&self) -> TransportKind {
        self.slot.kind
    }

    /// False once the request this callback belongs to was released
    pub fn is_current(&self) -> bool {
        self.slot.generation.load(Ordering::Acquire) == self.generation
    }

    pub fn on_available(&self, handle: NetworkHandle) {
        if !self.accepts(&handle) {
            return;
        }
        info!(
            "{} network available (id {}, interface {})",
            self.slot.kind,
            handle.id,
            handle.interface.as_deref().unwrap_or("default")
        );
        self.slot.state.send_replace(NetworkState::Connected(handle));
    }

    /// Re-emits `Connected` with the refreshed handle
    pub fn on_capabilities_changed(&self, handle: NetworkHandle) {
        if !self.accepts(&handle) {
            return;
        }
        debug!("{} network capabilities changed (id {})", self.slot.kind, handle.id);
        self.slot.state.send_replace(NetworkState::Connected(handle));
    }

    pub fn on_lost(&self, id: u64) {
        if !self.is_current() {
            return;
        }
        let lost = self
            .slot
            .state
            .send_if_modified(|state| match state {
                NetworkState::Connected(handle) if handle.id == id => {
                    *state = NetworkState::Disconnected;
                    true
                }
                _ => false,
            });
        if lost {
            warn!("{} network lost (id {})", self.slot.kind, id);
        }
    }

    fn accepts(&self, handle: &NetworkHandle) -> bool {
        self.is_current() && handle.kind == self.slot.kind
    }
}

impl fmt::Debug for NetworkCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkCallback")
            .field("kind", &self.slot.kind)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Platform source of network availability
pub trait NetworkMonitor: Send + Sync {
    /// Start reporting availability for `callback.kind()`
    fn request(&self, callback: NetworkCallback) -> Result<(), NetworkError>;

    /// Stop reporting for `kind`
    fn release(&self, kind: TransportKind);
}

/// Owns the cellular and WiFi handles
pub struct NetworkSelector {
    monitor: Arc<dyn NetworkMonitor>,
    cellular: Arc<TransportSlot>,
    wifi: Arc<TransportSlot>,
    resolver: DnsResolver,
}

impl NetworkSelector {
    pub fn new(monitor: Arc<dyn NetworkMonitor>, resolver: DnsResolver) -> Self {
        Self {
            monitor,
            cellular: Arc::new(TransportSlot::new(TransportKind::Cellular)),
            wifi: Arc::new(TransportSlot::new(TransportKind::Wifi)),
            resolver,
        }
    }

    fn slot(&self, kind: TransportKind) -> &Arc<TransportSlot> {
        match kind {
            TransportKind::Cellular => &self.cellular,
            TransportKind::Wifi => &self.wifi,
        }
    }

    /// Request both networks at once
    pub fn acquire(&self) -> Result<(), NetworkError> {
        info!("Requesting cellular and wifi networks");
        self.monitor.request(self.cellular.next_callback())?;
        self.monitor.request(self.wifi.next_callback())?;
        Ok(())
    }

    /// Drop both requests and reset to disconnected
    pub fn release(&self) {
        for kind in [TransportKind::Cellular, TransportKind::Wifi] {
            self.monitor.release(kind);
            self.slot(kind).invalidate();
        }
        info!("Network requests released");
    }

    /// Drop and re-request the cellular network (IP rotation)
    pub fn reconnect_cellular(&self) -> Result<(), NetworkError> {
        info!("Reconnecting cellular network");
        self.monitor.release(TransportKind::Cellular);
        self.cellular.invalidate();
        self.monitor.request(self.cellular.next_callback())
    }

    pub fn cellular(&self) -> Option<NetworkHandle> {
        self.cellular.current()
    }

    pub fn wifi(&self) -> Option<NetworkHandle> {
        self.wifi.current()
    }

    pub fn state(&self, kind: TransportKind) -> NetworkState {
        self.slot(kind).state.borrow().clone()
    }

    pub fn subscribe(&self, kind: TransportKind) -> watch::Receiver<NetworkState> {
        self.slot(kind).state.subscribe()
    }

    /// Attach `socket` to the cellular network
    pub fn bind(&self, socket: SockRef<'_>) -> Result<NetworkHandle, NetworkError> {
        let handle = self.cellular().ok_or(NetworkError::CellularUnavailable)?;
        handle.bind_socket(socket)?;
        Ok(handle)
    }

    /// Resolve `host` through the cellular network, preferring IPv4
    pub async fn resolve(&self, host: &str) -> Result<IpAddr, NetworkError> {
        let addrs = self.resolve_all(host).await?;
        addrs
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| NetworkError::dns(host, "no addresses"))
    }

    /// All addresses for `host` through the cellular network
    pub async fn resolve_all(&self, host: &str) -> Result<Vec<IpAddr>, NetworkError> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        let handle = self
            .cellular()
            .ok_or_else(|| NetworkError::dns(host, NetworkError::CellularUnavailable))?;
        let addrs = self.resolver.resolve(&handle, host).await?;
        if addrs.is_empty() {
            return Err(NetworkError::dns(host, "no addresses"));
        }
        Ok(addrs)
    }
}

impl fmt::Debug for NetworkSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkSelector")
            .field("cellular", &self.cellular())
            .field("wifi", &self.wifi())
            .finish()
    }
}
