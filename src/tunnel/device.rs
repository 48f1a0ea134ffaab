//! Virtual interface and platform capability
//!
//! The tunnel never touches platform VPN APIs directly. A [`VpnPlatform`]
//! creates the virtual interface and keeps selected sockets off its routes.

use super::TunnelError;
use async_trait::async_trait;
use socket2::SockRef;
use std::io;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

/// Parameters of the virtual interface, taken from AUTH_OK
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub mtu: u16,
    /// (network, prefix) pairs routed through the interface
    pub routes: Vec<(Ipv4Addr, u8)>,
    pub dns: Vec<Ipv4Addr>,
}

impl InterfaceConfig {
    /// `/24` address with a default route
    pub fn new(address: Ipv4Addr, mtu: u16, dns: Vec<Ipv4Addr>) -> Self {
        Self {
            address,
            prefix_len: crate::protocol::VIRTUAL_PREFIX_LEN,
            mtu,
            routes: vec![(Ipv4Addr::UNSPECIFIED, 0)],
            dns,
        }
    }
}

/// Packet endpoint presented to the local network stack
#[async_trait]
pub trait VirtualInterface: Send + Sync {
    /// Next packet sent by local applications
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Deliver a packet to local applications
    async fn send(&self, packet: &[u8]) -> io::Result<()>;
}

/// Platform-specific VPN capability
#[async_trait]
pub trait VpnPlatform: Send + Sync {
    async fn create_virtual_interface(
        &self,
        config: &InterfaceConfig,
    ) -> Result<Arc<dyn VirtualInterface>, TunnelError>;

    /// Keep `socket` reachable once the virtual interface owns the default route
    fn protect_socket(&self, socket: SockRef<'_>) -> io::Result<()>;
}

/// Host side of a [`ChannelInterface`]
#[derive(Debug)]
pub struct HostPort {
    pub config: InterfaceConfig,
    /// Sockets protected before this interface was created
    pub protected_sockets: usize,
    /// Packets the gateway delivers to local applications
    pub delivered: mpsc::Receiver<Vec<u8>>,
    /// Packets from local applications, carried into the tunnel
    pub inject: mpsc::Sender<Vec<u8>>,
}

/// Channel-backed virtual interface, for hosts that own the real TUN descriptor
pub struct ChannelInterface {
    delivered: mpsc::Sender<Vec<u8>>,
    injected: Mutex<mpsc::Receiver<Vec<u8>>>,
}

#[async_trait]
impl VirtualInterface for ChannelInterface {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let packet = self
            .injected
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "host port closed"))?;
        let n = packet.len().min(buf.len());
        buf[..n].copy_from_slice(&packet[..n]);
        Ok(n)
    }

    async fn send(&self, packet: &[u8]) -> io::Result<()> {
        self.delivered
            .send(packet.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "host port closed"))
    }
}

/// Platform whose interfaces are channel pairs handed to the host
pub struct ChannelPlatform {
    ports: mpsc::UnboundedSender<HostPort>,
    protected: AtomicUsize,
    queue_depth: usize,
}

impl ChannelPlatform {
    /// Returns the platform and the stream of host ports, one per created interface
    pub fn new(queue_depth: usize) -> (Self, mpsc::UnboundedReceiver<HostPort>) {
        let (ports, rx) = mpsc::unbounded_channel();
        (
            Self {
                ports,
                protected: AtomicUsize::new(0),
                queue_depth: queue_depth.max(1),
            },
            rx,
        )
    }

    pub fn protected_sockets(&self) -> usize {
        self.protected.load(Ordering::Acquire)
    }
}

#[async_trait]
impl VpnPlatform for ChannelPlatform {
    async fn create_virtual_interface(
        &self,
        config: &InterfaceConfig,
    ) -> Result<Arc<dyn VirtualInterface>, TunnelError> {
        let (delivered_tx, delivered_rx) = mpsc::channel(self.queue_depth);
        let (inject_tx, inject_rx) = mpsc::channel(self.queue_depth);

        self.ports
            .send(HostPort {
                config: config.clone(),
                protected_sockets: self.protected_sockets(),
                delivered: delivered_rx,
                inject: inject_tx,
            })
            .map_err(|_| TunnelError::Interface("host stopped accepting interfaces".to_string()))?;

        debug!("Channel interface created for {}", config.address);
        Ok(Arc::new(ChannelInterface {
            delivered: delivered_tx,
            injected: Mutex::new(inject_rx),
        }))
    }

    fn protect_socket(&self, _socket: SockRef<'_>) -> io::Result<()> {
        self.protected.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

#[cfg(target_os = "linux")]
pub use linux::LinuxTunPlatform;

#[cfg(target_os = "linux")]
mod linux {
    use super::*;
    use tokio::process::Command;
    use tracing::warn;

    /// TUN device via `tun-rs`; routes and DNS through `ip` / `resolvectl`.
    ///
    /// A default route is installed as the two `/1` halves, so the host's own
    /// default route is left in place.
    pub struct LinuxTunPlatform {
        name: String,
        protect_interface: Option<String>,
        fwmark: Option<u32>,
    }

    impl LinuxTunPlatform {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                protect_interface: None,
                fwmark: None,
            }
        }

        /// Pin protected sockets to this underlay interface
        pub fn with_protect_interface(mut self, interface: Option<String>) -> Self {
            self.protect_interface = interface;
            self
        }

        /// Mark protected sockets for policy routing
        pub fn with_fwmark(mut self, mark: Option<u32>) -> Self {
            self.fwmark = mark;
            self
        }

        async fn run(&self, program: &str, args: &[String]) -> Result<(), TunnelError> {
            let output = Command::new(program)
                .args(args)
                .output()
                .await
                .map_err(|e| TunnelError::Interface(format!("{} failed to start: {}", program, e)))?;
            if output.status.success() {
                Ok(())
            } else {
                Err(TunnelError::Interface(format!(
                    "{} {} failed: {}",
                    program,
                    args.join(" "),
                    String::from_utf8_lossy(&output.stderr).trim()
                )))
            }
        }
    }

    /// `ip route` targets for `routes`, with a default route split in two
    pub(super) fn route_targets(routes: &[(Ipv4Addr, u8)]) -> Vec<String> {
        routes
            .iter()
            .flat_map(|(network, prefix)| match prefix {
                0 => vec!["0.0.0.0/1".to_string(), "128.0.0.0/1".to_string()],
                _ => vec![format!("{}/{}", network, prefix)],
            })
            .collect()
    }

    struct TunInterface {
        device: tun_rs::AsyncDevice,
        name: String,
        routes: Vec<String>,
    }

    impl Drop for TunInterface {
        fn drop(&mut self) {
            for target in &self.routes {
                let removed = std::process::Command::new("ip")
                    .args(["route", "del", target.as_str(), "dev", self.name.as_str()])
                    .output();
                if let Err(e) = removed {
                    debug!("Route {} via {} not removed: {}", target, self.name, e);
                }
            }
        }
    }

    #[async_trait]
    impl VirtualInterface for TunInterface {
        async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            self.device.recv(buf).await
        }

        async fn send(&self, packet: &[u8]) -> io::Result<()> {
            self.device.send(packet).await.map(|_| ())
        }
    }

    #[async_trait]
    impl VpnPlatform for LinuxTunPlatform {
        async fn create_virtual_interface(
            &self,
            config: &InterfaceConfig,
        ) -> Result<Arc<dyn VirtualInterface>, TunnelError> {
            let device = tun_rs::DeviceBuilder::new()
                .name(&self.name)
                .ipv4(config.address, config.prefix_len, None::<Ipv4Addr>)
                .mtu(config.mtu)
                .build_async()
                .map_err(|e| TunnelError::Interface(format!("Failed to create TUN: {}", e)))?;

            info!(
                "TUN device {} created with address {}/{}",
                self.name, config.address, config.prefix_len
            );

            let routes = route_targets(&config.routes);
            for target in &routes {
                self.run(
                    "ip",
                    &["route".into(), "replace".into(), target.clone(), "dev".into(), self.name.clone()],
                )
                .await?;
            }

            if !config.dns.is_empty() {
                let mut args = vec!["dns".to_string(), self.name.clone()];
                args.extend(config.dns.iter().map(|ip| ip.to_string()));
                // not every host runs systemd-resolved
                if let Err(e) = self.run("resolvectl", &args).await {
                    warn!("DNS servers not applied to {}: {}", self.name, e);
                }
            }

            Ok(Arc::new(TunInterface {
                device,
                name: self.name.clone(),
                routes,
            }))
        }

        fn protect_socket(&self, socket: SockRef<'_>) -> io::Result<()> {
            if self.protect_interface.is_none() && self.fwmark.is_none() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "no protect interface or fwmark configured, socket would route into the TUN",
                ));
            }
            if let Some(interface) = &self.protect_interface {
                socket.bind_device(Some(interface.as_bytes()))?;
            }
            if let Some(mark) = self.fwmark {
                socket.set_mark(mark)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_interface_moves_packets() {
        let (platform, mut ports) = ChannelPlatform::new(8);
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        platform.protect_socket(SockRef::from(&socket)).unwrap();

        let config = InterfaceConfig::new(Ipv4Addr::new(10, 8, 0, 2), 1400, vec![]);
        let iface = platform.create_virtual_interface(&config).await.unwrap();
        let mut port = ports.recv().await.unwrap();
        assert_eq!(port.config.prefix_len, 24);
        assert_eq!(port.config.routes, vec![(Ipv4Addr::UNSPECIFIED, 0)]);
        assert_eq!(port.protected_sockets, 1);

        iface.send(&[1, 2, 3]).await.unwrap();
        assert_eq!(port.delivered.recv().await.unwrap(), vec![1, 2, 3]);

        port.inject.send(vec![9, 9]).await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(iface.recv(&mut buf).await.unwrap(), 2);

        drop(port);
        assert!(iface.recv(&mut buf).await.is_err());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_default_route_split() {
        let routes = linux::route_targets(&[
            (Ipv4Addr::UNSPECIFIED, 0),
            (Ipv4Addr::new(10, 8, 0, 0), 24),
        ]);
        assert_eq!(routes, vec!["0.0.0.0/1", "128.0.0.0/1", "10.8.0.0/24"]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_unconfigured_protection_fails() {
        let platform = LinuxTunPlatform::new("cg-test0");
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let err = platform.protect_socket(SockRef::from(&socket)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
