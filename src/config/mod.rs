//! Configuration management

use crate::protocol;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Tunnel configuration; when absent only the local proxies run
    #[serde(default)]
    pub tunnel: Option<TunnelConfig>,
    /// Local proxy configuration
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// IP forwarder configuration
    #[serde(default)]
    pub forwarder: ForwarderConfig,
    /// Network selector configuration
    #[serde(default)]
    pub network: NetworkConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Tunnel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Relay address (`host:port`)
    pub relay: String,
    /// Device identifier (UUID, hyphenated or plain)
    pub device_id: String,
    /// Name of the virtual interface
    pub interface_name: String,
    /// Virtual interface MTU
    pub mtu: u16,
    /// DNS servers pushed to the virtual interface
    pub dns: Vec<Ipv4Addr>,
    /// PING interval in seconds
    pub keepalive_secs: u64,
    /// Seconds without PONG before the session is declared dead
    pub pong_timeout_secs: u64,
    /// Seconds to wait for the AUTH reply
    pub auth_timeout_secs: u64,
    /// First reconnect delay in milliseconds
    pub reconnect_base_ms: u64,
    /// Reconnect delay ceiling in milliseconds
    pub reconnect_max_ms: u64,
    /// Underlay interface the tunnel socket is pinned to (keeps it off the virtual route).
    /// The binary falls back to `network.cellular_interface`.
    pub protect_interface: Option<String>,
    /// Firewall mark applied to protected sockets
    pub fwmark: Option<u32>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            relay: "127.0.0.1:51820".to_string(),
            device_id: String::new(),
            interface_name: "cellgate0".to_string(),
            mtu: protocol::DEFAULT_MTU,
            dns: protocol::VIRTUAL_DNS.to_vec(),
            keepalive_secs: protocol::KEEPALIVE_INTERVAL.as_secs(),
            pong_timeout_secs: protocol::PONG_TIMEOUT.as_secs(),
            auth_timeout_secs: protocol::AUTH_TIMEOUT.as_secs(),
            reconnect_base_ms: protocol::RECONNECT_BASE.as_millis() as u64,
            reconnect_max_ms: protocol::RECONNECT_MAX.as_millis() as u64,
            protect_interface: None,
            fwmark: None,
        }
    }
}

impl TunnelConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

/// Username/password pair accepted by the proxies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialEntry {
    pub username: String,
    pub password: String,
}

/// Local proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listen address shared by both proxies
    pub listen: IpAddr,
    /// HTTP proxy port (0 disables it)
    pub http_port: u16,
    /// SOCKS5 proxy port (0 disables it)
    pub socks5_port: u16,
    /// Negotiate RFC 1929 username/password on SOCKS5 when credentials are loaded
    pub socks5_require_auth: bool,
    /// Relay buffer per direction
    pub buffer_size: usize,
    /// Seconds a relay direction may stay silent before the session is dropped
    pub idle_timeout_secs: u64,
    /// Upstream connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Initial credential set; empty means any client is accepted
    pub credentials: Vec<CredentialEntry>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            http_port: 8080,
            socks5_port: 1080,
            socks5_require_auth: false,
            buffer_size: 32 * 1024,
            idle_timeout_secs: 120,
            connect_timeout_secs: 10,
            credentials: Vec::new(),
        }
    }
}

impl ProxyConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// IP forwarder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// TCP session idle timeout in seconds
    pub tcp_idle_secs: u64,
    /// UDP session idle timeout in seconds
    pub udp_idle_secs: u64,
    /// Sweep interval in seconds
    pub sweep_interval_secs: u64,
    /// Real socket connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Read buffer for real TCP sockets
    pub tcp_buffer_size: usize,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            tcp_idle_secs: 60,
            udp_idle_secs: 30,
            sweep_interval_secs: 10,
            connect_timeout_secs: 10,
            tcp_buffer_size: 64 * 1024,
        }
    }
}

impl ForwarderConfig {
    pub fn tcp_idle(&self) -> Duration {
        Duration::from_secs(self.tcp_idle_secs)
    }

    pub fn udp_idle(&self) -> Duration {
        Duration::from_secs(self.udp_idle_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// How network availability is discovered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorKind {
    /// Configured interfaces are reported available at once
    Static,
    /// Poll `/sys/class/net/<if>/operstate` (Linux)
    Sysfs,
}

/// Network selector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Availability monitor
    pub monitor: MonitorKind,
    /// Cellular interface; `None` uses system routing
    pub cellular_interface: Option<String>,
    /// WiFi interface; `None` uses system routing
    pub wifi_interface: Option<String>,
    /// Sysfs poll interval in seconds
    pub poll_interval_secs: u64,
    /// Resolvers queried over the cellular link
    pub dns_servers: Vec<IpAddr>,
    /// Per-query DNS timeout in seconds
    pub dns_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            monitor: MonitorKind::Static,
            cellular_interface: None,
            wifi_interface: None,
            poll_interval_secs: 2,
            dns_servers: protocol::VIRTUAL_DNS.iter().copied().map(IpAddr::V4).collect(),
            dns_timeout_secs: 5,
        }
    }
}

impl NetworkConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_secs(self.dns_timeout_secs.max(1))
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

/// Generate an example configuration file
pub fn generate_example_config() -> String {
    let config = Config {
        tunnel: Some(TunnelConfig {
            relay: "relay.example.com:51820".to_string(),
            device_id: "00000000-0000-0000-0000-000000000000".to_string(),
            protect_interface: Some("wlan0".to_string()),
            ..TunnelConfig::default()
        }),
        proxy: ProxyConfig {
            credentials: vec![CredentialEntry {
                username: "user".to_string(),
                password: "change-me".to_string(),
            }],
            ..ProxyConfig::default()
        },
        forwarder: ForwarderConfig::default(),
        network: NetworkConfig {
            monitor: MonitorKind::Sysfs,
            cellular_interface: Some("wwan0".to_string()),
            wifi_interface: Some("wlan0".to_string()),
            ..NetworkConfig::default()
        },
        logging: LoggingConfig::default(),
    };

    toml::to_string_pretty(&config).unwrap_or_default()
}
