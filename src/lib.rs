//! # Cellgate
//!
//! Turns a device's cellular radio into an outbound IP gateway for remote
//! clients while the device's own control traffic stays on WiFi.
//!
//! ## Features
//!
//! - **Network selection**: holds cellular and WiFi handles side by side and
//!   pins egress sockets and DNS lookups to the cellular link
//! - **UDP tunnel client** carrying a virtual IPv4 link to a relay peer
//! - **Userspace IP forwarder** with manual TCP state emulation and NAT-style
//!   UDP sessions
//! - **SOCKS5 and HTTP CONNECT** proxy servers relaying over cellular
//! - **Relay commands** such as IP rotation, pushed down the tunnel
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │        Local proxies (HTTP 8080 / SOCKS5 1080)       │
//! ├──────────────────────────┬──────────────────────────┤
//! │      Tunnel client       │       IP forwarder        │
//! │  (AUTH/DATA/PING/PONG)   │  (TCP emulation, UDP NAT) │
//! ├──────────────────────────┴──────────────────────────┤
//! │        Gateway context (selector + platform)         │
//! ├─────────────────────────────────────────────────────┤
//! │      Network selector (cellular bind, DNS pinning)   │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod command;
pub mod config;
pub mod context;
pub mod credentials;
pub mod forwarder;
pub mod network;
pub mod protocol;
pub mod proxy;
pub mod tunnel;

pub use config::Config;
pub use context::GatewayContext;
pub use credentials::CredentialStore;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(#[from] network::NetworkError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Forwarder error: {0}")]
    Forward(#[from] forwarder::ForwardError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Command error: {0}")]
    Command(#[from] command::CommandError),

    #[error("Configuration error: {0}")]
    Config(String),
}
