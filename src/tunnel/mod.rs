//! Tunnel layer - UDP-framed virtual IP link to the relay
//!
//! Provides:
//! - Frame encoding/decoding for both directions
//! - Virtual interface / platform capability
//! - Reconnect backoff
//! - The session supervisor ([`TunnelClient`])

mod backoff;
mod client;
mod device;
mod frame;

pub use backoff::Backoff;
pub use client::{TunnelClient, TunnelEvent, TunnelStatus};
pub use device::{
    ChannelInterface, ChannelPlatform, HostPort, InterfaceConfig, VirtualInterface, VpnPlatform,
};
#[cfg(target_os = "linux")]
pub use device::LinuxTunPlatform;
pub use frame::{ClientFrame, DeviceId, Phase, RelayFrame};

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Invalid device id: {0}")]
    InvalidDeviceId(String),

    #[error("Invalid relay address: {0}")]
    InvalidRelay(String),

    #[error("Authentication rejected by relay")]
    AuthRejected,

    #[error("Authentication timed out")]
    AuthTimeout,

    #[error("Virtual interface error: {0}")]
    Interface(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
