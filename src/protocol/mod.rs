//! Tunnel wire constants and timing defaults
//!
//! Every datagram exchanged with the relay starts with a single type byte.
//! Two byte values are reused across directions and are told apart only by
//! direction and connection phase:
//!
//! ```text
//! byte  client -> relay      relay -> client
//! 0x01  AUTH + device id     AUTH_OK + IPv4
//! 0x02  DATA + packet        DATA + packet
//! 0x03  PING                 AUTH_FAIL
//! 0x04  -                    PONG
//! 0x05  -                    COMMAND + JSON
//! ```

use std::net::Ipv4Addr;
use std::time::Duration;

/// Client AUTH / relay AUTH_OK
pub const TYPE_AUTH: u8 = 0x01;
/// DATA in either direction
pub const TYPE_DATA: u8 = 0x02;
/// Client PING
pub const TYPE_PING: u8 = 0x03;
/// Relay AUTH_FAIL, shares its value with PING
pub const TYPE_AUTH_FAIL: u8 = 0x03;
/// Relay PONG
pub const TYPE_PONG: u8 = 0x04;
/// Relay COMMAND push
pub const TYPE_COMMAND: u8 = 0x05;

/// Device identifier length on the wire
pub const DEVICE_ID_LEN: usize = 16;

/// Link MTU of the virtual interface
pub const DEFAULT_MTU: u16 = 1400;

/// IPv4 header without options
pub const IPV4_HEADER_LEN: usize = 20;

/// TCP header without options
pub const TCP_HEADER_LEN: usize = 20;

/// UDP header
pub const UDP_HEADER_LEN: usize = 8;

/// Prefix length of the address assigned by the relay
pub const VIRTUAL_PREFIX_LEN: u8 = 24;

/// DNS servers pushed to the virtual interface
pub const VIRTUAL_DNS: [Ipv4Addr; 2] = [Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)];

/// PING interval
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(25);

/// Session is declared dead after this long without a PONG
pub const PONG_TIMEOUT: Duration = Duration::from_secs(45);

/// Wait for AUTH_OK / AUTH_FAIL
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// First reconnect delay
pub const RECONNECT_BASE: Duration = Duration::from_secs(3);

/// Reconnect delay ceiling
pub const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Tunnel socket send/receive buffer size (2 MB)
pub const SOCKET_BUFFER_SIZE: usize = 2 * 1024 * 1024;

/// Largest TCP payload that fits in one tunnel packet for `mtu`
pub fn max_tcp_payload(mtu: u16) -> usize {
    (mtu as usize).saturating_sub(IPV4_HEADER_LEN + TCP_HEADER_LEN).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_budget() {
        assert_eq!(max_tcp_payload(DEFAULT_MTU), 1360);
        assert_eq!(max_tcp_payload(10), 1);
    }

    #[test]
    fn test_overlapping_type_bytes() {
        assert_eq!(TYPE_PING, TYPE_AUTH_FAIL);
        assert_ne!(TYPE_PONG, TYPE_DATA);
    }
}
