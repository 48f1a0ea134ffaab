//! Frame encoding/decoding for the tunnel protocol
//!
//! Frame format (one frame per UDP datagram):
//! ```text
//! +--------+----------------------------+
//! |  Type  |  Payload (type dependent)  |
//! +--------+----------------------------+
//! ```
//!
//! Relay replies reuse byte values of client frames, so decoding relay
//! frames needs the connection [`Phase`].

use super::TunnelError;
use crate::protocol::{
    DEVICE_ID_LEN, TYPE_AUTH, TYPE_AUTH_FAIL, TYPE_COMMAND, TYPE_DATA, TYPE_PING, TYPE_PONG,
};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use uuid::Uuid;

/// 16-byte device identifier sent in AUTH
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId([u8; DEVICE_ID_LEN]);

impl DeviceId {
    pub fn from_bytes(bytes: [u8; DEVICE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; DEVICE_ID_LEN] {
        &self.0
    }
}

impl FromStr for DeviceId {
    type Err = TunnelError;

    /// Accepts hyphenated or plain 32-digit hex
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(|uuid| Self(*uuid.as_bytes()))
            .map_err(|e| TunnelError::InvalidDeviceId(format!("{}: {}", s, e)))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0).hyphenated())
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self)
    }
}

/// Connection phase used to disambiguate relay frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// AUTH sent, waiting for AUTH_OK / AUTH_FAIL
    Authenticating,
    /// AUTH_OK received
    Established,
}

/// Client → relay frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Auth(DeviceId),
    Data(Bytes),
    Ping,
}

impl ClientFrame {
    /// Encode frame to bytes
    pub fn encode(&self) -> BytesMut {
        match self {
            ClientFrame::Auth(id) => {
                let mut buf = BytesMut::with_capacity(1 + DEVICE_ID_LEN);
                buf.put_u8(TYPE_AUTH);
                buf.put_slice(id.as_bytes());
                buf
            }
            ClientFrame::Data(packet) => encode_data(packet),
            ClientFrame::Ping => BytesMut::from(&[TYPE_PING][..]),
        }
    }

    /// Decode a client frame the way the relay does
    #[cfg(test)]
    pub(crate) fn decode(buf: &[u8]) -> Result<Self, TunnelError> {
        let (&kind, payload) = buf
            .split_first()
            .ok_or_else(|| TunnelError::InvalidFrame("empty datagram".to_string()))?;

        match kind {
            TYPE_AUTH => {
                let id: [u8; DEVICE_ID_LEN] = payload
                    .get(..DEVICE_ID_LEN)
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(|| {
                        TunnelError::InvalidFrame(format!("short AUTH: {} bytes", buf.len()))
                    })?;
                Ok(ClientFrame::Auth(DeviceId(id)))
            }
            TYPE_DATA if !payload.is_empty() => {
                Ok(ClientFrame::Data(Bytes::copy_from_slice(payload)))
            }
            TYPE_PING => Ok(ClientFrame::Ping),
            _ => Err(TunnelError::InvalidFrame(format!(
                "Unknown client frame type: {:#04x} ({} bytes)",
                kind,
                buf.len()
            ))),
        }
    }
}

/// Relay → client frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    AuthOk(Ipv4Addr),
    AuthFail,
    Data(Bytes),
    Pong,
    /// JSON command pushed by the relay
    Command(Bytes),
}

impl RelayFrame {
    /// Decode a relay frame according to `phase`
    pub fn decode(phase: Phase, buf: &[u8]) -> Result<Self, TunnelError> {
        let (&kind, payload) = buf
            .split_first()
            .ok_or_else(|| TunnelError::InvalidFrame("empty datagram".to_string()))?;

        match phase {
            Phase::Authenticating => match kind {
                TYPE_AUTH => {
                    let octets: [u8; 4] = payload
                        .get(..4)
                        .and_then(|b| b.try_into().ok())
                        .ok_or_else(|| {
                            TunnelError::InvalidFrame(format!("short AUTH_OK: {} bytes", buf.len()))
                        })?;
                    Ok(RelayFrame::AuthOk(Ipv4Addr::from(octets)))
                }
                TYPE_AUTH_FAIL => Ok(RelayFrame::AuthFail),
                _ => Err(TunnelError::InvalidFrame(format!(
                    "Unexpected reply during authentication: {:#04x}",
                    kind
                ))),
            },
            // PONG is shorter than any DATA frame, test it first
            Phase::Established => match kind {
                TYPE_PONG => Ok(RelayFrame::Pong),
                TYPE_DATA if !payload.is_empty() => {
                    Ok(RelayFrame::Data(Bytes::copy_from_slice(payload)))
                }
                TYPE_COMMAND if !payload.is_empty() => {
                    Ok(RelayFrame::Command(Bytes::copy_from_slice(payload)))
                }
                _ => Err(TunnelError::InvalidFrame(format!(
                    "Unknown frame type: {:#04x} ({} bytes)",
                    kind,
                    buf.len()
                ))),
            },
        }
    }

    /// Encode frame to bytes (relay side)
    pub fn encode(&self) -> BytesMut {
        match self {
            RelayFrame::AuthOk(ip) => {
                let mut buf = BytesMut::with_capacity(5);
                buf.put_u8(TYPE_AUTH);
                buf.put_slice(&ip.octets());
                buf
            }
            RelayFrame::AuthFail => BytesMut::from(&[TYPE_AUTH_FAIL][..]),
            RelayFrame::Data(packet) => encode_data(packet),
            RelayFrame::Pong => BytesMut::from(&[TYPE_PONG][..]),
            RelayFrame::Command(json) => {
                let mut buf = BytesMut::with_capacity(1 + json.len());
                buf.put_u8(TYPE_COMMAND);
                buf.put_slice(json);
                buf
            }
        }
    }
}

/// `[0x02][packet]`
pub fn encode_data(packet: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(1 + packet.len());
    buf.put_u8(TYPE_DATA);
    buf.put_slice(packet);
    buf
}
