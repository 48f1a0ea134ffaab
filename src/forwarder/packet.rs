//! IPv4 / TCP / UDP parsing, synthesis and checksums

use super::ForwardError;
use crate::protocol::{IPV4_HEADER_LEN, TCP_HEADER_LEN, UDP_HEADER_LEN};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::ops::BitOr;
use std::sync::atomic::{AtomicU16, Ordering};

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

const VERSION_IHL: u8 = 0x45;
const FLAG_DONT_FRAGMENT: u16 = 0x4000;
const DEFAULT_TTL: u8 = 64;
const TCP_WINDOW: u16 = 0xFFFF;

static NEXT_IP_ID: AtomicU16 = AtomicU16::new(1);

/// TCP control bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);

    pub fn from_bits(bits: u8) -> Self {
        TcpFlags(bits)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Connection request: SYN without ACK
    pub fn is_syn(self) -> bool {
        self.contains(Self::SYN) && !self.contains(Self::ACK)
    }
}

impl BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

/// Fields of an IPv4 header the forwarder needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
    pub header_len: usize,
    pub total_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSegment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport<'a> {
    Tcp(TcpSegment<'a>),
    Udp(UdpDatagram<'a>),
    Other(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    pub ip: Ipv4Header,
    pub transport: Transport<'a>,
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Destination of an IPv4 packet, `None` for anything else
pub fn ipv4_destination(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < IPV4_HEADER_LEN || packet[0] >> 4 != 4 {
        return None;
    }
    Some(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]))
}

pub fn parse_ipv4(packet: &[u8]) -> Result<Ipv4Header, ForwardError> {
    if packet.is_empty() {
        return Err(ForwardError::PacketTooShort(0));
    }
    let version = packet[0] >> 4;
    if version != 4 {
        return Err(ForwardError::NotIpv4(version));
    }
    if packet.len() < IPV4_HEADER_LEN {
        return Err(ForwardError::PacketTooShort(packet.len()));
    }

    let header_len = ((packet[0] & 0x0F) as usize) * 4;
    if header_len < IPV4_HEADER_LEN || header_len > packet.len() {
        return Err(ForwardError::Malformed(format!("bad IHL {}", header_len)));
    }
    // trailing link padding is not part of the datagram
    let total_len = (read_u16(packet, 2) as usize).min(packet.len());
    if total_len < header_len {
        return Err(ForwardError::Malformed(format!("total length {}", total_len)));
    }

    Ok(Ipv4Header {
        src: Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]),
        dst: Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]),
        protocol: packet[9],
        header_len,
        total_len,
    })
}

pub fn parse_tcp(segment: &[u8]) -> Result<TcpSegment<'_>, ForwardError> {
    if segment.len() < TCP_HEADER_LEN {
        return Err(ForwardError::PacketTooShort(segment.len()));
    }
    let data_offset = ((segment[12] >> 4) as usize) * 4;
    if data_offset < TCP_HEADER_LEN || data_offset > segment.len() {
        return Err(ForwardError::Malformed(format!("bad TCP data offset {}", data_offset)));
    }

    Ok(TcpSegment {
        src_port: read_u16(segment, 0),
        dst_port: read_u16(segment, 2),
        seq: read_u32(segment, 4),
        ack: read_u32(segment, 8),
        flags: TcpFlags::from_bits(segment[13]),
        payload: &segment[data_offset..],
    })
}

pub fn parse_udp(datagram: &[u8]) -> Result<UdpDatagram<'_>, ForwardError> {
    if datagram.len() < UDP_HEADER_LEN {
        return Err(ForwardError::PacketTooShort(datagram.len()));
    }
    let length = (read_u16(datagram, 4) as usize).clamp(UDP_HEADER_LEN, datagram.len());

    Ok(UdpDatagram {
        src_port: read_u16(datagram, 0),
        dst_port: read_u16(datagram, 2),
        payload: &datagram[UDP_HEADER_LEN..length],
    })
}

/// Parse an IPv4 packet and its TCP/UDP header
pub fn parse(packet: &[u8]) -> Result<Packet<'_>, ForwardError> {
    let ip = parse_ipv4(packet)?;
    let body = &packet[ip.header_len..ip.total_len];
    let transport = match ip.protocol {
        PROTO_TCP => Transport::Tcp(parse_tcp(body)?),
        PROTO_UDP => Transport::Udp(parse_udp(body)?),
        other => Transport::Other(other),
    };
    Ok(Packet { ip, transport })
}

fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Internet checksum (ones' complement of the ones'-complement sum)
pub fn checksum(data: &[u8]) -> u16 {
    fold(sum_words(data, 0))
}

/// TCP/UDP checksum including the 12-byte pseudo-header
pub fn transport_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = protocol;
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());

    fold(sum_words(segment, sum_words(&pseudo, 0)))
}

fn put_ipv4_header(buf: &mut BytesMut, src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, total_len: usize) {
    let start = buf.len();
    buf.put_u8(VERSION_IHL);
    buf.put_u8(0); // DSCP/ECN
    buf.put_u16(total_len as u16);
    buf.put_u16(NEXT_IP_ID.fetch_add(1, Ordering::Relaxed));
    buf.put_u16(FLAG_DONT_FRAGMENT);
    buf.put_u8(DEFAULT_TTL);
    buf.put_u8(protocol);
    buf.put_u16(0); // checksum
    buf.put_slice(&src.octets());
    buf.put_slice(&dst.octets());

    let csum = checksum(&buf[start..start + IPV4_HEADER_LEN]);
    buf[start + 10..start + 12].copy_from_slice(&csum.to_be_bytes());
}

/// Synthesize an IPv4/TCP packet from `src` to `dst`
pub fn build_tcp(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    payload: &[u8],
) -> Bytes {
    let tcp_len = TCP_HEADER_LEN + payload.len();
    let mut buf = BytesMut::with_capacity(IPV4_HEADER_LEN + tcp_len);
    put_ipv4_header(&mut buf, *src.ip(), *dst.ip(), PROTO_TCP, IPV4_HEADER_LEN + tcp_len);

    buf.put_u16(src.port());
    buf.put_u16(dst.port());
    buf.put_u32(seq);
    buf.put_u32(ack);
    buf.put_u8(((TCP_HEADER_LEN / 4) as u8) << 4);
    buf.put_u8(flags.bits());
    buf.put_u16(TCP_WINDOW);
    buf.put_u16(0); // checksum
    buf.put_u16(0); // urgent pointer
    buf.put_slice(payload);

    let csum = transport_checksum(*src.ip(), *dst.ip(), PROTO_TCP, &buf[IPV4_HEADER_LEN..]);
    buf[IPV4_HEADER_LEN + 16..IPV4_HEADER_LEN + 18].copy_from_slice(&csum.to_be_bytes());
    buf.freeze()
}

/// Synthesize an IPv4/UDP packet; the UDP checksum is left zero
pub fn build_udp(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Bytes {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let mut buf = BytesMut::with_capacity(IPV4_HEADER_LEN + udp_len);
    put_ipv4_header(&mut buf, *src.ip(), *dst.ip(), PROTO_UDP, IPV4_HEADER_LEN + udp_len);

    buf.put_u16(src.port());
    buf.put_u16(dst.port());
    buf.put_u16(udp_len as u16);
    buf.put_u16(0);
    buf.put_slice(payload);
    buf.freeze()
}
