//! Frame decoding for captured TCP connection attempts.
//!
//! The capture filter only hands us TCP segments with SYN set and ACK
//! clear, so every successfully decoded frame is exactly one new
//! connection attempt. Frames arrive truncated to [`SNAP_LEN`] bytes,
//! which covers the Ethernet, IPv4 and TCP headers but not the payload,
//! so decoding works on header slices layer by layer instead of slicing
//! the whole packet.

use std::net::Ipv4Addr;

use etherparse::{EtherType, Ethernet2HeaderSlice, IpNumber, Ipv4HeaderSlice, TcpHeaderSlice};
use thiserror::Error;

/// Snapshot length for the capture handle. Covers Ethernet + IPv4 + TCP
/// headers; payload is never needed.
pub const SNAP_LEN: i32 = 80;

/// BPF filter selecting new connection attempts in both directions:
/// SYN set, ACK clear (excludes SYN-ACK replies, so completed handshakes
/// are not double-counted).
pub const BPF_FILTER: &str =
    "tcp[tcpflags] & (tcp-syn) != 0 and tcp[tcpflags] & (tcp-ack) = 0";

/// One observed connection attempt, extracted from a captured frame.
///
/// Only the destination port is tracked: the scan heuristic counts
/// distinct ports probed on the destination host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame too short for an Ethernet header: {0}")]
    Ethernet(#[from] etherparse::err::LenError),
    #[error("frame has no IPv4 layer")]
    MissingIpv4,
    #[error("malformed IPv4 header: {0}")]
    Ipv4(#[from] etherparse::err::ipv4::HeaderSliceError),
    #[error("frame has no TCP layer")]
    MissingTcp,
    #[error("malformed TCP header: {0}")]
    Tcp(#[from] etherparse::err::tcp::HeaderSliceError),
}

/// Decode a raw link-layer frame into an [`Observation`].
///
/// Non-TCP/IPv4 frames yield an error; the capture loop logs and drops
/// them without stopping.
pub fn decode(frame: &[u8]) -> Result<Observation, DecodeError> {
    let eth = Ethernet2HeaderSlice::from_slice(frame)?;
    if eth.ether_type() != EtherType::IPV4 {
        return Err(DecodeError::MissingIpv4);
    }

    let ip = Ipv4HeaderSlice::from_slice(&frame[eth.slice().len()..])?;
    if ip.protocol() != IpNumber::TCP {
        return Err(DecodeError::MissingTcp);
    }

    let tcp_offset = eth.slice().len() + ip.slice().len();
    let tcp = TcpHeaderSlice::from_slice(&frame[tcp_offset..])?;

    Ok(Observation {
        src_ip: ip.source_addr(),
        dst_ip: ip.destination_addr(),
        dst_port: tcp.destination_port(),
    })
}
