//! Network layer protocols implementation
//!
//! This module contains implementations for network layer protocols:
//! - IPv4: header codec, routing and protocol demultiplexing
//! - ICMP: echo request/reply

use byteorder::{BigEndian, ByteOrder};

pub mod icmp;
pub mod ipv4;

// Re-export commonly used items
pub use icmp::{EchoReply, IcmpHeader, Icmp, ICMP_TYPE_ECHO_REPLY, ICMP_TYPE_ECHO_REQUEST};
pub use ipv4::{protocol, IpProtocolHandler, IpSend, Ipv4Header, Ipv4Layer, Ipv4Route, Ipv4Sender};

/// One's-complement sum of `data` as big-endian 16-bit words, carries folded.
///
/// An odd trailing byte is treated as the high byte of a final word.
pub fn ones_complement_sum(data: &[u8]) -> u16 {
    let mut words = data.chunks_exact(2);
    let mut sum: u32 = words
        .by_ref()
        .map(|w| u32::from(BigEndian::read_u16(w)))
        .sum();
    if let [last] = words.remainder() {
        sum += u32::from(*last) << 8;
    }

    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Internet checksum of `data`.
///
/// The checksum field inside `data` must be zero. The result is in host
/// order; write it with big-endian byte order.
/// This is used for IPv4 header, ICMP and TCP (with pseudo-header) checksums.
pub fn checksum(data: &[u8]) -> u16 {
    !ones_complement_sum(data)
}
