//! ICMP (Internet Control Message Protocol) implementation
//!
//! This module provides ICMP packet parsing and processing capabilities.
//! It supports Echo Request and Echo Reply: requests are answered, replies
//! are logged and kept in a short history so a pinger can find its answer.

use std::collections::VecDeque;
use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};
use log::{info, trace};

use crate::buffer::alloc_packet;
use crate::error::NetError;
use crate::network::checksum;
use crate::network::ipv4::{protocol, IpProtocolHandler, IpSend};

/// Minimum ICMP header length in bytes
pub const ICMP_HEADER_LEN: usize = 8;

/// ICMP message types
pub const ICMP_TYPE_ECHO_REPLY: u8 = 0;
pub const ICMP_TYPE_ECHO_REQUEST: u8 = 8;

/// Identifier carried by every echo request we originate.
pub const ECHO_IDENTIFIER: u16 = 0x1337;

const MAX_RECORDED_REPLIES: usize = 16;

/// ICMP packet header structure
///
/// Represents the standard 8-byte ICMP header as defined in RFC 792
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpHeader {
    pub msg_type: u8,  // ICMP message type
    pub msg_code: u8,  // ICMP message code
    pub checksum: u16, // ICMP checksum
    pub rest: [u8; 4], // Type-specific data (e.g., identifier and sequence for echo)
}

impl IcmpHeader {
    /// Echo request with the given identifier and sequence, checksum unset.
    pub fn echo_request(identifier: u16, sequence: u16) -> Self {
        let mut header = IcmpHeader {
            msg_type: ICMP_TYPE_ECHO_REQUEST,
            msg_code: 0,
            checksum: 0,
            rest: [0; 4],
        };
        header.set_identifier(identifier);
        header.set_sequence(sequence);
        header
    }

    /// Parse ICMP header from byte slice
    ///
    /// Returns None if the data is too short to contain a valid ICMP header
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < ICMP_HEADER_LEN {
            return None;
        }

        let mut rest = [0u8; 4];
        rest.copy_from_slice(&data[4..8]);
        Some(IcmpHeader {
            msg_type: data[0],
            msg_code: data[1],
            checksum: BigEndian::read_u16(&data[2..4]),
            rest,
        })
    }

    /// Convert ICMP header to bytes
    pub fn to_bytes(&self) -> [u8; ICMP_HEADER_LEN] {
        let mut bytes = [0u8; ICMP_HEADER_LEN];
        bytes[0] = self.msg_type;
        bytes[1] = self.msg_code;
        BigEndian::write_u16(&mut bytes[2..4], self.checksum);
        bytes[4..8].copy_from_slice(&self.rest);
        bytes
    }

    /// Check if this is an Echo Request message
    pub fn is_echo_request(&self) -> bool {
        self.msg_type == ICMP_TYPE_ECHO_REQUEST
    }

    /// Check if this is an Echo Reply message
    pub fn is_echo_reply(&self) -> bool {
        self.msg_type == ICMP_TYPE_ECHO_REPLY
    }

    /// Get the identifier field for Echo Request/Reply messages
    pub fn identifier(&self) -> u16 {
        BigEndian::read_u16(&self.rest[0..2])
    }

    /// Get the sequence number field for Echo Request/Reply messages
    pub fn sequence(&self) -> u16 {
        BigEndian::read_u16(&self.rest[2..4])
    }

    /// Set the identifier field for Echo Request/Reply messages
    pub fn set_identifier(&mut self, id: u16) {
        BigEndian::write_u16(&mut self.rest[0..2], id);
    }

    /// Set the sequence number field for Echo Request/Reply messages
    pub fn set_sequence(&mut self, seq: u16) {
        BigEndian::write_u16(&mut self.rest[2..4], seq);
    }
}

/// An echo reply that reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoReply {
    pub from: Ipv4Addr,
    pub identifier: u16,
    pub sequence: u16,
}

/// ICMP echo responder and pinger.
#[derive(Debug, Default)]
pub struct Icmp {
    next_sequence: u16,
    replies: VecDeque<EchoReply>,
}

impl Icmp {
    pub fn new() -> Self {
        Icmp::default()
    }

    /// Send an echo request to `dst` and return its sequence number.
    pub fn request_echo(&mut self, ip: &mut dyn IpSend, dst: Ipv4Addr) -> Result<u16, NetError> {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);

        let mut header = IcmpHeader::echo_request(ECHO_IDENTIFIER, sequence);
        header.checksum = checksum(&header.to_bytes());

        trace!("icmp: echo request {} to {}", sequence, dst);
        ip.send(dst, protocol::ICMP, &header.to_bytes())?;
        Ok(sequence)
    }

    /// Remove and return the recorded reply from `from` with `sequence`.
    pub fn take_reply(&mut self, from: Ipv4Addr, sequence: u16) -> Option<EchoReply> {
        let index = self
            .replies
            .iter()
            .position(|r| r.from == from && r.identifier == ECHO_IDENTIFIER && r.sequence == sequence)?;
        self.replies.remove(index)
    }

    pub fn replies(&self) -> impl Iterator<Item = &EchoReply> {
        self.replies.iter()
    }

    fn record(&mut self, reply: EchoReply) {
        if self.replies.len() >= MAX_RECORDED_REPLIES {
            self.replies.pop_front();
        }
        self.replies.push_back(reply);
    }
}

impl IpProtocolHandler for Icmp {
    fn on_datagram(
        &mut self,
        _ip: &mut dyn IpSend,
        src: Ipv4Addr,
        _dst: Ipv4Addr,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, NetError> {
        let header = match IcmpHeader::from_bytes(payload) {
            Some(header) => header,
            None => {
                trace!("icmp: dropping short message from {}", src);
                return Ok(None);
            }
        };

        match header.msg_type {
            ICMP_TYPE_ECHO_REPLY => {
                info!("ping response from {}", src);
                self.record(EchoReply {
                    from: src,
                    identifier: header.identifier(),
                    sequence: header.sequence(),
                });
                Ok(None)
            }
            ICMP_TYPE_ECHO_REQUEST => {
                let mut reply = alloc_packet(payload.len())?;
                reply.copy_from_slice(payload);
                reply[0] = ICMP_TYPE_ECHO_REPLY;
                reply[2..4].copy_from_slice(&[0, 0]);
                let sum = checksum(&reply);
                BigEndian::write_u16(&mut reply[2..4], sum);
                Ok(Some(reply))
            }
            other => {
                trace!("icmp: ignoring type {} from {}", other, src);
                Ok(None)
            }
        }
    }
}
