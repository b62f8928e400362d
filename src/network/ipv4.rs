//! IPv4 protocol implementation
//!
//! This module provides IPv4 packet parsing, validation, routing and
//! protocol demultiplexing.
//!
//! Features:
//! - IPv4 header parsing and serialization
//! - Checksum calculation and validation
//! - Direct versus gateway next-hop selection by subnet comparison
//! - One handler per protocol number, last registration wins
//!
//! Fragmentation is not supported: every packet is sent with Don't Fragment
//! set and received fragments are delivered as-is.

use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};
use log::trace;

use crate::buffer::alloc_packet;
use crate::dispatch::{HandlerId, HandlerTable};
use crate::error::NetError;
use crate::link::ethernet::ETHERTYPE_IPV4;
use crate::link::{Link, MacAddr, NetworkDevice};
use crate::network::checksum;

pub const IPV4_HEADER_LEN: usize = 20;
const IPV4_VERSION: u8 = 4;
const DEFAULT_IHL: u8 = 5; // 5 * 4 = 20 bytes (standard header length)
const DEFAULT_IDENT: u16 = 1;

/// IPv4 packet header structure
///
/// Represents the standard 20-byte IPv4 header as defined in RFC 791
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header {
    pub version: u8,
    pub ihl: u8, // Internet Header Length, in 32-bit words
    pub tos: u8, // Type of Service
    pub total_len: u16,
    pub id: u16,
    pub flags_frag_offset: u16, // Flags and Fragment Offset
    pub ttl: u8,                // Time to Live
    pub protocol: u8,           // Next Protocol
    pub checksum: u16,
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
}

impl Ipv4Header {
    /// Create the header for an outgoing packet carrying `payload_len` bytes.
    ///
    /// The checksum is filled in.
    pub fn new(protocol: u8, src_addr: Ipv4Addr, dst_addr: Ipv4Addr, payload_len: u16, ttl: u8) -> Self {
        let mut header = Ipv4Header {
            version: IPV4_VERSION,
            ihl: DEFAULT_IHL,
            tos: 0,
            total_len: IPV4_HEADER_LEN as u16 + payload_len,
            id: DEFAULT_IDENT,
            flags_frag_offset: flags::DONT_FRAGMENT,
            ttl,
            protocol,
            checksum: 0,
            src_addr,
            dst_addr,
        };
        header.update_checksum();
        header
    }

    /// Parse IPv4 header from byte slice
    ///
    /// Returns None if the data is too short or if the version field is not 4
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < IPV4_HEADER_LEN {
            return None;
        }

        let version = (data[0] & 0xF0) >> 4;
        if version != IPV4_VERSION {
            return None;
        }

        Some(Ipv4Header {
            version,
            ihl: data[0] & 0x0F,
            tos: data[1],
            total_len: BigEndian::read_u16(&data[2..4]),
            id: BigEndian::read_u16(&data[4..6]),
            flags_frag_offset: BigEndian::read_u16(&data[6..8]),
            ttl: data[8],
            protocol: data[9],
            checksum: BigEndian::read_u16(&data[10..12]),
            src_addr: Ipv4Addr::from(BigEndian::read_u32(&data[12..16])),
            dst_addr: Ipv4Addr::from(BigEndian::read_u32(&data[16..20])),
        })
    }

    /// Convert IPv4 header to bytes
    ///
    /// Serializes the header to a 20-byte array ready for transmission
    pub fn to_bytes(&self) -> [u8; IPV4_HEADER_LEN] {
        let mut bytes = [0u8; IPV4_HEADER_LEN];
        bytes[0] = (self.version << 4) | self.ihl;
        bytes[1] = self.tos;
        BigEndian::write_u16(&mut bytes[2..4], self.total_len);
        BigEndian::write_u16(&mut bytes[4..6], self.id);
        BigEndian::write_u16(&mut bytes[6..8], self.flags_frag_offset);
        bytes[8] = self.ttl;
        bytes[9] = self.protocol;
        BigEndian::write_u16(&mut bytes[10..12], self.checksum);
        bytes[12..16].copy_from_slice(&self.src_addr.octets());
        bytes[16..20].copy_from_slice(&self.dst_addr.octets());

        bytes
    }

    /// Recalculate the checksum after modifying header fields.
    pub fn update_checksum(&mut self) {
        self.checksum = 0;
        self.checksum = checksum(&self.to_bytes());
    }

    /// Get the header length in bytes
    pub fn header_len(&self) -> usize {
        (self.ihl as usize) * 4
    }
}

/// IPv4 protocol constants
pub mod protocol {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
    /// Reserved; cannot carry a handler.
    pub const RESERVED: u8 = 255;
}

/// IPv4 flags constants
pub mod flags {
    pub const DONT_FRAGMENT: u16 = 0x4000;
}

/// Gateway and subnet used to choose the next hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Route {
    pub gateway: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
}

impl Ipv4Route {
    pub fn new(gateway: Ipv4Addr, subnet_mask: Ipv4Addr) -> Self {
        Ipv4Route { gateway, subnet_mask }
    }

    /// Check if `addr` is in the same network as `local`
    pub fn is_same_network(&self, local: Ipv4Addr, addr: Ipv4Addr) -> bool {
        let mask = u32::from(self.subnet_mask);
        (u32::from(local) & mask) == (u32::from(addr) & mask)
    }

    /// Limited broadcast or the directed broadcast of `local`'s network
    pub fn is_broadcast(&self, local: Ipv4Addr, addr: Ipv4Addr) -> bool {
        if addr == Ipv4Addr::BROADCAST {
            return true;
        }
        let directed = u32::from(local) | !u32::from(self.subnet_mask);
        u32::from(addr) == directed
    }

    /// Host to hand a packet for `dst` to: `dst` itself when it is on our
    /// subnet, the gateway otherwise.
    pub fn next_hop(&self, local: Ipv4Addr, dst: Ipv4Addr) -> Ipv4Addr {
        if self.is_same_network(local, dst) {
            dst
        } else {
            self.gateway
        }
    }
}

/// Sending half of IPv4 as seen by the protocols above it.
pub trait IpSend {
    fn local_ip(&self) -> Ipv4Addr;

    /// Wrap `payload` in an IPv4 header for `protocol` and send it to `dst`.
    fn send(&mut self, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> Result<(), NetError>;
}

/// A handler for one IP protocol number.
pub trait IpProtocolHandler {
    /// Process a datagram addressed to us.
    ///
    /// `payload` excludes the IPv4 header and is clamped to the packet's total
    /// length. Returning `Some` sends the returned bytes back to `src` in a
    /// packet that reuses the received header with its addresses swapped.
    fn on_datagram(
        &mut self,
        ip: &mut dyn IpSend,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, NetError>;
}

/// What a registered protocol number is dispatched to.
pub(crate) enum IpHandler {
    Icmp,
    Udp,
    Tcp,
    Custom(Box<dyn IpProtocolHandler>),
}

/// IPv4 receive filter, protocol table and routing parameters.
pub struct Ipv4Layer {
    route: Ipv4Route,
    ttl: u8,
    handlers: HandlerTable<u8, IpHandler>,
}

impl Ipv4Layer {
    pub fn new(route: Ipv4Route, ttl: u8) -> Self {
        Ipv4Layer {
            route,
            ttl,
            handlers: HandlerTable::new(),
        }
    }

    pub fn route(&self) -> &Ipv4Route {
        &self.route
    }

    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    pub(crate) fn register(&mut self, protocol: u8, handler: IpHandler) -> HandlerId {
        self.handlers.register(protocol, handler)
    }

    /// Install `handler` for `protocol`, replacing whatever handled it before.
    pub fn register_custom(&mut self, protocol: u8, handler: Box<dyn IpProtocolHandler>) -> Result<HandlerId, NetError> {
        if protocol == protocol::RESERVED {
            return Err(NetError::ReservedProtocol(protocol));
        }
        Ok(self.register(protocol, IpHandler::Custom(handler)))
    }

    pub fn unregister(&mut self, protocol: u8, id: HandlerId) -> bool {
        self.handlers.unregister(protocol, id).is_some()
    }

    /// Route, TTL and handler table borrowed separately so a handler can be
    /// called with a sender built from the route.
    pub(crate) fn split(&mut self) -> (&Ipv4Route, u8, &mut HandlerTable<u8, IpHandler>) {
        (&self.route, self.ttl, &mut self.handlers)
    }

    /// Receive filter: parse `packet` and return its header and payload if it
    /// is addressed to `local_ip`.
    pub fn accept<'p>(&self, local_ip: Ipv4Addr, packet: &'p [u8]) -> Option<(Ipv4Header, &'p [u8])> {
        let header = match Ipv4Header::from_bytes(packet) {
            Some(header) => header,
            None => {
                trace!("ipv4: dropping short or non-v4 packet ({} bytes)", packet.len());
                return None;
            }
        };

        let header_len = header.header_len();
        if header_len < IPV4_HEADER_LEN || header_len > packet.len() {
            trace!("ipv4: dropping packet with bad header length {}", header_len);
            return None;
        }

        if header.dst_addr != local_ip {
            trace!("ipv4: packet for {} is not ours", header.dst_addr);
            return None;
        }

        if checksum(&packet[..header_len]) != 0 {
            trace!("ipv4: dropping packet from {} with bad checksum", header.src_addr);
            return None;
        }

        let total_len = (header.total_len as usize).min(packet.len());
        if total_len < header_len {
            return None;
        }

        Some((header, &packet[header_len..total_len]))
    }

    /// Turn a received header into the header of a reply carrying `reply`:
    /// addresses swapped, TTL reset, checksum recomputed. Options are kept.
    pub fn echo_packet(&self, raw_header: &[u8], reply: &[u8]) -> Result<Vec<u8>, NetError> {
        let header_len = raw_header.len();
        let max = usize::from(u16::MAX) - header_len;
        if reply.len() > max {
            return Err(NetError::PayloadTooLarge { size: reply.len(), max });
        }
        let mut packet = alloc_packet(header_len + reply.len())?;
        packet[..header_len].copy_from_slice(raw_header);
        packet[header_len..].copy_from_slice(reply);

        let (src, dst) = packet[12..20].split_at_mut(4);
        src.swap_with_slice(dst);
        packet[8] = self.ttl;
        BigEndian::write_u16(&mut packet[2..4], (header_len + reply.len()) as u16);
        packet[10..12].copy_from_slice(&[0, 0]);
        let sum = checksum(&packet[..header_len]);
        BigEndian::write_u16(&mut packet[10..12], sum);

        Ok(packet)
    }
}

/// [`IpSend`] over a [`Link`]: builds the header, picks the next hop,
/// resolves it through ARP and frames the packet.
pub struct Ipv4Sender<'a, D> {
    link: &'a mut Link<D>,
    route: &'a Ipv4Route,
    ttl: u8,
}

impl<'a, D: NetworkDevice> Ipv4Sender<'a, D> {
    pub fn new(link: &'a mut Link<D>, route: &'a Ipv4Route, ttl: u8) -> Self {
        Ipv4Sender { link, route, ttl }
    }
}

impl<D: NetworkDevice> IpSend for Ipv4Sender<'_, D> {
    fn local_ip(&self) -> Ipv4Addr {
        self.link.local_ip()
    }

    fn send(&mut self, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> Result<(), NetError> {
        let max = self.link.mtu().saturating_sub(IPV4_HEADER_LEN);
        if payload.len() > max {
            return Err(NetError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }

        let local = self.link.local_ip();
        let header = Ipv4Header::new(protocol, local, dst, payload.len() as u16, self.ttl);

        let mut packet = alloc_packet(IPV4_HEADER_LEN + payload.len())?;
        packet[..IPV4_HEADER_LEN].copy_from_slice(&header.to_bytes());
        packet[IPV4_HEADER_LEN..].copy_from_slice(payload);

        let dst_mac = if self.route.is_broadcast(local, dst) {
            MacAddr::BROADCAST
        } else {
            let next_hop = self.route.next_hop(local, dst);
            trace!("ipv4: {} via {}", dst, next_hop);
            self.link.resolve(next_hop)?
        };

        self.link.send_frame(dst_mac, ETHERTYPE_IPV4, &packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackConfig;
    use crate::link::ethernet::{EthernetFrame, ETHERNET_HEADER_LEN};
    use crate::link::MemoryDevice;

    const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 15);
    const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 2);

    fn route() -> Ipv4Route {
        Ipv4Route::new(Ipv4Addr::new(10, 0, 2, 2), Ipv4Addr::new(255, 255, 255, 0))
    }

    fn packet(protocol: u8, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
        let header = Ipv4Header::new(protocol, src, dst, payload.len() as u16, 64);
        let mut packet = header.to_bytes().to_vec();
        packet.extend_from_slice(payload);
        packet
    }

    #[test]
    fn test_header_defaults_and_checksum() {
        let header = Ipv4Header::new(protocol::UDP, LOCAL, PEER, 12, 64);
        let bytes = header.to_bytes();
        assert_eq!(bytes[0], 0x45);
        assert_eq!(BigEndian::read_u16(&bytes[2..4]), 32);
        assert_eq!(BigEndian::read_u16(&bytes[4..6]), 1);
        assert_eq!(BigEndian::read_u16(&bytes[6..8]), flags::DONT_FRAGMENT);
        assert_eq!(bytes[8], 64);
        assert_eq!(bytes[9], protocol::UDP);
        assert_eq!(checksum(&bytes), 0);
        assert_eq!(Ipv4Header::from_bytes(&bytes), Some(header));
    }

    #[test]
    fn test_same_network_detection() {
        let route = Ipv4Route::new(Ipv4Addr::new(192, 168, 1, 254), Ipv4Addr::new(255, 255, 255, 0));
        let local = Ipv4Addr::new(192, 168, 1, 1);

        assert!(route.is_same_network(local, Ipv4Addr::new(192, 168, 1, 100)));
        assert!(!route.is_same_network(local, Ipv4Addr::new(192, 168, 2, 1)));
    }

    #[test]
    fn test_broadcast_detection() {
        let route = Ipv4Route::new(Ipv4Addr::new(192, 168, 1, 254), Ipv4Addr::new(255, 255, 255, 0));
        let local = Ipv4Addr::new(192, 168, 1, 1);

        // Limited broadcast
        assert!(route.is_broadcast(local, Ipv4Addr::new(255, 255, 255, 255)));

        // Directed broadcast
        assert!(route.is_broadcast(local, Ipv4Addr::new(192, 168, 1, 255)));

        // Not broadcast
        assert!(!route.is_broadcast(local, Ipv4Addr::new(192, 168, 1, 2)));
    }

    #[test]
    fn test_next_hop() {
        let route = route();
        assert_eq!(route.next_hop(LOCAL, Ipv4Addr::new(10, 0, 2, 7)), Ipv4Addr::new(10, 0, 2, 7));
        assert_eq!(route.next_hop(LOCAL, Ipv4Addr::new(8, 8, 8, 8)), route.gateway);
    }

    #[test]
    fn test_accept_clamps_total_length() {
        let layer = Ipv4Layer::new(route(), 64);
        let mut raw = packet(protocol::UDP, PEER, LOCAL, &[1, 2, 3, 4]);

        let (header, payload) = layer.accept(LOCAL, &raw).unwrap();
        assert_eq!(payload, &[1, 2, 3, 4]);
        assert_eq!(payload.len(), header.total_len as usize - header.header_len());

        // Trailing link-layer padding is not part of the payload.
        raw.extend_from_slice(&[0; 6]);
        let (_, payload) = layer.accept(LOCAL, &raw).unwrap();
        assert_eq!(payload, &[1, 2, 3, 4]);

        // A truncated packet is clamped to what was received.
        let (_, payload) = layer.accept(LOCAL, &raw[..22]).unwrap();
        assert_eq!(payload, &[1, 2]);
    }

    #[test]
    fn test_accept_rejects_foreign_and_corrupt_packets() {
        let layer = Ipv4Layer::new(route(), 64);
        let raw = packet(protocol::UDP, PEER, Ipv4Addr::new(10, 0, 2, 16), &[1]);
        assert!(layer.accept(LOCAL, &raw).is_none());

        let mut raw = packet(protocol::UDP, PEER, LOCAL, &[1]);
        raw[8] = 1; // TTL changed without fixing the checksum
        assert!(layer.accept(LOCAL, &raw).is_none());

        assert!(layer.accept(LOCAL, &raw[..19]).is_none());
    }

    #[test]
    fn test_echo_packet_swaps_and_rechecksums() {
        let layer = Ipv4Layer::new(route(), 64);
        let mut raw = packet(protocol::ICMP, PEER, LOCAL, &[8, 0, 0, 0]);
        raw[8] = 3;
        let echo = layer.echo_packet(&raw[..IPV4_HEADER_LEN], &[0, 0, 0, 0, 9]).unwrap();

        let header = Ipv4Header::from_bytes(&echo).unwrap();
        assert_eq!(header.src_addr, LOCAL);
        assert_eq!(header.dst_addr, PEER);
        assert_eq!(header.ttl, 64);
        assert_eq!(header.total_len, 25);
        assert_eq!(checksum(&echo[..IPV4_HEADER_LEN]), 0);
        assert_eq!(&echo[IPV4_HEADER_LEN..], &[0, 0, 0, 0, 9]);
    }

    #[test]
    fn test_echo_packet_rejects_reply_beyond_total_length_field() {
        let layer = Ipv4Layer::new(route(), 64);
        let raw = packet(protocol::ICMP, PEER, LOCAL, &[8, 0, 0, 0]);
        let reply = vec![0u8; usize::from(u16::MAX) - IPV4_HEADER_LEN + 1];
        assert!(matches!(
            layer.echo_packet(&raw[..IPV4_HEADER_LEN], &reply),
            Err(NetError::PayloadTooLarge { .. })
        ));
    }

    struct Discard;

    impl IpProtocolHandler for Discard {
        fn on_datagram(
            &mut self,
            _ip: &mut dyn IpSend,
            _src: Ipv4Addr,
            _dst: Ipv4Addr,
            _payload: &[u8],
        ) -> Result<Option<Vec<u8>>, NetError> {
            Ok(None)
        }
    }

    #[test]
    fn test_reserved_protocol_cannot_register() {
        let mut layer = Ipv4Layer::new(route(), 64);
        assert!(matches!(
            layer.register_custom(protocol::RESERVED, Box::new(Discard)),
            Err(NetError::ReservedProtocol(255))
        ));

        let old = layer.register_custom(200, Box::new(Discard)).unwrap();
        let new = layer.register_custom(200, Box::new(Discard)).unwrap();
        assert!(!layer.unregister(200, old));
        assert!(layer.unregister(200, new));
    }

    #[test]
    fn test_sender_routes_off_subnet_via_gateway() {
        let config = StackConfig::default();
        let mut link = Link::new(MemoryDevice::new(config.mac, config.ip), &config);
        let gateway_mac = MacAddr([2, 0, 0, 0, 0, 2]);
        link.arp_mut().cache_mut().insert(config.gateway, gateway_mac);

        let route = Ipv4Route::new(config.gateway, config.subnet_mask);
        let mut sender = Ipv4Sender::new(&mut link, &route, 64);
        sender.send(Ipv4Addr::new(8, 8, 8, 8), protocol::UDP, b"dns?").unwrap();

        let sent = link.device_mut().take_sent();
        assert_eq!(sent.len(), 1);
        let frame = EthernetFrame::from_bytes(&sent[0]).unwrap();
        assert_eq!(frame.dst, gateway_mac);
        assert_eq!(frame.ether_type, ETHERTYPE_IPV4);

        let header = Ipv4Header::from_bytes(&sent[0][ETHERNET_HEADER_LEN..]).unwrap();
        assert_eq!(header.dst_addr, Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(header.src_addr, config.ip);
        assert_eq!(header.total_len, 24);
        assert_eq!(&sent[0][ETHERNET_HEADER_LEN + IPV4_HEADER_LEN..], b"dns?");
    }

    #[test]
    fn test_sender_broadcasts_without_arp() {
        let config = StackConfig::default();
        let mut link = Link::new(MemoryDevice::new(config.mac, config.ip), &config);
        let route = Ipv4Route::new(config.gateway, config.subnet_mask);

        let mut sender = Ipv4Sender::new(&mut link, &route, 64);
        sender.send(Ipv4Addr::new(10, 0, 2, 255), protocol::UDP, b"hi").unwrap();

        let sent = link.device_mut().take_sent();
        assert_eq!(sent.len(), 1);
        assert!(EthernetFrame::from_bytes(&sent[0]).unwrap().dst.is_broadcast());
    }

    #[test]
    fn test_sender_rejects_oversized_payload() {
        let config = StackConfig::default();
        let mut link = Link::new(MemoryDevice::new(config.mac, config.ip), &config);
        let route = Ipv4Route::new(config.gateway, config.subnet_mask);

        let mut sender = Ipv4Sender::new(&mut link, &route, 64);
        let payload = vec![0u8; 1481];
        assert!(matches!(
            sender.send(PEER, protocol::UDP, &payload),
            Err(NetError::PayloadTooLarge { max: 1480, .. })
        ));
    }
}
