//! ARP (Address Resolution Protocol) for IPv4 over Ethernet.
//!
//! The resolver keeps an append-only, bounded cache of replies it has seen.
//! There are no timers and no eviction: a mapping learned once stays for the
//! lifetime of the resolver, and repeated replies for the same address are
//! appended rather than merged, so the oldest entry wins on lookup.
//!
//! The blocking resolve itself lives on [`Link`](super::Link), which owns the
//! device the reply has to come in on.

use std::net::Ipv4Addr;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace, warn};

use super::MacAddr;

/// Size of an Ethernet/IPv4 ARP message.
pub const ARP_MESSAGE_LEN: usize = 28;

pub const HARDWARE_ETHERNET: u16 = 0x0001;
pub const PROTOCOL_IPV4: u16 = 0x0800;

pub const ARP_REQUEST: u16 = 1;
pub const ARP_REPLY: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpMessage {
    pub hardware_type: u16,
    pub protocol: u16,
    pub hardware_size: u8,
    pub protocol_size: u8,
    pub command: u16,
    pub src_mac: MacAddr,
    pub src_ip: Ipv4Addr,
    pub dst_mac: MacAddr,
    pub dst_ip: Ipv4Addr,
}

impl ArpMessage {
    fn ethernet_ipv4(command: u16, src_mac: MacAddr, src_ip: Ipv4Addr, dst_mac: MacAddr, dst_ip: Ipv4Addr) -> Self {
        ArpMessage {
            hardware_type: HARDWARE_ETHERNET,
            protocol: PROTOCOL_IPV4,
            hardware_size: 6,
            protocol_size: 4,
            command,
            src_mac,
            src_ip,
            dst_mac,
            dst_ip,
        }
    }

    /// Who-has `target`? Tell `src_ip`.
    pub fn request(src_mac: MacAddr, src_ip: Ipv4Addr, target: Ipv4Addr) -> Self {
        Self::ethernet_ipv4(ARP_REQUEST, src_mac, src_ip, MacAddr::BROADCAST, target)
    }

    /// `src_ip` is-at `src_mac`, addressed to (`dst_mac`, `dst_ip`).
    pub fn reply(src_mac: MacAddr, src_ip: Ipv4Addr, dst_mac: MacAddr, dst_ip: Ipv4Addr) -> Self {
        Self::ethernet_ipv4(ARP_REPLY, src_mac, src_ip, dst_mac, dst_ip)
    }

    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < ARP_MESSAGE_LEN {
            return None;
        }

        let mut src_mac = [0u8; 6];
        let mut dst_mac = [0u8; 6];
        src_mac.copy_from_slice(&data[8..14]);
        dst_mac.copy_from_slice(&data[18..24]);
        Some(ArpMessage {
            hardware_type: BigEndian::read_u16(&data[0..2]),
            protocol: BigEndian::read_u16(&data[2..4]),
            hardware_size: data[4],
            protocol_size: data[5],
            command: BigEndian::read_u16(&data[6..8]),
            src_mac: MacAddr(src_mac),
            src_ip: Ipv4Addr::from(BigEndian::read_u32(&data[14..18])),
            dst_mac: MacAddr(dst_mac),
            dst_ip: Ipv4Addr::from(BigEndian::read_u32(&data[24..28])),
        })
    }

    pub fn to_bytes(&self) -> [u8; ARP_MESSAGE_LEN] {
        let mut bytes = [0u8; ARP_MESSAGE_LEN];
        BigEndian::write_u16(&mut bytes[0..2], self.hardware_type);
        BigEndian::write_u16(&mut bytes[2..4], self.protocol);
        bytes[4] = self.hardware_size;
        bytes[5] = self.protocol_size;
        BigEndian::write_u16(&mut bytes[6..8], self.command);
        bytes[8..14].copy_from_slice(&self.src_mac.0);
        bytes[14..18].copy_from_slice(&self.src_ip.octets());
        bytes[18..24].copy_from_slice(&self.dst_mac.0);
        bytes[24..28].copy_from_slice(&self.dst_ip.octets());
        bytes
    }

    fn is_ethernet_ipv4(&self) -> bool {
        self.hardware_type == HARDWARE_ETHERNET
            && self.protocol == PROTOCOL_IPV4
            && self.hardware_size == 6
            && self.protocol_size == 4
    }
}

/// Fixed-capacity, append-only IP to MAC table.
#[derive(Debug, Clone)]
pub struct ArpCache {
    entries: Vec<(Ipv4Addr, MacAddr)>,
    capacity: usize,
}

impl ArpCache {
    pub fn new(capacity: usize) -> Self {
        ArpCache {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// First cached MAC for `ip`, if any.
    pub fn lookup(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.entries
            .iter()
            .find(|(cached, _)| *cached == ip)
            .map(|(_, mac)| *mac)
    }

    /// Append a mapping. Returns `false` once the cache is full.
    pub fn insert(&mut self, ip: Ipv4Addr, mac: MacAddr) -> bool {
        if self.entries.len() >= self.capacity {
            return false;
        }
        self.entries.push((ip, mac));
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// ARP state owned by the link: the cache and the resolve bound.
pub struct ArpResolver {
    cache: ArpCache,
    timeout: Duration,
}

impl ArpResolver {
    pub fn new(capacity: usize, timeout: Duration) -> Self {
        ArpResolver {
            cache: ArpCache::new(capacity),
            timeout,
        }
    }

    pub fn lookup(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.cache.lookup(ip)
    }

    pub fn cache(&self) -> &ArpCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut ArpCache {
        &mut self.cache
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Process an inbound ARP payload addressed to (`local_ip`, `local_mac`).
    ///
    /// Requests for our address produce the reply to send back; replies are
    /// learned into the cache and never answered.
    pub fn on_message(&mut self, local_ip: Ipv4Addr, local_mac: MacAddr, payload: &[u8]) -> Option<ArpMessage> {
        let message = match ArpMessage::from_bytes(payload) {
            Some(message) => message,
            None => {
                trace!("arp: dropping short message ({} bytes)", payload.len());
                return None;
            }
        };

        if !message.is_ethernet_ipv4() || message.dst_ip != local_ip {
            return None;
        }

        match message.command {
            ARP_REQUEST => {
                debug!("arp: {} is-at {}, answering {}", local_ip, local_mac, message.src_ip);
                Some(ArpMessage::reply(local_mac, local_ip, message.src_mac, message.src_ip))
            }
            ARP_REPLY => {
                if self.cache.insert(message.src_ip, message.src_mac) {
                    debug!("arp: learned {} is-at {}", message.src_ip, message.src_mac);
                } else {
                    warn!("arp: cache full, not learning {}", message.src_ip);
                }
                None
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 15);
    const LOCAL_MAC: MacAddr = MacAddr([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
    const PEER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 2);
    const PEER_MAC: MacAddr = MacAddr([0x52, 0x55, 0x0a, 0x00, 0x02, 0x02]);

    fn resolver() -> ArpResolver {
        ArpResolver::new(128, Duration::from_secs(1))
    }

    #[test]
    fn test_message_layout() {
        let bytes = ArpMessage::request(LOCAL_MAC, LOCAL_IP, PEER_IP).to_bytes();
        assert_eq!(&bytes[0..8], &[0x00, 0x01, 0x08, 0x00, 6, 4, 0x00, 0x01]);
        assert_eq!(&bytes[8..14], &LOCAL_MAC.0);
        assert_eq!(&bytes[14..18], &[10, 0, 2, 15]);
        assert_eq!(&bytes[18..24], &[0xFF; 6]);
        assert_eq!(&bytes[24..28], &[10, 0, 2, 2]);
    }

    #[test]
    fn test_request_for_us_is_answered() {
        let mut arp = resolver();
        let request = ArpMessage::request(PEER_MAC, PEER_IP, LOCAL_IP).to_bytes();

        let reply = arp.on_message(LOCAL_IP, LOCAL_MAC, &request).unwrap();
        assert_eq!(reply.command, ARP_REPLY);
        assert_eq!(reply.src_mac, LOCAL_MAC);
        assert_eq!(reply.src_ip, LOCAL_IP);
        assert_eq!(reply.dst_mac, PEER_MAC);
        assert_eq!(reply.dst_ip, PEER_IP);
        assert!(arp.cache().is_empty());
    }

    #[test]
    fn test_request_for_someone_else_is_ignored() {
        let mut arp = resolver();
        let request = ArpMessage::request(PEER_MAC, PEER_IP, Ipv4Addr::new(10, 0, 2, 3)).to_bytes();
        assert!(arp.on_message(LOCAL_IP, LOCAL_MAC, &request).is_none());
    }

    #[test]
    fn test_reply_is_learned() {
        let mut arp = resolver();
        assert_eq!(arp.lookup(PEER_IP), None);

        let reply = ArpMessage::reply(PEER_MAC, PEER_IP, LOCAL_MAC, LOCAL_IP).to_bytes();
        assert!(arp.on_message(LOCAL_IP, LOCAL_MAC, &reply).is_none());
        assert_eq!(arp.lookup(PEER_IP), Some(PEER_MAC));
    }

    #[test]
    fn test_first_entry_wins_and_duplicates_append() {
        let mut arp = resolver();
        let other_mac = MacAddr([2, 2, 2, 2, 2, 2]);
        for mac in [PEER_MAC, other_mac] {
            let reply = ArpMessage::reply(mac, PEER_IP, LOCAL_MAC, LOCAL_IP).to_bytes();
            arp.on_message(LOCAL_IP, LOCAL_MAC, &reply);
        }
        assert_eq!(arp.cache().len(), 2);
        assert_eq!(arp.lookup(PEER_IP), Some(PEER_MAC));
    }

    #[test]
    fn test_cache_is_bounded() {
        let mut cache = ArpCache::new(2);
        assert!(cache.insert(Ipv4Addr::new(10, 0, 0, 1), PEER_MAC));
        assert!(cache.insert(Ipv4Addr::new(10, 0, 0, 2), PEER_MAC));
        assert!(!cache.insert(Ipv4Addr::new(10, 0, 0, 3), PEER_MAC));
        assert_eq!(cache.lookup(Ipv4Addr::new(10, 0, 0, 3)), None);
    }

    #[test]
    fn test_rejects_short_and_foreign_messages() {
        let mut arp = resolver();
        let request = ArpMessage::request(PEER_MAC, PEER_IP, LOCAL_IP).to_bytes();
        assert!(arp.on_message(LOCAL_IP, LOCAL_MAC, &request[..27]).is_none());

        let mut foreign = request;
        foreign[1] = 0x06; // IEEE 802 hardware type
        assert!(arp.on_message(LOCAL_IP, LOCAL_MAC, &foreign).is_none());
    }
}
