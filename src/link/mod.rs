//! Link layer: the NIC collaborator, Ethernet framing and ARP.
//!
//! [`Link`] is the transmit context every upper layer sends through. It owns
//! the device and the ARP cache, so a blocking [`Link::resolve`] can pull
//! frames off the device itself while it waits for a reply.

pub mod arp;
pub mod ethernet;
pub mod memory;
#[cfg(target_os = "linux")]
pub mod tap;

use std::collections::VecDeque;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::buffer::alloc_packet;
use crate::config::StackConfig;
use crate::error::NetError;
use arp::{ArpMessage, ArpResolver};
use ethernet::{EthernetFrame, ETHERNET_HEADER_LEN, ETHERTYPE_ARP};

pub use arp::ArpCache;
pub use ethernet::{EtherFrameHandler, EthernetLayer};
pub use memory::MemoryDevice;

/// Frames held back while [`Link::resolve`] is polling the device.
const MAX_DEFERRED_FRAMES: usize = 64;

/// A 48-bit Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| NetError::InvalidAddress(s.to_string()))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| NetError::InvalidAddress(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(NetError::InvalidAddress(s.to_string()));
        }
        Ok(MacAddr(octets))
    }
}

/// The raw frame interface a NIC driver provides to the stack.
pub trait NetworkDevice {
    /// Transmit one complete Ethernet frame.
    fn send(&mut self, frame: &[u8]) -> Result<(), NetError>;

    /// Wait up to `timeout` for one frame, copying it into `buf`.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>, NetError>;

    fn mac_address(&self) -> MacAddr;

    fn ip_address(&self) -> Ipv4Addr;
}

/// Transmit side of the stack: device, ARP cache and deferred frames.
pub struct Link<D> {
    device: D,
    arp: ArpResolver,
    deferred: VecDeque<Vec<u8>>,
    mtu: usize,
}

impl<D: NetworkDevice> Link<D> {
    pub fn new(device: D, config: &StackConfig) -> Self {
        Link {
            device,
            arp: ArpResolver::new(config.arp_cache_capacity, config.arp_timeout),
            deferred: VecDeque::new(),
            mtu: config.mtu,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.device.ip_address()
    }

    pub fn local_mac(&self) -> MacAddr {
        self.device.mac_address()
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    pub fn arp(&self) -> &ArpResolver {
        &self.arp
    }

    pub fn arp_mut(&mut self) -> &mut ArpResolver {
        &mut self.arp
    }

    /// Frame `payload` with our MAC as source and hand it to the device.
    pub fn send_frame(&mut self, dst: MacAddr, ether_type: u16, payload: &[u8]) -> Result<(), NetError> {
        if payload.len() > self.mtu {
            return Err(NetError::PayloadTooLarge {
                size: payload.len(),
                max: self.mtu,
            });
        }

        let header = EthernetFrame {
            dst,
            src: self.local_mac(),
            ether_type,
        };
        let frame = header.encapsulate(payload)?;
        self.device.send(&frame)
    }

    /// Broadcast an ARP request for `ip` without waiting for the answer.
    pub fn request_mac(&mut self, ip: Ipv4Addr) -> Result<(), NetError> {
        debug!("arp: who-has {} tell {}", ip, self.local_ip());
        let request = ArpMessage::request(self.local_mac(), self.local_ip(), ip);
        self.send_frame(MacAddr::BROADCAST, ETHERTYPE_ARP, &request.to_bytes())
    }

    /// Announce our (IP, MAC) pair to the host owning `ip`.
    ///
    /// Resolves `ip` first, so this blocks like [`Link::resolve`].
    pub fn broadcast_mac(&mut self, ip: Ipv4Addr) -> Result<(), NetError> {
        let dst_mac = self.resolve(ip)?;
        let announce = ArpMessage::reply(self.local_mac(), self.local_ip(), dst_mac, ip);
        self.send_frame(dst_mac, ETHERTYPE_ARP, &announce.to_bytes())
    }

    /// Map `ip` to a MAC address, asking the network if the cache misses.
    ///
    /// On a miss this sends one ARP request and then polls the device until a
    /// reply lands in the cache or the configured timeout expires. ARP frames
    /// seen while waiting are handled immediately by the built-in resolver,
    /// even if a custom handler has taken over EtherType 0x0806; everything
    /// else is queued for the next
    /// [`NetworkInterface::poll`](crate::iface::NetworkInterface::poll).
    pub fn resolve(&mut self, ip: Ipv4Addr) -> Result<MacAddr, NetError> {
        if let Some(mac) = self.arp.lookup(ip) {
            return Ok(mac);
        }

        self.request_mac(ip)?;

        let timeout = self.arp.timeout();
        let deadline = Instant::now() + timeout;
        let mut buf = alloc_packet(ETHERNET_HEADER_LEN + self.mtu)?;
        loop {
            if let Some(mac) = self.arp.lookup(ip) {
                return Ok(mac);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(NetError::ArpTimeout { ip, waited: timeout });
            }
            if let Some(len) = self.device.recv(&mut buf, deadline - now)? {
                self.absorb(&buf[..len])?;
            }
        }
    }

    /// Pop the oldest frame that arrived during a resolve.
    pub(crate) fn take_deferred(&mut self) -> Option<Vec<u8>> {
        self.deferred.pop_front()
    }

    /// Handle an ARP frame in place or park anything else for later.
    ///
    /// The Ethernet handler table is not consulted here.
    fn absorb(&mut self, frame: &[u8]) -> Result<(), NetError> {
        let local_mac = self.local_mac();
        let local_ip = self.local_ip();

        if let Some((header, payload)) = EthernetFrame::accept(frame, local_mac) {
            if header.ether_type == ETHERTYPE_ARP {
                if let Some(reply) = self.arp.on_message(local_ip, local_mac, payload) {
                    self.send_frame(header.src, ETHERTYPE_ARP, &reply.to_bytes())?;
                }
                return Ok(());
            }
        } else {
            trace!("link: dropping frame not addressed to us while resolving");
            return Ok(());
        }

        if self.deferred.len() >= MAX_DEFERRED_FRAMES {
            warn!("link: deferred frame backlog full, dropping {} bytes", frame.len());
            return Ok(());
        }
        self.deferred.push_back(frame.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_display_and_parse() {
        let mac: MacAddr = "52:54:00:12:34:56".parse().unwrap();
        assert_eq!(mac, MacAddr([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]));
        assert_eq!(mac.to_string(), "52:54:00:12:34:56");

        assert!("52:54:00:12:34".parse::<MacAddr>().is_err());
        assert!("52:54:00:12:34:56:78".parse::<MacAddr>().is_err());
        assert!("zz:54:00:12:34:56".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_send_frame_fills_header() {
        let config = StackConfig::default();
        let device = MemoryDevice::new(config.mac, config.ip);
        let mut link = Link::new(device, &config);

        let dst = MacAddr([1, 2, 3, 4, 5, 6]);
        link.send_frame(dst, 0x88B5, b"hello").unwrap();

        let sent = link.device_mut().take_sent();
        assert_eq!(sent.len(), 1);
        let header = EthernetFrame::from_bytes(&sent[0]).unwrap();
        assert_eq!(header.dst, dst);
        assert_eq!(header.src, config.mac);
        assert_eq!(header.ether_type, 0x88B5);
        assert_eq!(&sent[0][ETHERNET_HEADER_LEN..], b"hello");
    }

    #[test]
    fn test_send_frame_rejects_oversized_payload() {
        let config = StackConfig::default();
        let mut link = Link::new(MemoryDevice::new(config.mac, config.ip), &config);
        let payload = vec![0u8; config.mtu + 1];
        assert!(matches!(
            link.send_frame(MacAddr::BROADCAST, 0x0800, &payload),
            Err(NetError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_resolve_hits_cache_without_sending() {
        let config = StackConfig::default();
        let mut link = Link::new(MemoryDevice::new(config.mac, config.ip), &config);
        let peer = Ipv4Addr::new(10, 0, 2, 2);
        let peer_mac = MacAddr([2, 0, 0, 0, 0, 2]);
        link.arp_mut().cache_mut().insert(peer, peer_mac);

        assert_eq!(link.resolve(peer).unwrap(), peer_mac);
        assert!(link.device_mut().take_sent().is_empty());
    }

    #[test]
    fn test_resolve_waits_for_reply_and_defers_other_frames() {
        let config = StackConfig::default();
        let mut link = Link::new(MemoryDevice::new(config.mac, config.ip), &config);
        let peer = Ipv4Addr::new(10, 0, 2, 2);
        let peer_mac = MacAddr([2, 0, 0, 0, 0, 2]);

        // An unrelated IPv4 frame arrives before the ARP reply.
        let other = EthernetFrame {
            dst: config.mac,
            src: peer_mac,
            ether_type: ethernet::ETHERTYPE_IPV4,
        }
        .encapsulate(&[0x45; 20])
        .unwrap();
        link.device_mut().inject(other.clone());

        let reply = ArpMessage::reply(peer_mac, peer, config.mac, config.ip);
        let frame = EthernetFrame {
            dst: config.mac,
            src: peer_mac,
            ether_type: ETHERTYPE_ARP,
        }
        .encapsulate(&reply.to_bytes())
        .unwrap();
        link.device_mut().inject(frame);

        assert_eq!(link.resolve(peer).unwrap(), peer_mac);

        let sent = link.device_mut().take_sent();
        assert_eq!(sent.len(), 1);
        let header = EthernetFrame::from_bytes(&sent[0]).unwrap();
        assert!(header.dst.is_broadcast());
        assert_eq!(header.ether_type, ETHERTYPE_ARP);

        assert_eq!(link.take_deferred(), Some(other));
        assert_eq!(link.take_deferred(), None);
    }

    #[test]
    fn test_resolve_times_out() {
        let config = StackConfig::default().with_arp_timeout(Duration::from_millis(20));
        let mut link = Link::new(MemoryDevice::new(config.mac, config.ip), &config);
        let peer = Ipv4Addr::new(10, 0, 2, 99);

        match link.resolve(peer) {
            Err(NetError::ArpTimeout { ip, .. }) => assert_eq!(ip, peer),
            other => panic!("expected ArpTimeout, got {:?}", other),
        }
    }
}
