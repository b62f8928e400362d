//! Ethernet II framing and EtherType dispatch.

use byteorder::{BigEndian, ByteOrder};
use log::trace;

use super::MacAddr;
use crate::buffer::alloc_packet;
use crate::dispatch::{HandlerId, HandlerTable};
use crate::error::NetError;

pub const ETHERNET_HEADER_LEN: usize = 14;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// The 14-byte Ethernet II header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetFrame {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ether_type: u16,
}

impl EthernetFrame {
    /// Parse the header at the start of `data`.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < ETHERNET_HEADER_LEN {
            return None;
        }

        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&data[0..6]);
        src.copy_from_slice(&data[6..12]);
        Some(EthernetFrame {
            dst: MacAddr(dst),
            src: MacAddr(src),
            ether_type: BigEndian::read_u16(&data[12..14]),
        })
    }

    pub fn to_bytes(&self) -> [u8; ETHERNET_HEADER_LEN] {
        let mut bytes = [0u8; ETHERNET_HEADER_LEN];
        bytes[0..6].copy_from_slice(&self.dst.0);
        bytes[6..12].copy_from_slice(&self.src.0);
        BigEndian::write_u16(&mut bytes[12..14], self.ether_type);
        bytes
    }

    /// Build a complete frame: this header followed by `payload`.
    pub fn encapsulate(&self, payload: &[u8]) -> Result<Vec<u8>, NetError> {
        let mut frame = alloc_packet(ETHERNET_HEADER_LEN + payload.len())?;
        frame[..ETHERNET_HEADER_LEN].copy_from_slice(&self.to_bytes());
        frame[ETHERNET_HEADER_LEN..].copy_from_slice(payload);
        Ok(frame)
    }

    /// Receive filter: split `frame` into header and payload if it is
    /// addressed to `local` or to the broadcast address.
    pub fn accept(frame: &[u8], local: MacAddr) -> Option<(EthernetFrame, &[u8])> {
        let header = match Self::from_bytes(frame) {
            Some(header) => header,
            None => {
                trace!("eth: dropping runt frame of {} bytes", frame.len());
                return None;
            }
        };

        if !header.dst.is_broadcast() && header.dst != local {
            trace!("eth: frame for {} is not ours", header.dst);
            return None;
        }

        Some((header, &frame[ETHERNET_HEADER_LEN..]))
    }

    /// Header for sending a reply back to whoever sent this frame.
    pub fn echo(&self, local: MacAddr) -> EthernetFrame {
        EthernetFrame {
            dst: self.src,
            src: local,
            ether_type: self.ether_type,
        }
    }
}

/// A handler for one EtherType not handled by the stack itself.
pub trait EtherFrameHandler {
    /// Process a payload; returning `Some` sends it back to the frame's sender.
    fn on_frame(&mut self, payload: &[u8]) -> Option<Vec<u8>>;
}

/// What a registered EtherType is dispatched to.
pub(crate) enum EtherHandler {
    Arp,
    Ipv4,
    Custom(Box<dyn EtherFrameHandler>),
}

/// EtherType to handler mapping.
#[derive(Default)]
pub struct EthernetLayer {
    handlers: HandlerTable<u16, EtherHandler>,
}

impl EthernetLayer {
    pub fn new() -> Self {
        EthernetLayer {
            handlers: HandlerTable::new(),
        }
    }

    pub(crate) fn register(&mut self, ether_type: u16, handler: EtherHandler) -> HandlerId {
        self.handlers.register(ether_type, handler)
    }

    pub fn register_custom(&mut self, ether_type: u16, handler: Box<dyn EtherFrameHandler>) -> HandlerId {
        self.handlers.register(ether_type, EtherHandler::Custom(handler))
    }

    pub fn unregister(&mut self, ether_type: u16, id: HandlerId) -> bool {
        self.handlers.unregister(ether_type, id).is_some()
    }

    pub(crate) fn handler_mut(&mut self, ether_type: u16) -> Option<&mut EtherHandler> {
        self.handlers.get_mut(ether_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL: MacAddr = MacAddr([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
    const PEER: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x02]);

    #[test]
    fn test_header_layout() {
        let header = EthernetFrame {
            dst: PEER,
            src: LOCAL,
            ether_type: ETHERTYPE_ARP,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..6], &PEER.0);
        assert_eq!(&bytes[6..12], &LOCAL.0);
        assert_eq!(&bytes[12..14], &[0x08, 0x06]);
        assert_eq!(EthernetFrame::from_bytes(&bytes), Some(header));
    }

    #[test]
    fn test_accept_filters_destination() {
        let to_us = EthernetFrame { dst: LOCAL, src: PEER, ether_type: ETHERTYPE_IPV4 }
            .encapsulate(b"abc")
            .unwrap();
        let (header, payload) = EthernetFrame::accept(&to_us, LOCAL).unwrap();
        assert_eq!(header.src, PEER);
        assert_eq!(payload, b"abc");

        let broadcast = EthernetFrame { dst: MacAddr::BROADCAST, src: PEER, ether_type: ETHERTYPE_ARP }
            .encapsulate(b"")
            .unwrap();
        assert!(EthernetFrame::accept(&broadcast, LOCAL).is_some());

        let other = EthernetFrame { dst: MacAddr([9; 6]), src: PEER, ether_type: ETHERTYPE_IPV4 }
            .encapsulate(b"abc")
            .unwrap();
        assert!(EthernetFrame::accept(&other, LOCAL).is_none());

        assert!(EthernetFrame::accept(&to_us[..13], LOCAL).is_none());
    }

    #[test]
    fn test_echo_swaps_addresses() {
        let header = EthernetFrame { dst: LOCAL, src: PEER, ether_type: ETHERTYPE_IPV4 };
        let reply = header.echo(LOCAL);
        assert_eq!(reply.dst, PEER);
        assert_eq!(reply.src, LOCAL);
        assert_eq!(reply.ether_type, ETHERTYPE_IPV4);
    }
}
