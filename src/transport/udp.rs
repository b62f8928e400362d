//! UDP (User Datagram Protocol) implementation
//!
//! The provider keeps a flat socket table that is scanned in insertion order
//! on receive; the first socket that matches wins. A listening socket matches
//! any peer on its local port and commits to the first one it hears from.
//! After that it behaves like a connected socket and other peers sending to
//! the same port match nothing.
//!
//! Outgoing datagrams carry a zero checksum.

use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace};

use crate::buffer::alloc_packet;
use crate::error::NetError;
use crate::network::ipv4::{protocol, IpProtocolHandler, IpSend};

/// UDP header length in bytes
pub const UDP_HEADER_LEN: usize = 8;

/// Largest payload that fits one Ethernet frame after IPv4 and UDP headers.
pub const MAX_UDP_PAYLOAD: usize = 1500 - 20 - UDP_HEADER_LEN;

/// UDP packet header structure
///
/// Represents the standard 8-byte UDP header as defined in RFC 768
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16, // Length of UDP header and data
    pub checksum: u16,
}

impl UdpHeader {
    /// Parse UDP header from byte slice
    ///
    /// Returns None if the data is too short to contain a valid UDP header
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < UDP_HEADER_LEN {
            return None;
        }

        Some(UdpHeader {
            src_port: BigEndian::read_u16(&data[0..2]),
            dst_port: BigEndian::read_u16(&data[2..4]),
            length: BigEndian::read_u16(&data[4..6]),
            checksum: BigEndian::read_u16(&data[6..8]),
        })
    }

    /// Convert UDP header to bytes
    pub fn to_bytes(&self) -> [u8; UDP_HEADER_LEN] {
        let mut bytes = [0u8; UDP_HEADER_LEN];
        BigEndian::write_u16(&mut bytes[0..2], self.src_port);
        BigEndian::write_u16(&mut bytes[2..4], self.dst_port);
        BigEndian::write_u16(&mut bytes[4..6], self.length);
        BigEndian::write_u16(&mut bytes[6..8], self.checksum);
        bytes
    }
}

/// Names a socket in a [`UdpProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UdpHandle(usize);

/// Application callback for datagrams arriving on a bound socket.
pub trait UdpHandler {
    fn on_datagram(&mut self, ctx: &mut UdpContext<'_>, data: &[u8]);
}

/// Represents a UDP socket.
pub struct UdpSocket {
    handle: UdpHandle,
    local_ip: Ipv4Addr,
    local_port: u16,
    remote_ip: Ipv4Addr,
    remote_port: u16,
    listening: bool,
    handler: Option<Box<dyn UdpHandler>>,
}

impl UdpSocket {
    pub fn handle(&self) -> UdpHandle {
        self.handle
    }

    pub fn local_endpoint(&self) -> (Ipv4Addr, u16) {
        (self.local_ip, self.local_port)
    }

    /// The peer, or `0.0.0.0:0` while still listening.
    pub fn remote_endpoint(&self) -> (Ipv4Addr, u16) {
        (self.remote_ip, self.remote_port)
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    fn matches(&self, src: Ipv4Addr, dst: Ipv4Addr, header: &UdpHeader) -> bool {
        self.local_port == header.dst_port
            && self.local_ip == dst
            && (self.listening || (self.remote_ip == src && self.remote_port == header.src_port))
    }
}

/// What a [`UdpHandler`] sees of its socket while handling a datagram.
pub struct UdpContext<'a> {
    socket: &'a UdpSocket,
    ip: &'a mut dyn IpSend,
}

impl UdpContext<'_> {
    pub fn handle(&self) -> UdpHandle {
        self.socket.handle
    }

    pub fn local_port(&self) -> u16 {
        self.socket.local_port
    }

    pub fn remote_endpoint(&self) -> (Ipv4Addr, u16) {
        self.socket.remote_endpoint()
    }

    /// Send `data` back to the socket's peer.
    pub fn reply(&mut self, data: &[u8]) -> Result<(), NetError> {
        send_datagram(&mut *self.ip, self.socket, data)
    }
}

fn send_datagram(ip: &mut dyn IpSend, socket: &UdpSocket, data: &[u8]) -> Result<(), NetError> {
    if data.len() > MAX_UDP_PAYLOAD {
        return Err(NetError::PayloadTooLarge {
            size: data.len(),
            max: MAX_UDP_PAYLOAD,
        });
    }

    let total_len = UDP_HEADER_LEN + data.len();
    let header = UdpHeader {
        src_port: socket.local_port,
        dst_port: socket.remote_port,
        length: total_len as u16,
        checksum: 0,
    };

    let mut datagram = alloc_packet(total_len)?;
    datagram[..UDP_HEADER_LEN].copy_from_slice(&header.to_bytes());
    datagram[UDP_HEADER_LEN..].copy_from_slice(data);

    ip.send(socket.remote_ip, protocol::UDP, &datagram)
}

/// The UDP socket table.
pub struct UdpProvider {
    local_ip: Ipv4Addr,
    sockets: Vec<UdpSocket>,
    next_handle: usize,
    first_ephemeral: u16,
    next_port: u16,
}

impl UdpProvider {
    pub fn new(local_ip: Ipv4Addr, first_ephemeral: u16) -> Self {
        UdpProvider {
            local_ip,
            sockets: Vec::new(),
            next_handle: 0,
            first_ephemeral,
            next_port: first_ephemeral,
        }
    }

    /// Open a socket to `remote_ip:remote_port` from a fresh ephemeral port.
    pub fn connect(&mut self, remote_ip: Ipv4Addr, remote_port: u16) -> UdpHandle {
        let local_port = self.allocate_port();
        let handle = self.insert(local_port, remote_ip, remote_port, false);
        debug!("udp: {:?} {}:{} -> {}:{}", handle, self.local_ip, local_port, remote_ip, remote_port);
        handle
    }

    /// Open a socket that accepts the first peer to send to `port`.
    pub fn listen(&mut self, port: u16) -> UdpHandle {
        let handle = self.insert(port, Ipv4Addr::UNSPECIFIED, 0, true);
        debug!("udp: {:?} listening on {}:{}", handle, self.local_ip, port);
        handle
    }

    /// Attach the handler that receives this socket's datagrams.
    pub fn bind(&mut self, handle: UdpHandle, handler: Box<dyn UdpHandler>) -> Result<(), NetError> {
        let index = self.position(handle)?;
        self.sockets[index].handler = Some(handler);
        Ok(())
    }

    pub fn send(&self, ip: &mut dyn IpSend, handle: UdpHandle, data: &[u8]) -> Result<(), NetError> {
        let index = self.position(handle)?;
        send_datagram(ip, &self.sockets[index], data)
    }

    /// Remove the socket; its handler is dropped.
    pub fn disconnect(&mut self, handle: UdpHandle) -> Result<(), NetError> {
        let index = self.position(handle)?;
        self.sockets.swap_remove(index);
        debug!("udp: {:?} closed", handle);
        Ok(())
    }

    pub fn socket(&self, handle: UdpHandle) -> Option<&UdpSocket> {
        self.sockets.iter().find(|s| s.handle == handle)
    }

    pub fn sockets(&self) -> impl Iterator<Item = &UdpSocket> {
        self.sockets.iter()
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    fn insert(&mut self, local_port: u16, remote_ip: Ipv4Addr, remote_port: u16, listening: bool) -> UdpHandle {
        let handle = UdpHandle(self.next_handle);
        self.next_handle += 1;
        self.sockets.push(UdpSocket {
            handle,
            local_ip: self.local_ip,
            local_port,
            remote_ip,
            remote_port,
            listening,
            handler: None,
        });
        handle
    }

    fn position(&self, handle: UdpHandle) -> Result<usize, NetError> {
        self.sockets
            .iter()
            .position(|s| s.handle == handle)
            .ok_or(NetError::UnknownSocket)
    }

    fn allocate_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = port.checked_add(1).unwrap_or(self.first_ephemeral);
        port
    }
}

impl IpProtocolHandler for UdpProvider {
    fn on_datagram(
        &mut self,
        ip: &mut dyn IpSend,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, NetError> {
        let header = match UdpHeader::from_bytes(payload) {
            Some(header) => header,
            None => {
                trace!("udp: dropping short datagram from {}", src);
                return Ok(None);
            }
        };

        let index = match self.sockets.iter().position(|s| s.matches(src, dst, &header)) {
            Some(index) => index,
            None => {
                debug!("udp: no socket for {}:{} -> port {}", src, header.src_port, header.dst_port);
                return Ok(None);
            }
        };

        let socket = &mut self.sockets[index];
        if socket.listening {
            socket.listening = false;
            socket.remote_ip = src;
            socket.remote_port = header.src_port;
            debug!("udp: {:?} committed to {}:{}", socket.handle, src, header.src_port);
        }

        let end = (header.length as usize).clamp(UDP_HEADER_LEN, payload.len());
        let data = &payload[UDP_HEADER_LEN..end];

        if let Some(mut handler) = socket.handler.take() {
            let mut ctx = UdpContext { socket: &*socket, ip };
            handler.on_datagram(&mut ctx, data);
            socket.handler = Some(handler);
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 15);
    const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 2);
    const OTHER: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 3);

    #[derive(Default)]
    struct Recorder {
        sent: Vec<(Ipv4Addr, u8, Vec<u8>)>,
    }

    impl IpSend for Recorder {
        fn local_ip(&self) -> Ipv4Addr {
            LOCAL
        }

        fn send(&mut self, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> Result<(), NetError> {
            self.sent.push((dst, protocol, payload.to_vec()));
            Ok(())
        }
    }

    struct Collect(Rc<RefCell<Vec<Vec<u8>>>>);

    impl UdpHandler for Collect {
        fn on_datagram(&mut self, _ctx: &mut UdpContext<'_>, data: &[u8]) {
            self.0.borrow_mut().push(data.to_vec());
        }
    }

    struct Echo;

    impl UdpHandler for Echo {
        fn on_datagram(&mut self, ctx: &mut UdpContext<'_>, data: &[u8]) {
            ctx.reply(data).unwrap();
        }
    }

    fn datagram(src_port: u16, dst_port: u16, data: &[u8]) -> Vec<u8> {
        let header = UdpHeader {
            src_port,
            dst_port,
            length: (UDP_HEADER_LEN + data.len()) as u16,
            checksum: 0,
        };
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(data);
        bytes
    }

    #[test]
    fn test_connect_assigns_ephemeral_ports() {
        let mut udp = UdpProvider::new(LOCAL, 1024);
        let a = udp.connect(PEER, 53);
        let b = udp.connect(PEER, 53);
        assert_eq!(udp.socket(a).unwrap().local_endpoint(), (LOCAL, 1024));
        assert_eq!(udp.socket(b).unwrap().local_endpoint(), (LOCAL, 1025));
        assert_eq!(udp.socket(a).unwrap().remote_endpoint(), (PEER, 53));
    }

    #[test]
    fn test_ephemeral_counter_wraps() {
        let mut udp = UdpProvider::new(LOCAL, 65535);
        let a = udp.connect(PEER, 1);
        let b = udp.connect(PEER, 1);
        assert_eq!(udp.socket(a).unwrap().local_endpoint().1, 65535);
        assert_eq!(udp.socket(b).unwrap().local_endpoint().1, 65535);
    }

    #[test]
    fn test_send_builds_header_without_checksum() {
        let mut udp = UdpProvider::new(LOCAL, 1024);
        let mut ip = Recorder::default();
        let handle = udp.connect(PEER, 9000);

        udp.send(&mut ip, handle, b"hello").unwrap();

        let (dst, proto, bytes) = &ip.sent[0];
        assert_eq!(*dst, PEER);
        assert_eq!(*proto, protocol::UDP);
        let header = UdpHeader::from_bytes(bytes).unwrap();
        assert_eq!(header.src_port, 1024);
        assert_eq!(header.dst_port, 9000);
        assert_eq!(header.length, 13);
        assert_eq!(header.checksum, 0);
        assert_eq!(&bytes[UDP_HEADER_LEN..], b"hello");
    }

    #[test]
    fn test_send_rejects_oversized_payload() {
        let mut udp = UdpProvider::new(LOCAL, 1024);
        let mut ip = Recorder::default();
        let handle = udp.connect(PEER, 9000);
        let data = vec![0u8; MAX_UDP_PAYLOAD + 1];
        assert!(matches!(
            udp.send(&mut ip, handle, &data),
            Err(NetError::PayloadTooLarge { max: 1472, .. })
        ));
        assert!(ip.sent.is_empty());
    }

    #[test]
    fn test_listening_socket_commits_to_first_peer() {
        let mut udp = UdpProvider::new(LOCAL, 1024);
        let mut ip = Recorder::default();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let handle = udp.listen(7000);
        udp.bind(handle, Box::new(Collect(seen.clone()))).unwrap();

        udp.on_datagram(&mut ip, PEER, LOCAL, &datagram(4000, 7000, b"one")).unwrap();
        let socket = udp.socket(handle).unwrap();
        assert!(!socket.is_listening());
        assert_eq!(socket.remote_endpoint(), (PEER, 4000));

        // A second peer no longer matches the committed socket.
        udp.on_datagram(&mut ip, OTHER, LOCAL, &datagram(4000, 7000, b"two")).unwrap();
        // The committed peer still does.
        udp.on_datagram(&mut ip, PEER, LOCAL, &datagram(4000, 7000, b"three")).unwrap();

        assert_eq!(*seen.borrow(), vec![b"one".to_vec(), b"three".to_vec()]);
        assert_eq!(udp.sockets().filter(|s| !s.is_listening()).count(), 1);
    }

    #[test]
    fn test_handler_reply_goes_to_sender() {
        let mut udp = UdpProvider::new(LOCAL, 1024);
        let mut ip = Recorder::default();
        let handle = udp.listen(7);
        udp.bind(handle, Box::new(Echo)).unwrap();

        let reply = udp.on_datagram(&mut ip, PEER, LOCAL, &datagram(5555, 7, b"ping")).unwrap();
        assert!(reply.is_none());

        let (dst, _, bytes) = &ip.sent[0];
        assert_eq!(*dst, PEER);
        let header = UdpHeader::from_bytes(bytes).unwrap();
        assert_eq!((header.src_port, header.dst_port), (7, 5555));
        assert_eq!(&bytes[UDP_HEADER_LEN..], b"ping");
    }

    #[test]
    fn test_length_field_bounds_payload() {
        let mut udp = UdpProvider::new(LOCAL, 1024);
        let mut ip = Recorder::default();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let handle = udp.listen(7000);
        udp.bind(handle, Box::new(Collect(seen.clone()))).unwrap();

        let mut bytes = datagram(4000, 7000, b"abc");
        bytes.extend_from_slice(&[0, 0]);
        udp.on_datagram(&mut ip, PEER, LOCAL, &bytes).unwrap();
        assert_eq!(*seen.borrow(), vec![b"abc".to_vec()]);
    }

    #[test]
    fn test_short_and_unmatched_datagrams_are_dropped() {
        let mut udp = UdpProvider::new(LOCAL, 1024);
        let mut ip = Recorder::default();
        udp.listen(7000);

        udp.on_datagram(&mut ip, PEER, LOCAL, &[0; 7]).unwrap();
        udp.on_datagram(&mut ip, PEER, LOCAL, &datagram(4000, 7001, b"x")).unwrap();
        assert!(udp.sockets().all(|s| s.is_listening()));
    }

    #[test]
    fn test_disconnect_removes_socket() {
        let mut udp = UdpProvider::new(LOCAL, 1024);
        let a = udp.connect(PEER, 1);
        let b = udp.connect(PEER, 2);

        udp.disconnect(a).unwrap();
        assert_eq!(udp.len(), 1);
        assert!(udp.socket(a).is_none());
        assert!(udp.socket(b).is_some());
        assert!(matches!(udp.disconnect(a), Err(NetError::UnknownSocket)));
    }
}
