//! TCP (Transmission Control Protocol) implementation
//!
//! This module provides TCP segment parsing and serialization, the socket
//! table, and a reduced RFC 793 connection state machine. Reliability is
//! purely ACK driven: there are no retransmission timers, no congestion
//! control and no out-of-order reassembly. A segment that does not carry the
//! next expected sequence number is answered with a reset.

use std::net::Ipv4Addr;

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};
use log::{debug, info, trace};

use crate::buffer::alloc_packet;
use crate::error::NetError;
use crate::network::checksum;
use crate::network::ipv4::{protocol, IpProtocolHandler, IpSend};

/// TCP header length without options
pub const TCP_HEADER_LEN: usize = 20;

/// Maximum segment size we advertise and send.
pub const TCP_MSS: usize = 1460;

/// Kind 2 (MSS), length 4, value 1460. Carried on every SYN.
const MSS_OPTION: [u8; 4] = [2, 4, 0x05, 0xB4];

const PSEUDO_HEADER_LEN: usize = 12;
const WINDOW_SIZE: u16 = 0xFFFF;

bitflags! {
    /// TCP control bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
        const ECE = 0x40;
        const CWR = 0x80;
    }
}

// Control-bit combinations the state machine distinguishes.
const CTL_SYN: u8 = TcpFlags::SYN.bits();
const CTL_ACK: u8 = TcpFlags::ACK.bits();
const CTL_FIN: u8 = TcpFlags::FIN.bits();
const CTL_SYN_ACK: u8 = CTL_SYN | CTL_ACK;
const CTL_SYN_FIN: u8 = CTL_SYN | CTL_FIN;
const CTL_SYN_FIN_ACK: u8 = CTL_SYN | CTL_FIN | CTL_ACK;
const CTL_FIN_ACK: u8 = CTL_FIN | CTL_ACK;

/// TCP connection states as defined in RFC 793
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
    CloseWait,
}

/// TCP packet header structure
///
/// Represents the standard 20-byte TCP header as defined in RFC 793
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    pub data_offset_and_flags: u16, // Data offset (4 bits) + Reserved (4 bits) + Flags (8 bits)
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

impl TcpHeader {
    /// Header for an outgoing segment whose header (with options) is
    /// `header_len` bytes. The checksum is left zero.
    pub fn new(src_port: u16, dst_port: u16, seq_number: u32, ack_number: u32, flags: TcpFlags, header_len: usize) -> Self {
        TcpHeader {
            src_port,
            dst_port,
            seq_number,
            ack_number,
            data_offset_and_flags: (((header_len / 4) as u16) << 12) | flags.bits() as u16,
            window_size: WINDOW_SIZE,
            checksum: 0,
            urgent_ptr: 0,
        }
    }

    /// Parse TCP header from byte slice
    ///
    /// Returns None if the data is too short to contain a valid TCP header
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < TCP_HEADER_LEN {
            return None;
        }

        Some(TcpHeader {
            src_port: BigEndian::read_u16(&data[0..2]),
            dst_port: BigEndian::read_u16(&data[2..4]),
            seq_number: BigEndian::read_u32(&data[4..8]),
            ack_number: BigEndian::read_u32(&data[8..12]),
            data_offset_and_flags: BigEndian::read_u16(&data[12..14]),
            window_size: BigEndian::read_u16(&data[14..16]),
            checksum: BigEndian::read_u16(&data[16..18]),
            urgent_ptr: BigEndian::read_u16(&data[18..20]),
        })
    }

    /// Convert TCP header to bytes
    pub fn to_bytes(&self) -> [u8; TCP_HEADER_LEN] {
        let mut bytes = [0u8; TCP_HEADER_LEN];
        BigEndian::write_u16(&mut bytes[0..2], self.src_port);
        BigEndian::write_u16(&mut bytes[2..4], self.dst_port);
        BigEndian::write_u32(&mut bytes[4..8], self.seq_number);
        BigEndian::write_u32(&mut bytes[8..12], self.ack_number);
        BigEndian::write_u16(&mut bytes[12..14], self.data_offset_and_flags);
        BigEndian::write_u16(&mut bytes[14..16], self.window_size);
        BigEndian::write_u16(&mut bytes[16..18], self.checksum);
        BigEndian::write_u16(&mut bytes[18..20], self.urgent_ptr);
        bytes
    }

    pub fn flags(&self) -> TcpFlags {
        TcpFlags::from_bits_truncate(self.data_offset_and_flags as u8)
    }

    /// Get the data offset (header length) in bytes
    pub fn data_offset(&self) -> usize {
        ((self.data_offset_and_flags >> 12) as usize) * 4
    }
}

/// Names a socket in a [`TcpProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpHandle(usize);

/// Application callback for data arriving on a bound socket.
pub trait TcpHandler {
    /// Consume `data`. Returning `false` rejects it and resets the
    /// connection.
    fn on_data(&mut self, conn: &mut TcpConnection<'_>, data: &[u8]) -> bool;
}

/// One connection (or listener) in the socket table.
pub struct TcpSocket {
    handle: TcpHandle,
    local_ip: Ipv4Addr,
    local_port: u16,
    remote_ip: Ipv4Addr,
    remote_port: u16,
    sequence_number: u32,
    acknowledgement_number: u32,
    state: TcpState,
    handler: Option<Box<dyn TcpHandler>>,
}

impl TcpSocket {
    fn new(handle: TcpHandle, local_ip: Ipv4Addr, local_port: u16, remote_ip: Ipv4Addr, remote_port: u16) -> Self {
        TcpSocket {
            handle,
            local_ip,
            local_port,
            remote_ip,
            remote_port,
            sequence_number: 0,
            acknowledgement_number: 0,
            state: TcpState::Closed,
            handler: None,
        }
    }

    pub fn handle(&self) -> TcpHandle {
        self.handle
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    pub fn local_endpoint(&self) -> (Ipv4Addr, u16) {
        (self.local_ip, self.local_port)
    }

    pub fn remote_endpoint(&self) -> (Ipv4Addr, u16) {
        (self.remote_ip, self.remote_port)
    }

    /// Sequence number of the next byte we send.
    pub fn sequence_number(&self) -> u32 {
        self.sequence_number
    }

    /// Next sequence number we expect from the peer.
    pub fn acknowledgement_number(&self) -> u32 {
        self.acknowledgement_number
    }

    fn set_state(&mut self, state: TcpState) {
        if self.state != state {
            debug!("tcp: {:?} {:?} -> {:?}", self.handle, self.state, state);
            self.state = state;
        }
    }

    fn accepts(&self, src: Ipv4Addr, dst: Ipv4Addr, header: &TcpHeader) -> bool {
        if self.local_port != header.dst_port || self.local_ip != dst {
            return false;
        }
        let new_connection = self.state == TcpState::Listen
            && header.flags() & (TcpFlags::SYN | TcpFlags::ACK) == TcpFlags::SYN;
        new_connection || (self.remote_port == header.src_port && self.remote_ip == src)
    }

    /// Drive the state machine with one inbound segment that is not a reset.
    fn on_segment(
        &mut self,
        ip: &mut dyn IpSend,
        src: Ipv4Addr,
        header: &TcpHeader,
        data: &[u8],
        initial_sequence: u32,
    ) -> Result<(), NetError> {
        let control = header.flags() & (TcpFlags::SYN | TcpFlags::ACK | TcpFlags::FIN);

        let reset = match control.bits() {
            CTL_SYN => {
                if self.state == TcpState::Listen {
                    self.remote_ip = src;
                    self.remote_port = header.src_port;
                    self.acknowledgement_number = header.seq_number.wrapping_add(1);
                    self.sequence_number = initial_sequence;
                    self.set_state(TcpState::SynReceived);
                    send_segment(ip, self, TcpFlags::SYN | TcpFlags::ACK, &[])?;
                    self.sequence_number = self.sequence_number.wrapping_add(1);
                    false
                } else {
                    true
                }
            }
            CTL_SYN_ACK => {
                if self.state == TcpState::SynSent {
                    self.acknowledgement_number = header.seq_number.wrapping_add(1);
                    self.sequence_number = self.sequence_number.wrapping_add(1);
                    self.set_state(TcpState::Established);
                    info!("tcp: connected to {}:{}", self.remote_ip, self.remote_port);
                    send_segment(ip, self, TcpFlags::ACK, &[])?;
                    false
                } else {
                    true
                }
            }
            CTL_SYN_FIN | CTL_SYN_FIN_ACK => true,
            CTL_FIN | CTL_FIN_ACK => match self.state {
                TcpState::Established => {
                    self.set_state(TcpState::CloseWait);
                    self.acknowledgement_number = self.acknowledgement_number.wrapping_add(1);
                    send_segment(ip, self, TcpFlags::ACK, &[])?;
                    send_segment(ip, self, TcpFlags::FIN | TcpFlags::ACK, &[])?;
                    false
                }
                TcpState::CloseWait => {
                    self.set_state(TcpState::Closed);
                    false
                }
                TcpState::FinWait1 | TcpState::FinWait2 => {
                    self.set_state(TcpState::Closed);
                    self.acknowledgement_number = self.acknowledgement_number.wrapping_add(1);
                    send_segment(ip, self, TcpFlags::ACK, &[])?;
                    false
                }
                _ => true,
            },
            CTL_ACK => match self.state {
                TcpState::SynReceived => {
                    self.set_state(TcpState::Established);
                    info!("tcp: accepted {}:{}", self.remote_ip, self.remote_port);
                    return Ok(());
                }
                TcpState::FinWait1 => {
                    self.set_state(TcpState::FinWait2);
                    return Ok(());
                }
                TcpState::CloseWait => {
                    self.set_state(TcpState::Closed);
                    false
                }
                _ if data.is_empty() => false,
                _ => self.deliver(ip, header, data)?,
            },
            _ => self.deliver(ip, header, data)?,
        };

        if reset {
            debug!("tcp: {:?} resetting in {:?} on {:?}", self.handle, self.state, header.flags());
            send_segment(ip, self, TcpFlags::RST, &[])?;
        }
        Ok(())
    }

    /// Hand in-sequence data to the handler and acknowledge it.
    ///
    /// Returns whether the connection must be reset.
    fn deliver(&mut self, ip: &mut dyn IpSend, header: &TcpHeader, data: &[u8]) -> Result<bool, NetError> {
        if header.seq_number != self.acknowledgement_number {
            debug!(
                "tcp: {:?} expected seq {:#x}, got {:#x}",
                self.handle, self.acknowledgement_number, header.seq_number
            );
            return Ok(true);
        }
        if data.is_empty() {
            return Ok(false);
        }

        let accepted = match self.handler.take() {
            Some(mut handler) => {
                let accepted = {
                    let mut conn = TcpConnection { socket: &mut *self, ip: &mut *ip };
                    handler.on_data(&mut conn, data)
                };
                self.handler = Some(handler);
                accepted
            }
            None => false,
        };
        if !accepted {
            return Ok(true);
        }

        self.acknowledgement_number = self.acknowledgement_number.wrapping_add(data.len() as u32);
        send_segment(ip, self, TcpFlags::ACK, &[])?;
        Ok(false)
    }
}

/// What a [`TcpHandler`] sees of its connection while handling data.
pub struct TcpConnection<'a> {
    socket: &'a mut TcpSocket,
    ip: &'a mut dyn IpSend,
}

impl TcpConnection<'_> {
    pub fn handle(&self) -> TcpHandle {
        self.socket.handle
    }

    pub fn state(&self) -> TcpState {
        self.socket.state
    }

    pub fn remote_endpoint(&self) -> (Ipv4Addr, u16) {
        self.socket.remote_endpoint()
    }

    /// Send `data` on this connection.
    pub fn send(&mut self, data: &[u8]) -> Result<(), NetError> {
        send_data(&mut *self.ip, &mut *self.socket, data)
    }

    /// Start closing this connection.
    pub fn disconnect(&mut self) -> Result<(), NetError> {
        close(&mut *self.ip, &mut *self.socket)
    }
}

/// Build one segment from the socket's current numbers and send it.
///
/// The pseudo-header is laid out in front of the segment so the checksum is
/// taken over one contiguous buffer. The sequence number advances by the
/// payload length only; SYN and FIN are accounted for by the caller.
fn send_segment(ip: &mut dyn IpSend, socket: &mut TcpSocket, flags: TcpFlags, data: &[u8]) -> Result<(), NetError> {
    let options: &[u8] = if flags.contains(TcpFlags::SYN) { &MSS_OPTION } else { &[] };
    let header_len = TCP_HEADER_LEN + options.len();
    let segment_len = header_len + data.len();

    let mut buf = alloc_packet(PSEUDO_HEADER_LEN + segment_len)?;
    buf[0..4].copy_from_slice(&socket.local_ip.octets());
    buf[4..8].copy_from_slice(&socket.remote_ip.octets());
    buf[8] = 0;
    buf[9] = protocol::TCP;
    BigEndian::write_u16(&mut buf[10..12], segment_len as u16);

    let header = TcpHeader::new(
        socket.local_port,
        socket.remote_port,
        socket.sequence_number,
        socket.acknowledgement_number,
        flags,
        header_len,
    );
    let segment = &mut buf[PSEUDO_HEADER_LEN..];
    segment[..TCP_HEADER_LEN].copy_from_slice(&header.to_bytes());
    segment[TCP_HEADER_LEN..header_len].copy_from_slice(options);
    segment[header_len..].copy_from_slice(data);

    let sum = checksum(&buf);
    BigEndian::write_u16(&mut buf[PSEUDO_HEADER_LEN + 16..PSEUDO_HEADER_LEN + 18], sum);

    trace!(
        "tcp: {:?} send {:?} seq {:#x} ack {:#x} len {}",
        socket.handle,
        flags,
        socket.sequence_number,
        socket.acknowledgement_number,
        data.len()
    );
    ip.send(socket.remote_ip, protocol::TCP, &buf[PSEUDO_HEADER_LEN..])?;
    socket.sequence_number = socket.sequence_number.wrapping_add(data.len() as u32);
    Ok(())
}

/// Send application data as MSS-sized `PSH|ACK` segments.
fn send_data(ip: &mut dyn IpSend, socket: &mut TcpSocket, data: &[u8]) -> Result<(), NetError> {
    if socket.state != TcpState::Established {
        return Err(NetError::NotConnected(socket.state));
    }
    for chunk in data.chunks(TCP_MSS) {
        send_segment(ip, socket, TcpFlags::PSH | TcpFlags::ACK, chunk)?;
    }
    Ok(())
}

fn close(ip: &mut dyn IpSend, socket: &mut TcpSocket) -> Result<(), NetError> {
    socket.set_state(TcpState::FinWait1);
    send_segment(ip, socket, TcpFlags::FIN | TcpFlags::ACK, &[])?;
    socket.sequence_number = socket.sequence_number.wrapping_add(1);
    Ok(())
}

/// The TCP socket table.
pub struct TcpProvider {
    local_ip: Ipv4Addr,
    sockets: Vec<TcpSocket>,
    next_handle: usize,
    first_ephemeral: u16,
    next_port: u16,
    initial_sequence: u32,
}

impl TcpProvider {
    pub fn new(local_ip: Ipv4Addr, first_ephemeral: u16, initial_sequence: u32) -> Self {
        TcpProvider {
            local_ip,
            sockets: Vec::new(),
            next_handle: 0,
            first_ephemeral,
            next_port: first_ephemeral,
            initial_sequence,
        }
    }

    /// Open a connection to `remote_ip:remote_port` by sending a SYN.
    ///
    /// Returns as soon as the SYN is sent; the socket is `SynSent` until the
    /// peer answers.
    pub fn connect(&mut self, ip: &mut dyn IpSend, remote_ip: Ipv4Addr, remote_port: u16) -> Result<TcpHandle, NetError> {
        let local_port = self.allocate_port();
        let handle = self.insert(local_port, remote_ip, remote_port);
        let index = self.sockets.len() - 1;

        let socket = &mut self.sockets[index];
        socket.set_state(TcpState::SynSent);
        socket.sequence_number = self.initial_sequence;
        if let Err(e) = send_segment(ip, socket, TcpFlags::SYN, &[]) {
            self.sockets.swap_remove(index);
            return Err(e);
        }
        Ok(handle)
    }

    /// Open a listener on `port`. It turns into the connection for the first
    /// SYN it receives.
    pub fn listen(&mut self, port: u16) -> TcpHandle {
        let handle = self.insert(port, Ipv4Addr::UNSPECIFIED, 0);
        if let Some(socket) = self.sockets.last_mut() {
            socket.set_state(TcpState::Listen);
        }
        handle
    }

    /// Attach the handler that receives this socket's data.
    pub fn bind(&mut self, handle: TcpHandle, handler: Box<dyn TcpHandler>) -> Result<(), NetError> {
        let index = self.position(handle)?;
        self.sockets[index].handler = Some(handler);
        Ok(())
    }

    /// Send `data` on an established connection.
    pub fn send(&mut self, ip: &mut dyn IpSend, handle: TcpHandle, data: &[u8]) -> Result<(), NetError> {
        let index = self.position(handle)?;
        send_data(ip, &mut self.sockets[index], data)
    }

    /// Start an active close: `FinWait1` and a `FIN|ACK`.
    pub fn disconnect(&mut self, ip: &mut dyn IpSend, handle: TcpHandle) -> Result<(), NetError> {
        let index = self.position(handle)?;
        close(ip, &mut self.sockets[index])
    }

    pub fn state(&self, handle: TcpHandle) -> Option<TcpState> {
        self.socket(handle).map(TcpSocket::state)
    }

    pub fn socket(&self, handle: TcpHandle) -> Option<&TcpSocket> {
        self.sockets.iter().find(|s| s.handle == handle)
    }

    pub fn sockets(&self) -> impl Iterator<Item = &TcpSocket> {
        self.sockets.iter()
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    fn insert(&mut self, local_port: u16, remote_ip: Ipv4Addr, remote_port: u16) -> TcpHandle {
        let handle = TcpHandle(self.next_handle);
        self.next_handle += 1;
        self.sockets
            .push(TcpSocket::new(handle, self.local_ip, local_port, remote_ip, remote_port));
        debug!("tcp: {:?} opened on {}:{}", handle, self.local_ip, local_port);
        handle
    }

    fn position(&self, handle: TcpHandle) -> Result<usize, NetError> {
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

/// Answer a segment nobody owns with a reset built from its own numbers.
fn reset_unmatched(ip: &mut dyn IpSend, src: Ipv4Addr, dst: Ipv4Addr, header: &TcpHeader) -> Result<(), NetError> {
    let mut socket = TcpSocket::new(TcpHandle(usize::MAX), dst, header.dst_port, src, header.src_port);
    socket.sequence_number = header.ack_number;
    socket.acknowledgement_number = header.seq_number.wrapping_add(1);
    send_segment(ip, &mut socket, TcpFlags::RST, &[])
}

impl IpProtocolHandler for TcpProvider {
    fn on_datagram(
        &mut self,
        ip: &mut dyn IpSend,
        src: Ipv4Addr,
        dst: Ipv4Addr,
        payload: &[u8],
    ) -> Result<Option<Vec<u8>>, NetError> {
        let header = match TcpHeader::from_bytes(payload) {
            Some(header) => header,
            None => {
                trace!("tcp: dropping short segment from {}", src);
                return Ok(None);
            }
        };

        let data_offset = header.data_offset();
        if data_offset < TCP_HEADER_LEN || data_offset > payload.len() {
            trace!("tcp: dropping segment with data offset {}", data_offset);
            return Ok(None);
        }
        let data = &payload[data_offset..];
        let flags = header.flags();

        let index = match self.sockets.iter().position(|s| s.accepts(src, dst, &header)) {
            Some(index) => index,
            None => {
                if !flags.contains(TcpFlags::RST) {
                    debug!("tcp: no socket for {}:{} -> port {}", src, header.src_port, header.dst_port);
                    reset_unmatched(ip, src, dst, &header)?;
                }
                return Ok(None);
            }
        };

        let result = if flags.contains(TcpFlags::RST) {
            self.sockets[index].set_state(TcpState::Closed);
            Ok(())
        } else {
            let initial_sequence = self.initial_sequence;
            self.sockets[index].on_segment(ip, src, &header, data, initial_sequence)
        };

        if self.sockets[index].state == TcpState::Closed {
            let socket = self.sockets.swap_remove(index);
            debug!("tcp: {:?} removed", socket.handle);
        }

        result.map(|()| None)
    }
}
