use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use log::{debug, trace};

use super::NetworkInterface;
use crate::dispatch::HandlerId;
use crate::error::NetError;
use crate::link::NetworkDevice;
use crate::network::icmp::ECHO_IDENTIFIER;
use crate::network::ipv4::{IpHandler, IpProtocolHandler, IpSend, Ipv4Sender};

impl<D: NetworkDevice> NetworkInterface<D> {
    /// Handle an IPv4 packet taken from an Ethernet frame.
    ///
    /// Returns the reply packet when the protocol handler answered in place.
    pub(super) fn receive_ipv4(&mut self, packet: &[u8]) -> Result<Option<Vec<u8>>, NetError> {
        let local_ip = self.link.local_ip();
        let (header, payload) = match self.ipv4.accept(local_ip, packet) {
            Some(accepted) => accepted,
            None => return Ok(None),
        };
        let header_len = header.header_len();

        let NetworkInterface {
            link,
            ipv4,
            icmp,
            udp,
            tcp,
            ..
        } = self;

        let (route, ttl, handlers) = ipv4.split();
        let handler: &mut dyn IpProtocolHandler = match handlers.get_mut(header.protocol) {
            Some(IpHandler::Icmp) => icmp,
            Some(IpHandler::Udp) => udp,
            Some(IpHandler::Tcp) => tcp,
            Some(IpHandler::Custom(handler)) => handler.as_mut(),
            None => {
                trace!("ipv4: no handler for protocol {} from {}", header.protocol, header.src_addr);
                return Ok(None);
            }
        };

        let mut sender = Ipv4Sender::new(link, route, ttl);
        let reply = handler.on_datagram(&mut sender, header.src_addr, header.dst_addr, payload)?;

        match reply {
            Some(reply) => Ok(Some(ipv4.echo_packet(&packet[..header_len], &reply)?)),
            None => Ok(None),
        }
    }

    /// Send `payload` to `dst` as an IPv4 packet carrying `protocol`.
    pub fn send_ipv4(&mut self, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> Result<(), NetError> {
        let mut sender = Ipv4Sender::new(&mut self.link, self.ipv4.route(), self.ipv4.ttl());
        sender.send(dst, protocol, payload)
    }

    /// Install `handler` for IP protocol `protocol`, replacing the current
    /// handler. Protocol 255 is reserved and refused.
    pub fn register_ip_handler(
        &mut self,
        protocol: u8,
        handler: Box<dyn IpProtocolHandler>,
    ) -> Result<HandlerId, NetError> {
        let id = self.ipv4.register_custom(protocol, handler)?;
        debug!("ipv4: handler registered for protocol {}", protocol);
        Ok(id)
    }

    pub fn unregister_ip_handler(&mut self, protocol: u8, id: HandlerId) -> bool {
        self.ipv4.unregister(protocol, id)
    }

    /// Send one echo request to `dst` and return its sequence number.
    pub fn request_echo(&mut self, dst: Ipv4Addr) -> Result<u16, NetError> {
        let mut sender = Ipv4Sender::new(&mut self.link, self.ipv4.route(), self.ipv4.ttl());
        self.icmp.request_echo(&mut sender, dst)
    }

    /// Ping `dst` and wait up to `timeout` for the answer.
    ///
    /// Returns the round-trip time, or `None` if no reply came back in time.
    pub fn ping(&mut self, dst: Ipv4Addr, timeout: Duration) -> Result<Option<Duration>, NetError> {
        let start = Instant::now();
        let sequence = self.request_echo(dst)?;

        let answered = self.poll_until(timeout, |iface| {
            iface
                .icmp
                .replies()
                .any(|r| r.from == dst && r.identifier == ECHO_IDENTIFIER && r.sequence == sequence)
        })?;
        if !answered {
            debug!("icmp: no reply from {} for sequence {}", dst, sequence);
            return Ok(None);
        }

        self.icmp.take_reply(dst, sequence);
        Ok(Some(start.elapsed()))
    }
}
