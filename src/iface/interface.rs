//! Network interface and frame processing
//!
//! [`NetworkInterface`] owns every layer of the stack and is the only entry
//! point for received frames. Processing is strictly one frame at a time:
//! a frame is fully handled, including any replies it triggers, before the
//! next one is read from the device.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::buffer::alloc_packet;
use crate::config::StackConfig;
use crate::dispatch::HandlerId;
use crate::error::NetError;
use crate::link::ethernet::{EtherHandler, EthernetFrame, ETHERNET_HEADER_LEN, ETHERTYPE_ARP, ETHERTYPE_IPV4};
use crate::link::{EtherFrameHandler, EthernetLayer, Link, MacAddr, NetworkDevice};
use crate::network::icmp::Icmp;
use crate::network::ipv4::{protocol, IpHandler, Ipv4Layer, Ipv4Route, Ipv4Sender};
use crate::transport::tcp::{TcpHandle, TcpHandler, TcpProvider, TcpSocket, TcpState};
use crate::transport::udp::{UdpHandle, UdpHandler, UdpProvider, UdpSocket};

/// Longest single device wait inside a blocking call.
const POLL_SLICE: Duration = Duration::from_millis(10);

/// The whole stack bound to one device.
pub struct NetworkInterface<D> {
    pub(super) link: Link<D>,
    pub(super) ethernet: EthernetLayer,
    pub(super) ipv4: Ipv4Layer,
    pub(super) icmp: Icmp,
    pub(super) udp: UdpProvider,
    pub(super) tcp: TcpProvider,
    pub(super) config: StackConfig,
}

impl<D: NetworkDevice> NetworkInterface<D> {
    /// Build the stack on `device` with ARP, IPv4, ICMP, UDP and TCP
    /// registered.
    ///
    /// The device must carry the IP and MAC address named in `config`.
    pub fn new(device: D, config: StackConfig) -> Result<Self, NetError> {
        let local_ip = device.ip_address();
        if local_ip != config.ip {
            return Err(NetError::AddressMismatch {
                configured: config.ip.to_string(),
                device: local_ip.to_string(),
            });
        }
        if device.mac_address() != config.mac {
            return Err(NetError::AddressMismatch {
                configured: config.mac.to_string(),
                device: device.mac_address().to_string(),
            });
        }

        let link = Link::new(device, &config);

        let mut ethernet = EthernetLayer::new();
        ethernet.register(ETHERTYPE_ARP, EtherHandler::Arp);
        ethernet.register(ETHERTYPE_IPV4, EtherHandler::Ipv4);

        let mut ipv4 = Ipv4Layer::new(Ipv4Route::new(config.gateway, config.subnet_mask), config.ttl);
        ipv4.register(protocol::ICMP, IpHandler::Icmp);
        ipv4.register(protocol::UDP, IpHandler::Udp);
        ipv4.register(protocol::TCP, IpHandler::Tcp);

        debug!("iface: up as {} / {}", local_ip, link.local_mac());
        Ok(NetworkInterface {
            link,
            ethernet,
            ipv4,
            icmp: Icmp::new(),
            udp: UdpProvider::new(local_ip, config.first_ephemeral_port),
            tcp: TcpProvider::new(local_ip, config.first_ephemeral_port, config.tcp_initial_sequence),
            config,
        })
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn device(&self) -> &D {
        self.link.device()
    }

    pub fn device_mut(&mut self) -> &mut D {
        self.link.device_mut()
    }

    pub fn local_ip(&self) -> Ipv4Addr {
        self.link.local_ip()
    }

    pub fn local_mac(&self) -> MacAddr {
        self.link.local_mac()
    }

    pub fn icmp(&self) -> &Icmp {
        &self.icmp
    }

    /// Run one received frame through the stack.
    ///
    /// Returns the frame to send back when a layer answered in place (ARP
    /// request, ICMP echo, or a custom handler). Malformed or unclaimed frames
    /// are dropped and yield `Ok(None)`; errors come only from sends the frame
    /// triggered.
    pub fn receive_frame(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>, NetError> {
        let local_mac = self.link.local_mac();
        let local_ip = self.link.local_ip();

        let (header, payload) = match EthernetFrame::accept(frame, local_mac) {
            Some(accepted) => accepted,
            None => return Ok(None),
        };

        let reply = match self.ethernet.handler_mut(header.ether_type) {
            Some(EtherHandler::Arp) => self
                .link
                .arp_mut()
                .on_message(local_ip, local_mac, payload)
                .map(|message| message.to_bytes().to_vec()),
            Some(EtherHandler::Ipv4) => self.receive_ipv4(payload)?,
            Some(EtherHandler::Custom(handler)) => handler.on_frame(payload),
            None => {
                trace!("eth: no handler for ethertype {:#06x}", header.ether_type);
                None
            }
        };

        let reply = match reply {
            Some(reply) => reply,
            None => return Ok(None),
        };
        if reply.len() > self.link.mtu() {
            return Err(NetError::PayloadTooLarge {
                size: reply.len(),
                max: self.link.mtu(),
            });
        }
        Ok(Some(header.echo(local_mac).encapsulate(&reply)?))
    }

    /// Process frames left over from a blocking resolve, then wait up to
    /// `timeout` for one more from the device.
    ///
    /// Returns how many frames were handled. Errors raised while handling a
    /// frame are logged and do not stop processing; only device errors are
    /// returned.
    pub fn poll(&mut self, timeout: Duration) -> Result<usize, NetError> {
        let mut handled = 0;
        while let Some(frame) = self.link.take_deferred() {
            self.dispatch(&frame);
            handled += 1;
        }

        let wait = if handled > 0 { Duration::ZERO } else { timeout };
        let mut buf = alloc_packet(ETHERNET_HEADER_LEN + self.link.mtu())?;
        if let Some(len) = self.link.device_mut().recv(&mut buf, wait)? {
            self.dispatch(&buf[..len]);
            handled += 1;
        }
        Ok(handled)
    }

    fn dispatch(&mut self, frame: &[u8]) {
        match self.receive_frame(frame) {
            Ok(Some(reply)) => {
                let sent = match EthernetFrame::from_bytes(&reply) {
                    Some(header) => self
                        .link
                        .send_frame(header.dst, header.ether_type, &reply[ETHERNET_HEADER_LEN..]),
                    None => Ok(()),
                };
                if let Err(e) = sent {
                    warn!("iface: failed to send reply: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("iface: error while handling frame: {}", e),
        }
    }

    /// Poll until `done` holds or `limit` has passed. Returns whether `done`
    /// held.
    pub(super) fn poll_until<F>(&mut self, limit: Duration, mut done: F) -> Result<bool, NetError>
    where
        F: FnMut(&Self) -> bool,
    {
        let deadline = Instant::now() + limit;
        loop {
            if done(self) {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.poll((deadline - now).min(POLL_SLICE))?;
        }
    }

    /// Install a handler for an EtherType, replacing any previous one.
    ///
    /// A handler for ARP only sees frames handled by [`poll`](Self::poll);
    /// replies that arrive during a blocking resolve go to the built-in
    /// resolver.
    pub fn register_ether_handler(&mut self, ether_type: u16, handler: Box<dyn EtherFrameHandler>) -> HandlerId {
        self.ethernet.register_custom(ether_type, handler)
    }

    pub fn unregister_ether_handler(&mut self, ether_type: u16, id: HandlerId) -> bool {
        self.ethernet.unregister(ether_type, id)
    }

    /// Map `ip` to its MAC address, asking the network on a cache miss.
    ///
    /// Blocks for at most the configured ARP timeout.
    pub fn resolve(&mut self, ip: Ipv4Addr) -> Result<MacAddr, NetError> {
        self.link.resolve(ip)
    }

    pub fn arp_lookup(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.link.arp().lookup(ip)
    }

    /// Broadcast a who-has for `ip` without waiting for the answer.
    pub fn request_mac(&mut self, ip: Ipv4Addr) -> Result<(), NetError> {
        self.link.request_mac(ip)
    }

    /// Announce our address pair to the host owning `ip`.
    pub fn broadcast_mac(&mut self, ip: Ipv4Addr) -> Result<(), NetError> {
        self.link.broadcast_mac(ip)
    }

    pub fn udp_connect(&mut self, ip: Ipv4Addr, port: u16) -> UdpHandle {
        self.udp.connect(ip, port)
    }

    pub fn udp_listen(&mut self, port: u16) -> UdpHandle {
        self.udp.listen(port)
    }

    pub fn udp_bind(&mut self, handle: UdpHandle, handler: Box<dyn UdpHandler>) -> Result<(), NetError> {
        self.udp.bind(handle, handler)
    }

    pub fn udp_send(&mut self, handle: UdpHandle, data: &[u8]) -> Result<(), NetError> {
        let mut ip = Ipv4Sender::new(&mut self.link, self.ipv4.route(), self.ipv4.ttl());
        self.udp.send(&mut ip, handle, data)
    }

    pub fn udp_disconnect(&mut self, handle: UdpHandle) -> Result<(), NetError> {
        self.udp.disconnect(handle)
    }

    pub fn udp_socket(&self, handle: UdpHandle) -> Option<&UdpSocket> {
        self.udp.socket(handle)
    }

    /// Start a TCP handshake with `ip:port`. Returns once the SYN is out.
    pub fn tcp_connect(&mut self, ip: Ipv4Addr, port: u16) -> Result<TcpHandle, NetError> {
        let mut sender = Ipv4Sender::new(&mut self.link, self.ipv4.route(), self.ipv4.ttl());
        self.tcp.connect(&mut sender, ip, port)
    }

    pub fn tcp_listen(&mut self, port: u16) -> TcpHandle {
        self.tcp.listen(port)
    }

    pub fn tcp_bind(&mut self, handle: TcpHandle, handler: Box<dyn TcpHandler>) -> Result<(), NetError> {
        self.tcp.bind(handle, handler)
    }

    /// Send `data` once the connection is established.
    ///
    /// A socket still in its handshake is polled for up to the configured
    /// connect timeout before giving up with `ConnectTimeout`.
    pub fn tcp_send(&mut self, handle: TcpHandle, data: &[u8]) -> Result<(), NetError> {
        let limit = self.config.connect_timeout;
        let settled = self.poll_until(limit, |iface| {
            !matches!(
                iface.tcp.state(handle),
                Some(TcpState::Listen | TcpState::SynSent | TcpState::SynReceived)
            )
        })?;
        if !settled {
            return Err(NetError::ConnectTimeout { waited: limit });
        }

        let mut sender = Ipv4Sender::new(&mut self.link, self.ipv4.route(), self.ipv4.ttl());
        self.tcp.send(&mut sender, handle, data)
    }

    /// Start closing the connection with a `FIN|ACK`.
    pub fn tcp_disconnect(&mut self, handle: TcpHandle) -> Result<(), NetError> {
        let mut sender = Ipv4Sender::new(&mut self.link, self.ipv4.route(), self.ipv4.ttl());
        self.tcp.disconnect(&mut sender, handle)
    }

    /// `None` once the socket has closed and been removed.
    pub fn tcp_state(&self, handle: TcpHandle) -> Option<TcpState> {
        self.tcp.state(handle)
    }

    pub fn tcp_socket(&self, handle: TcpHandle) -> Option<&TcpSocket> {
        self.tcp.socket(handle)
    }
}
