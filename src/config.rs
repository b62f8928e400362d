//! Stack configuration.

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::error::NetError;
use crate::link::MacAddr;

/// Tunables for one [`NetworkInterface`](crate::iface::NetworkInterface).
///
/// The defaults match the QEMU user-mode network: the guest is `10.0.2.15/24`
/// behind the gateway `10.0.2.2`.
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub gateway: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    /// TTL written into every sent or echoed IPv4 header.
    pub ttl: u8,
    pub arp_cache_capacity: usize,
    /// Upper bound on a blocking ARP resolve.
    pub arp_timeout: Duration,
    /// Upper bound on waiting for a TCP handshake before sending data.
    pub connect_timeout: Duration,
    pub first_ephemeral_port: u16,
    pub tcp_initial_sequence: u32,
    /// Largest Ethernet payload the device accepts.
    pub mtu: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            ip: Ipv4Addr::new(10, 0, 2, 15),
            mac: MacAddr([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]),
            gateway: Ipv4Addr::new(10, 0, 2, 2),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            ttl: 64,
            arp_cache_capacity: 128,
            arp_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(10),
            first_ephemeral_port: 1024,
            tcp_initial_sequence: 0xbeef_cafe,
            mtu: 1500,
        }
    }
}

impl StackConfig {
    /// Set address and subnet mask from `a.b.c.d/prefix` notation.
    pub fn with_cidr(mut self, cidr: &str) -> Result<Self, NetError> {
        let (ip, mask) = parse_cidr(cidr)?;
        self.ip = ip;
        self.subnet_mask = mask;
        Ok(self)
    }

    pub fn with_gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn with_mac(mut self, mac: MacAddr) -> Self {
        self.mac = mac;
        self
    }

    pub fn with_arp_timeout(mut self, timeout: Duration) -> Self {
        self.arp_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Parse `a.b.c.d/prefix` into an address and its netmask.
pub fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, Ipv4Addr), NetError> {
    let invalid = || NetError::InvalidAddress(cidr.to_string());

    let (addr, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    let ip: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
    let prefix: u32 = prefix.parse().map_err(|_| invalid())?;
    if prefix > 32 {
        return Err(invalid());
    }

    let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
    Ok((ip, Ipv4Addr::from(mask)))
}
