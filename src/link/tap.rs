//! Linux TAP interface as the NIC.
//!
//! The kernel side of the TAP interface acts as the peer host; the stack owns
//! the MAC and IP address given at construction.

use std::io;
use std::net::Ipv4Addr;
use std::thread;
use std::time::{Duration, Instant};

use log::debug;
use tun_tap::{Iface, Mode};

use super::{MacAddr, NetworkDevice};
use crate::error::NetError;

/// How long `recv` sleeps between reads of the non-blocking descriptor.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

pub struct TapDevice {
    iface: Iface,
    mac: MacAddr,
    ip: Ipv4Addr,
}

impl TapDevice {
    /// Create (or attach to) the TAP interface `name`.
    ///
    /// Requires `CAP_NET_ADMIN`.
    pub fn open(name: &str, mac: MacAddr, ip: Ipv4Addr) -> Result<Self, NetError> {
        let iface = Iface::without_packet_info(name, Mode::Tap)?;
        iface.set_non_blocking()?;
        debug!("tap: opened {} as {} / {}", iface.name(), ip, mac);
        Ok(TapDevice { iface, mac, ip })
    }

    pub fn name(&self) -> &str {
        self.iface.name()
    }
}

impl NetworkDevice for TapDevice {
    fn send(&mut self, frame: &[u8]) -> Result<(), NetError> {
        self.iface.send(frame)?;
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>, NetError> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.iface.recv(buf) {
                Ok(len) => return Ok(Some(len)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    thread::sleep(POLL_INTERVAL.min(deadline - now));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn mac_address(&self) -> MacAddr {
        self.mac
    }

    fn ip_address(&self) -> Ipv4Addr {
        self.ip
    }
}
