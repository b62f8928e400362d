//! In-memory NIC for simulations and tests.

use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::time::Duration;

use super::{MacAddr, NetworkDevice};
use crate::error::NetError;

/// A device whose wire is two queues: frames injected for the stack to
/// receive, and frames the stack has sent.
///
/// `recv` never sleeps; an empty inbound queue reads as a timeout.
#[derive(Debug)]
pub struct MemoryDevice {
    mac: MacAddr,
    ip: Ipv4Addr,
    inbound: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
}

impl MemoryDevice {
    pub fn new(mac: MacAddr, ip: Ipv4Addr) -> Self {
        MemoryDevice {
            mac,
            ip,
            inbound: VecDeque::new(),
            sent: Vec::new(),
        }
    }

    /// Queue a frame for the stack to receive.
    pub fn inject(&mut self, frame: Vec<u8>) {
        self.inbound.push_back(frame);
    }

    /// Drain every frame sent so far.
    pub fn take_sent(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.sent)
    }
}

impl NetworkDevice for MemoryDevice {
    fn send(&mut self, frame: &[u8]) -> Result<(), NetError> {
        self.sent.push(frame.to_vec());
        Ok(())
    }

    fn recv(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<Option<usize>, NetError> {
        match self.inbound.pop_front() {
            Some(frame) => {
                let len = frame.len().min(buf.len());
                buf[..len].copy_from_slice(&frame[..len]);
                Ok(Some(len))
            }
            None => Ok(None),
        }
    }

    fn mac_address(&self) -> MacAddr {
        self.mac
    }

    fn ip_address(&self) -> Ipv4Addr {
        self.ip
    }
}
