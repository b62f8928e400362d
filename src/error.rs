//! Error type shared by every layer of the stack.

use std::io;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::transport::tcp::TcpState;

/// Errors surfaced by send paths and blocking operations.
///
/// Malformed or unroutable inbound packets are never reported through this
/// type; they are dropped where they are detected.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("out of memory allocating a {0}-byte packet buffer")]
    OutOfMemory(usize),

    #[error("no ARP reply from {ip} within {waited:?}")]
    ArpTimeout { ip: Ipv4Addr, waited: Duration },

    #[error("connection not established within {waited:?}")]
    ConnectTimeout { waited: Duration },

    #[error("payload of {size} bytes exceeds the {max}-byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("unknown socket")]
    UnknownSocket,

    #[error("socket is not connected (state {0:?})")]
    NotConnected(TcpState),

    #[error("IP protocol {0} is reserved")]
    ReservedProtocol(u8),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("device address {device} differs from configured {configured}")]
    AddressMismatch { configured: String, device: String },

    #[error("device error: {0}")]
    Device(#[from] io::Error),
}
