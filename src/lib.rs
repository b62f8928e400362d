//! A small TCP/IP stack for a single Ethernet interface.
//!
//! The library covers the path from raw frames to application callbacks:
//! - Ethernet II framing and ARP address resolution
//! - IPv4 receive filtering, routing through a gateway, protocol dispatch
//! - ICMP echo request/reply handling
//! - UDP sockets and a minimal TCP connection state machine
//!
//! Everything runs on the caller's thread. [`NetworkInterface::poll`] reads
//! one frame from the [`NetworkDevice`] and handles it to completion.

pub mod buffer;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod iface;
pub mod link;
pub mod network;
pub mod transport;

// Re-export commonly used types
pub use config::StackConfig;
pub use error::NetError;
pub use iface::NetworkInterface;
pub use link::{MacAddr, MemoryDevice, NetworkDevice};
pub use network::{checksum, IcmpHeader, IpProtocolHandler, Ipv4Header};
pub use transport::{TcpConnection, TcpHandle, TcpHandler, TcpState, UdpContext, UdpHandle, UdpHandler};
