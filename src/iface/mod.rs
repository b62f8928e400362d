//! Network interface: the stack assembled on top of one device.
//!
//! - Frame and IPv4 dispatch
//! - Blocking helpers (resolve, ping, handshake wait) built on polling
//! - The socket API exposed to applications

pub mod interface;
mod ipv4;

pub use interface::NetworkInterface;
