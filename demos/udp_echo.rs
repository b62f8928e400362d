//! UDP echo service (port 7) on a TAP interface.
//!
//! ```sh
//! sudo -E cargo run --example udp_echo
//! echo hello | nc -u 10.0.2.15 7
//! ```

mod utils;

use std::time::Duration;

use kernel_netstack::link::tap::TapDevice;
use kernel_netstack::{NetError, NetworkInterface, StackConfig, UdpContext, UdpHandler};
use log::{debug, warn};
use utils::{configure_interface, init_logger};

const ECHO_PORT: u16 = 7;

struct Echo;

impl UdpHandler for Echo {
    fn on_datagram(&mut self, ctx: &mut UdpContext<'_>, data: &[u8]) {
        let (ip, port) = ctx.remote_endpoint();
        debug!("echoing {} bytes to {}:{}", data.len(), ip, port);
        if let Err(e) = ctx.reply(data) {
            warn!("echo to {}:{} failed: {}", ip, port, e);
        }
    }
}

fn main() -> Result<(), NetError> {
    init_logger();

    let config = StackConfig::default();
    let device = TapDevice::open("tap0", config.mac, config.ip)?;
    configure_interface(device.name(), "10.0.2.2/24")?;

    let mut iface = NetworkInterface::new(device, config)?;
    let mut socket = iface.udp_listen(ECHO_PORT);
    iface.udp_bind(socket, Box::new(Echo))?;

    loop {
        iface.poll(Duration::from_millis(100))?;

        // The listening socket commits to its first peer; reopen for the next.
        if iface.udp_socket(socket).map(|s| s.is_listening()) == Some(false) {
            iface.udp_disconnect(socket)?;
            socket = iface.udp_listen(ECHO_PORT);
            iface.udp_bind(socket, Box::new(Echo))?;
        }
    }
}
