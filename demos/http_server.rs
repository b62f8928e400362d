//! Bring the stack up on a TAP interface and serve a tiny HTTP page.
//!
//! The host end of `tap0` becomes `10.0.2.2/24` and acts as the gateway; the
//! stack answers as `10.0.2.15`. Try:
//!
//! ```sh
//! sudo -E cargo run --example http_server
//! curl http://10.0.2.15:1234/
//! ping 10.0.2.15
//! echo hi | nc -u 10.0.2.15 1234
//! ```

mod utils;

use std::net::Ipv4Addr;
use std::time::Duration;

use kernel_netstack::link::tap::TapDevice;
use kernel_netstack::{NetError, NetworkInterface, StackConfig, TcpConnection, TcpHandler, TcpState, UdpContext, UdpHandler};
use log::{info, warn};
use utils::{configure_interface, init_logger};

const PORT: u16 = 1234;

const PAGE: &str = "HTTP/1.1 200 OK\r\n\
Server: kernel-netstack\r\n\
Content-Type: text/html\r\n\
Connection: close\r\n\
\r\n\
<html><head><title>kernel-netstack</title></head>\
<body><h1>Hello from a hand-written TCP stack</h1></body></html>\r\n";

struct HttpHandler;

impl TcpHandler for HttpHandler {
    fn on_data(&mut self, conn: &mut TcpConnection<'_>, data: &[u8]) -> bool {
        let (ip, port) = conn.remote_endpoint();
        info!("tcp {}:{} sent: {}", ip, port, String::from_utf8_lossy(data));

        if data.starts_with(b"GET / HTTP") {
            if let Err(e) = conn.send(PAGE.as_bytes()) {
                warn!("failed to send page: {}", e);
            }
            if let Err(e) = conn.disconnect() {
                warn!("failed to close connection: {}", e);
            }
        }
        true
    }
}

struct PrintHandler;

impl UdpHandler for PrintHandler {
    fn on_datagram(&mut self, ctx: &mut UdpContext<'_>, data: &[u8]) {
        let (ip, port) = ctx.remote_endpoint();
        info!("udp {}:{} sent: {}", ip, port, String::from_utf8_lossy(data));
    }
}

fn main() -> Result<(), NetError> {
    init_logger();

    let config = StackConfig::default()
        .with_cidr("10.0.2.15/24")?
        .with_gateway(Ipv4Addr::new(10, 0, 2, 2));

    let device = TapDevice::open("tap0", config.mac, config.ip)?;
    configure_interface(device.name(), "10.0.2.2/24")?;

    let gateway = config.gateway;
    let mut iface = NetworkInterface::new(device, config)?;
    iface.broadcast_mac(gateway)?;

    let mut listener = iface.tcp_listen(PORT);
    iface.tcp_bind(listener, Box::new(HttpHandler))?;
    let udp = iface.udp_listen(PORT);
    iface.udp_bind(udp, Box::new(PrintHandler))?;
    info!("listening on tcp/udp port {}", PORT);

    loop {
        iface.poll(Duration::from_millis(100))?;

        // A listener becomes the connection for the first SYN it sees.
        if iface.tcp_state(listener) != Some(TcpState::Listen) {
            listener = iface.tcp_listen(PORT);
            iface.tcp_bind(listener, Box::new(HttpHandler))?;
        }
    }
}
