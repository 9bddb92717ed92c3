//! Network plumbing for overmesh.
//!
//! The core treats the operating system through two narrow interfaces:
//! [`TunDevice`] for the overlay side and [`UdpTransport`] for the
//! underlay side. Both are swappable in tests ([`MockTun`], loopback
//! sockets), which is how the end-to-end handshake and relay scenarios
//! run without privileges.

mod addr;
mod error;
mod packet;
mod tun;
mod udp;

pub use addr::OverlayIp;
pub use error::{NetError, NetResult};
pub use packet::{build_ipv4_udp, parse_ipv4, FirewallPacket, PROTO_ICMP, PROTO_TCP, PROTO_UDP};
pub use tun::{mock_tun, mock_tun_with_routes, MockTun, MockTunHandle, TunDevice};
pub use udp::{RateLimiter, UdpTransport, UdpTransportBuilder};
