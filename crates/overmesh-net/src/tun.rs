//! TUN device interface.
//!
//! The core only needs a handful of operations from the overlay device;
//! platform implementations live behind this trait. [`MockTun`] is the
//! channel-backed implementation the integration tests drive.

use std::sync::Arc;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tokio::sync::{mpsc, Mutex};

use crate::addr::OverlayIp;
use crate::error::{NetError, NetResult};

/// The overlay-side device the packet pipeline reads from and writes to.
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Device name, for logging
    fn name(&self) -> &str;

    /// The overlay network this device serves
    fn cidr(&self) -> Ipv4Net;

    /// Resolve a destination to the overlay peer that owns it.
    /// Addresses inside `cidr` map to themselves; addresses covered by a
    /// configured route map to the route's gateway; anything else is
    /// [`OverlayIp::UNSET`].
    fn route_for(&self, ip: OverlayIp) -> OverlayIp;

    /// Read one packet from the OS side; blocks until one is available
    async fn read_packet(&self) -> NetResult<Vec<u8>>;

    /// Deliver one packet to the OS side
    async fn write_packet(&self, data: &[u8]) -> NetResult<()>;
}

/// An in-memory TUN device backed by channels.
pub struct MockTun {
    name: String,
    cidr: Ipv4Net,
    routes: Vec<(Ipv4Net, OverlayIp)>,
    from_os: Mutex<mpsc::Receiver<Vec<u8>>>,
    to_os: mpsc::Sender<Vec<u8>>,
}

/// Test-side handle to a [`MockTun`]: inject packets as if the OS wrote
/// them to the device, and observe packets the pipeline delivered.
pub struct MockTunHandle {
    pub inject: mpsc::Sender<Vec<u8>>,
    pub delivered: mpsc::Receiver<Vec<u8>>,
}

/// Create a paired [`MockTun`] and [`MockTunHandle`].
pub fn mock_tun(cidr: Ipv4Net) -> (Arc<MockTun>, MockTunHandle) {
    mock_tun_with_routes(cidr, Vec::new())
}

/// Same as [`mock_tun`] with additional routed subnets
pub fn mock_tun_with_routes(
    cidr: Ipv4Net,
    routes: Vec<(Ipv4Net, OverlayIp)>,
) -> (Arc<MockTun>, MockTunHandle) {
    let (inject_tx, inject_rx) = mpsc::channel(256);
    let (deliver_tx, deliver_rx) = mpsc::channel(256);

    let tun = Arc::new(MockTun {
        name: "mock0".to_string(),
        cidr,
        routes,
        from_os: Mutex::new(inject_rx),
        to_os: deliver_tx,
    });
    let handle = MockTunHandle {
        inject: inject_tx,
        delivered: deliver_rx,
    };
    (tun, handle)
}

#[async_trait]
impl TunDevice for MockTun {
    fn name(&self) -> &str {
        &self.name
    }

    fn cidr(&self) -> Ipv4Net {
        self.cidr
    }

    fn route_for(&self, ip: OverlayIp) -> OverlayIp {
        if self.cidr.contains(&std::net::Ipv4Addr::from(ip)) {
            return ip;
        }
        for (net, via) in &self.routes {
            if net.contains(&std::net::Ipv4Addr::from(ip)) {
                return *via;
            }
        }
        OverlayIp::UNSET
    }

    async fn read_packet(&self) -> NetResult<Vec<u8>> {
        self.from_os
            .lock()
            .await
            .recv()
            .await
            .ok_or(NetError::TunClosed)
    }

    async fn write_packet(&self, data: &[u8]) -> NetResult<()> {
        self.to_os
            .send(data.to_vec())
            .await
            .map_err(|_| NetError::TunClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_mock_tun_io() {
        let cidr: Ipv4Net = "10.128.0.0/24".parse().unwrap();
        let (tun, mut handle) = mock_tun(cidr);

        handle.inject.send(vec![1, 2, 3]).await.unwrap();
        assert_eq!(tun.read_packet().await.unwrap(), vec![1, 2, 3]);

        tun.write_packet(&[4, 5]).await.unwrap();
        assert_eq!(handle.delivered.recv().await.unwrap(), vec![4, 5]);
    }

    #[test]
    fn test_route_for() {
        let cidr: Ipv4Net = "10.128.0.0/24".parse().unwrap();
        let gw = OverlayIp::from(Ipv4Addr::new(10, 128, 0, 9));
        let (tun, _handle) =
            mock_tun_with_routes(cidr, vec![("192.168.50.0/24".parse().unwrap(), gw)]);

        let inside = OverlayIp::from(Ipv4Addr::new(10, 128, 0, 3));
        assert_eq!(tun.route_for(inside), inside);

        let routed = OverlayIp::from(Ipv4Addr::new(192, 168, 50, 7));
        assert_eq!(tun.route_for(routed), gw);

        let outside = OverlayIp::from(Ipv4Addr::new(8, 8, 8, 8));
        assert_eq!(tun.route_for(outside), OverlayIp::UNSET);
    }
}
