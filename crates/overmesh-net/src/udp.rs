//! UDP transport layer.
//!
//! Thin wrapper over a tokio UDP socket dealing in raw datagrams; framing
//! and crypto live above in the core. The builder configures SO_REUSEPORT
//! so several receive workers can bind the same port and let the kernel
//! fan incoming datagrams out across them.

use std::collections::HashMap;
use std::hash::Hash;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::error::{NetError, NetResult};

/// Largest datagram we will send or receive
pub const MAX_DATAGRAM_SIZE: usize = 9001;

/// UDP transport for sending and receiving overmesh datagrams
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    /// Create a new UDP transport bound to the specified address
    pub async fn bind(addr: SocketAddr) -> NetResult<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                NetError::AddressInUse(addr)
            } else {
                NetError::Io(e)
            }
        })?;

        let local_addr = socket.local_addr()?;
        debug!("UDP transport bound to {}", local_addr);

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
        })
    }

    /// Get local address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send one datagram
    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) -> NetResult<()> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(NetError::InvalidPacket(format!(
                "datagram too large: {} bytes",
                data.len()
            )));
        }
        trace!("sending {} bytes to {}", data.len(), addr);
        self.socket.send_to(data, addr).await?;
        Ok(())
    }

    /// Receive one datagram into `buf`, returning length and source
    pub async fn recv_from(&self, buf: &mut [u8]) -> NetResult<(usize, SocketAddr)> {
        let (len, from) = self.socket.recv_from(buf).await?;
        trace!("received {} bytes from {}", len, from);
        Ok((len, from))
    }
}

/// Builder for UDP transport with custom socket options
pub struct UdpTransportBuilder {
    bind_addr: SocketAddr,
    recv_buffer_size: Option<usize>,
    send_buffer_size: Option<usize>,
    reuse_port: bool,
}

impl UdpTransportBuilder {
    /// Create a new builder
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            recv_buffer_size: None,
            send_buffer_size: None,
            reuse_port: false,
        }
    }

    /// Set receive buffer size
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = Some(size);
        self
    }

    /// Set send buffer size
    pub fn send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = Some(size);
        self
    }

    /// Allow several sockets to bind the same port (one per receive worker)
    pub fn reuse_port(mut self, enable: bool) -> Self {
        self.reuse_port = enable;
        self
    }

    /// Build the transport
    pub fn build(self) -> NetResult<UdpTransport> {
        use socket2::{Domain, Protocol, Socket, Type};

        let domain = if self.bind_addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;

        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }

        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        if self.reuse_port {
            socket.set_reuse_port(true)?;
        }

        // Non-blocking before handing the fd to tokio
        socket.set_nonblocking(true)?;
        socket.bind(&self.bind_addr.into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        let tokio_socket = UdpSocket::from_std(std_socket)?;
        let local_addr = tokio_socket.local_addr()?;
        debug!("UDP transport bound to {} with custom options", local_addr);

        Ok(UdpTransport {
            socket: Arc::new(tokio_socket),
            local_addr,
        })
    }
}

/// Simple sliding-window rate limiter, keyed by whatever the caller
/// needs to throttle (peer underlay IP, overlay address, ...).
pub struct RateLimiter<K: Eq + Hash + Clone> {
    max_per_window: u32,
    window: Duration,
    tracker: StdRwLock<HashMap<K, Vec<Instant>>>,
}

impl<K: Eq + Hash + Clone + std::fmt::Debug> RateLimiter<K> {
    /// Allow `max_per_window` events per `window` per key
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            tracker: StdRwLock::new(HashMap::new()),
        }
    }

    /// Check whether an event for this key is allowed right now
    pub fn check(&self, key: K) -> bool {
        let now = Instant::now();
        let mut tracker = self.tracker.write().unwrap();
        let timestamps = tracker.entry(key.clone()).or_default();

        timestamps.retain(|&t| now.duration_since(t) < self.window);

        if timestamps.len() >= self.max_per_window as usize {
            warn!("rate limit exceeded for {:?}", key);
            false
        } else {
            timestamps.push(now);
            true
        }
    }

    /// Drop stale entries
    pub fn cleanup(&self) {
        let now = Instant::now();
        let mut tracker = self.tracker.write().unwrap();
        tracker.retain(|_, timestamps| {
            timestamps.retain(|&t| now.duration_since(t) < self.window);
            !timestamps.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transport_bind() {
        let transport = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert!(transport.local_addr().port() > 0);
    }

    #[tokio::test]
    async fn test_transport_send_recv() {
        let t1 = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let t2 = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        t1.send_to(b"ping", t2.local_addr()).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, from) = t2.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, t1.local_addr());
    }

    #[tokio::test]
    async fn test_builder_reuse_port() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let t1 = UdpTransportBuilder::new(addr)
            .reuse_port(true)
            .build()
            .unwrap();

        // Second socket on the same concrete port must succeed on unix
        #[cfg(unix)]
        {
            let t2 = UdpTransportBuilder::new(t1.local_addr())
                .reuse_port(true)
                .build()
                .unwrap();
            assert_eq!(t1.local_addr().port(), t2.local_addr().port());
        }
    }

    #[test]
    fn test_rate_limiter() {
        let limiter: RateLimiter<std::net::IpAddr> = RateLimiter::new(3, Duration::from_secs(1));
        let ip: std::net::IpAddr = "192.168.1.1".parse().unwrap();

        assert!(limiter.check(ip));
        assert!(limiter.check(ip));
        assert!(limiter.check(ip));
        assert!(!limiter.check(ip));
    }
}
