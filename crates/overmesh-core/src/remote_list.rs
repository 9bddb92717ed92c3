//! Candidate underlay addresses for a peer.
//!
//! Each tunnel keeps an ordered set of places the peer might be
//! reachable, learned from the lighthouse, static config, and observed
//! roaming. Consumers take sorted snapshots; preferred-range members
//! sort first so LAN paths win over WAN ones. Duplicates are allowed in
//! the list and deduplicated by consumers.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Mutex;

use ipnet::Ipv4Net;
use overmesh_net::OverlayIp;

/// Default cap per address family
pub const DEFAULT_MAX_PER_FAMILY: usize = 10;

#[derive(Default)]
struct RemoteListInner {
    v4: Vec<SocketAddrV4>,
    v6: Vec<SocketAddrV6>,
    relays: Vec<OverlayIp>,
}

/// Thread-safe candidate address set. Has its own lock; callers must not
/// hold the host map lock while taking this one.
pub struct RemoteList {
    inner: Mutex<RemoteListInner>,
    max_v4: usize,
    max_v6: usize,
}

impl Default for RemoteList {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteList {
    pub fn new() -> Self {
        Self::with_caps(DEFAULT_MAX_PER_FAMILY, DEFAULT_MAX_PER_FAMILY)
    }

    pub fn with_caps(max_v4: usize, max_v6: usize) -> Self {
        Self {
            inner: Mutex::new(RemoteListInner::default()),
            max_v4,
            max_v6,
        }
    }

    /// Replace the IPv4 candidate set, keeping only addresses the filter
    /// admits. The filter typically rejects addresses inside the overlay
    /// network itself.
    pub fn set_v4<F>(&self, candidates: &[SocketAddrV4], filter: F)
    where
        F: Fn(&SocketAddrV4) -> bool,
    {
        let mut inner = self.inner.lock().unwrap();
        inner.v4.clear();
        for c in candidates {
            if filter(c) {
                inner.v4.push(*c);
            }
        }
        let max = self.max_v4;
        if inner.v4.len() > max {
            // oldest past the cap falls off the end
            inner.v4.truncate(max);
        }
    }

    /// Put one IPv4 address at the front of the list
    pub fn prepend_v4(&self, addr: SocketAddrV4) {
        let mut inner = self.inner.lock().unwrap();
        inner.v4.insert(0, addr);
        let max = self.max_v4;
        if inner.v4.len() > max {
            inner.v4.truncate(max);
        }
    }

    /// Put one IPv6 address at the front of the list
    pub fn prepend_v6(&self, addr: SocketAddrV6) {
        let mut inner = self.inner.lock().unwrap();
        inner.v6.insert(0, addr);
        let max = self.max_v6;
        if inner.v6.len() > max {
            inner.v6.truncate(max);
        }
    }

    /// Replace the set of relay peers that can reach this host
    pub fn set_relays(&self, relays: Vec<OverlayIp>) {
        self.inner.lock().unwrap().relays = relays;
    }

    /// Add one relay peer if not already present
    pub fn add_relay(&self, relay: OverlayIp) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.relays.contains(&relay) {
            inner.relays.push(relay);
        }
    }

    pub fn relays(&self) -> Vec<OverlayIp> {
        self.inner.lock().unwrap().relays.clone()
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.v4.len() + inner.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted snapshot: preferred-range members first, then private
    /// addresses, then public, IPv6 last; lexicographic within a class.
    /// The sort is stable, so equal keys keep insertion order.
    pub fn copy_addrs(&self, preferred: &[Ipv4Net]) -> Vec<SocketAddr> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<SocketAddr> = Vec::with_capacity(inner.v4.len() + inner.v6.len());
        out.extend(inner.v4.iter().map(|a| SocketAddr::V4(*a)));
        out.extend(inner.v6.iter().map(|a| SocketAddr::V6(*a)));
        drop(inner);

        out.sort_by_key(|addr| sort_key(addr, preferred));
        out
    }
}

fn sort_key(addr: &SocketAddr, preferred: &[Ipv4Net]) -> (u8, [u8; 16], u16) {
    match addr {
        SocketAddr::V4(a) => {
            let ip = *a.ip();
            let rank = if preferred.iter().any(|net| net.contains(&ip)) {
                0
            } else if is_private_v4(&ip) {
                1
            } else {
                2
            };
            let mut bytes = [0u8; 16];
            bytes[..4].copy_from_slice(&ip.octets());
            (rank, bytes, a.port())
        }
        SocketAddr::V6(a) => (3, a.ip().octets(), a.port()),
    }
}

fn is_private_v4(ip: &Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> SocketAddrV4 {
        s.parse().unwrap()
    }

    #[test]
    fn test_preferred_ranges_sort_first() {
        let list = RemoteList::new();
        list.set_v4(
            &[v4("8.8.8.8:4242"), v4("192.168.1.5:4242"), v4("10.1.1.1:4242")],
            |_| true,
        );

        let preferred: Vec<Ipv4Net> = vec!["10.1.1.0/24".parse().unwrap()];
        let sorted = list.copy_addrs(&preferred);

        assert_eq!(sorted[0], SocketAddr::V4(v4("10.1.1.1:4242")));
        // private beats public
        assert_eq!(sorted[1], SocketAddr::V4(v4("192.168.1.5:4242")));
        assert_eq!(sorted[2], SocketAddr::V4(v4("8.8.8.8:4242")));
    }

    #[test]
    fn test_sort_is_stable_permutation() {
        let list = RemoteList::new();
        let input = [v4("8.8.8.8:1"), v4("9.9.9.9:1"), v4("8.8.4.4:1")];
        list.set_v4(&input, |_| true);

        let sorted = list.copy_addrs(&[]);
        assert_eq!(sorted.len(), 3);
        for a in &input {
            assert!(sorted.contains(&SocketAddr::V4(*a)));
        }
    }

    #[test]
    fn test_filter_rejects() {
        let list = RemoteList::new();
        list.set_v4(&[v4("10.0.0.1:1"), v4("8.8.8.8:1")], |a| {
            !a.ip().is_private()
        });
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_cap_enforced() {
        let list = RemoteList::with_caps(3, 3);
        let many: Vec<SocketAddrV4> = (0..10)
            .map(|i| SocketAddrV4::new(Ipv4Addr::new(1, 2, 3, i), 100 + i as u16))
            .collect();
        list.set_v4(&many, |_| true);
        assert_eq!(list.len(), 3);

        // prepending over the cap evicts the oldest
        list.prepend_v4(v4("9.9.9.9:9"));
        assert_eq!(list.len(), 3);
        let sorted = list.copy_addrs(&[]);
        assert!(sorted.contains(&SocketAddr::V4(v4("9.9.9.9:9"))));
    }

    #[test]
    fn test_duplicates_pass_through() {
        // De-duplication is the consumer's job, not the list's
        let list = RemoteList::new();
        list.set_v4(&[v4("8.8.8.8:1"), v4("8.8.8.8:1")], |_| true);
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn test_relays() {
        let list = RemoteList::new();
        let r = OverlayIp::from(Ipv4Addr::new(10, 0, 0, 9));
        list.add_relay(r);
        list.add_relay(r);
        assert_eq!(list.relays(), vec![r]);
    }
}
