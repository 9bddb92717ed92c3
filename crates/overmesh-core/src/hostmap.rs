//! The table of tunnels.
//!
//! One [`HostMap`] holds every live or in-flight tunnel, reachable three
//! ways: by the peer's overlay address (the "primary" tunnel used for
//! sends), by our local index (how inbound datagrams find their session),
//! and by the peer's index once it has acknowledged one. Relay indices
//! live in a fourth table pointing at the tunnel that carries them.
//!
//! Several host infos may exist for one overlay address, e.g. while both
//! sides initiate concurrently; exactly one of them is primary.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use ipnet::Ipv4Net;
use tracing::debug;

use overmesh_net::OverlayIp;
use overmesh_pki::MeshCertificate;

use crate::error::{CoreError, CoreResult};
use crate::handshake::InitiatorHandshake;
use crate::remote_list::RemoteList;
use crate::session::ConnectionState;

/// How often (in packets) the primary choice is re-evaluated
pub const DEFAULT_PROMOTE_EVERY: u32 = 1000;

const INDEX_PROBES: usize = 32;

/// What a relay entry does at this node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayType {
    /// We shuttle ciphertext between two peers
    Forwarding,
    /// We are one endpoint of the relayed tunnel
    Terminal,
}

/// Relay setup progress
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayPhase {
    Requested,
    Established,
}

/// One relay hop's bookkeeping, stored on the tunnel that carries it
#[derive(Clone, Debug)]
pub struct Relay {
    pub typ: RelayType,
    pub phase: RelayPhase,
    pub local_index: u32,
    pub remote_index: u32,
    pub peer_ip: OverlayIp,
}

#[derive(Default)]
struct RelayStateInner {
    relays: HashMap<OverlayIp, Relay>,
    by_index: HashMap<u32, OverlayIp>,
}

/// Relay entries hanging off one host info, keyed by the far peer
#[derive(Default)]
pub struct RelayState {
    inner: RwLock<RelayStateInner>,
}

impl RelayState {
    pub fn insert(&self, relay: Relay) {
        let mut inner = self.inner.write().unwrap();
        inner.by_index.insert(relay.local_index, relay.peer_ip);
        inner.relays.insert(relay.peer_ip, relay);
    }

    pub fn query_by_ip(&self, peer_ip: OverlayIp) -> Option<Relay> {
        self.inner.read().unwrap().relays.get(&peer_ip).cloned()
    }

    pub fn query_by_index(&self, local_index: u32) -> Option<Relay> {
        let inner = self.inner.read().unwrap();
        let ip = inner.by_index.get(&local_index)?;
        inner.relays.get(ip).cloned()
    }

    /// Fill in the peer's index and flip to established, by peer address
    pub fn complete_by_ip(&self, peer_ip: OverlayIp, remote_index: u32) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.relays.get_mut(&peer_ip) {
            Some(r) => {
                r.remote_index = remote_index;
                r.phase = RelayPhase::Established;
                true
            }
            None => false,
        }
    }

    /// Flip an entry to established without touching its indices
    pub fn establish_by_ip(&self, peer_ip: OverlayIp) -> Option<Relay> {
        let mut inner = self.inner.write().unwrap();
        let r = inner.relays.get_mut(&peer_ip)?;
        r.phase = RelayPhase::Established;
        Some(r.clone())
    }

    /// Fill in the peer's index and flip to established, by our index
    pub fn complete_by_index(&self, local_index: u32, remote_index: u32) -> Option<Relay> {
        let mut inner = self.inner.write().unwrap();
        let ip = *inner.by_index.get(&local_index)?;
        let r = inner.relays.get_mut(&ip)?;
        r.remote_index = remote_index;
        r.phase = RelayPhase::Established;
        Some(r.clone())
    }

    pub fn remove(&self, peer_ip: OverlayIp) -> Option<Relay> {
        let mut inner = self.inner.write().unwrap();
        let relay = inner.relays.remove(&peer_ip)?;
        inner.by_index.remove(&relay.local_index);
        Some(relay)
    }

    pub fn copy_all(&self) -> Vec<Relay> {
        self.inner.read().unwrap().relays.values().cloned().collect()
    }

    pub fn relay_ips(&self) -> Vec<OverlayIp> {
        self.inner.read().unwrap().relays.keys().copied().collect()
    }
}

/// Per-tunnel record
pub struct HostInfo {
    pub vpn_ip: OverlayIp,
    local_index: AtomicU32,
    remote_index: AtomicU32,
    connection_state: RwLock<Option<Arc<ConnectionState>>>,
    remote: RwLock<Option<SocketAddr>>,
    // Shared with the lighthouse cache entry for this address, so
    // lighthouse replies land directly in the tunnel's candidate set
    remotes: RwLock<Arc<RemoteList>>,
    peer_cert: RwLock<Option<Arc<MeshCertificate>>>,
    handshake_ready: AtomicBool,
    handshake_counter: AtomicU32,
    last_rebind_count: AtomicU64,
    pub relay_state: RelayState,
    // our hello (initiator) or cached reply (responder), resent on retries
    handshake_packet: Mutex<Vec<u8>>,
    initiator_state: Mutex<Option<InitiatorHandshake>>,
    promote_counter: AtomicU32,
    last_roam: Mutex<Option<(Instant, SocketAddr)>>,
}

impl HostInfo {
    pub fn new(vpn_ip: OverlayIp) -> Self {
        Self {
            vpn_ip,
            local_index: AtomicU32::new(0),
            remote_index: AtomicU32::new(0),
            connection_state: RwLock::new(None),
            remote: RwLock::new(None),
            remotes: RwLock::new(Arc::new(RemoteList::new())),
            peer_cert: RwLock::new(None),
            handshake_ready: AtomicBool::new(false),
            handshake_counter: AtomicU32::new(0),
            last_rebind_count: AtomicU64::new(u64::MAX),
            relay_state: RelayState::default(),
            handshake_packet: Mutex::new(Vec::new()),
            initiator_state: Mutex::new(None),
            promote_counter: AtomicU32::new(0),
            last_roam: Mutex::new(None),
        }
    }

    pub fn local_index(&self) -> u32 {
        self.local_index.load(Ordering::Acquire)
    }

    pub fn set_local_index(&self, idx: u32) {
        self.local_index.store(idx, Ordering::Release);
    }

    pub fn remote_index(&self) -> u32 {
        self.remote_index.load(Ordering::Acquire)
    }

    pub fn set_remote_index(&self, idx: u32) {
        self.remote_index.store(idx, Ordering::Release);
    }

    pub fn connection_state(&self) -> Option<Arc<ConnectionState>> {
        self.connection_state.read().unwrap().clone()
    }

    pub fn set_connection_state(&self, cs: Arc<ConnectionState>) {
        *self.connection_state.write().unwrap() = Some(cs);
    }

    /// Ready means the handshake completed and keys are installed
    pub fn is_ready(&self) -> bool {
        self.connection_state()
            .map(|cs| cs.is_ready())
            .unwrap_or(false)
    }

    pub fn remotes(&self) -> Arc<RemoteList> {
        self.remotes.read().unwrap().clone()
    }

    pub fn set_remotes(&self, remotes: Arc<RemoteList>) {
        *self.remotes.write().unwrap() = remotes;
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        *self.remote.read().unwrap()
    }

    pub fn set_remote(&self, addr: SocketAddr) {
        *self.remote.write().unwrap() = Some(addr);
    }

    pub fn peer_cert(&self) -> Option<Arc<MeshCertificate>> {
        self.peer_cert.read().unwrap().clone()
    }

    pub fn set_peer_cert(&self, cert: Arc<MeshCertificate>) {
        *self.peer_cert.write().unwrap() = Some(cert);
    }

    pub fn handshake_ready(&self) -> bool {
        self.handshake_ready.load(Ordering::Acquire)
    }

    pub fn set_handshake_ready(&self) {
        self.handshake_ready.store(true, Ordering::Release);
    }

    pub fn handshake_counter(&self) -> u32 {
        self.handshake_counter.load(Ordering::Relaxed)
    }

    pub fn bump_handshake_counter(&self) -> u32 {
        self.handshake_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn last_rebind_count(&self) -> u64 {
        self.last_rebind_count.load(Ordering::Relaxed)
    }

    pub fn set_last_rebind_count(&self, v: u64) {
        self.last_rebind_count.store(v, Ordering::Relaxed);
    }

    pub fn handshake_packet(&self) -> Vec<u8> {
        self.handshake_packet.lock().unwrap().clone()
    }

    pub fn set_handshake_packet(&self, bytes: Vec<u8>) {
        *self.handshake_packet.lock().unwrap() = bytes;
    }

    pub fn take_initiator_state(&self) -> Option<InitiatorHandshake> {
        self.initiator_state.lock().unwrap().take()
    }

    pub fn set_initiator_state(&self, hs: InitiatorHandshake) {
        *self.initiator_state.lock().unwrap() = Some(hs);
    }

    /// Bump the per-tunnel packet count used to pace primary re-election
    pub fn tick_promote_counter(&self) -> u32 {
        self.promote_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record a roam; returns false (suppress) when flapping back to the
    /// address we just left within the hold-down window.
    pub fn roam_check(&self, new_addr: SocketAddr, hold_down: std::time::Duration) -> bool {
        let mut last = self.last_roam.lock().unwrap();
        if let Some((when, prev)) = *last {
            if prev == new_addr && when.elapsed() < hold_down {
                return false;
            }
        }
        let old = self.remote();
        if let Some(old) = old {
            *last = Some((Instant::now(), old));
        }
        true
    }
}

struct HostMapInner {
    hosts: HashMap<OverlayIp, Arc<HostInfo>>,
    indexes: HashMap<u32, Arc<HostInfo>>,
    remote_indexes: HashMap<u32, Arc<HostInfo>>,
    relays: HashMap<u32, Arc<HostInfo>>,
}

/// A table of tunnels under one reader-writer lock.
pub struct HostMap {
    name: &'static str,
    vpn_cidr: Ipv4Net,
    preferred_ranges: RwLock<Arc<Vec<Ipv4Net>>>,
    promote_every: u32,
    inner: RwLock<HostMapInner>,
}

impl HostMap {
    pub fn new(name: &'static str, vpn_cidr: Ipv4Net, preferred_ranges: Vec<Ipv4Net>) -> Self {
        Self::with_promote_every(name, vpn_cidr, preferred_ranges, DEFAULT_PROMOTE_EVERY)
    }

    pub fn with_promote_every(
        name: &'static str,
        vpn_cidr: Ipv4Net,
        preferred_ranges: Vec<Ipv4Net>,
        promote_every: u32,
    ) -> Self {
        Self {
            name,
            vpn_cidr,
            preferred_ranges: RwLock::new(Arc::new(preferred_ranges)),
            promote_every: promote_every.max(1),
            inner: RwLock::new(HostMapInner {
                hosts: HashMap::new(),
                indexes: HashMap::new(),
                remote_indexes: HashMap::new(),
                relays: HashMap::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn vpn_cidr(&self) -> Ipv4Net {
        self.vpn_cidr
    }

    pub fn preferred_ranges(&self) -> Arc<Vec<Ipv4Net>> {
        self.preferred_ranges.read().unwrap().clone()
    }

    pub fn set_preferred_ranges(&self, ranges: Vec<Ipv4Net>) {
        *self.preferred_ranges.write().unwrap() = Arc::new(ranges);
    }

    /// Get or create the primary host info for an overlay address.
    /// Returns the record and whether it was just created.
    pub fn add_vpn_ip(&self, vpn_ip: OverlayIp) -> (Arc<HostInfo>, bool) {
        {
            let inner = self.inner.read().unwrap();
            if let Some(hi) = inner.hosts.get(&vpn_ip) {
                return (hi.clone(), false);
            }
        }
        let mut inner = self.inner.write().unwrap();
        if let Some(hi) = inner.hosts.get(&vpn_ip) {
            return (hi.clone(), false);
        }
        let hi = Arc::new(HostInfo::new(vpn_ip));
        inner.hosts.insert(vpn_ip, hi.clone());
        (hi, true)
    }

    pub fn query_vpn_ip(&self, vpn_ip: OverlayIp) -> Option<Arc<HostInfo>> {
        self.inner.read().unwrap().hosts.get(&vpn_ip).cloned()
    }

    pub fn query_index(&self, index: u32) -> Option<Arc<HostInfo>> {
        self.inner.read().unwrap().indexes.get(&index).cloned()
    }

    pub fn query_remote_index(&self, index: u32) -> Option<Arc<HostInfo>> {
        self.inner.read().unwrap().remote_indexes.get(&index).cloned()
    }

    pub fn query_relay(&self, index: u32) -> Option<Arc<HostInfo>> {
        self.inner.read().unwrap().relays.get(&index).cloned()
    }

    /// Allocate a local index no map in `scope` is using. `self` is
    /// always part of the scope.
    pub fn allocate_index(&self, scope: &[&HostMap]) -> CoreResult<u32> {
        for _ in 0..INDEX_PROBES {
            let candidate: u32 = rand::random();
            if candidate == 0 {
                continue;
            }
            let mine = {
                let inner = self.inner.read().unwrap();
                inner.indexes.contains_key(&candidate) || inner.relays.contains_key(&candidate)
            };
            if mine {
                continue;
            }
            let clash = scope.iter().any(|m| {
                let inner = m.inner.read().unwrap();
                inner.indexes.contains_key(&candidate) || inner.relays.contains_key(&candidate)
            });
            if !clash {
                return Ok(candidate);
            }
        }
        Err(CoreError::IndexExhausted)
    }

    /// Register a host info under its local index
    pub fn insert_index(&self, index: u32, hi: &Arc<HostInfo>) {
        hi.set_local_index(index);
        self.inner.write().unwrap().indexes.insert(index, hi.clone());
    }

    /// Register the index the peer picked for this tunnel
    pub fn insert_remote_index(&self, index: u32, hi: &Arc<HostInfo>) {
        hi.set_remote_index(index);
        self.inner
            .write()
            .unwrap()
            .remote_indexes
            .insert(index, hi.clone());
    }

    /// Register a relay index pointing at its carrier tunnel
    pub fn insert_relay(&self, index: u32, hi: &Arc<HostInfo>) {
        self.inner.write().unwrap().relays.insert(index, hi.clone());
    }

    pub fn remove_relay(&self, index: u32) {
        let carrier = {
            let mut inner = self.inner.write().unwrap();
            inner.relays.remove(&index)
        };
        if let Some(carrier) = carrier {
            if let Some(r) = carrier.relay_state.query_by_index(index) {
                carrier.relay_state.remove(r.peer_ip);
            }
        }
    }

    /// Add a completed host info as the new primary for its address.
    /// A previous primary stays reachable by index until deleted.
    pub fn add_host_info_as_primary(&self, hi: &Arc<HostInfo>) {
        let mut inner = self.inner.write().unwrap();
        Self::unlocked_index(&mut inner, hi);
        inner.hosts.insert(hi.vpn_ip, hi.clone());
    }

    /// Add a completed host info without displacing an existing primary
    pub fn add_host_info_secondary(&self, hi: &Arc<HostInfo>) {
        let mut inner = self.inner.write().unwrap();
        Self::unlocked_index(&mut inner, hi);
        inner.hosts.entry(hi.vpn_ip).or_insert_with(|| hi.clone());
    }

    fn unlocked_index(inner: &mut HostMapInner, hi: &Arc<HostInfo>) {
        let idx = hi.local_index();
        if idx != 0 {
            inner.indexes.insert(idx, hi.clone());
        }
        let ridx = hi.remote_index();
        if ridx != 0 {
            inner.remote_indexes.insert(ridx, hi.clone());
        }
    }

    /// Atomically repoint the primary for this host info's address
    pub fn make_primary(&self, hi: &Arc<HostInfo>) {
        let mut inner = self.inner.write().unwrap();
        inner.hosts.insert(hi.vpn_ip, hi.clone());
    }

    /// Remove a host info from every table, including any relay indices
    /// carried by it. The primary slot is only vacated if this record
    /// holds it.
    pub fn delete_host_info(&self, hi: &Arc<HostInfo>) {
        let mut inner = self.inner.write().unwrap();

        let idx = hi.local_index();
        if let Some(existing) = inner.indexes.get(&idx) {
            if Arc::ptr_eq(existing, hi) {
                inner.indexes.remove(&idx);
            }
        }
        let ridx = hi.remote_index();
        if let Some(existing) = inner.remote_indexes.get(&ridx) {
            if Arc::ptr_eq(existing, hi) {
                inner.remote_indexes.remove(&ridx);
            }
        }
        if let Some(existing) = inner.hosts.get(&hi.vpn_ip) {
            if Arc::ptr_eq(existing, hi) {
                inner.hosts.remove(&hi.vpn_ip);
            }
        }
        for relay in hi.relay_state.copy_all() {
            inner.relays.remove(&relay.local_index);
        }
        debug!(map = self.name, vpn_ip = %hi.vpn_ip, index = idx, "removed tunnel");
    }

    /// Move a host info out of this map (the pending map) entirely
    pub fn evict(&self, hi: &Arc<HostInfo>) {
        self.delete_host_info(hi);
    }

    /// Look up the primary for sends, periodically re-electing a
    /// non-primary whose remote sits in a preferred range.
    pub fn promote_best_query_vpn_ip(&self, vpn_ip: OverlayIp) -> Option<Arc<HostInfo>> {
        let primary = self.query_vpn_ip(vpn_ip)?;

        if primary.tick_promote_counter() % self.promote_every == 0 {
            let ranges = self.preferred_ranges();
            if !ranges.is_empty() && !self.remote_preferred(&primary, &ranges) {
                let better = {
                    let inner = self.inner.read().unwrap();
                    inner
                        .indexes
                        .values()
                        .find(|hi| {
                            hi.vpn_ip == vpn_ip
                                && !Arc::ptr_eq(hi, &primary)
                                && hi.is_ready()
                                && self.remote_preferred(hi, &ranges)
                        })
                        .cloned()
                };
                if let Some(better) = better {
                    debug!(vpn_ip = %vpn_ip, "promoting preferred-range tunnel to primary");
                    self.make_primary(&better);
                    return Some(better);
                }
            }
        }
        Some(primary)
    }

    fn remote_preferred(&self, hi: &Arc<HostInfo>, ranges: &[Ipv4Net]) -> bool {
        match hi.remote() {
            Some(SocketAddr::V4(a)) => ranges.iter().any(|r| r.contains(a.ip())),
            _ => false,
        }
    }

    pub fn host_count(&self) -> usize {
        self.inner.read().unwrap().hosts.len()
    }

    pub fn index_count(&self) -> usize {
        self.inner.read().unwrap().indexes.len()
    }

    pub fn relay_count(&self) -> usize {
        self.inner.read().unwrap().relays.len()
    }

    pub fn all_host_infos(&self) -> Vec<Arc<HostInfo>> {
        self.inner.read().unwrap().indexes.values().cloned().collect()
    }
}
