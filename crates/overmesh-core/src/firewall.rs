//! Stateful packet filter.
//!
//! Rules are indexed by direction, protocol and port; a packet is
//! admitted by the first matching rule, probed in order: exact
//! protocol+port, protocol+any-port, any-protocol+port, any. Rule
//! predicates match against the peer's verified certificate (groups,
//! name, issuing CA) and its overlay address.
//!
//! Admitted flows establish conntrack entries so replies pass without a
//! rule; each worker keeps a private cache in front of the shared table
//! and drops it wholesale on a timer instead of locking per packet.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ipnet::Ipv4Net;
use tracing::trace;

use overmesh_net::{FirewallPacket, PROTO_ICMP, PROTO_TCP, PROTO_UDP};
use overmesh_pki::MeshCertificate;

use crate::error::{CoreError, CoreResult};

/// Why a packet was refused; surfaced only for logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NoMatchingRule,
    InvalidCertificate,
    NoPeerCert,
}

/// Protocol selector for a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleProto {
    Any,
    Tcp,
    Udp,
    Icmp,
}

impl RuleProto {
    pub fn from_name(name: &str) -> CoreResult<Self> {
        match name {
            "any" => Ok(Self::Any),
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            "icmp" => Ok(Self::Icmp),
            other => Err(CoreError::ConfigInvalid(format!(
                "unknown firewall protocol: {}",
                other
            ))),
        }
    }

    fn matches(self, raw: u8) -> bool {
        match self {
            Self::Any => true,
            Self::Tcp => raw == PROTO_TCP,
            Self::Udp => raw == PROTO_UDP,
            Self::Icmp => raw == PROTO_ICMP,
        }
    }
}

/// One rule's predicates. Empty predicates match everything; specified
/// ones must all hold.
#[derive(Debug, Clone, Default)]
pub struct Rule {
    /// Peer cert must carry every one of these groups
    pub groups: Vec<String>,
    /// Peer cert common name must equal this
    pub host: Option<String>,
    /// Peer overlay address must fall in this range
    pub cidr: Option<Ipv4Net>,
    /// Peer cert must chain to a CA with this name
    pub ca_name: Option<String>,
}

impl Rule {
    fn matches(&self, fp: &FirewallPacket, cert: &MeshCertificate, issuer_name: Option<&str>) -> bool {
        for g in &self.groups {
            if !cert.details.groups.iter().any(|cg| cg == g) {
                return false;
            }
        }
        if let Some(host) = &self.host {
            if host != "any" && *host != cert.details.name {
                return false;
            }
        }
        if let Some(cidr) = &self.cidr {
            if !cidr.contains(&std::net::Ipv4Addr::from(fp.remote_ip)) {
                return false;
            }
        }
        if let Some(want) = &self.ca_name {
            if issuer_name != Some(want.as_str()) {
                return false;
            }
        }
        true
    }
}

#[derive(Default)]
struct RuleTable {
    exact: HashMap<(RuleProto, u16), Vec<Rule>>,
    proto_any_port: HashMap<RuleProto, Vec<Rule>>,
    any_proto_port: HashMap<u16, Vec<Rule>>,
    any: Vec<Rule>,
}

impl RuleTable {
    fn add(&mut self, proto: RuleProto, port: Option<u16>, rule: Rule) {
        match (proto, port) {
            (RuleProto::Any, None) => self.any.push(rule),
            (RuleProto::Any, Some(p)) => self.any_proto_port.entry(p).or_default().push(rule),
            (p, None) => self.proto_any_port.entry(p).or_default().push(rule),
            (p, Some(port)) => self.exact.entry((p, port)).or_default().push(rule),
        }
    }

    fn matches(&self, fp: &FirewallPacket, cert: &MeshCertificate, issuer: Option<&str>) -> bool {
        let proto = match fp.protocol {
            PROTO_TCP => RuleProto::Tcp,
            PROTO_UDP => RuleProto::Udp,
            PROTO_ICMP => RuleProto::Icmp,
            _ => RuleProto::Any,
        };
        let buckets: [Option<&Vec<Rule>>; 4] = [
            self.exact.get(&(proto, fp.local_port)),
            self.proto_any_port.get(&proto),
            self.any_proto_port.get(&fp.local_port),
            Some(&self.any),
        ];
        for bucket in buckets.into_iter().flatten() {
            for rule in bucket {
                if rule.matches(fp, cert, issuer) {
                    return true;
                }
            }
        }
        false
    }
}

type ConnKey = (u32, u32, u16, u16, u8);

fn conn_key(fp: &FirewallPacket) -> ConnKey {
    (
        fp.local_ip.as_u32(),
        fp.remote_ip.as_u32(),
        fp.local_port,
        fp.remote_port,
        fp.protocol,
    )
}

/// Shared connection-tracking table
#[derive(Default)]
pub struct Conntrack {
    inner: Mutex<HashMap<ConnKey, Instant>>,
}

impl Conntrack {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_and_refresh(&self, key: ConnKey, timeout: Duration) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        match inner.get_mut(&key) {
            Some(expiry) if *expiry > now => {
                *expiry = now + timeout;
                true
            }
            Some(_) => {
                inner.remove(&key);
                false
            }
            None => false,
        }
    }

    fn add(&self, key: ConnKey, timeout: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(key, Instant::now() + timeout);
    }

    /// Drop expired flows; run from the stats/maintenance timer
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.inner.lock().unwrap().retain(|_, expiry| *expiry > now);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-worker conntrack cache. Owned by exactly one worker, so no lock;
/// the whole cache is discarded when its timeout lapses.
pub struct ConntrackCache {
    map: HashMap<ConnKey, ()>,
    last_flush: Instant,
    timeout: Duration,
}

impl ConntrackCache {
    pub fn new(timeout: Duration) -> Self {
        Self {
            map: HashMap::new(),
            last_flush: Instant::now(),
            timeout,
        }
    }

    fn check(&mut self, key: &ConnKey) -> bool {
        if self.last_flush.elapsed() > self.timeout {
            self.map.clear();
            self.last_flush = Instant::now();
            return false;
        }
        self.map.contains_key(key)
    }

    fn insert(&mut self, key: ConnKey) {
        self.map.insert(key, ());
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

/// Flow timeouts per protocol class
#[derive(Debug, Clone, Copy)]
pub struct FirewallTimeouts {
    pub tcp: Duration,
    pub udp: Duration,
    pub default: Duration,
}

impl Default for FirewallTimeouts {
    fn default() -> Self {
        Self {
            tcp: Duration::from_secs(12 * 60),
            udp: Duration::from_secs(3 * 60),
            default: Duration::from_secs(10 * 60),
        }
    }
}

/// The packet filter. Immutable once built; config reload swaps in a
/// fresh instance sharing the same conntrack table.
pub struct Firewall {
    inbound: RuleTable,
    outbound: RuleTable,
    conntrack: Arc<Conntrack>,
    timeouts: FirewallTimeouts,
}

impl Firewall {
    pub fn new(timeouts: FirewallTimeouts) -> Self {
        Self::with_conntrack(timeouts, Arc::new(Conntrack::new()))
    }

    /// Build sharing an existing conntrack table (rule reload path)
    pub fn with_conntrack(timeouts: FirewallTimeouts, conntrack: Arc<Conntrack>) -> Self {
        Self {
            inbound: RuleTable::default(),
            outbound: RuleTable::default(),
            conntrack,
            timeouts,
        }
    }

    pub fn conntrack(&self) -> Arc<Conntrack> {
        self.conntrack.clone()
    }

    pub fn add_rule(&mut self, incoming: bool, proto: RuleProto, port: Option<u16>, rule: Rule) {
        if incoming {
            self.inbound.add(proto, port, rule);
        } else {
            self.outbound.add(proto, port, rule);
        }
    }

    fn timeout_for(&self, proto: u8) -> Duration {
        match proto {
            PROTO_TCP => self.timeouts.tcp,
            PROTO_UDP => self.timeouts.udp,
            _ => self.timeouts.default,
        }
    }

    /// Decide a packet's fate. `None` means pass. `issuer_name` is the
    /// resolved name of the CA that signed the peer cert, when known.
    pub fn drop_packet(
        &self,
        fp: &FirewallPacket,
        incoming: bool,
        cert: Option<&MeshCertificate>,
        issuer_name: Option<&str>,
        now_unix: u64,
        mut cache: Option<&mut ConntrackCache>,
    ) -> Option<DropReason> {
        let cert = match cert {
            Some(c) => c,
            None => return Some(DropReason::NoPeerCert),
        };

        let key = conn_key(fp);
        if let Some(cache) = cache.as_deref_mut() {
            if cache.check(&key) {
                return None;
            }
        }
        if self.conntrack.check_and_refresh(key, self.timeout_for(fp.protocol)) {
            if let Some(cache) = cache.as_deref_mut() {
                cache.insert(key);
            }
            return None;
        }

        // The peer must still be inside its validity window and must own
        // the overlay address on the packet
        if cert.valid_at(now_unix).is_err() {
            return Some(DropReason::InvalidCertificate);
        }
        if !cert_owns_ip(cert, fp.remote_ip) {
            return Some(DropReason::InvalidCertificate);
        }

        let table = if incoming { &self.inbound } else { &self.outbound };
        if !table.matches(fp, cert, issuer_name) {
            return Some(DropReason::NoMatchingRule);
        }

        trace!(?fp, incoming, "flow admitted");
        self.conntrack.add(key, self.timeout_for(fp.protocol));
        if let Some(cache) = cache.as_deref_mut() {
            cache.insert(key);
        }
        None
    }
}

fn cert_owns_ip(cert: &MeshCertificate, ip: overmesh_net::OverlayIp) -> bool {
    let addr = std::net::Ipv4Addr::from(ip);
    cert.details.ips.iter().any(|net| net.addr() == addr)
        || cert.details.subnets.iter().any(|net| net.contains(&addr))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use overmesh_net::{build_ipv4_udp, parse_ipv4, OverlayIp};
    use overmesh_pki::{unix_now, CertDetails};
    use rand::rngs::OsRng;
    use std::net::Ipv4Addr;

    fn cert(name: &str, ip: &str, groups: &[&str]) -> MeshCertificate {
        let ca = SigningKey::generate(&mut OsRng);
        MeshCertificate::sign(
            CertDetails {
                name: name.to_string(),
                ips: vec![format!("{}/24", ip).parse().unwrap()],
                subnets: vec![],
                groups: groups.iter().map(|s| s.to_string()).collect(),
                not_before: unix_now(),
                not_after: unix_now() + 3600,
                public_key: [1u8; 32],
                is_ca: false,
                issuer: "x".to_string(),
            },
            &ca,
        )
        .unwrap()
    }

    fn udp_packet(src: &str, dst: &str, sport: u16, dport: u16, incoming: bool) -> FirewallPacket {
        let p = build_ipv4_udp(
            OverlayIp::from(src.parse::<Ipv4Addr>().unwrap()),
            OverlayIp::from(dst.parse::<Ipv4Addr>().unwrap()),
            sport,
            dport,
            b"x",
        );
        parse_ipv4(&p, incoming).unwrap()
    }

    #[test]
    fn test_no_cert_drops() {
        let fw = Firewall::new(FirewallTimeouts::default());
        let fp = udp_packet("10.0.0.2", "10.0.0.1", 9, 80, true);
        assert_eq!(
            fw.drop_packet(&fp, true, None, None, unix_now(), None),
            Some(DropReason::NoPeerCert)
        );
    }

    #[test]
    fn test_rule_port_and_group() {
        let mut fw = Firewall::new(FirewallTimeouts::default());
        fw.add_rule(
            true,
            RuleProto::Udp,
            Some(80),
            Rule {
                groups: vec!["servers".to_string()],
                ..Default::default()
            },
        );

        let good = cert("peer", "10.0.0.2", &["servers"]);
        let bad = cert("peer", "10.0.0.2", &["laptops"]);

        // dst port 80 inbound at 10.0.0.1
        let fp = udp_packet("10.0.0.2", "10.0.0.1", 4000, 80, true);
        assert_eq!(fw.drop_packet(&fp, true, Some(&good), None, unix_now(), None), None);
        assert_eq!(
            fw.drop_packet(&fp, true, Some(&bad), None, unix_now(), None),
            Some(DropReason::NoMatchingRule)
        );

        // wrong port
        let fp = udp_packet("10.0.0.2", "10.0.0.1", 4000, 81, true);
        assert_eq!(
            fw.drop_packet(&fp, true, Some(&good), None, unix_now(), None),
            Some(DropReason::NoMatchingRule)
        );
    }

    #[test]
    fn test_any_rule_catches_all() {
        let mut fw = Firewall::new(FirewallTimeouts::default());
        fw.add_rule(false, RuleProto::Any, None, Rule::default());
        let peer = cert("peer", "10.0.0.2", &[]);
        let fp = udp_packet("10.0.0.1", "10.0.0.2", 1234, 9999, false);
        assert_eq!(fw.drop_packet(&fp, false, Some(&peer), None, unix_now(), None), None);
    }

    #[test]
    fn test_cert_ip_spoof_dropped() {
        let mut fw = Firewall::new(FirewallTimeouts::default());
        fw.add_rule(true, RuleProto::Any, None, Rule::default());
        // cert owns .2 but the packet claims to be from .3
        let peer = cert("peer", "10.0.0.2", &[]);
        let fp = udp_packet("10.0.0.3", "10.0.0.1", 1, 2, true);
        assert_eq!(
            fw.drop_packet(&fp, true, Some(&peer), None, unix_now(), None),
            Some(DropReason::InvalidCertificate)
        );
    }

    #[test]
    fn test_expired_cert_dropped() {
        let mut fw = Firewall::new(FirewallTimeouts::default());
        fw.add_rule(true, RuleProto::Any, None, Rule::default());
        let peer = cert("peer", "10.0.0.2", &[]);
        let fp = udp_packet("10.0.0.2", "10.0.0.1", 1, 2, true);
        assert_eq!(
            fw.drop_packet(&fp, true, Some(&peer), None, unix_now() + 7200, None),
            Some(DropReason::InvalidCertificate)
        );
    }

    #[test]
    fn test_conntrack_admits_reply() {
        let mut fw = Firewall::new(FirewallTimeouts::default());
        // outbound anything, inbound nothing
        fw.add_rule(false, RuleProto::Any, None, Rule::default());
        let peer = cert("peer", "10.0.0.2", &[]);

        // without an outbound flow, the reply is refused
        let reply = udp_packet("10.0.0.2", "10.0.0.1", 80, 4000, true);
        assert_eq!(
            fw.drop_packet(&reply, true, Some(&peer), None, unix_now(), None),
            Some(DropReason::NoMatchingRule)
        );

        // outbound 10.0.0.1:4000 -> 10.0.0.2:80 opens the flow
        let out = udp_packet("10.0.0.1", "10.0.0.2", 4000, 80, false);
        assert_eq!(fw.drop_packet(&out, false, Some(&peer), None, unix_now(), None), None);

        // now the reply passes on conntrack alone
        assert_eq!(fw.drop_packet(&reply, true, Some(&peer), None, unix_now(), None), None);
        assert_eq!(fw.conntrack().len(), 1);
    }

    #[test]
    fn test_worker_cache_hits_without_shared_table() {
        let mut fw = Firewall::new(FirewallTimeouts::default());
        fw.add_rule(false, RuleProto::Any, None, Rule::default());
        let peer = cert("peer", "10.0.0.2", &[]);
        let mut cache = ConntrackCache::new(Duration::from_secs(60));

        let out = udp_packet("10.0.0.1", "10.0.0.2", 4000, 80, false);
        assert_eq!(
            fw.drop_packet(&out, false, Some(&peer), None, unix_now(), Some(&mut cache)),
            None
        );
        assert_eq!(cache.len(), 1);

        // second packet of the flow is a pure cache hit
        assert_eq!(
            fw.drop_packet(&out, false, Some(&peer), None, unix_now(), Some(&mut cache)),
            None
        );
    }

    #[test]
    fn test_ca_name_predicate() {
        let mut fw = Firewall::new(FirewallTimeouts::default());
        fw.add_rule(
            true,
            RuleProto::Any,
            None,
            Rule {
                ca_name: Some("prod ca".to_string()),
                ..Default::default()
            },
        );
        let peer = cert("peer", "10.0.0.2", &[]);
        let fp = udp_packet("10.0.0.2", "10.0.0.1", 1, 2, true);

        assert_eq!(
            fw.drop_packet(&fp, true, Some(&peer), Some("prod ca"), unix_now(), None),
            None
        );
        assert_eq!(
            fw.drop_packet(&fp, true, Some(&peer), Some("lab ca"), unix_now(), None),
            Some(DropReason::NoMatchingRule)
        );
    }
}
