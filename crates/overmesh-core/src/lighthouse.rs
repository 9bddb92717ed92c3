//! Peer discovery.
//!
//! A lighthouse node keeps a directory of every peer's reachable
//! underlay addresses, learned from periodic update notifications.
//! Regular nodes query it when they need a peer's addresses, and the
//! lighthouse additionally tells the queried peer to punch back toward
//! the querier so both NAT mappings open.
//!
//! Discovery messages ride inside established tunnels to the lighthouse
//! like any other traffic.

use std::collections::{HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use overmesh_net::{OverlayIp, RateLimiter, UdpTransport};

use crate::config::{AllowList, Settings};
use crate::error::{CoreError, CoreResult};
use crate::header::{MessageType, SUBTYPE_NONE};
use crate::interface::EncWriter;
use crate::metrics::Metrics;
use crate::punchy::Punchy;
use crate::remote_list::RemoteList;

/// Discovery message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaType {
    HostQuery,
    HostQueryReply,
    HostUpdateNotification,
    HostPunchNotification,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ip4AndPort {
    pub ip: u32,
    pub port: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ip6AndPort {
    pub hi: u64,
    pub lo: u64,
    pub port: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaDetails {
    pub vpn_ip: u32,
    pub ip4_and_ports: Vec<Ip4AndPort>,
    pub ip6_and_ports: Vec<Ip6AndPort>,
    pub relay_vpn_ips: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub typ: MetaType,
    pub details: MetaDetails,
}

impl Ip4AndPort {
    pub fn from_sockaddr(a: &SocketAddrV4) -> Self {
        Self {
            ip: u32::from(*a.ip()),
            port: a.port() as u32,
        }
    }

    pub fn to_sockaddr(self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.ip), self.port as u16)
    }
}

impl Ip6AndPort {
    pub fn to_sockaddr(self) -> SocketAddrV6 {
        let mut octets = [0u8; 16];
        octets[..8].copy_from_slice(&self.hi.to_be_bytes());
        octets[8..].copy_from_slice(&self.lo.to_be_bytes());
        SocketAddrV6::new(octets.into(), self.port as u16, 0, 0)
    }
}

fn encode(meta: &Meta) -> CoreResult<Vec<u8>> {
    bincode::serialize(meta).map_err(|e| CoreError::Encoding(e.to_string()))
}

pub struct Lighthouse {
    am_lighthouse: bool,
    my_vpn_ip: OverlayIp,
    my_vpn_net: ipnet::Ipv4Net,
    addr_map: RwLock<HashMap<OverlayIp, Arc<RemoteList>>>,
    lighthouses: HashSet<OverlayIp>,
    static_map: HashMap<OverlayIp, Vec<SocketAddr>>,
    remote_allow: AllowList,
    local_allow: AllowList,
    interval: Duration,
    punchy: Arc<Punchy>,
    puncher: Arc<UdpTransport>,
    trigger: mpsc::Sender<OverlayIp>,
    query_limiter: RateLimiter<OverlayIp>,
    advertise_addrs: Vec<SocketAddrV4>,
    relays_for_me: Vec<OverlayIp>,
    metrics: Arc<Metrics>,
}

impl Lighthouse {
    pub fn new(
        settings: &Settings,
        my_vpn_ip: OverlayIp,
        my_vpn_net: ipnet::Ipv4Net,
        puncher: Arc<UdpTransport>,
        punchy: Arc<Punchy>,
        trigger: mpsc::Sender<OverlayIp>,
        metrics: Arc<Metrics>,
    ) -> CoreResult<Self> {
        let static_map = settings.static_hosts_parsed()?;
        let lighthouses: HashSet<OverlayIp> = settings.lighthouse_ips()?.into_iter().collect();

        if lighthouses.contains(&my_vpn_ip) {
            return Err(CoreError::ConfigInvalid(
                "lighthouse.hosts must not contain our own address".to_string(),
            ));
        }

        // What we tell lighthouses about ourselves: any static mapping
        // for our own address, plus the bound listen address when it is
        // concrete. Lighthouses additionally learn our NAT mapping from
        // the source address of our updates.
        let mut advertise_addrs = Vec::new();
        if let Some(addrs) = static_map.get(&my_vpn_ip) {
            for a in addrs {
                if let SocketAddr::V4(a) = a {
                    advertise_addrs.push(*a);
                }
            }
        }
        if let SocketAddr::V4(local) = puncher.local_addr() {
            if !local.ip().is_unspecified() {
                advertise_addrs.push(local);
            }
        }

        let lh = Self {
            am_lighthouse: settings.lighthouse.am_lighthouse,
            my_vpn_ip,
            my_vpn_net,
            addr_map: RwLock::new(HashMap::new()),
            lighthouses,
            static_map,
            remote_allow: settings.remote_allow_list_parsed()?,
            local_allow: settings.local_allow_list_parsed()?,
            interval: settings.lighthouse_interval(),
            punchy,
            puncher,
            trigger,
            query_limiter: RateLimiter::new(1, Duration::from_secs(1)),
            advertise_addrs,
            relays_for_me: if settings.relay.use_relays {
                settings.relay_ips()?
            } else {
                Vec::new()
            },
            metrics,
        };

        // Seed the cache with every statically mapped peer
        for (vpn_ip, addrs) in &lh.static_map {
            let list = lh.query_cache_inner(*vpn_ip);
            let v4: Vec<SocketAddrV4> = addrs
                .iter()
                .filter_map(|a| match a {
                    SocketAddr::V4(a) => Some(*a),
                    SocketAddr::V6(_) => None,
                })
                .collect();
            list.set_v4(&v4, |_| true);
            for a in addrs {
                if let SocketAddr::V6(a) = a {
                    list.prepend_v6(*a);
                }
            }
        }
        Ok(lh)
    }

    pub fn punchy(&self) -> &Arc<Punchy> {
        &self.punchy
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn am_lighthouse(&self) -> bool {
        self.am_lighthouse
    }

    pub fn is_lighthouse(&self, vpn_ip: OverlayIp) -> bool {
        self.lighthouses.contains(&vpn_ip)
    }

    pub fn is_static(&self, vpn_ip: OverlayIp) -> bool {
        self.static_map.contains_key(&vpn_ip)
    }

    /// The cached candidate list for a peer, created on first use.
    /// Handshaking tunnels adopt this exact list so replies land in it.
    pub fn query_cache(&self, vpn_ip: OverlayIp) -> Arc<RemoteList> {
        self.query_cache_inner(vpn_ip)
    }

    fn query_cache_inner(&self, vpn_ip: OverlayIp) -> Arc<RemoteList> {
        {
            let map = self.addr_map.read().unwrap();
            if let Some(list) = map.get(&vpn_ip) {
                return list.clone();
            }
        }
        let mut map = self.addr_map.write().unwrap();
        map.entry(vpn_ip)
            .or_insert_with(|| Arc::new(RemoteList::new()))
            .clone()
    }

    /// Ask every lighthouse for a peer's addresses, rate-limited to one
    /// query per peer per second.
    pub async fn query_server(&self, vpn_ip: OverlayIp, w: &dyn EncWriter) {
        if self.am_lighthouse || vpn_ip == self.my_vpn_ip || self.lighthouses.is_empty() {
            return;
        }
        // lighthouses themselves are found through the static map
        if self.lighthouses.contains(&vpn_ip) {
            return;
        }
        if !self.query_limiter.check(vpn_ip) {
            return;
        }
        let msg = Meta {
            typ: MetaType::HostQuery,
            details: MetaDetails {
                vpn_ip: vpn_ip.as_u32(),
                ..Default::default()
            },
        };
        let bytes = match encode(&msg) {
            Ok(b) => b,
            Err(_) => return,
        };
        trace!(%vpn_ip, "querying lighthouses");
        for lh in &self.lighthouses {
            w.send_message_to_vpn_ip(MessageType::LightHouse, SUBTYPE_NONE, *lh, &bytes)
                .await;
        }
    }

    /// Handle one decrypted discovery message from `from_vpn_ip`
    pub async fn handle_request(
        &self,
        w: &dyn EncWriter,
        source_addr: Option<SocketAddr>,
        from_vpn_ip: OverlayIp,
        payload: &[u8],
    ) {
        let msg: Meta = match bincode::deserialize(payload) {
            Ok(m) => m,
            Err(e) => {
                debug!(%from_vpn_ip, "undecodable lighthouse message: {}", e);
                return;
            }
        };

        match msg.typ {
            MetaType::HostQuery => self.handle_host_query(w, from_vpn_ip, &msg.details).await,
            MetaType::HostQueryReply => {
                self.handle_query_reply(from_vpn_ip, &msg.details).await;
            }
            MetaType::HostUpdateNotification => {
                self.handle_host_update(source_addr, from_vpn_ip, &msg.details);
            }
            MetaType::HostPunchNotification => {
                self.handle_punch_notification(from_vpn_ip, &msg.details).await;
            }
        }
    }

    async fn handle_host_query(
        &self,
        w: &dyn EncWriter,
        querier: OverlayIp,
        details: &MetaDetails,
    ) {
        if !self.am_lighthouse {
            debug!(%querier, "got a host query but we are not a lighthouse");
            return;
        }
        let target = OverlayIp::from_u32(details.vpn_ip);

        if let Some(reply) = self.details_for(target) {
            let msg = Meta {
                typ: MetaType::HostQueryReply,
                details: reply,
            };
            if let Ok(bytes) = encode(&msg) {
                w.send_message_to_vpn_ip(MessageType::LightHouse, SUBTYPE_NONE, querier, &bytes)
                    .await;
            }
        }

        // Tell the target to punch toward the querier so both NAT
        // mappings open even when the querier cannot reach it directly
        if let Some(querier_details) = self.details_for(querier) {
            let msg = Meta {
                typ: MetaType::HostPunchNotification,
                details: querier_details,
            };
            if let Ok(bytes) = encode(&msg) {
                w.send_message_to_vpn_ip(MessageType::LightHouse, SUBTYPE_NONE, target, &bytes)
                    .await;
            }
        }
    }

    fn details_for(&self, vpn_ip: OverlayIp) -> Option<MetaDetails> {
        let list = {
            let map = self.addr_map.read().unwrap();
            map.get(&vpn_ip)?.clone()
        };
        let mut details = MetaDetails {
            vpn_ip: vpn_ip.as_u32(),
            ..Default::default()
        };
        for addr in list.copy_addrs(&[]) {
            match addr {
                SocketAddr::V4(a) => details.ip4_and_ports.push(Ip4AndPort::from_sockaddr(&a)),
                SocketAddr::V6(a) => details.ip6_and_ports.push(Ip6AndPort {
                    hi: u64::from_be_bytes(a.ip().octets()[..8].try_into().unwrap()),
                    lo: u64::from_be_bytes(a.ip().octets()[8..].try_into().unwrap()),
                    port: a.port() as u32,
                }),
            }
        }
        details.relay_vpn_ips = list.relays().iter().map(|r| r.as_u32()).collect();
        Some(details)
    }

    async fn handle_query_reply(&self, from_vpn_ip: OverlayIp, details: &MetaDetails) {
        // Only lighthouses we actually query may steer us
        if !self.lighthouses.contains(&from_vpn_ip) {
            return;
        }
        let target = OverlayIp::from_u32(details.vpn_ip);
        let list = self.query_cache_inner(target);

        let candidates: Vec<SocketAddrV4> = details
            .ip4_and_ports
            .iter()
            .map(|p| p.to_sockaddr())
            .filter(|a| self.learnable(a))
            .collect();
        list.set_v4(&candidates, |_| true);
        for p in &details.ip6_and_ports {
            list.prepend_v6(p.to_sockaddr());
        }
        list.set_relays(
            details
                .relay_vpn_ips
                .iter()
                .map(|r| OverlayIp::from_u32(*r))
                .filter(|r| *r != self.my_vpn_ip)
                .collect(),
        );
        trace!(%target, addrs = list.len(), "lighthouse reply cached");

        // Kick the pending handshake rather than waiting a full retry
        let _ = self.trigger.try_send(target);

        if self.punchy.punch() {
            self.punch_all(&candidates).await;
        }
    }

    fn handle_host_update(
        &self,
        source_addr: Option<SocketAddr>,
        from_vpn_ip: OverlayIp,
        details: &MetaDetails,
    ) {
        if !self.am_lighthouse {
            return;
        }
        if details.vpn_ip != from_vpn_ip.as_u32() {
            debug!(%from_vpn_ip, "update notification for someone else, ignoring");
            return;
        }
        let list = self.query_cache_inner(from_vpn_ip);
        let candidates: Vec<SocketAddrV4> = details
            .ip4_and_ports
            .iter()
            .map(|p| p.to_sockaddr())
            .collect();
        list.set_v4(&candidates, |a| self.learnable(a));
        // The address the update actually came from is the one NAT will
        // accept; it goes in front
        if let Some(SocketAddr::V4(observed)) = source_addr {
            if self.learnable(&observed) {
                list.prepend_v4(observed);
            }
        }
        list.set_relays(
            details
                .relay_vpn_ips
                .iter()
                .map(|r| OverlayIp::from_u32(*r))
                .collect(),
        );
        trace!(%from_vpn_ip, addrs = list.len(), "host update stored");
    }

    async fn handle_punch_notification(&self, from_vpn_ip: OverlayIp, details: &MetaDetails) {
        // Punch instructions only come from our lighthouses
        if !self.lighthouses.contains(&from_vpn_ip) {
            return;
        }
        let addrs: Vec<SocketAddrV4> = details
            .ip4_and_ports
            .iter()
            .map(|p| p.to_sockaddr())
            .filter(|a| self.learnable(a))
            .collect();
        if self.punchy.punch() {
            self.punch_all(&addrs).await;
        }
        if self.punchy.respond() {
            // After the punches have had a moment to open state, dial
            // the peer ourselves
            let target = OverlayIp::from_u32(details.vpn_ip);
            let trigger = self.trigger.clone();
            let delay = self.punchy.respond_delay();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = trigger.try_send(target);
            });
        }
    }

    /// Fire a small datagram at each address to open NAT state. The
    /// payload is a single zero byte, too short to parse as a header,
    /// so receivers drop it silently.
    async fn punch_all(&self, addrs: &[SocketAddrV4]) {
        let delay = self.punchy.delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay.min(Duration::from_millis(100))).await;
        }
        for a in addrs {
            if self.puncher.send_to(&[0], SocketAddr::V4(*a)).await.is_ok() {
                self.metrics.punches_sent.fetch_add(1, Ordering::Relaxed);
                trace!(addr = %a, "punched");
            }
        }
    }

    /// Whether a learned address is usable as a peer underlay
    fn learnable(&self, a: &SocketAddrV4) -> bool {
        if a.port() == 0 {
            return false;
        }
        // never learn addresses inside the overlay itself
        if self.my_vpn_net.contains(a.ip()) {
            return false;
        }
        self.remote_allow.allows(*a.ip())
    }

    /// One publish pass: tell every lighthouse where we can be reached
    pub async fn publish_update(&self, w: &dyn EncWriter) {
        if self.am_lighthouse || self.lighthouses.is_empty() {
            return;
        }
        let mut details = MetaDetails {
            vpn_ip: self.my_vpn_ip.as_u32(),
            ..Default::default()
        };
        for a in &self.advertise_addrs {
            if self.local_allow.allows_sockaddr(a) {
                details.ip4_and_ports.push(Ip4AndPort::from_sockaddr(a));
            }
        }
        details.relay_vpn_ips = self.relays_for_me.iter().map(|r| r.as_u32()).collect();

        let msg = Meta {
            typ: MetaType::HostUpdateNotification,
            details,
        };
        let bytes = match encode(&msg) {
            Ok(b) => b,
            Err(_) => return,
        };
        for lh in &self.lighthouses {
            w.send_message_to_vpn_ip(MessageType::LightHouse, SUBTYPE_NONE, *lh, &bytes)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostmap::{HostInfo, Relay};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingWriter {
        sent: Mutex<Vec<(MessageType, OverlayIp, Vec<u8>)>>,
    }

    #[async_trait]
    impl EncWriter for RecordingWriter {
        async fn send_message_to_vpn_ip(
            &self,
            typ: MessageType,
            _st: u8,
            vpn_ip: OverlayIp,
            payload: &[u8],
        ) {
            self.sent
                .lock()
                .unwrap()
                .push((typ, vpn_ip, payload.to_vec()));
        }
        async fn send_datagram_via(&self, _c: &Arc<HostInfo>, _r: &Relay, _i: &[u8]) {}
        async fn request_relay(&self, _t: OverlayIp, _r: OverlayIp) {}
    }

    fn ip(s: &str) -> OverlayIp {
        OverlayIp::from(s.parse::<Ipv4Addr>().unwrap())
    }

    async fn lighthouse_node(am_lighthouse: bool, settings_extra: &str) -> Lighthouse {
        let yaml = format!(
            "lighthouse:\n  am_lighthouse: {}\n{}",
            am_lighthouse, settings_extra
        );
        let settings = Settings::from_yaml(&yaml).unwrap();
        let transport = Arc::new(
            UdpTransport::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );
        let (tx, _rx) = mpsc::channel(8);
        Lighthouse::new(
            &settings,
            ip("10.128.0.1"),
            "10.128.0.0/24".parse().unwrap(),
            transport,
            Arc::new(Punchy::new(false, false, Duration::ZERO, Duration::ZERO)),
            tx,
            Arc::new(Metrics::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_update_then_query_round_trip() {
        let lh = lighthouse_node(true, "").await;
        let w = RecordingWriter::default();

        // 10.128.0.2 reports in from 198.51.100.7
        let update = Meta {
            typ: MetaType::HostUpdateNotification,
            details: MetaDetails {
                vpn_ip: ip("10.128.0.2").as_u32(),
                ip4_and_ports: vec![Ip4AndPort {
                    ip: u32::from(Ipv4Addr::new(192, 0, 2, 9)),
                    port: 4242,
                }],
                ..Default::default()
            },
        };
        lh.handle_request(
            &w,
            Some("198.51.100.7:9999".parse().unwrap()),
            ip("10.128.0.2"),
            &bincode::serialize(&update).unwrap(),
        )
        .await;

        // 10.128.0.3 asks where .2 lives
        let query = Meta {
            typ: MetaType::HostQuery,
            details: MetaDetails {
                vpn_ip: ip("10.128.0.2").as_u32(),
                ..Default::default()
            },
        };
        lh.handle_request(
            &w,
            Some("203.0.113.5:1111".parse().unwrap()),
            ip("10.128.0.3"),
            &bincode::serialize(&query).unwrap(),
        )
        .await;

        let sent = w.sent.lock().unwrap();
        let (typ, to, payload) = &sent[0];
        assert_eq!(*typ, MessageType::LightHouse);
        assert_eq!(*to, ip("10.128.0.3"));
        let reply: Meta = bincode::deserialize(payload).unwrap();
        assert_eq!(reply.typ, MetaType::HostQueryReply);
        assert_eq!(reply.details.vpn_ip, ip("10.128.0.2").as_u32());
        // reported address plus the observed source address
        assert_eq!(reply.details.ip4_and_ports.len(), 2);
    }

    #[tokio::test]
    async fn test_query_sends_punch_notification_to_target() {
        let lh = lighthouse_node(true, "").await;
        let w = RecordingWriter::default();

        for (peer, addr) in [("10.128.0.2", "192.0.2.9:4242"), ("10.128.0.3", "192.0.2.10:4242")] {
            let a: SocketAddrV4 = addr.parse().unwrap();
            let update = Meta {
                typ: MetaType::HostUpdateNotification,
                details: MetaDetails {
                    vpn_ip: ip(peer).as_u32(),
                    ip4_and_ports: vec![Ip4AndPort::from_sockaddr(&a)],
                    ..Default::default()
                },
            };
            lh.handle_request(&w, None, ip(peer), &bincode::serialize(&update).unwrap())
                .await;
        }

        let query = Meta {
            typ: MetaType::HostQuery,
            details: MetaDetails {
                vpn_ip: ip("10.128.0.2").as_u32(),
                ..Default::default()
            },
        };
        lh.handle_request(&w, None, ip("10.128.0.3"), &bincode::serialize(&query).unwrap())
            .await;

        let sent = w.sent.lock().unwrap();
        // reply to querier + punch notification to target
        assert_eq!(sent.len(), 2);
        let (_, to, payload) = &sent[1];
        assert_eq!(*to, ip("10.128.0.2"));
        let punch: Meta = bincode::deserialize(payload).unwrap();
        assert_eq!(punch.typ, MetaType::HostPunchNotification);
        assert_eq!(punch.details.vpn_ip, ip("10.128.0.3").as_u32());
    }

    #[tokio::test]
    async fn test_non_lighthouse_ignores_queries() {
        let lh = lighthouse_node(false, "").await;
        let w = RecordingWriter::default();
        let query = Meta {
            typ: MetaType::HostQuery,
            details: MetaDetails {
                vpn_ip: ip("10.128.0.2").as_u32(),
                ..Default::default()
            },
        };
        lh.handle_request(&w, None, ip("10.128.0.3"), &bincode::serialize(&query).unwrap())
            .await;
        assert!(w.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_query_reply_only_accepted_from_lighthouse() {
        let extra = "static_host_map:\n  \"10.128.0.9\": [\"192.0.2.1:4242\"]\n";
        let yaml_hosts = format!("  hosts: [\"10.128.0.9\"]\n{}", extra);
        let lh = lighthouse_node(false, &yaml_hosts).await;

        let reply = Meta {
            typ: MetaType::HostQueryReply,
            details: MetaDetails {
                vpn_ip: ip("10.128.0.2").as_u32(),
                ip4_and_ports: vec![Ip4AndPort {
                    ip: u32::from(Ipv4Addr::new(192, 0, 2, 50)),
                    port: 4242,
                }],
                ..Default::default()
            },
        };
        let w = RecordingWriter::default();

        // from a random peer: ignored
        lh.handle_request(&w, None, ip("10.128.0.4"), &bincode::serialize(&reply).unwrap())
            .await;
        assert!(lh.query_cache(ip("10.128.0.2")).is_empty());

        // from the configured lighthouse: cached
        lh.handle_request(&w, None, ip("10.128.0.9"), &bincode::serialize(&reply).unwrap())
            .await;
        assert_eq!(lh.query_cache(ip("10.128.0.2")).len(), 1);
    }

    #[tokio::test]
    async fn test_overlay_addresses_never_learned() {
        let lh = lighthouse_node(true, "").await;
        let w = RecordingWriter::default();
        let update = Meta {
            typ: MetaType::HostUpdateNotification,
            details: MetaDetails {
                vpn_ip: ip("10.128.0.2").as_u32(),
                ip4_and_ports: vec![
                    // inside the overlay, must be refused
                    Ip4AndPort {
                        ip: u32::from(Ipv4Addr::new(10, 128, 0, 7)),
                        port: 4242,
                    },
                    Ip4AndPort {
                        ip: u32::from(Ipv4Addr::new(192, 0, 2, 9)),
                        port: 4242,
                    },
                ],
                ..Default::default()
            },
        };
        lh.handle_request(&w, None, ip("10.128.0.2"), &bincode::serialize(&update).unwrap())
            .await;
        assert_eq!(lh.query_cache(ip("10.128.0.2")).len(), 1);
    }

    #[tokio::test]
    async fn test_query_server_rate_limited() {
        let extra = "static_host_map:\n  \"10.128.0.9\": [\"192.0.2.1:4242\"]\n";
        let yaml_hosts = format!("  hosts: [\"10.128.0.9\"]\n{}", extra);
        let lh = lighthouse_node(false, &yaml_hosts).await;
        let w = RecordingWriter::default();

        lh.query_server(ip("10.128.0.2"), &w).await;
        lh.query_server(ip("10.128.0.2"), &w).await;
        assert_eq!(w.sent.lock().unwrap().len(), 1, "second query inside the window is dropped");
    }

    #[tokio::test]
    async fn test_static_map_seeds_cache() {
        let extra = "static_host_map:\n  \"10.128.0.9\": [\"192.0.2.1:4242\"]\n";
        let yaml_hosts = format!("  hosts: [\"10.128.0.9\"]\n{}", extra);
        let lh = lighthouse_node(false, &yaml_hosts).await;
        assert!(lh.is_static(ip("10.128.0.9")));
        assert_eq!(lh.query_cache(ip("10.128.0.9")).len(), 1);
    }
}
