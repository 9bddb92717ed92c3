//! Handshake lifecycle: initiation, timer-driven retries with backoff,
//! responder handling, race resolution, and promotion of completed
//! tunnels into the main host map.
//!
//! In-flight tunnels live in a separate "pending" host map. A timer
//! wheel re-fires each outstanding handshake; when the peer's addresses
//! are unknown the lighthouse is asked first. When both sides initiate
//! at once, the side with the lower overlay address keeps its initiator
//! tunnel and the other side's becomes a secondary that the connection
//! manager later collapses.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, trace};

use overmesh_net::{OverlayIp, UdpTransport};
use overmesh_pki::unix_now;

use crate::error::{CoreError, CoreResult};
use crate::handshake::{read_hello, respond, InitiatorHandshake};
use crate::header::{Header, MessageType, HANDSHAKE_HELLO, HANDSHAKE_REPLY, HEADER_LEN};
use crate::hostmap::{HostInfo, HostMap, RelayPhase};
use crate::interface::{CertState, EncWriter, Interface, PacketSource};
use crate::lighthouse::Lighthouse;
use crate::metrics::Metrics;
use crate::session::{CipherKind, ConnectionState, DEFAULT_QUEUE_CAP};
use crate::timer_wheel::TimerWheel;

/// Most addresses one retry burst will spray a hello at
const MAX_HELLO_ADDRS: usize = 8;

/// Most relays one retry burst will try to thread a hello through
const MAX_HELLO_RELAYS: usize = 2;

/// Cap on the retry backoff exponent
const BACKOFF_CAP: u32 = 6;

#[derive(Debug, Clone, Copy)]
pub struct HandshakeConfig {
    pub try_interval: Duration,
    pub retries: u32,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            try_interval: Duration::from_secs(1),
            retries: 10,
        }
    }
}

pub struct HandshakeManager {
    pending: HostMap,
    main: Arc<HostMap>,
    lighthouse: Arc<Lighthouse>,
    outside: Arc<UdpTransport>,
    wheel: Mutex<TimerWheel<OverlayIp>>,
    config: HandshakeConfig,
    cipher: CipherKind,
    metrics: Arc<Metrics>,
}

impl HandshakeManager {
    pub fn new(
        main: Arc<HostMap>,
        lighthouse: Arc<Lighthouse>,
        outside: Arc<UdpTransport>,
        config: HandshakeConfig,
        cipher: CipherKind,
        metrics: Arc<Metrics>,
    ) -> Self {
        let span = config.try_interval * (1u32 << BACKOFF_CAP) * 2;
        Self {
            pending: HostMap::new("pending", main.vpn_cidr(), main.preferred_ranges().to_vec()),
            main,
            lighthouse,
            outside,
            wheel: Mutex::new(TimerWheel::new(config.try_interval, span)),
            config,
            cipher,
            metrics,
        }
    }

    pub fn pending(&self) -> &HostMap {
        &self.pending
    }

    /// Timer wheel tick granularity
    pub fn try_interval(&self) -> Duration {
        self.config.try_interval
    }

    /// Entries currently scheduled on the retry wheel
    pub fn wheel_len(&self) -> usize {
        self.wheel.lock().unwrap().len()
    }

    /// Ensure a pending tunnel exists for `vpn_ip`. A fresh one gets an
    /// index, an initiator session, and its hello bytes precomputed; a
    /// retry of an existing one is a no-op returning the same record.
    pub fn add_vpn_ip(
        &self,
        vpn_ip: OverlayIp,
        cert_state: &CertState,
    ) -> CoreResult<Arc<HostInfo>> {
        let (hostinfo, created) = self.pending.add_vpn_ip(vpn_ip);
        if !created {
            return Ok(hostinfo);
        }

        let index = self.pending.allocate_index(&[self.main.as_ref()])?;
        self.pending.insert_index(index, &hostinfo);

        let cs = ConnectionState::new(true, self.cipher, DEFAULT_QUEUE_CAP);
        hostinfo.set_connection_state(Arc::new(cs));

        let hs = InitiatorHandshake::new(cert_state.private_key.clone());
        let hello = hs.create_hello(&cert_state.raw_cert, index)?;
        let mut datagram =
            Header::new(MessageType::Handshake, HANDSHAKE_HELLO, 0, 0)
                .encode(self.cipher.counter_le())
                .to_vec();
        datagram.extend_from_slice(&hello);

        hostinfo.set_handshake_packet(datagram);
        hostinfo.set_initiator_state(hs);
        hostinfo.set_handshake_ready();

        self.wheel
            .lock()
            .unwrap()
            .add(vpn_ip, self.config.try_interval);
        self.metrics
            .handshakes_initiated
            .fetch_add(1, Ordering::Relaxed);
        debug!(%vpn_ip, index, "starting handshake");
        Ok(hostinfo)
    }

    /// Advance the retry wheel and fire every expired handshake
    pub async fn next_outbound_tick(&self, now: Instant, w: &dyn EncWriter) {
        let expired = self.wheel.lock().unwrap().purge(now);
        for vpn_ip in expired {
            self.handle_outbound(vpn_ip, w, false).await;
        }
    }

    /// One transmit attempt for an outstanding handshake.
    ///
    /// `lighthouse_triggered` marks a short-circuit from the trigger
    /// channel (static host or fresh lighthouse reply); it may only
    /// accelerate the first attempt and never reschedules, since the
    /// wheel entry from `add_vpn_ip` is still live.
    pub async fn handle_outbound(
        &self,
        vpn_ip: OverlayIp,
        w: &dyn EncWriter,
        lighthouse_triggered: bool,
    ) {
        let hostinfo = match self.pending.query_vpn_ip(vpn_ip) {
            Some(hi) => hi,
            None => return,
        };
        if hostinfo.is_ready() {
            // raced to completion
            return;
        }

        let counter = hostinfo.handshake_counter();
        if counter >= self.config.retries {
            info!(%vpn_ip, attempts = counter, "handshake timed out, giving up");
            self.metrics
                .handshakes_timed_out
                .fetch_add(1, Ordering::Relaxed);
            self.pending.delete_host_info(&hostinfo);
            return;
        }
        if lighthouse_triggered && counter > 0 {
            return;
        }
        if !hostinfo.handshake_ready() {
            self.wheel
                .lock()
                .unwrap()
                .add(vpn_ip, self.config.try_interval);
            return;
        }

        // Adopt the lighthouse cache entry so replies land directly in
        // our candidate set
        if hostinfo.remotes().is_empty() {
            hostinfo.set_remotes(self.lighthouse.query_cache(vpn_ip));
        }
        let remotes = hostinfo.remotes();
        if remotes.is_empty() {
            self.lighthouse.query_server(vpn_ip, w).await;
        }

        let hello = hostinfo.handshake_packet();
        let addrs = remotes.copy_addrs(&self.main.preferred_ranges());
        let mut sent = Vec::new();
        for addr in addrs {
            // the list allows duplicates; dedup here
            if sent.contains(&addr) {
                continue;
            }
            if sent.len() >= MAX_HELLO_ADDRS {
                break;
            }
            match self.outside.send_to(&hello, addr).await {
                Ok(()) => sent.push(addr),
                Err(e) => debug!(%addr, "hello send failed: {}", e),
            }
        }
        if !sent.is_empty() {
            trace!(%vpn_ip, attempt = counter + 1, targets = sent.len(), "hello sent");
        }

        // Thread the hello through relays when the peer advertises them
        for relay_ip in remotes.relays().into_iter().take(MAX_HELLO_RELAYS) {
            let carried = match self.main.query_vpn_ip(relay_ip) {
                Some(carrier) => match carrier.relay_state.query_by_ip(vpn_ip) {
                    Some(relay) if relay.phase == RelayPhase::Established => {
                        w.send_datagram_via(&carrier, &relay, &hello).await;
                        true
                    }
                    _ => false,
                },
                None => false,
            };
            if !carried {
                w.request_relay(vpn_ip, relay_ip).await;
            }
        }

        hostinfo.bump_handshake_counter();
        if !lighthouse_triggered {
            self.wheel
                .lock()
                .unwrap()
                .add(vpn_ip, self.backoff(counter + 1));
        }
    }

    /// try_interval doubling per attempt, capped, with +/-20% jitter
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(BACKOFF_CAP);
        let base = self.config.try_interval * (1u32 << exp);
        let factor = rand::thread_rng().gen_range(0.8..1.2);
        Duration::from_secs_f64(base.as_secs_f64() * factor)
    }

    /// Responder side: authenticate a hello, stand up the tunnel, send
    /// the reply. Duplicate hellos re-send the cached reply.
    pub async fn handle_hello(&self, intf: &Interface, source: PacketSource, data: &[u8]) {
        if data.len() < HEADER_LEN {
            return;
        }
        let parsed = match read_hello(&data[HEADER_LEN..], unix_now()) {
            Ok(p) => p,
            Err(CoreError::HandshakeReplay) => {
                // never answer a replayed handshake
                self.metrics.replay_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                debug!("dropping undecodable hello: {}", e);
                return;
            }
        };

        let ca_pool = intf.ca_pool();
        if let Err(e) = ca_pool.verify(&parsed.peer_cert, unix_now()) {
            debug!(name = %parsed.peer_cert.details.name, "rejecting hello, cert failed: {}", e);
            return;
        }
        let vpn_ip = match parsed.peer_cert.overlay_addr() {
            Ok(ip) => OverlayIp::from(ip),
            Err(_) => return,
        };
        if vpn_ip == intf.my_vpn_ip {
            debug!("dropping hello claiming our own overlay address");
            return;
        }
        if !self.main.vpn_cidr().contains(&std::net::Ipv4Addr::from(vpn_ip)) {
            debug!(%vpn_ip, "dropping hello from outside our overlay network");
            return;
        }

        // A retry of a hello we already answered: re-send the reply
        if let Some(existing) = self.main.query_remote_index(parsed.initiator_index) {
            if existing.vpn_ip == vpn_ip {
                let cached = existing.handshake_packet();
                if !cached.is_empty() {
                    trace!(%vpn_ip, "re-sending cached handshake reply");
                    self.transmit_reply(intf, &source, &cached).await;
                }
                return;
            }
        }

        let index = match self.main.allocate_index(&[&self.pending]) {
            Ok(i) => i,
            Err(e) => {
                tracing::error!("dropping hello: {}", e);
                return;
            }
        };

        let cert_state = intf.cert_state();
        let (reply, outcome) = match respond(
            &cert_state.private_key,
            &cert_state.raw_cert,
            &parsed,
            index,
            self.cipher,
        ) {
            Ok(r) => r,
            Err(e) => {
                debug!("failed to answer hello: {}", e);
                return;
            }
        };

        let hostinfo = Arc::new(HostInfo::new(vpn_ip));
        hostinfo.set_local_index(index);
        hostinfo.set_remote_index(outcome.initiator_index);
        hostinfo.set_peer_cert(Arc::new(outcome.peer_cert));
        hostinfo.set_remotes(self.lighthouse.query_cache(vpn_ip));

        let cs = ConnectionState::new(false, self.cipher, DEFAULT_QUEUE_CAP);
        if cs.set_keys(outcome.send, outcome.recv).is_err() {
            return;
        }
        // The responder can carry traffic as soon as the reply is out
        if cs.mark_ready().is_err() {
            return;
        }
        hostinfo.set_connection_state(Arc::new(cs));

        let mut datagram = Header::new(
            MessageType::Handshake,
            HANDSHAKE_REPLY,
            outcome.initiator_index,
            0,
        )
        .encode(self.cipher.counter_le())
        .to_vec();
        datagram.extend_from_slice(&reply);
        hostinfo.set_handshake_packet(datagram.clone());

        match &source {
            PacketSource::Direct(addr) => {
                hostinfo.set_remote(*addr);
                if let std::net::SocketAddr::V4(a) = addr {
                    hostinfo.remotes().prepend_v4(*a);
                }
            }
            PacketSource::Relayed { carrier, .. } => {
                hostinfo.remotes().add_relay(carrier.vpn_ip);
            }
        }

        // Concurrent initiations: the lower overlay address keeps its
        // initiator tunnel, so if the peer is lower its tunnel (this
        // one) takes the primary slot; if we are lower, this tunnel
        // rides along as a secondary until the loser is collapsed.
        let racing = self.pending.query_vpn_ip(vpn_ip).is_some();
        if racing && intf.my_vpn_ip < vpn_ip {
            self.main.add_host_info_secondary(&hostinfo);
            info!(%vpn_ip, "handshake race detected, keeping our initiation primary");
        } else {
            self.main.add_host_info_as_primary(&hostinfo);
        }

        self.transmit_reply(intf, &source, &datagram).await;
        intf.connection_manager.watch(index);
        self.metrics
            .handshakes_completed
            .fetch_add(1, Ordering::Relaxed);
        info!(
            %vpn_ip,
            index,
            remote_index = outcome.initiator_index,
            cert = %hostinfo.peer_cert().map(|c| c.details.name.clone()).unwrap_or_default(),
            "handshake answered, tunnel up"
        );
    }

    async fn transmit_reply(&self, intf: &Interface, source: &PacketSource, datagram: &[u8]) {
        match source {
            PacketSource::Direct(addr) => {
                if let Err(e) = self.outside.send_to(datagram, *addr).await {
                    debug!(%addr, "reply send failed: {}", e);
                }
            }
            PacketSource::Relayed { carrier, relay } => {
                intf.send_datagram_via(carrier, relay, datagram).await;
            }
        }
    }

    /// Initiator side: authenticate the reply, finish the session,
    /// promote the tunnel out of the pending map, flush held packets.
    pub async fn handle_reply(
        &self,
        intf: &Interface,
        source: PacketSource,
        header: &Header,
        data: &[u8],
    ) {
        let hostinfo = match self.pending.query_index(header.remote_index) {
            Some(hi) => hi,
            None => {
                // duplicate or stale reply
                trace!(index = header.remote_index, "reply for unknown pending handshake");
                return;
            }
        };

        let hs = match hostinfo.take_initiator_state() {
            Some(hs) => hs,
            None => return,
        };
        let outcome = match hs.process_reply(&data[HEADER_LEN..], self.cipher) {
            Ok(o) => o,
            Err(e) => {
                debug!(vpn_ip = %hostinfo.vpn_ip, "reply failed to authenticate: {}", e);
                // keep the state; a retried reply may still land
                hostinfo.set_initiator_state(hs);
                return;
            }
        };

        let ca_pool = intf.ca_pool();
        if let Err(e) = ca_pool.verify(&outcome.peer_cert, unix_now()) {
            debug!(vpn_ip = %hostinfo.vpn_ip, "rejecting reply, cert failed: {}", e);
            // a reply from the real peer may still be in flight
            hostinfo.set_initiator_state(hs);
            return;
        }
        match outcome.peer_cert.overlay_addr() {
            Ok(ip) if OverlayIp::from(ip) == hostinfo.vpn_ip => {}
            _ => {
                debug!(vpn_ip = %hostinfo.vpn_ip, "rejecting reply, cert does not own the address");
                hostinfo.set_initiator_state(hs);
                return;
            }
        }

        let cs = match hostinfo.connection_state() {
            Some(cs) => cs,
            None => return,
        };
        if cs.set_keys(outcome.send, outcome.recv).is_err() {
            return;
        }
        hostinfo.set_peer_cert(Arc::new(outcome.peer_cert));
        hostinfo.set_remote_index(outcome.responder_index);

        match &source {
            PacketSource::Direct(addr) => {
                hostinfo.set_remote(*addr);
                if let std::net::SocketAddr::V4(a) = addr {
                    hostinfo.remotes().prepend_v4(*a);
                }
            }
            PacketSource::Relayed { carrier, .. } => {
                hostinfo.remotes().add_relay(carrier.vpn_ip);
            }
        }

        // Race rule: the lower address keeps its initiator tunnel as
        // primary; the higher adopts the peer's and ours stays
        // secondary until the connection manager collapses it.
        let peer_won = match self.main.query_vpn_ip(hostinfo.vpn_ip) {
            Some(existing) if existing.is_ready() => intf.my_vpn_ip > hostinfo.vpn_ip,
            _ => false,
        };
        if peer_won {
            self.main.add_host_info_secondary(&hostinfo);
            info!(vpn_ip = %hostinfo.vpn_ip, "handshake race lost, adopting peer's tunnel");
        } else {
            self.main.add_host_info_as_primary(&hostinfo);
        }
        self.pending.evict(&hostinfo);

        let drained = match cs.ready_and_drain() {
            Ok(d) => d,
            Err(_) => return,
        };
        for cached in drained {
            intf.send_queued_packet(&hostinfo, &cs, cached).await;
        }

        intf.connection_manager.watch(hostinfo.local_index());
        self.metrics
            .handshakes_completed
            .fetch_add(1, Ordering::Relaxed);
        info!(
            vpn_ip = %hostinfo.vpn_ip,
            index = hostinfo.local_index(),
            remote_index = outcome.responder_index,
            "handshake complete, tunnel up"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::header::MessageType;
    use crate::hostmap::Relay;
    use crate::punchy::Punchy;
    use async_trait::async_trait;
    use ed25519_dalek::SigningKey;
    use overmesh_pki::CertDetails;
    use rand::rngs::OsRng;
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc;

    struct MockEncWriter;

    #[async_trait]
    impl EncWriter for MockEncWriter {
        async fn send_message_to_vpn_ip(
            &self,
            _typ: MessageType,
            _st: u8,
            _vpn_ip: OverlayIp,
            _payload: &[u8],
        ) {
        }
        async fn send_datagram_via(&self, _c: &Arc<HostInfo>, _r: &Relay, _i: &[u8]) {}
        async fn request_relay(&self, _t: OverlayIp, _r: OverlayIp) {}
    }

    fn cert_state(ip: &str) -> CertState {
        let key = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let ca = SigningKey::generate(&mut OsRng);
        let cert = overmesh_pki::MeshCertificate::sign(
            CertDetails {
                name: "test host".to_string(),
                ips: vec![format!("{}/24", ip).parse().unwrap()],
                subnets: vec![],
                groups: vec![],
                not_before: unix_now(),
                not_after: unix_now() + 3600,
                public_key: x25519_dalek::PublicKey::from(&key).to_bytes(),
                is_ca: false,
                issuer: "test".to_string(),
            },
            &ca,
        )
        .unwrap();
        CertState::new(cert, key).unwrap()
    }

    async fn manager() -> HandshakeManager {
        let main = Arc::new(HostMap::new(
            "main",
            "172.1.1.0/24".parse().unwrap(),
            vec!["10.1.1.0/24".parse().unwrap()],
        ));
        let transport = Arc::new(
            UdpTransport::bind("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );
        let (tx, _rx) = mpsc::channel(8);
        let lighthouse = Arc::new(
            Lighthouse::new(
                &Settings::default(),
                OverlayIp::from(Ipv4Addr::new(172, 1, 1, 1)),
                "172.1.1.0/24".parse().unwrap(),
                transport.clone(),
                Arc::new(Punchy::default()),
                tx,
                Arc::new(Metrics::new()),
            )
            .unwrap(),
        );
        HandshakeManager::new(
            main,
            lighthouse,
            transport,
            HandshakeConfig::default(),
            CipherKind::Aes,
            Arc::new(Metrics::new()),
        )
    }

    #[tokio::test]
    async fn test_add_vpn_ip_idempotent() {
        let hm = manager().await;
        let cs = cert_state("172.1.1.1");
        let ip = OverlayIp::from(Ipv4Addr::new(172, 1, 1, 2));

        let a = hm.add_vpn_ip(ip, &cs).unwrap();
        assert!(a.handshake_ready());
        assert_ne!(a.local_index(), 0);
        assert_eq!(hm.wheel_len(), 1);

        let b = hm.add_vpn_ip(ip, &cs).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(hm.pending().host_count(), 1);
        assert_eq!(hm.wheel_len(), 1, "retry must not double-schedule");
    }

    #[tokio::test]
    async fn test_trigger_only_accelerates_first_attempt() {
        let hm = manager().await;
        let cs = cert_state("172.1.1.1");
        let ip = OverlayIp::from(Ipv4Addr::new(172, 1, 1, 2));
        let mw = MockEncWriter;

        let hi = hm.add_vpn_ip(ip, &cs).unwrap();
        assert_eq!(hi.handshake_counter(), 0);

        hm.handle_outbound(ip, &mw, true).await;
        assert_eq!(hi.handshake_counter(), 1, "trigger fires the first attempt");
        assert_eq!(hm.wheel_len(), 1, "trigger must not add a wheel entry");

        hi.remotes().prepend_v4("10.1.1.1:4242".parse().unwrap());
        hm.handle_outbound(ip, &mw, true).await;
        assert_eq!(hi.handshake_counter(), 1, "later triggers are no-ops");
        assert_eq!(hm.wheel_len(), 1);
    }

    #[tokio::test]
    async fn test_retries_exhaust_and_evict() {
        let hm = manager().await;
        let cs = cert_state("172.1.1.1");
        let ip = OverlayIp::from(Ipv4Addr::new(172, 1, 1, 2));
        let mw = MockEncWriter;

        hm.add_vpn_ip(ip, &cs).unwrap();
        assert_eq!(hm.pending().host_count(), 1);

        let mut now = Instant::now();
        hm.next_outbound_tick(now, &mw).await;
        // walk far past every backoff until the retries run out
        for _ in 0..(hm.config.retries + 2) {
            now += Duration::from_secs(120);
            hm.next_outbound_tick(now, &mw).await;
        }
        assert_eq!(hm.pending().host_count(), 0, "timed-out handshake must be gone");
        assert_eq!(hm.pending().index_count(), 0);
        assert_eq!(
            hm.metrics.handshakes_timed_out.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_hello_spray_dedups_addresses() {
        let hm = manager().await;
        let cs = cert_state("172.1.1.1");
        let ip = OverlayIp::from(Ipv4Addr::new(172, 1, 1, 2));
        let mw = MockEncWriter;

        // a receiver socket we can count datagrams on
        let sink = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let sink_addr = match sink.local_addr() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };

        let hi = hm.add_vpn_ip(ip, &cs).unwrap();
        // duplicate entries are allowed in the list and deduped at send
        hi.remotes().prepend_v4(sink_addr);
        hi.remotes().prepend_v4(sink_addr);

        hm.handle_outbound(ip, &mw, true).await;

        let mut buf = [0u8; 2048];
        let (n, _) = sink.recv_from(&mut buf).await.unwrap();
        assert!(n > HEADER_LEN);
        let h = Header::decode(&buf[..n], false).unwrap();
        assert_eq!(h.typ, MessageType::Handshake);
        assert_eq!(h.subtype, HANDSHAKE_HELLO);

        // only one datagram despite the duplicate address
        let second = tokio::time::timeout(
            Duration::from_millis(200),
            sink.recv_from(&mut buf),
        )
        .await;
        assert!(second.is_err(), "duplicate address must be deduped at send");
    }
}
