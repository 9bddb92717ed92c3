//! Tunnel liveness and eviction.
//!
//! Every watched tunnel is visited on a timer. A visit that saw inbound
//! traffic is healthy; a visit without inbound marks the tunnel
//! pending-deletion and, if we were the only side talking, emits a probe
//! the peer will echo. A second consecutive silent visit tears the
//! tunnel down. Expired peer certificates tear down immediately when
//! `disconnect_invalid` is set.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use overmesh_pki::CaPool;

use crate::header::{MessageType, SUBTYPE_NONE, TEST_REQUEST};
use crate::hostmap::{HostInfo, HostMap};
use crate::interface::EncWriter;
use crate::metrics::Metrics;
use crate::timer_wheel::TimerWheel;

pub struct ConnectionManager {
    hostmap: Arc<HostMap>,
    in_set: Mutex<HashSet<u32>>,
    out_set: Mutex<HashSet<u32>>,
    pending_deletion: Mutex<HashSet<u32>>,
    wheel: Mutex<TimerWheel<u32>>,
    check_interval: Duration,
    pending_deletion_interval: Duration,
    metrics: Arc<Metrics>,
}

impl ConnectionManager {
    pub fn new(
        hostmap: Arc<HostMap>,
        check_interval: Duration,
        pending_deletion_interval: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        let span = check_interval.max(pending_deletion_interval) * 2;
        Self {
            hostmap,
            in_set: Mutex::new(HashSet::new()),
            out_set: Mutex::new(HashSet::new()),
            pending_deletion: Mutex::new(HashSet::new()),
            wheel: Mutex::new(TimerWheel::new(check_interval.min(pending_deletion_interval), span)),
            check_interval,
            pending_deletion_interval,
            metrics,
        }
    }

    /// Inbound traffic was decrypted on this tunnel
    pub fn mark_in(&self, local_index: u32) {
        self.in_set.lock().unwrap().insert(local_index);
    }

    /// We sent traffic on this tunnel
    pub fn mark_out(&self, local_index: u32) {
        self.out_set.lock().unwrap().insert(local_index);
    }

    /// Put a freshly established tunnel under supervision
    pub fn watch(&self, local_index: u32) {
        self.mark_out(local_index);
        self.wheel
            .lock()
            .unwrap()
            .add(local_index, self.check_interval);
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Advance the wheel and run the traffic check for every due tunnel
    pub async fn tick(
        &self,
        now: Instant,
        w: &dyn EncWriter,
        ca_pool: &CaPool,
        disconnect_invalid: bool,
        now_unix: u64,
    ) {
        let due = self.wheel.lock().unwrap().purge(now);
        for idx in due {
            self.do_traffic_check(idx, w, ca_pool, disconnect_invalid, now_unix)
                .await;
        }
    }

    /// One supervision visit for a tunnel
    pub async fn do_traffic_check(
        &self,
        local_index: u32,
        w: &dyn EncWriter,
        ca_pool: &CaPool,
        disconnect_invalid: bool,
        now_unix: u64,
    ) {
        let hostinfo = match self.hostmap.query_index(local_index) {
            Some(hi) => hi,
            None => {
                self.forget(local_index);
                return;
            }
        };

        if disconnect_invalid && self.is_invalid_certificate(now_unix, &hostinfo, ca_pool) {
            info!(vpn_ip = %hostinfo.vpn_ip, "peer certificate is no longer valid, closing tunnel");
            w.send_message_to_vpn_ip(
                MessageType::CloseTunnel,
                SUBTYPE_NONE,
                hostinfo.vpn_ip,
                &[],
            )
            .await;
            self.hostmap.delete_host_info(&hostinfo);
            self.metrics
                .tunnels_evicted
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.forget(local_index);
            return;
        }

        let saw_in = self.in_set.lock().unwrap().remove(&local_index);
        let saw_out = self.out_set.lock().unwrap().remove(&local_index);

        if saw_in {
            // The peer is alive; nothing to do until the next visit
            self.pending_deletion.lock().unwrap().remove(&local_index);
            self.wheel
                .lock()
                .unwrap()
                .add(local_index, self.check_interval);
            return;
        }

        if self.pending_deletion.lock().unwrap().remove(&local_index) {
            // Second consecutive silent visit
            info!(
                vpn_ip = %hostinfo.vpn_ip,
                index = local_index,
                "no tunnel activity, tearing down"
            );
            self.hostmap.delete_host_info(&hostinfo);
            self.metrics
                .tunnels_evicted
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return;
        }

        self.pending_deletion.lock().unwrap().insert(local_index);
        if saw_out {
            // We talked into silence; poke the peer so a live one marks
            // inbound traffic before the next visit
            debug!(vpn_ip = %hostinfo.vpn_ip, "probing quiet tunnel");
            w.send_message_to_vpn_ip(
                MessageType::Test,
                TEST_REQUEST,
                hostinfo.vpn_ip,
                &[],
            )
            .await;
        }
        self.wheel
            .lock()
            .unwrap()
            .add(local_index, self.pending_deletion_interval);
    }

    /// Whether the peer's certificate fails verification at `now`
    pub fn is_invalid_certificate(
        &self,
        now_unix: u64,
        hostinfo: &Arc<HostInfo>,
        ca_pool: &CaPool,
    ) -> bool {
        match hostinfo.peer_cert() {
            Some(cert) => {
                if let Err(e) = ca_pool.verify(&cert, now_unix) {
                    debug!(vpn_ip = %hostinfo.vpn_ip, "remote certificate is no longer valid: {}", e);
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    fn forget(&self, local_index: u32) {
        self.in_set.lock().unwrap().remove(&local_index);
        self.out_set.lock().unwrap().remove(&local_index);
        self.pending_deletion.lock().unwrap().remove(&local_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ed25519_dalek::SigningKey;
    use overmesh_net::OverlayIp;
    use overmesh_pki::{unix_now, CertDetails, MeshCertificate};
    use rand::rngs::OsRng;
    use std::net::Ipv4Addr;

    #[derive(Default)]
    struct RecordingWriter {
        sent: Mutex<Vec<(MessageType, OverlayIp)>>,
    }

    #[async_trait]
    impl EncWriter for RecordingWriter {
        async fn send_message_to_vpn_ip(
            &self,
            typ: MessageType,
            _st: u8,
            vpn_ip: OverlayIp,
            _payload: &[u8],
        ) {
            self.sent.lock().unwrap().push((typ, vpn_ip));
        }
        async fn send_datagram_via(
            &self,
            _c: &Arc<HostInfo>,
            _r: &crate::hostmap::Relay,
            _i: &[u8],
        ) {
        }
        async fn request_relay(&self, _t: OverlayIp, _r: OverlayIp) {}
    }

    fn setup() -> (Arc<HostMap>, ConnectionManager, Arc<HostInfo>, u32, OverlayIp) {
        let hostmap = Arc::new(HostMap::new("test", "172.1.1.0/24".parse().unwrap(), vec![]));
        let nc = ConnectionManager::new(
            hostmap.clone(),
            Duration::from_secs(5),
            Duration::from_secs(10),
            Arc::new(Metrics::new()),
        );
        let vpn_ip = OverlayIp::from(Ipv4Addr::new(172, 1, 1, 2));
        let (hostinfo, _) = hostmap.add_vpn_ip(vpn_ip);
        hostinfo.set_local_index(1099);
        hostinfo.set_remote_index(9901);
        hostmap.insert_index(1099, &hostinfo);
        (hostmap, nc, hostinfo, 1099, vpn_ip)
    }

    fn expiring_cert_setup(ttl: u64) -> (CaPool, Arc<MeshCertificate>, u64) {
        let now = unix_now();
        let ca_key = SigningKey::generate(&mut OsRng);
        let ca = MeshCertificate::sign(
            CertDetails {
                name: "ca".to_string(),
                ips: vec![],
                subnets: vec![],
                groups: vec![],
                not_before: now,
                not_after: now + 3600,
                public_key: ca_key.verifying_key().to_bytes(),
                is_ca: true,
                issuer: String::new(),
            },
            &ca_key,
        )
        .unwrap();
        let mut pool = CaPool::new();
        let issuer = ca.fingerprint().unwrap();
        pool.add_ca(ca).unwrap();
        let peer = MeshCertificate::sign(
            CertDetails {
                name: "host".to_string(),
                ips: vec!["172.1.1.2/24".parse().unwrap()],
                subnets: vec![],
                groups: vec![],
                not_before: now,
                not_after: now + ttl,
                public_key: [3u8; 32],
                is_ca: false,
                issuer,
            },
            &ca_key,
        )
        .unwrap();
        (pool, Arc::new(peer), now)
    }

    #[tokio::test]
    async fn test_three_silent_checks_evict() {
        let (hostmap, nc, hostinfo, idx, vpn_ip) = setup();
        let w = RecordingWriter::default();
        let pool = CaPool::new();

        // traffic both ways, then a check: healthy, counters reset
        nc.mark_out(idx);
        nc.mark_in(idx);
        assert!(!nc.pending_deletion.lock().unwrap().contains(&idx));
        nc.do_traffic_check(idx, &w, &pool, false, unix_now()).await;
        assert!(!nc.pending_deletion.lock().unwrap().contains(&idx));
        assert!(!nc.out_set.lock().unwrap().contains(&idx));
        assert!(!nc.in_set.lock().unwrap().contains(&idx));

        // only outbound traffic: pending deletion, probe emitted
        nc.mark_out(idx);
        nc.do_traffic_check(idx, &w, &pool, false, unix_now()).await;
        assert!(nc.pending_deletion.lock().unwrap().contains(&idx));
        assert!(hostmap.query_index(idx).is_some());
        assert!(hostmap.query_vpn_ip(vpn_ip).is_some());
        assert_eq!(
            w.sent.lock().unwrap().last(),
            Some(&(MessageType::Test, vpn_ip))
        );

        // still nothing inbound: gone
        nc.do_traffic_check(idx, &w, &pool, false, unix_now()).await;
        assert!(!nc.pending_deletion.lock().unwrap().contains(&idx));
        assert!(hostmap.query_index(idx).is_none());
        assert!(hostmap.query_vpn_ip(vpn_ip).is_none());
        drop(hostinfo);
    }

    #[tokio::test]
    async fn test_inbound_traffic_rescues_pending_tunnel() {
        let (hostmap, nc, _hostinfo, idx, vpn_ip) = setup();
        let w = RecordingWriter::default();
        let pool = CaPool::new();

        nc.mark_out(idx);
        nc.mark_in(idx);
        nc.do_traffic_check(idx, &w, &pool, false, unix_now()).await;

        nc.mark_out(idx);
        nc.do_traffic_check(idx, &w, &pool, false, unix_now()).await;
        assert!(nc.pending_deletion.lock().unwrap().contains(&idx));

        // the probe was answered
        nc.mark_in(idx);
        nc.do_traffic_check(idx, &w, &pool, false, unix_now()).await;
        assert!(!nc.pending_deletion.lock().unwrap().contains(&idx));
        assert!(hostmap.query_index(idx).is_some());
        assert!(hostmap.query_vpn_ip(vpn_ip).is_some());
    }

    #[tokio::test]
    async fn test_invalid_certificate_detection() {
        let (_hostmap, nc, hostinfo, _idx, _vpn_ip) = setup();
        let (pool, peer_cert, now) = expiring_cert_setup(60);
        hostinfo.set_peer_cert(peer_cert);

        // still inside the validity window
        assert!(!nc.is_invalid_certificate(now + 45, &hostinfo, &pool));
        // past not_after
        assert!(nc.is_invalid_certificate(now + 61, &hostinfo, &pool));
    }

    #[tokio::test]
    async fn test_disconnect_invalid_closes_tunnel() {
        let (hostmap, nc, hostinfo, idx, vpn_ip) = setup();
        let (pool, peer_cert, now) = expiring_cert_setup(60);
        hostinfo.set_peer_cert(peer_cert);
        let w = RecordingWriter::default();

        // disconnect_invalid off: the expired cert does not tear down
        nc.mark_in(idx);
        nc.do_traffic_check(idx, &w, &pool, false, now + 61).await;
        assert!(hostmap.query_index(idx).is_some());

        // on: the next check closes and removes the tunnel
        nc.do_traffic_check(idx, &w, &pool, true, now + 61).await;
        assert!(hostmap.query_index(idx).is_none());
        assert_eq!(
            w.sent.lock().unwrap().last(),
            Some(&(MessageType::CloseTunnel, vpn_ip))
        );
    }
}
