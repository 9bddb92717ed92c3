//! Shared harness for the end-to-end scenarios: a throwaway CA, full
//! nodes running over loopback UDP with channel-backed TUN devices.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use overmesh_core::config::Settings;
use overmesh_core::control::Control;
use overmesh_net::{build_ipv4_udp, mock_tun, MockTunHandle, OverlayIp};
use overmesh_pki::{
    encode_pem, unix_now, CertDetails, MeshCertificate, BANNER_X25519_PRIVATE_KEY,
};

pub struct TestCa {
    key: SigningKey,
    pub cert_pem: String,
    fingerprint: String,
}

impl TestCa {
    pub fn new() -> Self {
        let key = SigningKey::generate(&mut OsRng);
        let now = unix_now();
        let cert = MeshCertificate::sign(
            CertDetails {
                name: "e2e test ca".to_string(),
                ips: vec![],
                subnets: vec![],
                groups: vec![],
                not_before: now,
                not_after: now + 86400,
                public_key: key.verifying_key().to_bytes(),
                is_ca: true,
                issuer: String::new(),
            },
            &key,
        )
        .unwrap();
        Self {
            fingerprint: cert.fingerprint().unwrap(),
            cert_pem: cert.to_pem().unwrap(),
            key,
        }
    }

    /// Issue a node certificate and key, both as PEM
    pub fn issue(&self, name: &str, ip_cidr: &str, groups: &[&str]) -> (String, String) {
        let key = StaticSecret::random_from_rng(OsRng);
        let now = unix_now();
        let cert = MeshCertificate::sign(
            CertDetails {
                name: name.to_string(),
                ips: vec![ip_cidr.parse().unwrap()],
                subnets: vec![],
                groups: groups.iter().map(|s| s.to_string()).collect(),
                not_before: now,
                not_after: now + 3600,
                public_key: PublicKey::from(&key).to_bytes(),
                is_ca: false,
                issuer: self.fingerprint.clone(),
            },
            &self.key,
        )
        .unwrap();
        (
            cert.to_pem().unwrap(),
            encode_pem(BANNER_X25519_PRIVATE_KEY, &key.to_bytes()),
        )
    }
}

/// Reserve a probably-free loopback UDP port
pub fn free_port() -> u16 {
    let sock = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    sock.local_addr().unwrap().port()
}

pub struct Node {
    pub control: Control,
    pub tun: MockTunHandle,
    pub vpn_ip: OverlayIp,
    pub udp: SocketAddr,
}

/// Stand up a full node on loopback with fast timers. `configure` can
/// adjust the settings (static host map, relay flags, firewall) before
/// boot.
pub async fn start_node(
    ca: &TestCa,
    name: &str,
    ip_cidr: &str,
    port: u16,
    configure: impl FnOnce(&mut Settings),
) -> Node {
    let (cert_pem, key_pem) = ca.issue(name, ip_cidr, &[]);

    let mut settings = Settings::default();
    settings.pki.ca = ca.cert_pem.clone();
    settings.pki.cert = cert_pem;
    settings.pki.key = key_pem;
    settings.listen.host = "127.0.0.1".to_string();
    settings.listen.port = port;
    settings.handshakes.try_interval = Some("100ms".to_string());
    settings.timers.connection_alive_interval = 1;
    settings.timers.pending_deletion_interval = 1;
    allow_all(&mut settings);
    configure(&mut settings);

    let net: ipnet::Ipv4Net = ip_cidr.parse().unwrap();
    let overlay_net: ipnet::Ipv4Net = net.trunc();
    let (tun, handle) = mock_tun(overlay_net);

    let control = Control::boot_with(settings, tun).unwrap();
    control.start();

    Node {
        udp: control.local_udp_addr(),
        control,
        tun: handle,
        vpn_ip: OverlayIp::from(net.addr()),
    }
}

/// Permit everything in both directions
pub fn allow_all(settings: &mut Settings) {
    for list in [&mut settings.firewall.inbound, &mut settings.firewall.outbound] {
        list.push(overmesh_core::config::RuleSetting {
            host: Some("any".to_string()),
            ..Default::default()
        });
    }
}

pub fn static_entry(settings: &mut Settings, vpn_ip: &str, addrs: &[SocketAddr]) {
    settings
        .static_host_map
        .insert(vpn_ip.to_string(), addrs.iter().map(|a| a.to_string()).collect());
}

impl Node {
    /// Inject a UDP-in-IPv4 payload as if an application wrote it to
    /// our TUN device
    pub async fn send_payload(&self, dst: OverlayIp, payload: &[u8]) {
        let packet = build_ipv4_udp(self.vpn_ip, dst, 4242, 80, payload);
        self.tun.inject.send(packet).await.unwrap();
    }

    /// Wait for one packet to land on our TUN device, returning its UDP
    /// payload
    pub async fn recv_payload(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        let packet = tokio::time::timeout(timeout, self.tun.delivered.recv())
            .await
            .ok()??;
        Some(packet[28..].to_vec())
    }

    /// Drain anything already delivered without waiting
    pub fn drain_delivered(&mut self) -> usize {
        let mut n = 0;
        while self.tun.delivered.try_recv().is_ok() {
            n += 1;
        }
        n
    }
}

/// Poll a condition until it holds or the deadline passes
pub async fn wait_for(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    cond()
}
