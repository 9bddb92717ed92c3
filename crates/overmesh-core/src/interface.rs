//! The tunnel interface: everything one node needs to move packets
//! between its TUN device and its peers.
//!
//! [`Interface`] owns the host map, the managers, the firewall snapshot
//! and the UDP writers. The packet pipeline lives in the `outbound` and
//! `inbound` modules as `impl Interface` blocks; background tasks are
//! spawned by [`crate::control::Control`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tokio::sync::{mpsc, Notify};
use tracing::warn;
use x25519_dalek::StaticSecret;

use overmesh_net::{OverlayIp, RateLimiter, TunDevice, UdpTransport};
use overmesh_pki::{CaPool, MeshCertificate};

use crate::config::{AllowList, Settings};
use crate::connection_manager::ConnectionManager;
use crate::error::{CoreError, CoreResult};
use crate::firewall::Firewall;
use crate::handshake_manager::{HandshakeConfig, HandshakeManager};
use crate::header::MessageType;
use crate::hostmap::{HostInfo, HostMap, Relay};
use crate::lighthouse::Lighthouse;
use crate::metrics::Metrics;
use crate::punchy::Punchy;
use crate::relay_manager::RelayManager;
use crate::session::CipherKind;

/// How long a roam back to the previous underlay address is suppressed
pub const ROAM_HOLD_DOWN: Duration = Duration::from_secs(5);

/// Our own certificate, raw bytes, and the matching private key.
/// Swapped atomically as a unit on reload.
pub struct CertState {
    pub cert: Arc<MeshCertificate>,
    pub raw_cert: Vec<u8>,
    pub private_key: Arc<StaticSecret>,
}

impl CertState {
    pub fn new(cert: MeshCertificate, private_key: StaticSecret) -> CoreResult<Self> {
        cert.verify_private_key(&private_key)?;
        let raw_cert = cert.to_bytes()?;
        Ok(Self {
            cert: Arc::new(cert),
            raw_cert,
            private_key: Arc::new(private_key),
        })
    }
}

/// Where a datagram came from: straight off a socket, or unwrapped from
/// a relay carrier tunnel.
#[derive(Clone)]
pub enum PacketSource {
    Direct(SocketAddr),
    Relayed {
        carrier: Arc<HostInfo>,
        relay: Relay,
    },
}

impl PacketSource {
    pub fn addr(&self) -> Option<SocketAddr> {
        match self {
            PacketSource::Direct(a) => Some(*a),
            PacketSource::Relayed { .. } => None,
        }
    }
}

/// Anything that can push an encrypted message toward an overlay address.
/// The managers depend on this instead of the full [`Interface`] so unit
/// tests can substitute a recorder.
#[async_trait]
pub trait EncWriter: Send + Sync {
    async fn send_message_to_vpn_ip(
        &self,
        typ: MessageType,
        subtype: u8,
        vpn_ip: OverlayIp,
        payload: &[u8],
    );

    /// Push an already-framed datagram through an established relay
    async fn send_datagram_via(&self, carrier: &Arc<HostInfo>, relay: &Relay, inner: &[u8]);

    /// Ask `relay_ip` to set up a relay toward `target`
    async fn request_relay(&self, target: OverlayIp, relay_ip: OverlayIp);
}

/// Everything already resolved that [`Interface::build`] needs
pub struct InterfaceParams {
    pub settings: Arc<Settings>,
    pub tun: Arc<dyn TunDevice>,
    pub writers: Vec<Arc<UdpTransport>>,
    pub cert_state: CertState,
    pub ca_pool: CaPool,
}

pub struct Interface {
    pub my_vpn_ip: OverlayIp,
    pub my_vpn_net: Ipv4Net,
    pub(crate) local_broadcast: OverlayIp,

    pub hostmap: Arc<HostMap>,
    pub handshake_manager: Arc<HandshakeManager>,
    pub connection_manager: Arc<ConnectionManager>,
    pub lighthouse: Arc<Lighthouse>,
    pub relay_manager: Arc<RelayManager>,

    firewall: RwLock<Arc<Firewall>>,
    cert_state: RwLock<Arc<CertState>>,
    ca_pool: RwLock<Arc<CaPool>>,

    pub inside: Arc<dyn TunDevice>,
    pub writers: Vec<Arc<UdpTransport>>,
    pub cipher: CipherKind,

    pub(crate) drop_local_broadcast: bool,
    pub(crate) drop_multicast: bool,
    pub disconnect_invalid: AtomicBool,
    pub use_relays: bool,

    pub(crate) rebind_count: AtomicU64,
    pub(crate) recv_error_limiter: RateLimiter<SocketAddr>,
    pub(crate) remote_allow_list: AllowList,

    pub handshake_trigger: mpsc::Sender<OverlayIp>,
    pub(crate) trigger_rx: tokio::sync::Mutex<Option<mpsc::Receiver<OverlayIp>>>,

    pub(crate) routine_cache_timeout: Duration,
    pub(crate) stats_interval: Option<Duration>,

    pub metrics: Arc<Metrics>,
    pub shutdown: AtomicBool,
    pub shutdown_notify: Notify,
}

impl Interface {
    /// Assemble an interface from resolved parts. The caller (normally
    /// [`crate::control`]) has already loaded certificates and bound
    /// sockets.
    pub fn build(params: InterfaceParams) -> CoreResult<Arc<Self>> {
        let InterfaceParams {
            settings,
            tun,
            writers,
            cert_state,
            ca_pool,
        } = params;

        if writers.is_empty() {
            return Err(CoreError::ConfigInvalid(
                "at least one UDP writer is required".to_string(),
            ));
        }

        let cipher = settings.cipher_kind()?;
        let my_vpn_net = cert_state.cert.overlay_net()?;
        let my_vpn_ip = OverlayIp::from(cert_state.cert.overlay_addr()?);
        let local_broadcast = OverlayIp::from_u32(
            my_vpn_ip.as_u32() | !u32::from(my_vpn_net.netmask()),
        );

        let preferred = settings.preferred_ranges_parsed()?;
        let metrics = Arc::new(Metrics::new());
        let hostmap = Arc::new(HostMap::new("main", my_vpn_net, preferred.clone()));

        let (trigger_tx, trigger_rx) = mpsc::channel(settings.handshakes.trigger_buffer.max(1));

        let (punch_delay, respond_delay) = settings.punchy_delays()?;
        let punchy = Arc::new(Punchy::new(
            settings.punchy.punch,
            settings.punchy.respond,
            punch_delay,
            respond_delay,
        ));

        let lighthouse = Arc::new(Lighthouse::new(
            settings.as_ref(),
            my_vpn_ip,
            my_vpn_net,
            writers[0].clone(),
            punchy,
            trigger_tx.clone(),
            metrics.clone(),
        )?);

        let handshake_manager = Arc::new(HandshakeManager::new(
            hostmap.clone(),
            lighthouse.clone(),
            writers[0].clone(),
            HandshakeConfig {
                try_interval: settings.handshake_try_interval()?,
                retries: settings.handshakes.retries,
            },
            cipher,
            metrics.clone(),
        ));

        let (check_interval, pending_deletion_interval) = settings.timers_parsed()?;
        let connection_manager = Arc::new(ConnectionManager::new(
            hostmap.clone(),
            check_interval,
            pending_deletion_interval,
            metrics.clone(),
        ));

        let relay_manager = Arc::new(RelayManager::new(
            hostmap.clone(),
            settings.relay.am_relay,
            metrics.clone(),
        ));

        let firewall = settings.build_firewall(None)?;

        Ok(Arc::new(Self {
            my_vpn_ip,
            my_vpn_net,
            local_broadcast,
            hostmap,
            handshake_manager,
            connection_manager,
            lighthouse,
            relay_manager,
            firewall: RwLock::new(Arc::new(firewall)),
            cert_state: RwLock::new(Arc::new(cert_state)),
            ca_pool: RwLock::new(Arc::new(ca_pool)),
            inside: tun,
            writers,
            cipher,
            drop_local_broadcast: settings.tun.drop_local_broadcast,
            drop_multicast: settings.tun.drop_multicast,
            disconnect_invalid: AtomicBool::new(settings.logging.disconnect_invalid),
            use_relays: settings.relay.use_relays,
            rebind_count: AtomicU64::new(0),
            recv_error_limiter: RateLimiter::new(5, Duration::from_secs(1)),
            remote_allow_list: settings.remote_allow_list_parsed()?,
            handshake_trigger: trigger_tx,
            trigger_rx: tokio::sync::Mutex::new(Some(trigger_rx)),
            routine_cache_timeout: settings.routine_cache_timeout()?,
            stats_interval: settings.stats_interval()?,
            metrics,
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        }))
    }

    pub fn firewall(&self) -> Arc<Firewall> {
        self.firewall.read().unwrap().clone()
    }

    pub fn cert_state(&self) -> Arc<CertState> {
        self.cert_state.read().unwrap().clone()
    }

    pub fn ca_pool(&self) -> Arc<CaPool> {
        self.ca_pool.read().unwrap().clone()
    }

    /// Resolve the display name of the CA that signed a peer cert
    pub fn issuer_name(&self, cert: &MeshCertificate) -> Option<String> {
        self.ca_pool()
            .get_ca(cert)
            .ok()
            .map(|ca| ca.details.name.clone())
    }

    pub fn rebind_count(&self) -> u64 {
        self.rebind_count.load(Ordering::Relaxed)
    }

    /// Note that the underlay sockets were rebound; tunnels re-query the
    /// lighthouse on their next send so peers punch toward the new
    /// mapping.
    pub fn bump_rebind_count(&self) {
        self.rebind_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Apply a fresh settings snapshot: firewall rules (keeping the
    /// conntrack table), relay flag, punchy flags, disconnect policy.
    pub fn apply_reload(&self, settings: &Settings) -> CoreResult<()> {
        let conntrack = self.firewall().conntrack();
        let fresh = settings.build_firewall(Some(conntrack))?;
        *self.firewall.write().unwrap() = Arc::new(fresh);

        self.relay_manager.set_am_relay(settings.relay.am_relay);
        self.lighthouse.punchy().set_punch(settings.punchy.punch);
        self.lighthouse.punchy().set_respond(settings.punchy.respond);
        self.disconnect_invalid
            .store(settings.logging.disconnect_invalid, Ordering::Relaxed);
        self.hostmap
            .set_preferred_ranges(settings.preferred_ranges_parsed()?);
        Ok(())
    }

    /// Swap in freshly loaded certificate material
    pub fn apply_cert_reload(&self, cert_state: CertState, ca_pool: CaPool) {
        *self.cert_state.write().unwrap() = Arc::new(cert_state);
        *self.ca_pool.write().unwrap() = Arc::new(ca_pool);
    }
}

#[async_trait]
impl EncWriter for Interface {
    async fn send_message_to_vpn_ip(
        &self,
        typ: MessageType,
        subtype: u8,
        vpn_ip: OverlayIp,
        payload: &[u8],
    ) {
        if let Err(e) = self.send_to_vpn_ip(typ, subtype, vpn_ip, payload).await {
            warn!(%vpn_ip, "failed to send {:?}: {}", typ, e);
        }
    }

    async fn send_datagram_via(&self, carrier: &Arc<HostInfo>, relay: &Relay, inner: &[u8]) {
        if let Err(e) = self.send_via(carrier, relay, inner).await {
            warn!(relay = %carrier.vpn_ip, "failed to send via relay: {}", e);
        }
    }

    async fn request_relay(&self, target: OverlayIp, relay_ip: OverlayIp) {
        self.relay_manager.initiate(self, target, relay_ip).await;
    }
}
