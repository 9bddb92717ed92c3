//! Lifecycle control: assemble an [`Interface`] from configuration,
//! run its background tasks, and expose the introspection hooks the
//! integration tests (and an embedding process) drive.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use x25519_dalek::StaticSecret;

use overmesh_net::{OverlayIp, TunDevice, UdpTransportBuilder};
use overmesh_pki::{
    decode_pem, CaPool, MeshCertificate, BANNER_X25519_PRIVATE_KEY,
};

use crate::config::{Config, Settings};
use crate::error::{CoreError, CoreResult};
use crate::firewall::ConntrackCache;
use crate::interface::{CertState, Interface, InterfaceParams};

/// A running node and the handles to stop it
pub struct Control {
    intf: Arc<Interface>,
    config: Arc<Config>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Load the CA pool, node certificate and private key named by config
pub fn load_pki(settings: &Settings) -> CoreResult<(CertState, CaPool)> {
    let ca_pem = Settings::read_pem_field(&settings.pki.ca)?;
    let ca_pool = CaPool::from_pem(&ca_pem)?;

    let cert_pem = Settings::read_pem_field(&settings.pki.cert)?;
    let (cert, _) = MeshCertificate::from_pem(&cert_pem)?;

    let key_pem = Settings::read_pem_field(&settings.pki.key)?;
    let (key_raw, _) = decode_pem(BANNER_X25519_PRIVATE_KEY, &key_pem)?;
    let key_bytes: [u8; 32] = key_raw.as_slice().try_into().map_err(|_| {
        CoreError::ConfigInvalid(format!(
            "private key must be 32 bytes, got {}",
            key_raw.len()
        ))
    })?;
    let private_key = StaticSecret::from(key_bytes);

    let cert_state = CertState::new(cert, private_key)?;
    ca_pool.verify(&cert_state.cert, overmesh_pki::unix_now())?;
    Ok((cert_state, ca_pool))
}

impl Control {
    /// Bind sockets, load PKI material, and assemble the interface.
    /// Nothing runs until [`Control::start`].
    pub fn boot(config: Arc<Config>, tun: Arc<dyn TunDevice>) -> CoreResult<Self> {
        let settings = config.settings();
        settings.validate()?;

        let (cert_state, ca_pool) = load_pki(&settings)?;

        let host: IpAddr = settings.listen.host.parse().map_err(|_| {
            CoreError::ConfigInvalid(format!("invalid listen.host: {}", settings.listen.host))
        })?;
        let routines = settings.listen.routines.max(1);
        let mut writers = Vec::with_capacity(routines);
        let mut port = settings.listen.port;
        for q in 0..routines {
            let transport = UdpTransportBuilder::new(SocketAddr::new(host, port))
                .reuse_port(routines > 1)
                .build()?;
            if q == 0 {
                // an ephemeral first bind pins the port for the rest
                port = transport.local_addr().port();
            }
            writers.push(Arc::new(transport));
        }
        info!(
            addr = %writers[0].local_addr(),
            workers = routines,
            "underlay sockets bound"
        );

        let intf = Interface::build(InterfaceParams {
            settings: settings.clone(),
            tun,
            writers,
            cert_state,
            ca_pool,
        })?;

        let reload_intf = intf.clone();
        config.register_reload_callback(move |fresh| {
            if let Err(e) = reload_intf.apply_reload(fresh) {
                error!("config reload failed: {}", e);
                return;
            }
            match load_pki(fresh) {
                Ok((cert_state, ca_pool)) => reload_intf.apply_cert_reload(cert_state, ca_pool),
                Err(e) => error!("certificate reload failed: {}", e),
            }
        });

        Ok(Self {
            intf,
            config,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Convenience for tests and embedders holding a parsed settings
    /// snapshot rather than a config file.
    pub fn boot_with(settings: Settings, tun: Arc<dyn TunDevice>) -> CoreResult<Self> {
        Self::boot(Arc::new(Config::new(settings, None)), tun)
    }

    pub fn interface(&self) -> Arc<Interface> {
        self.intf.clone()
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.clone()
    }

    /// The concrete underlay address of the first worker socket
    pub fn local_udp_addr(&self) -> SocketAddr {
        self.intf.writers[0].local_addr()
    }

    /// Spawn every background task: one receive loop per worker socket,
    /// the TUN reader, the handshake and connection timers, the trigger
    /// drain, the lighthouse publisher, and the stats logger.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap();

        for (q, transport) in self.intf.writers.iter().enumerate() {
            let intf = self.intf.clone();
            let transport = transport.clone();
            tasks.push(tokio::spawn(async move {
                let mut cache = ConntrackCache::new(intf.routine_cache_timeout);
                let mut buf = vec![0u8; 65536];
                loop {
                    tokio::select! {
                        r = transport.recv_from(&mut buf) => match r {
                            Ok((n, addr)) => {
                                intf.read_outside_packet(addr, &buf[..n], q, &mut cache).await;
                            }
                            Err(e) => {
                                if intf.is_shut_down() {
                                    break;
                                }
                                warn!("udp recv error: {}", e);
                            }
                        },
                        _ = intf.shutdown_notify.notified() => break,
                    }
                }
            }));
        }

        {
            let intf = self.intf.clone();
            tasks.push(tokio::spawn(async move {
                let mut cache = ConntrackCache::new(intf.routine_cache_timeout);
                loop {
                    tokio::select! {
                        r = intf.inside.read_packet() => match r {
                            Ok(packet) => intf.consume_inside_packet(&packet, 0, &mut cache).await,
                            Err(_) => {
                                if intf.is_shut_down() {
                                    break;
                                }
                                tokio::time::sleep(Duration::from_millis(10)).await;
                            }
                        },
                        _ = intf.shutdown_notify.notified() => break,
                    }
                }
            }));
        }

        {
            let intf = self.intf.clone();
            let tick = self.intf.handshake_manager.try_interval();
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(tick);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            intf.handshake_manager
                                .next_outbound_tick(Instant::now(), &*intf)
                                .await;
                        }
                        _ = intf.shutdown_notify.notified() => break,
                    }
                }
            }));
        }

        {
            let intf = self.intf.clone();
            tasks.push(tokio::spawn(async move {
                let mut rx = match intf.trigger_rx.lock().await.take() {
                    Some(rx) => rx,
                    None => return,
                };
                loop {
                    tokio::select! {
                        next = rx.recv() => match next {
                            Some(vpn_ip) => {
                                // a punch-respond trigger may reference a
                                // peer we have no tunnel for yet
                                if intf.hostmap.query_vpn_ip(vpn_ip).is_none() {
                                    intf.get_or_handshake(vpn_ip).await;
                                }
                                intf.handshake_manager
                                    .handle_outbound(vpn_ip, &*intf, true)
                                    .await;
                            }
                            None => break,
                        },
                        _ = intf.shutdown_notify.notified() => break,
                    }
                }
            }));
        }

        {
            let intf = self.intf.clone();
            let tick = self
                .intf
                .connection_manager
                .check_interval()
                .min(Duration::from_secs(1));
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(tick);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let pool = intf.ca_pool();
                            let disconnect = intf.disconnect_invalid.load(Ordering::Relaxed);
                            intf.connection_manager
                                .tick(
                                    Instant::now(),
                                    &*intf,
                                    &pool,
                                    disconnect,
                                    overmesh_pki::unix_now(),
                                )
                                .await;
                            intf.firewall().conntrack().purge_expired();
                        }
                        _ = intf.shutdown_notify.notified() => break,
                    }
                }
            }));
        }

        {
            let intf = self.intf.clone();
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(intf.lighthouse.interval());
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            intf.lighthouse.publish_update(&*intf).await;
                        }
                        _ = intf.shutdown_notify.notified() => break,
                    }
                }
            }));
        }

        if let Some(stats_interval) = self.intf.stats_interval {
            let intf = self.intf.clone();
            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(stats_interval);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            info!(stats = %intf.metrics.snapshot(), "periodic stats");
                        }
                        _ = intf.shutdown_notify.notified() => break,
                    }
                }
            }));
        }

        info!(vpn_ip = %self.intf.my_vpn_ip, "node running");
    }

    /// Stop everything: say goodbye to established peers, flag
    /// shutdown, wake all tasks, and reap them.
    pub async fn stop(&self) {
        for hi in self.intf.hostmap.all_host_infos() {
            if hi.is_ready() {
                self.intf.send_close_tunnel(&hi).await;
            }
        }
        self.intf.shutdown.store(true, Ordering::Relaxed);
        self.intf.shutdown_notify.notify_waiters();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().unwrap().drain(..).collect();
        for t in tasks {
            t.abort();
        }
        info!("node stopped");
    }

    // --- introspection hooks, used by the end-to-end tests ---

    /// Established tunnels as (overlay ip, local index, remote index)
    pub fn list_tunnels(&self) -> Vec<(OverlayIp, u32, u32)> {
        self.intf
            .hostmap
            .all_host_infos()
            .iter()
            .map(|hi| (hi.vpn_ip, hi.local_index(), hi.remote_index()))
            .collect()
    }

    pub fn tunnel_count(&self) -> usize {
        self.intf.hostmap.index_count()
    }

    pub fn host_count(&self) -> usize {
        self.intf.hostmap.host_count()
    }

    pub fn pending_count(&self) -> usize {
        self.intf.handshake_manager.pending().host_count()
    }

    pub fn has_tunnel_to(&self, vpn_ip: OverlayIp) -> bool {
        self.intf
            .hostmap
            .query_vpn_ip(vpn_ip)
            .map(|hi| hi.is_ready())
            .unwrap_or(false)
    }

    /// Tear down the tunnel to a peer, telling it first
    pub async fn close_tunnel(&self, vpn_ip: OverlayIp) -> CoreResult<()> {
        let hi = self
            .intf
            .hostmap
            .query_vpn_ip(vpn_ip)
            .ok_or(CoreError::HostNotFound(vpn_ip))?;
        self.intf.send_close_tunnel(&hi).await;
        self.intf.hostmap.delete_host_info(&hi);
        Ok(())
    }

    /// Forget every tunnel without telling anyone, as an unclean
    /// restart would
    pub fn drop_all_tunnels(&self) {
        for hi in self.intf.hostmap.all_host_infos() {
            self.intf.hostmap.delete_host_info(&hi);
        }
    }
}
