//! Outside-to-inside packet path: UDP datagrams are decoded, decrypted,
//! filtered, and written to the TUN device; relay envelopes are unwrapped
//! or forwarded; control traffic is fanned out to the managers.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use overmesh_net::parse_ipv4;
use overmesh_pki::unix_now;

use crate::error::{CoreError, CoreResult};
use crate::firewall::ConntrackCache;
use crate::header::{
    Header, MessageType, HANDSHAKE_HELLO, HANDSHAKE_REPLY, HEADER_LEN, MESSAGE_RELAY,
    SUBTYPE_NONE, TEST_REQUEST,
};
use crate::hostmap::{HostInfo, RelayPhase, RelayType};
use crate::interface::{Interface, PacketSource, ROAM_HOLD_DOWN};
use crate::relay_manager::ControlMsg;

impl Interface {
    /// Process one datagram received on worker `q`
    pub async fn read_outside_packet(
        &self,
        addr: SocketAddr,
        data: &[u8],
        q: usize,
        cache: &mut ConntrackCache,
    ) {
        let header = match Header::decode(data, self.cipher.counter_le()) {
            Ok(h) => h,
            Err(e) => {
                trace!(%addr, "dropping undecodable datagram: {}", e);
                self.metrics.dropped_inbound.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        if header.typ == MessageType::Message && header.subtype == MESSAGE_RELAY {
            self.handle_relay_envelope(addr, header, data, q, cache).await;
            return;
        }

        self.dispatch(header, data, PacketSource::Direct(addr), q, cache)
            .await;
    }

    /// An outer relay envelope: decrypt with the carrier tunnel, then
    /// either forward the still-sealed inner bytes or, if we are the
    /// terminal, process them as a datagram that arrived via the relay.
    async fn handle_relay_envelope(
        &self,
        addr: SocketAddr,
        header: Header,
        data: &[u8],
        q: usize,
        cache: &mut ConntrackCache,
    ) {
        let carrier = match self.hostmap.query_relay(header.remote_index) {
            Some(hi) => hi,
            None => {
                self.send_recv_error(addr, header.remote_index).await;
                return;
            }
        };

        let inner = match self.decrypt_packet(&carrier, &header, data) {
            Ok(p) => p,
            Err(_) => {
                self.metrics.decrypt_failures.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        self.connection_manager.mark_in(carrier.local_index());
        self.handle_host_roaming(&carrier, addr);

        let relay = match carrier.relay_state.query_by_index(header.remote_index) {
            Some(r) => r,
            None => {
                debug!(index = header.remote_index, "decrypted relay envelope with no relay state");
                return;
            }
        };

        match relay.typ {
            RelayType::Forwarding => {
                // Shuttle the sealed bytes to the other leg; we cannot
                // read them
                let target = match self.hostmap.query_vpn_ip(relay.peer_ip) {
                    Some(hi) => hi,
                    None => {
                        debug!(peer = %relay.peer_ip, "relay target tunnel is gone");
                        return;
                    }
                };
                let target_relay = match target.relay_state.query_by_ip(carrier.vpn_ip) {
                    Some(r) if r.phase == RelayPhase::Established => r,
                    _ => {
                        debug!(peer = %relay.peer_ip, "relay to target not established");
                        return;
                    }
                };
                self.metrics.relays_forwarded.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.send_via(&target, &target_relay, &inner).await {
                    debug!("failed to forward relayed packet: {}", e);
                }
            }
            RelayType::Terminal => {
                let inner_header = match Header::decode(&inner, self.cipher.counter_le()) {
                    Ok(h) => h,
                    Err(e) => {
                        debug!("dropping relayed datagram with bad header: {}", e);
                        return;
                    }
                };
                if inner_header.typ == MessageType::Message
                    && inner_header.subtype == MESSAGE_RELAY
                {
                    // relays do not nest
                    return;
                }
                let source = PacketSource::Relayed {
                    carrier: carrier.clone(),
                    relay,
                };
                self.dispatch(inner_header, &inner, source, q, cache).await;
            }
        }
    }

    async fn dispatch(
        &self,
        header: Header,
        data: &[u8],
        source: PacketSource,
        _q: usize,
        cache: &mut ConntrackCache,
    ) {
        match header.typ {
            MessageType::Handshake => match header.subtype {
                HANDSHAKE_HELLO => {
                    self.handshake_manager.handle_hello(self, source, data).await;
                }
                HANDSHAKE_REPLY => {
                    self.handshake_manager
                        .handle_reply(self, source, &header, data)
                        .await;
                }
                other => trace!(subtype = other, "unknown handshake subtype"),
            },
            MessageType::Message => {
                self.handle_message_packet(header, data, source, cache).await;
            }
            MessageType::LightHouse => {
                if let Some((hostinfo, plaintext)) = self.open_for(header, data, &source).await {
                    self.lighthouse
                        .handle_request(self, source.addr(), hostinfo.vpn_ip, &plaintext)
                        .await;
                }
            }
            MessageType::Test => {
                if let Some((hostinfo, plaintext)) = self.open_for(header, data, &source).await {
                    if header.subtype == TEST_REQUEST {
                        let _ = self
                            .send_message_to_hostinfo(
                                MessageType::Test,
                                crate::header::TEST_REPLY,
                                &hostinfo,
                                &plaintext,
                            )
                            .await;
                    }
                }
            }
            MessageType::CloseTunnel => {
                if let Some((hostinfo, _)) = self.open_for(header, data, &source).await {
                    // Only the address we are actually talking to may
                    // close the tunnel
                    if source.addr().is_some() && source.addr() == hostinfo.remote() {
                        info!(vpn_ip = %hostinfo.vpn_ip, "peer requested tunnel close");
                        self.hostmap.delete_host_info(&hostinfo);
                    }
                }
            }
            MessageType::Control => {
                if let Some((hostinfo, plaintext)) = self.open_for(header, data, &source).await {
                    match bincode::deserialize::<ControlMsg>(&plaintext) {
                        Ok(msg) => {
                            self.relay_manager.handle_control(self, &hostinfo, &msg).await;
                        }
                        Err(e) => debug!("undecodable control message: {}", e),
                    }
                }
            }
            MessageType::RecvError => {
                self.handle_recv_error(header, source).await;
            }
        }
    }

    /// Common prologue for encrypted non-data messages: find the tunnel
    /// by our index, decrypt, mark liveness, track roaming.
    async fn open_for(
        &self,
        header: Header,
        data: &[u8],
        source: &PacketSource,
    ) -> Option<(Arc<HostInfo>, Vec<u8>)> {
        let hostinfo = match self.hostmap.query_index(header.remote_index) {
            Some(hi) => hi,
            None => {
                if let Some(addr) = source.addr() {
                    self.send_recv_error(addr, header.remote_index).await;
                }
                return None;
            }
        };
        let plaintext = match self.decrypt_packet(&hostinfo, &header, data) {
            Ok(p) => p,
            Err(_) => {
                self.metrics.decrypt_failures.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        self.connection_manager.mark_in(hostinfo.local_index());
        if let Some(addr) = source.addr() {
            self.handle_host_roaming(&hostinfo, addr);
        }
        Some((hostinfo, plaintext))
    }

    async fn handle_message_packet(
        &self,
        header: Header,
        data: &[u8],
        source: PacketSource,
        cache: &mut ConntrackCache,
    ) {
        if header.subtype != SUBTYPE_NONE {
            return;
        }
        let hostinfo = match self.hostmap.query_index(header.remote_index) {
            Some(hi) => hi,
            None => {
                // The peer has a tunnel we no longer know; tell it so it
                // can handshake fresh
                if let Some(addr) = source.addr() {
                    self.send_recv_error(addr, header.remote_index).await;
                }
                return;
            }
        };

        let plaintext = match self.decrypt_packet(&hostinfo, &header, data) {
            Ok(p) => p,
            Err(_) => {
                self.metrics.decrypt_failures.fetch_add(1, Ordering::Relaxed);
                if let Some(addr) = source.addr() {
                    self.send_recv_error(addr, header.remote_index).await;
                }
                return;
            }
        };

        self.connection_manager.mark_in(hostinfo.local_index());
        self.metrics.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .rx_bytes
            .fetch_add(plaintext.len() as u64, Ordering::Relaxed);

        if let Some(addr) = source.addr() {
            self.handle_host_roaming(&hostinfo, addr);
        }

        let fp = match parse_ipv4(&plaintext, true) {
            Ok(fp) => fp,
            Err(e) => {
                debug!(vpn_ip = %hostinfo.vpn_ip, "dropping inbound payload: {}", e);
                return;
            }
        };

        let cert = hostinfo.peer_cert();
        let issuer = cert.as_deref().and_then(|c| self.issuer_name(c));
        let verdict = self.firewall().drop_packet(
            &fp,
            true,
            cert.as_deref(),
            issuer.as_deref(),
            unix_now(),
            Some(cache),
        );
        if let Some(reason) = verdict {
            self.metrics.firewall_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(?fp, ?reason, "dropping inbound packet");
            return;
        }

        if let Err(e) = self.inside.write_packet(&plaintext).await {
            // A failed device write never tears the tunnel down
            warn!("tun write failed: {}", e);
        }
    }

    fn decrypt_packet(
        &self,
        hostinfo: &Arc<HostInfo>,
        header: &Header,
        data: &[u8],
    ) -> CoreResult<Vec<u8>> {
        let cs = hostinfo
            .connection_state()
            .filter(|cs| cs.is_ready())
            .ok_or(CoreError::TunnelNotReady)?;
        if data.len() < HEADER_LEN {
            return Err(CoreError::DataDecryptFailed);
        }
        cs.decrypt(header.message_counter, &data[..HEADER_LEN], &data[HEADER_LEN..])
    }

    /// The peer told us it cannot find the tunnel we are sending on;
    /// drop our side so the next packet handshakes fresh.
    async fn handle_recv_error(&self, header: Header, source: PacketSource) {
        let addr = match source.addr() {
            Some(a) => a,
            None => return,
        };
        if !self.recv_error_limiter.check(addr) {
            return;
        }
        self.metrics.recv_errors_received.fetch_add(1, Ordering::Relaxed);

        let hostinfo = match self.hostmap.query_remote_index(header.remote_index) {
            Some(hi) => hi,
            None => return,
        };
        // Ignore the claim unless it comes from where we send
        if let Some(remote) = hostinfo.remote() {
            if remote != addr {
                return;
            }
        }
        info!(vpn_ip = %hostinfo.vpn_ip, "tearing down tunnel after recv_error from peer");
        self.hostmap.delete_host_info(&hostinfo);
    }

    /// Tell a sender we have no tunnel for the index it used
    pub(crate) async fn send_recv_error(&self, addr: SocketAddr, index: u32) {
        if !self.recv_error_limiter.check(addr) {
            return;
        }
        self.metrics.recv_errors_sent.fetch_add(1, Ordering::Relaxed);
        let header = Header::new(MessageType::RecvError, SUBTYPE_NONE, index, 0);
        let _ = self
            .writers[0]
            .send_to(&header.encode(self.cipher.counter_le()), addr)
            .await;
    }

    /// An authenticated packet arrived from an unexpected source
    /// address: adopt it if the allow list admits it and we are not
    /// flapping between two addresses.
    fn handle_host_roaming(&self, hostinfo: &Arc<HostInfo>, addr: SocketAddr) {
        if hostinfo.remote() == Some(addr) {
            return;
        }
        if let SocketAddr::V4(a) = addr {
            if !self.remote_allow_list.allows(*a.ip()) {
                debug!(vpn_ip = %hostinfo.vpn_ip, %addr, "roam to disallowed address ignored");
                return;
            }
        }
        if !hostinfo.roam_check(addr, ROAM_HOLD_DOWN) {
            debug!(vpn_ip = %hostinfo.vpn_ip, %addr, "roam flap suppressed");
            return;
        }
        info!(
            vpn_ip = %hostinfo.vpn_ip,
            old = ?hostinfo.remote(),
            new = %addr,
            "peer roamed"
        );
        hostinfo.set_remote(addr);
        if let SocketAddr::V4(a) = addr {
            hostinfo.remotes().prepend_v4(a);
        }
    }
}
