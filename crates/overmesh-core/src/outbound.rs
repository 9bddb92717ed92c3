//! Inside-to-outside packet path: TUN reads become AEAD-sealed UDP
//! datagrams, starting handshakes and falling back to relays as needed.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use overmesh_net::{parse_ipv4, OverlayIp};
use overmesh_pki::unix_now;

use crate::error::{CoreError, CoreResult};
use crate::firewall::ConntrackCache;
use crate::header::{Header, MessageType, MESSAGE_RELAY, SUBTYPE_NONE};
use crate::hostmap::{HostInfo, Relay, RelayPhase};
use crate::interface::Interface;
use crate::session::{CachedPacket, ConnectionState};

impl Interface {
    /// Process one packet read from the TUN device on worker `q`
    pub async fn consume_inside_packet(&self, packet: &[u8], q: usize, cache: &mut ConntrackCache) {
        let fp = match parse_ipv4(packet, false) {
            Ok(fp) => fp,
            Err(e) => {
                debug!("dropping malformed outbound packet: {}", e);
                return;
            }
        };

        if self.drop_local_broadcast && fp.remote_ip == self.local_broadcast {
            return;
        }
        if fp.remote_ip == self.my_vpn_ip {
            return;
        }
        if self.drop_multicast && fp.remote_ip.is_multicast() {
            return;
        }

        let hostinfo = match self.get_or_handshake(fp.remote_ip).await {
            Some(hi) => hi,
            None => {
                debug!(dst = %fp.remote_ip, "dropping outbound packet, not routable on the overlay");
                self.metrics.dropped_outbound.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let cs = match hostinfo.connection_state() {
            Some(cs) => cs,
            None => return,
        };

        if !cs.is_ready() {
            // Hold the packet until the handshake lands; the queue lock
            // re-checks readiness so we cannot strand a packet behind a
            // concurrent drain
            let queued = cs.queue_packet(
                CachedPacket {
                    typ: MessageType::Message,
                    subtype: SUBTYPE_NONE,
                    payload: packet.to_vec(),
                },
                &self.metrics.cached_packets_dropped,
            );
            if queued {
                self.metrics.cached_packets.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }

        let cert = hostinfo.peer_cert();
        let issuer = cert.as_deref().and_then(|c| self.issuer_name(c));
        let verdict = self.firewall().drop_packet(
            &fp,
            false,
            cert.as_deref(),
            issuer.as_deref(),
            unix_now(),
            Some(cache),
        );
        if let Some(reason) = verdict {
            self.metrics.firewall_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(?fp, ?reason, "dropping outbound packet");
            return;
        }

        if let Err(e) = self
            .send_no_metrics(MessageType::Message, SUBTYPE_NONE, &cs, &hostinfo, packet, q)
            .await
        {
            debug!(dst = %fp.remote_ip, "failed to send outbound packet: {}", e);
        } else {
            self.metrics.tx_packets.fetch_add(1, Ordering::Relaxed);
            self.metrics
                .tx_bytes
                .fetch_add(packet.len() as u64, Ordering::Relaxed);
        }
    }

    /// Find the tunnel for an overlay destination, starting a handshake
    /// if none exists. Returns `None` when the address is not routable.
    pub async fn get_or_handshake(&self, vpn_ip: OverlayIp) -> Option<Arc<HostInfo>> {
        let vpn_ip = if self.my_vpn_net.contains(&std::net::Ipv4Addr::from(vpn_ip)) {
            vpn_ip
        } else {
            let routed = self.inside.route_for(vpn_ip);
            if routed.is_unset() {
                return None;
            }
            routed
        };

        if let Some(hi) = self.hostmap.promote_best_query_vpn_ip(vpn_ip) {
            return Some(hi);
        }

        if let Some(hi) = self.handshake_manager.pending().query_vpn_ip(vpn_ip) {
            return Some(hi);
        }

        let hi = match self
            .handshake_manager
            .add_vpn_ip(vpn_ip, &self.cert_state())
        {
            Ok(hi) => hi,
            Err(e) => {
                warn!(%vpn_ip, "failed to start handshake: {}", e);
                return None;
            }
        };

        // A statically mapped peer needs no lighthouse answer; kick the
        // first attempt without waiting for the timer
        if self.lighthouse.is_static(vpn_ip) {
            let _ = self.handshake_trigger.try_send(vpn_ip);
        }

        Some(hi)
    }

    /// Encrypted send toward an overlay address, queueing while the
    /// handshake is in flight. Backs the [`crate::EncWriter`] impl.
    pub(crate) async fn send_to_vpn_ip(
        &self,
        typ: MessageType,
        subtype: u8,
        vpn_ip: OverlayIp,
        payload: &[u8],
    ) -> CoreResult<()> {
        let hostinfo = self
            .get_or_handshake(vpn_ip)
            .await
            .ok_or(CoreError::HostNotFound(vpn_ip))?;
        self.send_message_to_hostinfo(typ, subtype, &hostinfo, payload)
            .await
    }

    pub(crate) async fn send_message_to_hostinfo(
        &self,
        typ: MessageType,
        subtype: u8,
        hostinfo: &Arc<HostInfo>,
        payload: &[u8],
    ) -> CoreResult<()> {
        let cs = hostinfo
            .connection_state()
            .ok_or(CoreError::TunnelNotReady)?;
        if !cs.is_ready() {
            let queued = cs.queue_packet(
                CachedPacket {
                    typ,
                    subtype,
                    payload: payload.to_vec(),
                },
                &self.metrics.cached_packets_dropped,
            );
            if queued {
                self.metrics.cached_packets.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }
        Box::pin(self.send_no_metrics(typ, subtype, &cs, hostinfo, payload, 0))
            .await
    }

    /// Seal and transmit one message on an established tunnel.
    pub(crate) async fn send_no_metrics(
        &self,
        typ: MessageType,
        subtype: u8,
        cs: &ConnectionState,
        hostinfo: &Arc<HostInfo>,
        payload: &[u8],
        q: usize,
    ) -> CoreResult<()> {
        let counter = cs.next_counter();
        let header = Header::new(typ, subtype, hostinfo.remote_index(), counter);
        let aad = header.encode(self.cipher.counter_le());

        self.connection_manager.mark_out(hostinfo.local_index());

        // If the sockets were rebound since this tunnel last checked,
        // re-query the lighthouse so the peer punches toward our new
        // mapping. Skipped on teardown.
        if typ != MessageType::CloseTunnel && hostinfo.last_rebind_count() != self.rebind_count() {
            hostinfo.set_last_rebind_count(self.rebind_count());
            self.lighthouse.query_server(hostinfo.vpn_ip, self).await;
            trace!(vpn_ip = %hostinfo.vpn_ip, "lighthouse refresh triggered by socket rebind");
        }

        let ciphertext = cs.encrypt(counter, &aad, payload)?;
        let mut out = Vec::with_capacity(aad.len() + ciphertext.len());
        out.extend_from_slice(&aad);
        out.extend_from_slice(&ciphertext);

        match hostinfo.remote() {
            Some(addr) => {
                let q = q % self.writers.len();
                if let Err(e) = self.writers[q].send_to(&out, addr).await {
                    // Send failures drop the packet but never the tunnel
                    warn!(%addr, "udp send failed: {}", e);
                    self.metrics.dropped_outbound.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            }
            None => self.send_fallback_via_relay(hostinfo, &out).await,
        }
    }

    /// No direct path: push the sealed datagram through an established
    /// relay, or start setting one up.
    async fn send_fallback_via_relay(
        &self,
        hostinfo: &Arc<HostInfo>,
        inner: &[u8],
    ) -> CoreResult<()> {
        if !self.use_relays {
            self.metrics.dropped_outbound.fetch_add(1, Ordering::Relaxed);
            return Err(CoreError::HostNotFound(hostinfo.vpn_ip));
        }

        for relay_ip in hostinfo.remotes().relays() {
            if let Some(carrier) = self.hostmap.query_vpn_ip(relay_ip) {
                if let Some(relay) = carrier.relay_state.query_by_ip(hostinfo.vpn_ip) {
                    if relay.phase == RelayPhase::Established {
                        return self.send_via(&carrier, &relay, inner).await;
                    }
                    continue;
                }
            }
            // No usable entry through this relay yet; ask for one
            self.relay_manager
                .initiate(self, hostinfo.vpn_ip, relay_ip)
                .await;
        }

        debug!(vpn_ip = %hostinfo.vpn_ip, "no relay path available, dropping");
        self.metrics.dropped_outbound.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Wrap an already-built datagram in a relay envelope and send it to
    /// the carrier. The carrier never sees the inner plaintext; for data
    /// packets the inner bytes are themselves sealed end to end.
    pub(crate) async fn send_via(
        &self,
        carrier: &Arc<HostInfo>,
        relay: &Relay,
        inner: &[u8],
    ) -> CoreResult<()> {
        let cs = carrier
            .connection_state()
            .filter(|cs| cs.is_ready())
            .ok_or(CoreError::TunnelNotReady)?;

        let counter = cs.next_counter();
        let header = Header::new(
            MessageType::Message,
            MESSAGE_RELAY,
            relay.remote_index,
            counter,
        );
        let aad = header.encode(self.cipher.counter_le());
        let ciphertext = cs.encrypt(counter, &aad, inner)?;

        let mut out = Vec::with_capacity(aad.len() + ciphertext.len());
        out.extend_from_slice(&aad);
        out.extend_from_slice(&ciphertext);

        let addr = carrier.remote().ok_or(CoreError::TunnelNotReady)?;
        self.connection_manager.mark_out(carrier.local_index());
        self.writers[0].send_to(&out, addr).await?;
        Ok(())
    }

    /// Flush one packet that was queued while the handshake was in
    /// flight. Data packets get their firewall verdict now, since none
    /// was possible before the peer's certificate was known.
    pub(crate) async fn send_queued_packet(
        &self,
        hostinfo: &Arc<HostInfo>,
        cs: &ConnectionState,
        cached: CachedPacket,
    ) {
        if cached.typ == MessageType::Message && cached.subtype == SUBTYPE_NONE {
            let fp = match parse_ipv4(&cached.payload, false) {
                Ok(fp) => fp,
                Err(_) => return,
            };
            let cert = hostinfo.peer_cert();
            let issuer = cert.as_deref().and_then(|c| self.issuer_name(c));
            let verdict = self.firewall().drop_packet(
                &fp,
                false,
                cert.as_deref(),
                issuer.as_deref(),
                unix_now(),
                None,
            );
            if let Some(reason) = verdict {
                self.metrics.firewall_dropped.fetch_add(1, Ordering::Relaxed);
                debug!(?fp, ?reason, "dropping queued packet");
                return;
            }
        }
        if let Err(e) = self
            .send_no_metrics(cached.typ, cached.subtype, cs, hostinfo, &cached.payload, 0)
            .await
        {
            debug!(vpn_ip = %hostinfo.vpn_ip, "failed to flush queued packet: {}", e);
        }
    }

    /// Best-effort goodbye on an established tunnel
    pub(crate) async fn send_close_tunnel(&self, hostinfo: &Arc<HostInfo>) {
        if let Some(cs) = hostinfo.connection_state().filter(|cs| cs.is_ready()) {
            let _ = self
                .send_no_metrics(
                    MessageType::CloseTunnel,
                    SUBTYPE_NONE,
                    &cs,
                    hostinfo,
                    &[],
                    0,
                )
                .await;
        }
    }
}
