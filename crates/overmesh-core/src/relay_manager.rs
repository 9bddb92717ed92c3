//! Relay setup and control.
//!
//! When two peers cannot reach each other directly but both hold a
//! tunnel to a third peer, that peer can shuttle their (still
//! end-to-end encrypted) datagrams. This module owns the control
//! conversation that allocates the relay indices on all three nodes;
//! the data path lives in the packet pipeline.
//!
//! Index layout for A <-> R <-> B: A holds a `Terminal` entry
//! {local: IA, remote: IR_A}; R holds two `Forwarding` entries, one per
//! leg ({IR_A, IA} on A's tunnel, {IR_B, IB} on B's); B holds a
//! `Terminal` entry {local: IB, remote: IR_B}.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use overmesh_net::OverlayIp;

use crate::error::{CoreError, CoreResult};
use crate::header::{MessageType, SUBTYPE_NONE};
use crate::hostmap::{HostInfo, HostMap, Relay, RelayPhase, RelayType};
use crate::interface::Interface;
use crate::metrics::Metrics;

const RELAY_INDEX_PROBES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlType {
    CreateRelayRequest,
    CreateRelayResponse,
}

/// Relay control message, carried inside a tunnel as `Control` traffic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMsg {
    pub typ: ControlType,
    pub initiator_relay_index: u32,
    pub responder_relay_index: u32,
    pub relay_from_ip: u32,
    pub relay_to_ip: u32,
}

pub struct RelayManager {
    hostmap: Arc<HostMap>,
    am_relay: AtomicBool,
    metrics: Arc<Metrics>,
}

impl RelayManager {
    pub fn new(hostmap: Arc<HostMap>, am_relay: bool, metrics: Arc<Metrics>) -> Self {
        Self {
            hostmap,
            am_relay: AtomicBool::new(am_relay),
            metrics,
        }
    }

    pub fn am_relay(&self) -> bool {
        self.am_relay.load(Ordering::Relaxed)
    }

    pub fn set_am_relay(&self, v: bool) {
        self.am_relay.store(v, Ordering::Relaxed);
    }

    /// Allocate a relay index and hang the entry off its carrier
    /// tunnel. Only the primary host info is reachable from the relay
    /// tables, so the carrier is promoted first.
    pub fn add_relay(
        &self,
        carrier: &Arc<HostInfo>,
        peer_ip: OverlayIp,
        remote_index: Option<u32>,
        typ: RelayType,
        phase: RelayPhase,
    ) -> CoreResult<u32> {
        for _ in 0..RELAY_INDEX_PROBES {
            let index: u32 = rand::random();
            if index == 0 {
                continue;
            }
            if self.hostmap.query_relay(index).is_some()
                || self.hostmap.query_index(index).is_some()
            {
                continue;
            }
            self.hostmap.make_primary(carrier);
            carrier.relay_state.insert(Relay {
                typ,
                phase,
                local_index: index,
                remote_index: remote_index.unwrap_or(0),
                peer_ip,
            });
            self.hostmap.insert_relay(index, carrier);
            return Ok(index);
        }
        Err(CoreError::IndexExhausted)
    }

    /// A-side kickoff: ask `relay_ip` to stand up a relay toward
    /// `target`. Safe to call repeatedly; an established entry is left
    /// alone and a requested one just re-sends.
    pub async fn initiate(&self, intf: &Interface, target: OverlayIp, relay_ip: OverlayIp) {
        let carrier = match self.hostmap.query_vpn_ip(relay_ip) {
            Some(hi) if hi.is_ready() => hi,
            _ => {
                // bring the relay tunnel up first; the next send retries
                intf.get_or_handshake(relay_ip).await;
                return;
            }
        };

        let index = match carrier.relay_state.query_by_ip(target) {
            Some(relay) if relay.phase == RelayPhase::Established => return,
            Some(relay) => relay.local_index,
            None => match self.add_relay(
                &carrier,
                target,
                None,
                RelayType::Terminal,
                RelayPhase::Requested,
            ) {
                Ok(i) => i,
                Err(e) => {
                    error!("failed to allocate relay index: {}", e);
                    return;
                }
            },
        };

        let req = ControlMsg {
            typ: ControlType::CreateRelayRequest,
            initiator_relay_index: index,
            responder_relay_index: 0,
            relay_from_ip: intf.my_vpn_ip.as_u32(),
            relay_to_ip: target.as_u32(),
        };
        info!(relay = %relay_ip, %target, index, "requesting relay");
        self.send_control(intf, &carrier, &req).await;
    }

    pub async fn handle_control(&self, intf: &Interface, h: &Arc<HostInfo>, msg: &ControlMsg) {
        match msg.typ {
            ControlType::CreateRelayRequest => self.handle_request(intf, h, msg).await,
            ControlType::CreateRelayResponse => self.handle_response(intf, h, msg).await,
        }
    }

    async fn handle_request(&self, intf: &Interface, h: &Arc<HostInfo>, msg: &ControlMsg) {
        let from = OverlayIp::from_u32(msg.relay_from_ip);
        let target = OverlayIp::from_u32(msg.relay_to_ip);
        debug!(%from, %target, init = msg.initiator_relay_index, via = %h.vpn_ip, "relay requested");

        if target == intf.my_vpn_ip {
            self.handle_request_as_target(intf, h, msg, from, target).await;
        } else {
            self.handle_request_as_middle(intf, h, msg, from, target).await;
        }
    }

    /// We are the far end of the requested relay
    async fn handle_request_as_target(
        &self,
        intf: &Interface,
        h: &Arc<HostInfo>,
        msg: &ControlMsg,
        from: OverlayIp,
        target: OverlayIp,
    ) {
        match h.relay_state.query_by_ip(from) {
            Some(existing) => match existing.phase {
                RelayPhase::Requested => {
                    if !h
                        .relay_state
                        .complete_by_ip(from, msg.initiator_relay_index)
                    {
                        error!(%from, "relay state vanished during completion");
                        return;
                    }
                }
                RelayPhase::Established => {
                    if existing.remote_index != msg.initiator_relay_index {
                        // A peer never changes an index once created
                        error!(
                            %from,
                            existing = existing.remote_index,
                            got = msg.initiator_relay_index,
                            "existing relay mismatch with create request"
                        );
                        return;
                    }
                }
            },
            None => {
                if let Err(e) = self.add_relay(
                    h,
                    from,
                    Some(msg.initiator_relay_index),
                    RelayType::Terminal,
                    RelayPhase::Established,
                ) {
                    error!("failed to add relay: {}", e);
                    return;
                }
            }
        }

        let relay = match h.relay_state.query_by_ip(from) {
            Some(r) => r,
            None => return,
        };
        let resp = ControlMsg {
            typ: ControlType::CreateRelayResponse,
            responder_relay_index: relay.local_index,
            initiator_relay_index: relay.remote_index,
            relay_from_ip: from.as_u32(),
            relay_to_ip: target.as_u32(),
        };
        self.send_control(intf, h, &resp).await;
    }

    /// We would be the relay in the middle
    async fn handle_request_as_middle(
        &self,
        intf: &Interface,
        h: &Arc<HostInfo>,
        msg: &ControlMsg,
        from: OverlayIp,
        target: OverlayIp,
    ) {
        if !self.am_relay() {
            return;
        }
        let peer = match self.hostmap.query_vpn_ip(target) {
            Some(p) => p,
            None => {
                // Dial the target now; a retried request will find it
                intf.get_or_handshake(target).await;
                return;
            }
        };
        if peer.remote().is_none() {
            // only relay toward peers we reach directly
            return;
        }

        let mut send_request = false;
        let target_relay = peer.relay_state.query_by_ip(from);
        let index = match &target_relay {
            Some(r) => {
                if r.phase == RelayPhase::Requested {
                    send_request = true;
                }
                r.local_index
            }
            None => {
                match self.add_relay(
                    &peer,
                    from,
                    None,
                    RelayType::Forwarding,
                    RelayPhase::Requested,
                ) {
                    Ok(i) => {
                        send_request = true;
                        i
                    }
                    Err(e) => {
                        error!("failed to allocate relay index: {}", e);
                        return;
                    }
                }
            }
        };

        if send_request {
            let req = ControlMsg {
                typ: ControlType::CreateRelayRequest,
                initiator_relay_index: index,
                responder_relay_index: 0,
                relay_from_ip: from.as_u32(),
                relay_to_ip: target.as_u32(),
            };
            self.send_control(intf, &peer, &req).await;
        }

        // Track the half toward the requester as well
        match h.relay_state.query_by_ip(target) {
            None => {
                let phase = match &target_relay {
                    Some(r) if r.phase == RelayPhase::Established => RelayPhase::Established,
                    _ => RelayPhase::Requested,
                };
                if let Err(e) = self.add_relay(
                    h,
                    target,
                    Some(msg.initiator_relay_index),
                    RelayType::Forwarding,
                    phase,
                ) {
                    error!("failed to allocate relay index: {}", e);
                }
            }
            Some(relay) => match relay.phase {
                RelayPhase::Established => {
                    if relay.remote_index != msg.initiator_relay_index {
                        error!(
                            existing = relay.remote_index,
                            got = msg.initiator_relay_index,
                            "existing relay mismatch with create request"
                        );
                        return;
                    }
                    // idempotent retry: answer again with what we have
                    let resp = ControlMsg {
                        typ: ControlType::CreateRelayResponse,
                        responder_relay_index: relay.local_index,
                        initiator_relay_index: relay.remote_index,
                        relay_from_ip: from.as_u32(),
                        relay_to_ip: target.as_u32(),
                    };
                    self.send_control(intf, h, &resp).await;
                }
                RelayPhase::Requested => {
                    // still waiting on the other leg
                }
            },
        }
    }

    async fn handle_response(&self, intf: &Interface, h: &Arc<HostInfo>, msg: &ControlMsg) {
        let target = OverlayIp::from_u32(msg.relay_to_ip);
        debug!(
            via = %h.vpn_ip,
            init = msg.initiator_relay_index,
            resp = msg.responder_relay_index,
            "relay response"
        );

        let relay = match h
            .relay_state
            .complete_by_index(msg.initiator_relay_index, msg.responder_relay_index)
        {
            Some(r) => r,
            None => {
                info!(via = %h.vpn_ip, init = msg.initiator_relay_index, "failed to update relay");
                return;
            }
        };

        self.metrics
            .relays_established
            .fetch_add(1, Ordering::Relaxed);

        if relay.typ == RelayType::Terminal {
            // We initiated this relay; flush any handshake waiting on it
            let peer_ip = relay.peer_ip;
            if let Some(pending) = intf.handshake_manager.pending().query_vpn_ip(peer_ip) {
                pending.remotes().add_relay(h.vpn_ip);
                let hello = pending.handshake_packet();
                if !hello.is_empty() {
                    info!(%peer_ip, relay = %h.vpn_ip, "relay established, sending handshake through it");
                    if let Err(e) = intf.send_via(h, &relay, &hello).await {
                        debug!("failed to send handshake via relay: {}", e);
                    }
                }
            }
            if let Some(hi) = self.hostmap.query_vpn_ip(peer_ip) {
                hi.remotes().add_relay(h.vpn_ip);
            }
            return;
        }

        // We are the middle: the far leg is up, finish the near one and
        // tell the original requester
        let peer = match self.hostmap.query_vpn_ip(relay.peer_ip) {
            Some(p) => p,
            None => {
                error!(peer = %relay.peer_ip, "no tunnel for relay peer");
                return;
            }
        };
        let peer_relay = match peer.relay_state.establish_by_ip(target) {
            Some(r) => r,
            None => {
                error!(peer = %peer.vpn_ip, %target, "no relay state toward target");
                return;
            }
        };

        let resp = ControlMsg {
            typ: ControlType::CreateRelayResponse,
            responder_relay_index: peer_relay.local_index,
            initiator_relay_index: peer_relay.remote_index,
            relay_from_ip: peer.vpn_ip.as_u32(),
            relay_to_ip: target.as_u32(),
        };
        self.send_control(intf, &peer, &resp).await;
    }

    async fn send_control(&self, intf: &Interface, to: &Arc<HostInfo>, msg: &ControlMsg) {
        let bytes = match bincode::serialize(msg) {
            Ok(b) => b,
            Err(e) => {
                error!("failed to encode relay control message: {}", e);
                return;
            }
        };
        if let Err(e) = intf
            .send_message_to_hostinfo(MessageType::Control, SUBTYPE_NONE, to, &bytes)
            .await
        {
            debug!(to = %to.vpn_ip, "failed to send relay control message: {}", e);
        }
    }

    /// Drop a relay index, e.g. when its carrier tunnel dies
    pub fn remove_relay(&self, local_index: u32) {
        self.hostmap.remove_relay(local_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(s: &str) -> OverlayIp {
        OverlayIp::from(s.parse::<Ipv4Addr>().unwrap())
    }

    fn setup() -> (Arc<HostMap>, RelayManager, Arc<HostInfo>) {
        let hostmap = Arc::new(HostMap::new("test", "10.128.0.0/24".parse().unwrap(), vec![]));
        let rm = RelayManager::new(hostmap.clone(), true, Arc::new(Metrics::new()));
        let (carrier, _) = hostmap.add_vpn_ip(ip("10.128.0.9"));
        let idx = hostmap.allocate_index(&[]).unwrap();
        hostmap.insert_index(idx, &carrier);
        (hostmap, rm, carrier)
    }

    #[test]
    fn test_add_relay_registers_index() {
        let (hostmap, rm, carrier) = setup();
        let idx = rm
            .add_relay(
                &carrier,
                ip("10.128.0.2"),
                Some(77),
                RelayType::Forwarding,
                RelayPhase::Requested,
            )
            .unwrap();

        assert_ne!(idx, 0);
        let found = hostmap.query_relay(idx).unwrap();
        assert!(Arc::ptr_eq(&found, &carrier));

        let relay = carrier.relay_state.query_by_index(idx).unwrap();
        assert_eq!(relay.peer_ip, ip("10.128.0.2"));
        assert_eq!(relay.remote_index, 77);
        assert_eq!(relay.phase, RelayPhase::Requested);
    }

    #[test]
    fn test_add_relay_indices_unique() {
        let (hostmap, rm, carrier) = setup();
        let a = rm
            .add_relay(&carrier, ip("10.128.0.2"), None, RelayType::Forwarding, RelayPhase::Requested)
            .unwrap();
        let b = rm
            .add_relay(&carrier, ip("10.128.0.3"), None, RelayType::Forwarding, RelayPhase::Requested)
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(hostmap.relay_count(), 2);
    }

    #[test]
    fn test_control_msg_round_trip() {
        let msg = ControlMsg {
            typ: ControlType::CreateRelayRequest,
            initiator_relay_index: 1,
            responder_relay_index: 0,
            relay_from_ip: ip("10.128.0.1").as_u32(),
            relay_to_ip: ip("10.128.0.2").as_u32(),
        };
        let bytes = bincode::serialize(&msg).unwrap();
        let decoded: ControlMsg = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded.typ, ControlType::CreateRelayRequest);
        assert_eq!(decoded.relay_to_ip, msg.relay_to_ip);
    }
}
