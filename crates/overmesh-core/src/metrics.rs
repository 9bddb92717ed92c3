//! Process-local counters.
//!
//! Handles are threaded through constructors instead of living in a
//! global registry; the stats task logs a snapshot on an interval.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    pub tx_packets: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub dropped_outbound: AtomicU64,
    pub dropped_inbound: AtomicU64,
    pub firewall_dropped: AtomicU64,
    pub replay_dropped: AtomicU64,
    pub decrypt_failures: AtomicU64,
    pub cached_packets: AtomicU64,
    pub cached_packets_dropped: AtomicU64,
    pub handshakes_initiated: AtomicU64,
    pub handshakes_completed: AtomicU64,
    pub handshakes_timed_out: AtomicU64,
    pub recv_errors_sent: AtomicU64,
    pub recv_errors_received: AtomicU64,
    pub relays_forwarded: AtomicU64,
    pub relays_established: AtomicU64,
    pub punches_sent: AtomicU64,
    pub tunnels_evicted: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// One-line snapshot for the periodic stats log
    pub fn snapshot(&self) -> String {
        format!(
            "tx={}p/{}b rx={}p/{}b drop_out={} drop_in={} fw_drop={} replay={} hs={}/{}/{} relay_fwd={}",
            self.tx_packets.load(Ordering::Relaxed),
            self.tx_bytes.load(Ordering::Relaxed),
            self.rx_packets.load(Ordering::Relaxed),
            self.rx_bytes.load(Ordering::Relaxed),
            self.dropped_outbound.load(Ordering::Relaxed),
            self.dropped_inbound.load(Ordering::Relaxed),
            self.firewall_dropped.load(Ordering::Relaxed),
            self.replay_dropped.load(Ordering::Relaxed),
            self.handshakes_initiated.load(Ordering::Relaxed),
            self.handshakes_completed.load(Ordering::Relaxed),
            self.handshakes_timed_out.load(Ordering::Relaxed),
            self.relays_forwarded.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let m = Metrics::new();
        m.tx_packets.fetch_add(3, Ordering::Relaxed);
        m.handshakes_completed.fetch_add(1, Ordering::Relaxed);
        let s = m.snapshot();
        assert!(s.contains("tx=3p"));
    }
}
