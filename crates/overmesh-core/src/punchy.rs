//! NAT punching behavior knobs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Controls whether and how this node sends hole-punch packets.
/// Reload-safe: the flags are atomics swapped by the config watcher.
pub struct Punchy {
    punch: AtomicBool,
    respond: AtomicBool,
    delay: Duration,
    respond_delay: Duration,
}

impl Punchy {
    pub fn new(punch: bool, respond: bool, delay: Duration, respond_delay: Duration) -> Self {
        Self {
            punch: AtomicBool::new(punch),
            respond: AtomicBool::new(respond),
            delay,
            respond_delay,
        }
    }

    pub fn punch(&self) -> bool {
        self.punch.load(Ordering::Relaxed)
    }

    pub fn respond(&self) -> bool {
        self.respond.load(Ordering::Relaxed)
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn respond_delay(&self) -> Duration {
        self.respond_delay
    }

    pub fn set_punch(&self, v: bool) {
        self.punch.store(v, Ordering::Relaxed);
    }

    pub fn set_respond(&self, v: bool) {
        self.respond.store(v, Ordering::Relaxed);
    }
}

impl Default for Punchy {
    fn default() -> Self {
        Self::new(true, false, Duration::from_secs(1), Duration::from_secs(5))
    }
}
