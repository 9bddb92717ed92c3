//! Hashed timer wheel.
//!
//! Cheap scheduling for the handshake and connection managers: slots are
//! tick-granular, entries fire when the wheel advances past them. An
//! entry may fire one tick late, never early.

use std::time::{Duration, Instant};

pub struct TimerWheel<T> {
    wheel: Vec<Vec<T>>,
    tick: Duration,
    current: usize,
    last_advance: Option<Instant>,
}

impl<T> TimerWheel<T> {
    /// `tick` is the slot granularity; `span` the longest schedulable
    /// timeout. One spare slot keeps "now" and "span" from colliding.
    pub fn new(tick: Duration, span: Duration) -> Self {
        let slots = (span.as_millis() / tick.as_millis().max(1)) as usize + 2;
        Self {
            wheel: (0..slots).map(|_| Vec::new()).collect(),
            tick,
            current: 0,
            last_advance: None,
        }
    }

    /// Schedule `item` to fire after `timeout`
    pub fn add(&mut self, item: T, timeout: Duration) {
        let mut ticks = (timeout.as_millis() / self.tick.as_millis().max(1)) as usize + 1;
        if ticks >= self.wheel.len() {
            ticks = self.wheel.len() - 1;
        }
        let slot = (self.current + ticks) % self.wheel.len();
        self.wheel[slot].push(item);
    }

    /// Advance to `now`, returning every entry whose slot has passed
    pub fn purge(&mut self, now: Instant) -> Vec<T> {
        let elapsed = match self.last_advance {
            None => {
                self.last_advance = Some(now);
                return Vec::new();
            }
            Some(last) => now.saturating_duration_since(last),
        };

        let mut ticks = (elapsed.as_millis() / self.tick.as_millis().max(1)) as usize;
        if ticks == 0 {
            return Vec::new();
        }
        if ticks > self.wheel.len() {
            ticks = self.wheel.len();
        }
        // Only bank the time we actually consumed, so partial ticks
        // carry into the next advance
        self.last_advance = Some(
            self.last_advance.unwrap() + self.tick * ticks as u32,
        );

        let mut expired = Vec::new();
        for _ in 0..ticks {
            self.current = (self.current + 1) % self.wheel.len();
            expired.append(&mut self.wheel[self.current]);
        }
        expired
    }

    /// Total scheduled entries, for tests and introspection
    pub fn len(&self) -> usize {
        self.wheel.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_after_timeout() {
        let mut w: TimerWheel<u32> = TimerWheel::new(
            Duration::from_millis(100),
            Duration::from_secs(10),
        );
        let start = Instant::now();
        assert!(w.purge(start).is_empty());

        w.add(7, Duration::from_millis(250));
        assert_eq!(w.len(), 1);

        // Not yet
        assert!(w.purge(start + Duration::from_millis(200)).is_empty());
        // Fires within one tick of the deadline
        let fired = w.purge(start + Duration::from_millis(500));
        assert_eq!(fired, vec![7]);
        assert_eq!(w.len(), 0);
    }

    #[test]
    fn test_never_fires_early() {
        let mut w: TimerWheel<u32> =
            TimerWheel::new(Duration::from_millis(100), Duration::from_secs(5));
        let start = Instant::now();
        w.purge(start);
        w.add(1, Duration::from_millis(400));

        assert!(w.purge(start + Duration::from_millis(399)).is_empty());
    }

    #[test]
    fn test_long_sleep_collects_everything() {
        let mut w: TimerWheel<u32> =
            TimerWheel::new(Duration::from_millis(100), Duration::from_secs(2));
        let start = Instant::now();
        w.purge(start);
        w.add(1, Duration::from_millis(100));
        w.add(2, Duration::from_millis(900));
        w.add(3, Duration::from_millis(1900));

        let mut fired = w.purge(start + Duration::from_secs(60));
        fired.sort();
        assert_eq!(fired, vec![1, 2, 3]);
    }

    #[test]
    fn test_timeout_beyond_span_clamps() {
        let mut w: TimerWheel<u32> =
            TimerWheel::new(Duration::from_millis(100), Duration::from_secs(1));
        let start = Instant::now();
        w.purge(start);
        w.add(9, Duration::from_secs(60));

        let fired = w.purge(start + Duration::from_secs(2));
        assert_eq!(fired, vec![9]);
    }
}
