//! Per-key "at most once per duration" gate, used for the per-flow
//! new-flow notification (30s) and the scan alert (1h).

use crate::clock::SharedClock;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub struct RateLimiter {
    clock: SharedClock,
    period: Duration,
    last_fired: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    pub fn new(clock: SharedClock, period: Duration) -> Self {
        Self {
            clock,
            period,
            last_fired: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` (and records the firing) if `key` hasn't fired within
    /// `period`.
    pub fn allow(&self, key: &str) -> bool {
        let now = self.clock.now();
        let mut last_fired = self.last_fired.lock();
        match last_fired.get(key) {
            Some(last) if now.duration_since(*last) < self.period => false,
            _ => {
                last_fired.insert(key.to_string(), now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    #[test]
    fn second_call_within_period_is_suppressed() {
        let clock = FakeClock::new();
        let limiter = RateLimiter::new(clock.clone(), Duration::from_secs(30));
        assert!(limiter.allow("aa:bb:cc:dd:ee:01"));
        assert!(!limiter.allow("aa:bb:cc:dd:ee:01"));
    }

    #[test]
    fn call_after_period_elapses_is_allowed() {
        let clock = FakeClock::new();
        let limiter = RateLimiter::new(clock.clone(), Duration::from_secs(30));
        assert!(limiter.allow("aa:bb:cc:dd:ee:01"));
        clock.advance(Duration::from_secs(31));
        assert!(limiter.allow("aa:bb:cc:dd:ee:01"));
    }

    #[test]
    fn distinct_keys_are_independent() {
        let clock = FakeClock::new();
        let limiter = RateLimiter::new(clock.clone(), Duration::from_secs(30));
        assert!(limiter.allow("a"));
        assert!(limiter.allow("b"));
    }
}
