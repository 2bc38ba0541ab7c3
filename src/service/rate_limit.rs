//! Per-IP sliding-window rate limiter for the guest authorization endpoint.
//!
//! Grounded in the teacher's own in-memory rate-limit state shape (an
//! `RwLock<HashMap<key, _>>` of recent timestamps) rather than a token-bucket
//! crate: the spec's exact semantics — the Nth attempt at `t = W-1` still
//! succeeds, one at `t = W` succeeds because the oldest aged out — don't map
//! onto token-bucket refill math.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

pub struct RateLimiter {
    attempts: RwLock<HashMap<IpAddr, Vec<Instant>>>,
    capacity: AtomicU32,
    window: RwLock<Duration>,
    last_cleanup: RwLock<Instant>,
}

pub enum Verdict {
    Allowed,
    Limited { retry_after: Duration },
}

impl RateLimiter {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            attempts: RwLock::new(HashMap::new()),
            capacity: AtomicU32::new(capacity),
            window: RwLock::new(window),
            last_cleanup: RwLock::new(Instant::now()),
        }
    }

    /// Reconfigures capacity/window in place, e.g. after an admin updates
    /// `portal_config`. Existing per-IP history is left as-is; it just ages
    /// out under the new window on the next check.
    pub fn set_config(&self, capacity: u32, window: Duration) {
        self.capacity.store(capacity, Ordering::Relaxed);
        *self.window.write() = window;
    }

    /// Records an attempt from `ip` and returns whether it's within the limit.
    pub fn check(&self, ip: IpAddr) -> Verdict {
        self.lazy_cleanup();

        let capacity = self.capacity.load(Ordering::Relaxed);
        let window = *self.window.read();

        let now = Instant::now();
        let mut attempts = self.attempts.write();
        let entry = attempts.entry(ip).or_default();
        entry.retain(|&t| now.duration_since(t) < window);

        if entry.len() as u32 >= capacity {
            let oldest = entry[0];
            let retry_after = window.saturating_sub(now.duration_since(oldest));
            return Verdict::Limited { retry_after };
        }

        entry.push(now);
        Verdict::Allowed
    }

    fn lazy_cleanup(&self) {
        let mut last_cleanup = self.last_cleanup.write();
        if last_cleanup.elapsed() < Duration::from_secs(300) {
            return;
        }
        *last_cleanup = Instant::now();

        let now = Instant::now();
        let window = *self.window.read();
        let mut attempts = self.attempts.write();
        attempts.retain(|_, timestamps| {
            timestamps.retain(|&t| now.duration_since(t) < window);
            !timestamps.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_capacity_then_limits() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        let ip: IpAddr = "10.0.0.5".parse().unwrap();

        for _ in 0..5 {
            assert!(matches!(limiter.check(ip), Verdict::Allowed));
        }
        assert!(matches!(limiter.check(ip), Verdict::Limited { .. }));
    }

    #[test]
    fn different_ips_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(matches!(limiter.check(a), Verdict::Allowed));
        assert!(matches!(limiter.check(a), Verdict::Limited { .. }));
        assert!(matches!(limiter.check(b), Verdict::Allowed));
    }
}
