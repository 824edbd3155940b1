//! Sliding-window rate limiter for upgrade and connect attempts.
//!
//! Each key keeps the timestamps of its recent attempts; anything older
//! than the window is forgotten.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// A rate limiter with a per-key attempt budget over a rolling window.
#[derive(Debug)]
pub struct RateLimiter {
    max_attempts: u32,
    window: Duration,
    /// key → attempt timestamps inside the window.
    entries: HashMap<String, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            entries: HashMap::new(),
        }
    }

    /// Record an attempt for `key` if it is within budget.
    ///
    /// Returns `true` if allowed, `false` if rate-limited.
    pub fn check_and_record(&mut self, key: &str) -> bool {
        let now = Instant::now();
        let window = self.window;
        let attempts = self.entries.entry(key.to_string()).or_default();
        attempts.retain(|t| now.duration_since(*t) < window);

        if attempts.len() as u32 >= self.max_attempts {
            return false;
        }
        attempts.push(now);
        true
    }

    /// Drop keys with no attempts left in the window.
    pub fn gc(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.entries.retain(|_, attempts| {
            attempts.retain(|t| now.duration_since(*t) < window);
            !attempts.is_empty()
        });
    }

    /// Number of keys currently tracked.
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}

/// Rate limiters applied by the relay server.
#[derive(Debug)]
pub struct ServerRateLimits {
    /// WebSocket upgrades per remote IP.
    pub upgrade: RateLimiter,
    /// `connect` frames per owner.
    pub connect: RateLimiter,
}

impl Default for ServerRateLimits {
    fn default() -> Self {
        Self {
            upgrade: RateLimiter::new(30, Duration::from_secs(60)),
            connect: RateLimiter::new(20, Duration::from_secs(60)),
        }
    }
}

impl ServerRateLimits {
    pub fn check_upgrade(&mut self, ip: &IpAddr) -> bool {
        self.upgrade.check_and_record(&ip.to_string())
    }

    pub fn check_connect(&mut self, owner_id: &str) -> bool {
        self.connect.check_and_record(owner_id)
    }

    pub fn gc(&mut self) {
        self.upgrade.gc();
        self.connect.gc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_per_key() {
        let mut limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.check_and_record("a"));
        assert!(limiter.check_and_record("a"));
        assert!(!limiter.check_and_record("a"));
        assert!(limiter.check_and_record("b"));
    }

    #[test]
    fn attempts_expire_with_the_window() {
        let mut limiter = RateLimiter::new(1, Duration::from_millis(20));
        assert!(limiter.check_and_record("a"));
        assert!(!limiter.check_and_record("a"));
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.check_and_record("a"));

        std::thread::sleep(Duration::from_millis(30));
        limiter.gc();
        assert_eq!(limiter.tracked(), 0);
    }

    #[test]
    fn server_limits_track_ips_and_owners_separately() {
        let mut limits = ServerRateLimits::default();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        for _ in 0..30 {
            assert!(limits.check_upgrade(&ip));
        }
        assert!(!limits.check_upgrade(&ip));
        assert!(limits.check_connect("alice"));
    }
}
