//! Token-bucket rate limiting.
//!
//! Message and image-chunk buckets are keyed by client identity; the
//! connection gate is keyed by source IP and escalates repeat offenders to
//! a temporary IP ban. Buckets are independent: a client that exhausts its
//! send budget still receives messages.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Which budget a frame draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateKind {
    Message,
    ImageChunk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Denied; one token refills after this many seconds.
    DeniedFor(u64),
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64) -> Self {
        Self {
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn try_consume(&mut self, rate: f64, capacity: f64) -> RateDecision {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            RateDecision::Allowed
        } else {
            let wait = ((1.0 - self.tokens) / rate).ceil().max(1.0);
            RateDecision::DeniedFor(wait as u64)
        }
    }
}

/// Per-identity buckets for message and image-chunk budgets.
pub struct RateLimiter {
    message_capacity: f64,
    message_rate: f64,
    image_capacity: f64,
    image_rate: f64,
    buckets: HashMap<(String, RateKind), TokenBucket>,
    last_sweep: Instant,
}

const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

impl RateLimiter {
    /// Budgets are counts per 10-second window.
    pub fn new(message_per_10s: u32, image_chunks_per_10s: u32) -> Self {
        Self {
            message_capacity: f64::from(message_per_10s),
            message_rate: f64::from(message_per_10s) / 10.0,
            image_capacity: f64::from(image_chunks_per_10s),
            image_rate: f64::from(image_chunks_per_10s) / 10.0,
            buckets: HashMap::new(),
            last_sweep: Instant::now(),
        }
    }

    pub fn check(&mut self, identity: &str, kind: RateKind) -> RateDecision {
        if self.last_sweep.elapsed() >= SWEEP_INTERVAL {
            self.sweep();
        }
        let (rate, capacity) = match kind {
            RateKind::Message => (self.message_rate, self.message_capacity),
            RateKind::ImageChunk => (self.image_rate, self.image_capacity),
        };
        self.buckets
            .entry((identity.to_string(), kind))
            .or_insert_with(|| TokenBucket::new(capacity))
            .try_consume(rate, capacity)
    }

    /// Drop a client's buckets on disconnect.
    pub fn forget(&mut self, identity: &str) {
        self.buckets.retain(|(id, _), _| id != identity);
    }

    fn sweep(&mut self) {
        self.buckets
            .retain(|_, bucket| bucket.last_refill.elapsed() < SWEEP_INTERVAL);
        self.last_sweep = Instant::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allowed,
    Denied,
    /// Denied, and the violation count crossed the ban threshold: the
    /// caller should hand the address a temp ban.
    BanNow,
}

/// Connection-rate tracking per source IP.
pub struct ConnectionGate {
    capacity: f64,
    rate: f64,
    ban_threshold: u32,
    buckets: HashMap<IpAddr, TokenBucket>,
    violations: HashMap<IpAddr, u32>,
}

impl ConnectionGate {
    /// `per_minute` connections per IP; `ban_threshold` denials before a ban.
    pub fn new(per_minute: u32, ban_threshold: u32) -> Self {
        Self {
            capacity: f64::from(per_minute),
            rate: f64::from(per_minute) / 60.0,
            ban_threshold,
            buckets: HashMap::new(),
            violations: HashMap::new(),
        }
    }

    pub fn check(&mut self, ip: IpAddr) -> GateDecision {
        let capacity = self.capacity;
        let rate = self.rate;
        let decision = self
            .buckets
            .entry(ip)
            .or_insert_with(|| TokenBucket::new(capacity))
            .try_consume(rate, capacity);
        match decision {
            RateDecision::Allowed => GateDecision::Allowed,
            RateDecision::DeniedFor(_) => {
                let violations = self.violations.entry(ip).or_insert(0);
                *violations += 1;
                if *violations >= self.ban_threshold {
                    self.violations.remove(&ip);
                    GateDecision::BanNow
                } else {
                    GateDecision::Denied
                }
            }
        }
    }

    /// Clear tracked state for an address (after a ban expires).
    pub fn clear(&mut self, ip: IpAddr) {
        self.buckets.remove(&ip);
        self.violations.remove(&ip);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_allows_exactly_the_budget() {
        let mut limiter = RateLimiter::new(30, 100);
        let mut allowed = 0;
        let mut denied = 0;
        for _ in 0..40 {
            match limiter.check("alice", RateKind::Message) {
                RateDecision::Allowed => allowed += 1,
                RateDecision::DeniedFor(secs) => {
                    assert!(secs >= 1);
                    denied += 1;
                }
            }
        }
        assert_eq!(allowed, 30);
        assert_eq!(denied, 10);
    }

    #[test]
    fn buckets_are_independent_per_identity_and_kind() {
        let mut limiter = RateLimiter::new(2, 2);
        assert_eq!(limiter.check("a", RateKind::Message), RateDecision::Allowed);
        assert_eq!(limiter.check("a", RateKind::Message), RateDecision::Allowed);
        assert!(matches!(
            limiter.check("a", RateKind::Message),
            RateDecision::DeniedFor(_)
        ));
        // Image budget and other identities are untouched.
        assert_eq!(
            limiter.check("a", RateKind::ImageChunk),
            RateDecision::Allowed
        );
        assert_eq!(limiter.check("b", RateKind::Message), RateDecision::Allowed);
    }

    #[test]
    fn tokens_refill_over_time() {
        let mut limiter = RateLimiter::new(10, 10);
        for _ in 0..10 {
            assert_eq!(
                limiter.check("a", RateKind::Message),
                RateDecision::Allowed
            );
        }
        assert!(matches!(
            limiter.check("a", RateKind::Message),
            RateDecision::DeniedFor(_)
        ));
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(limiter.check("a", RateKind::Message), RateDecision::Allowed);
    }

    #[test]
    fn forget_resets_identity() {
        let mut limiter = RateLimiter::new(1, 1);
        assert_eq!(limiter.check("a", RateKind::Message), RateDecision::Allowed);
        assert!(matches!(
            limiter.check("a", RateKind::Message),
            RateDecision::DeniedFor(_)
        ));
        limiter.forget("a");
        assert_eq!(limiter.check("a", RateKind::Message), RateDecision::Allowed);
    }

    #[test]
    fn gate_escalates_to_ban() {
        let mut gate = ConnectionGate::new(2, 3);
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        assert_eq!(gate.check(ip), GateDecision::Allowed);
        assert_eq!(gate.check(ip), GateDecision::Allowed);
        assert_eq!(gate.check(ip), GateDecision::Denied);
        assert_eq!(gate.check(ip), GateDecision::Denied);
        assert_eq!(gate.check(ip), GateDecision::BanNow);
        // Counter resets after the ban fires.
        assert_eq!(gate.check(ip), GateDecision::Denied);
    }

    #[test]
    fn gate_tracks_ips_separately() {
        let mut gate = ConnectionGate::new(1, 10);
        let a: IpAddr = "203.0.113.1".parse().unwrap();
        let b: IpAddr = "203.0.113.2".parse().unwrap();
        assert_eq!(gate.check(a), GateDecision::Allowed);
        assert_eq!(gate.check(a), GateDecision::Denied);
        assert_eq!(gate.check(b), GateDecision::Allowed);
    }
}
