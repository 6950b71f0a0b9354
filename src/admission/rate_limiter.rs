// src/admission/rate_limiter.rs

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Window policy for the rate limiter.
///
/// The closure is evaluated on every admission check, so the effective
/// window can be changed while the server is running.
///
/// Without a retention horizon the limiter keeps one entry per host
/// forever. With one, hosts idle for longer than both the horizon and the
/// current window may be evicted; the horizon must be at least the largest
/// window the closure will ever return.
#[derive(Clone)]
pub struct RateLimit {
    window: Arc<dyn Fn() -> Duration + Send + Sync>,
    retention: Option<Duration>,
}

impl RateLimit {
    pub fn new<F>(window: F) -> Self
    where
        F: Fn() -> Duration + Send + Sync + 'static,
    {
        Self {
            window: Arc::new(window),
            retention: None,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn retention(&self) -> Option<Duration> {
        self.retention
    }

    pub fn fixed(window: Duration) -> Self {
        Self::new(move || window)
    }

    pub fn window(&self) -> Duration {
        (self.window)()
    }
}

impl fmt::Debug for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimit")
            .field("window", &self.window())
            .field("retention", &self.retention)
            .finish()
    }
}

/// Tracks the last admitted connection per remote host.
///
/// Keys are the host part of the peer address only; the ephemeral port
/// is ignored so reconnects from the same machine share a window.
pub struct RateLimiter {
    policy: RateLimit,
    last_admitted: DashMap<IpAddr, Instant>,
}

impl RateLimiter {
    pub fn new(policy: RateLimit) -> Self {
        Self {
            policy,
            last_admitted: DashMap::new(),
        }
    }

    /// Admit or deny a connection from `peer`.
    pub fn admit(&self, peer: SocketAddr) -> bool {
        self.admit_at(peer.ip(), Instant::now())
    }

    pub(crate) fn admit_at(&self, host: IpAddr, now: Instant) -> bool {
        let window = self.policy.window();

        // The entry guard holds the shard lock for the whole check-and-set.
        match self.last_admitted.entry(host) {
            Entry::Vacant(vacant) => {
                vacant.insert(now);
                true
            }
            Entry::Occupied(mut occupied) => {
                if now.saturating_duration_since(*occupied.get()) >= window {
                    occupied.insert(now);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Drop hosts idle for longer than the retention horizon and the
    /// current window. A no-op when the policy has no retention.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub(crate) fn sweep_at(&self, now: Instant) -> usize {
        let retention = match self.policy.retention() {
            Some(retention) => retention,
            None => return 0,
        };
        let horizon = retention.max(self.policy.window());
        let before = self.last_admitted.len();
        self.last_admitted
            .retain(|_, last| now.saturating_duration_since(*last) < horizon);
        before.saturating_sub(self.last_admitted.len())
    }

    pub fn tracked_hosts(&self) -> usize {
        self.last_admitted.len()
    }

    pub fn policy(&self) -> &RateLimit {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn host(last_octet: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last_octet])
    }

    #[test]
    fn test_first_connection_admitted() {
        let limiter = RateLimiter::new(RateLimit::fixed(Duration::from_secs(1)));
        assert!(limiter.admit_at(host(1), Instant::now()));
        assert_eq!(limiter.tracked_hosts(), 1);
    }

    #[test]
    fn test_repeat_within_window_denied() {
        let limiter = RateLimiter::new(RateLimit::fixed(Duration::from_secs(1)));
        let start = Instant::now();

        assert!(limiter.admit_at(host(1), start));
        assert!(!limiter.admit_at(host(1), start + Duration::from_millis(10)));
        assert!(!limiter.admit_at(host(1), start + Duration::from_millis(999)));
    }

    #[test]
    fn test_boundary_is_admitted() {
        let limiter = RateLimiter::new(RateLimit::fixed(Duration::from_secs(1)));
        let start = Instant::now();

        assert!(limiter.admit_at(host(1), start));
        assert!(limiter.admit_at(host(1), start + Duration::from_secs(1)));
    }

    #[test]
    fn test_denied_connections_do_not_extend_window() {
        let limiter = RateLimiter::new(RateLimit::fixed(Duration::from_millis(100)));
        let start = Instant::now();

        assert!(limiter.admit_at(host(1), start));
        for ms in [20, 40, 60, 80] {
            assert!(!limiter.admit_at(host(1), start + Duration::from_millis(ms)));
        }
        // Measured from the last admitted connection, not the last attempt.
        assert!(limiter.admit_at(host(1), start + Duration::from_millis(100)));
        assert!(!limiter.admit_at(host(1), start + Duration::from_millis(150)));
    }

    #[test]
    fn test_hosts_are_independent() {
        let limiter = RateLimiter::new(RateLimit::fixed(Duration::from_secs(10)));
        let now = Instant::now();

        assert!(limiter.admit_at(host(1), now));
        assert!(limiter.admit_at(host(2), now + Duration::from_millis(1)));
        assert!(!limiter.admit_at(host(1), now + Duration::from_millis(2)));
        assert_eq!(limiter.tracked_hosts(), 2);
    }

    #[test]
    fn test_port_is_ignored() {
        let limiter = RateLimiter::new(RateLimit::fixed(Duration::from_secs(10)));

        assert!(limiter.admit("127.0.0.1:40000".parse().unwrap()));
        assert!(!limiter.admit("127.0.0.1:40001".parse().unwrap()));
    }

    #[test]
    fn test_policy_changes_apply_immediately() {
        let window_ms = Arc::new(AtomicU64::new(1_000));
        let policy = {
            let window_ms = window_ms.clone();
            RateLimit::new(move || Duration::from_millis(window_ms.load(Ordering::SeqCst)))
        };
        let limiter = RateLimiter::new(policy);
        let start = Instant::now();

        assert!(limiter.admit_at(host(1), start));
        assert!(!limiter.admit_at(host(1), start + Duration::from_millis(200)));

        window_ms.store(100, Ordering::SeqCst);
        assert!(limiter.admit_at(host(1), start + Duration::from_millis(200)));
    }

    #[test]
    fn test_zero_window_admits_everything() {
        let limiter = RateLimiter::new(RateLimit::fixed(Duration::ZERO));
        let now = Instant::now();

        assert!(limiter.admit_at(host(1), now));
        assert!(limiter.admit_at(host(1), now));
        assert!(limiter.admit_at(host(1), now + Duration::from_nanos(1)));
    }

    #[test]
    fn test_sweep_without_retention_keeps_everything() {
        let limiter = RateLimiter::new(RateLimit::fixed(Duration::from_millis(100)));
        let start = Instant::now();

        assert!(limiter.admit_at(host(1), start));
        assert_eq!(limiter.sweep_at(start + Duration::from_secs(3600)), 0);
        assert_eq!(limiter.tracked_hosts(), 1);
    }

    #[test]
    fn test_sweep_then_window_growth_still_denies() {
        let window_ms = Arc::new(AtomicU64::new(1_000));
        let policy = {
            let window_ms = window_ms.clone();
            RateLimit::new(move || Duration::from_millis(window_ms.load(Ordering::SeqCst)))
                .with_retention(Duration::from_secs(10))
        };
        let swept = RateLimiter::new(policy.clone());
        let untouched = RateLimiter::new(policy);
        let start = Instant::now();

        assert!(swept.admit_at(host(1), start));
        assert!(untouched.admit_at(host(1), start));

        // Older than the 1s window but inside the 10s horizon.
        assert_eq!(swept.sweep_at(start + Duration::from_secs(2)), 0);

        window_ms.store(10_000, Ordering::SeqCst);
        let later = start + Duration::from_secs(3);
        assert!(!swept.admit_at(host(1), later));
        assert!(!untouched.admit_at(host(1), later));
    }

    #[test]
    fn test_sweep_horizon_follows_larger_window() {
        let limiter = RateLimiter::new(
            RateLimit::fixed(Duration::from_secs(5)).with_retention(Duration::from_secs(1)),
        );
        let start = Instant::now();

        assert!(limiter.admit_at(host(1), start));
        assert_eq!(limiter.sweep_at(start + Duration::from_secs(2)), 0);
        assert!(!limiter.admit_at(host(1), start + Duration::from_secs(2)));
    }

    #[test]
    fn test_sweep_evicts_stale_hosts() {
        let limiter = RateLimiter::new(
            RateLimit::fixed(Duration::from_millis(100)).with_retention(Duration::from_millis(100)),
        );
        let start = Instant::now();

        assert!(limiter.admit_at(host(1), start));
        assert!(limiter.admit_at(host(2), start + Duration::from_millis(80)));

        let evicted = limiter.sweep_at(start + Duration::from_millis(120));
        assert_eq!(evicted, 1);
        assert_eq!(limiter.tracked_hosts(), 1);

        // host 2 is still inside its window
        assert!(!limiter.admit_at(host(2), start + Duration::from_millis(120)));
        assert!(limiter.admit_at(host(1), start + Duration::from_millis(120)));
    }

    proptest! {
        #[test]
        fn prop_admit_matches_window_rule(
            window_ms in 1u64..500,
            gaps in proptest::collection::vec(0u64..600, 1..40),
        ) {
            let limiter = RateLimiter::new(RateLimit::fixed(Duration::from_millis(window_ms)));
            let start = Instant::now();
            let mut now = start;
            let mut last_admitted: Option<Instant> = None;

            for gap in gaps {
                now += Duration::from_millis(gap);
                let expected = match last_admitted {
                    None => true,
                    Some(last) => now.duration_since(last) >= Duration::from_millis(window_ms),
                };
                let admitted = limiter.admit_at(host(7), now);
                prop_assert_eq!(admitted, expected);
                if admitted {
                    last_admitted = Some(now);
                }
            }
        }
    }
}
