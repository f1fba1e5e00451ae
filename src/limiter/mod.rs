//! Process-local fixed-window rate limiting
//!
//! Buckets are keyed by (identity, source address). Check-and-increment on a
//! bucket happens under its `DashMap` entry lock. A background sweep drops
//! buckets whose window has passed, so memory tracks only clients seen within
//! the last window. `max_entries` is a soft bound enforced on insert.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::RateSpec;

/// Identity of one rate-limit bucket
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub identity: String,
    /// `None` shares one bucket across every address
    pub address: Option<String>,
}

impl BucketKey {
    pub fn per_address(identity: &str, address: &str) -> Self {
        Self {
            identity: identity.to_string(),
            address: Some(address.to_string()),
        }
    }

    pub fn shared(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            address: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: u32,
    reset_at: DateTime<Utc>,
}

/// Window state after a check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub current_count: u32,
    pub limit: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitStatus {
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.current_count)
    }

    /// Whole seconds until the window resets, rounded up
    pub fn reset_in_secs(&self, now: DateTime<Utc>) -> u64 {
        let millis = (self.reset_at - now).num_milliseconds().max(0) as u64;
        millis.div_ceil(1000)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateCheck {
    Unlimited,
    Allowed(RateLimitStatus),
    Limited(RateLimitStatus),
}

impl RateCheck {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, RateCheck::Limited(_))
    }

    pub fn status(&self) -> Option<&RateLimitStatus> {
        match self {
            RateCheck::Unlimited => None,
            RateCheck::Allowed(status) | RateCheck::Limited(status) => Some(status),
        }
    }
}

/// Shared fixed-window counters; clones share the same buckets
#[derive(Clone)]
pub struct RateLimiterCache {
    inner: Arc<Inner>,
}

struct Inner {
    buckets: DashMap<BucketKey, Bucket>,
    default_spec: RateSpec,
    max_entries: usize,
}

impl RateLimiterCache {
    pub fn new(default_spec: RateSpec, max_entries: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                buckets: DashMap::new(),
                default_spec,
                max_entries: max_entries.max(1),
            }),
        }
    }

    pub fn default_spec(&self) -> RateSpec {
        self.inner.default_spec
    }

    /// Sweep period: the default window length
    pub fn sweep_interval(&self) -> Duration {
        match self.inner.default_spec {
            RateSpec::PerWindow { window, .. } => window,
            RateSpec::Unlimited => Duration::from_secs(60),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.buckets.is_empty()
    }

    /// Check and count one request against the default allowance
    pub fn check(&self, key: BucketKey, now: DateTime<Utc>) -> RateCheck {
        self.check_with(key, self.inner.default_spec, now)
    }

    /// Check and count one request against `spec`
    pub fn check_with(&self, key: BucketKey, spec: RateSpec, now: DateTime<Utc>) -> RateCheck {
        let (max_requests, window) = match spec {
            RateSpec::Unlimited => return RateCheck::Unlimited,
            RateSpec::PerWindow { max_requests, window } => (max_requests, window),
        };
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::seconds(60));

        if self.inner.buckets.len() >= self.inner.max_entries && !self.inner.buckets.contains_key(&key) {
            self.make_room(now);
        }

        let mut bucket = self.inner.buckets.entry(key).or_insert_with(|| Bucket {
            count: 0,
            reset_at: now + window,
        });

        if now > bucket.reset_at {
            bucket.count = 0;
            bucket.reset_at = now + window;
        }

        if bucket.count >= max_requests {
            return RateCheck::Limited(RateLimitStatus {
                current_count: bucket.count,
                limit: max_requests,
                reset_at: bucket.reset_at,
            });
        }

        bucket.count += 1;
        RateCheck::Allowed(RateLimitStatus {
            current_count: bucket.count,
            limit: max_requests,
            reset_at: bucket.reset_at,
        })
    }

    /// Remove buckets whose window has already passed
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.inner.buckets.len();
        self.inner.buckets.retain(|_, bucket| bucket.reset_at >= now);
        before.saturating_sub(self.inner.buckets.len())
    }

    fn make_room(&self, now: DateTime<Utc>) {
        if self.sweep(now) > 0 && self.inner.buckets.len() < self.inner.max_entries {
            return;
        }

        let oldest = self
            .inner
            .buckets
            .iter()
            .min_by_key(|entry| entry.value().reset_at)
            .map(|entry| entry.key().clone());

        if let Some(key) = oldest {
            self.inner.buckets.remove(&key);
            warn!(
                max_entries = self.inner.max_entries,
                "Rate limiter at capacity, evicted oldest bucket"
            );
        }
    }

    /// Run `sweep` every window length until the runtime shuts down
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let limiter = self.clone();
        let period = self.sweep_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // First tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let removed = limiter.sweep(Utc::now());
                if removed > 0 {
                    debug!(removed, tracked = limiter.len(), "Swept expired rate limit buckets");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 9, 0, 0).unwrap()
    }

    fn per_minute(max: u32) -> RateLimiterCache {
        RateLimiterCache::new(RateSpec::per_window(max, Duration::from_secs(60)), 1_000)
    }

    #[test]
    fn test_sixty_first_request_is_limited() {
        let limiter = per_minute(60);
        let key = BucketKey::per_address("kg_a", "1.2.3.4");
        let now = start();

        for i in 0..60 {
            let check = limiter.check(key.clone(), now + chrono::Duration::milliseconds(i * 100));
            assert!(check.is_allowed(), "request {} was limited", i + 1);
        }

        let later = now + chrono::Duration::seconds(10);
        match limiter.check(key, later) {
            RateCheck::Limited(status) => {
                assert_eq!(status.limit, 60);
                let reset_in = status.reset_in_secs(later);
                assert!(reset_in <= 60 && reset_in >= 49, "reset_in = {}", reset_in);
            }
            other => panic!("expected limit, got {:?}", other),
        }
    }

    #[test]
    fn test_buckets_are_per_address() {
        let limiter = per_minute(1);
        assert!(limiter.check(BucketKey::per_address("kg_a", "1.1.1.1"), start()).is_allowed());
        assert!(!limiter.check(BucketKey::per_address("kg_a", "1.1.1.1"), start()).is_allowed());
        assert!(limiter.check(BucketKey::per_address("kg_a", "2.2.2.2"), start()).is_allowed());
        assert!(limiter.check(BucketKey::per_address("kg_b", "1.1.1.1"), start()).is_allowed());
    }

    #[test]
    fn test_window_resets_after_expiry() {
        let limiter = per_minute(2);
        let key = BucketKey::per_address("kg_a", "1.1.1.1");
        limiter.check(key.clone(), start());
        limiter.check(key.clone(), start());
        assert!(!limiter.check(key.clone(), start()).is_allowed());

        let after = start() + chrono::Duration::seconds(61);
        match limiter.check(key, after) {
            RateCheck::Allowed(status) => {
                assert_eq!(status.current_count, 1);
                assert_eq!(status.remaining(), 1);
            }
            other => panic!("expected allow, got {:?}", other),
        }
    }

    #[test]
    fn test_unlimited_always_passes() {
        let limiter = per_minute(1);
        for _ in 0..1_000 {
            let check = limiter.check_with(BucketKey::shared("legacy"), RateSpec::Unlimited, start());
            assert_eq!(check, RateCheck::Unlimited);
        }
        assert!(limiter.is_empty());
    }

    #[test]
    fn test_sweep_removes_expired_only() {
        let limiter = per_minute(5);
        limiter.check(BucketKey::per_address("kg_a", "1.1.1.1"), start());
        limiter.check(
            BucketKey::per_address("kg_b", "1.1.1.1"),
            start() + chrono::Duration::seconds(45),
        );

        let removed = limiter.sweep(start() + chrono::Duration::seconds(70));
        assert_eq!(removed, 1);
        assert_eq!(limiter.len(), 1);
    }

    #[test]
    fn test_capacity_evicts_oldest_bucket() {
        let limiter = RateLimiterCache::new(RateSpec::per_window(5, Duration::from_secs(60)), 2);
        limiter.check(BucketKey::per_address("kg_a", "1.1.1.1"), start());
        limiter.check(
            BucketKey::per_address("kg_a", "2.2.2.2"),
            start() + chrono::Duration::seconds(1),
        );
        limiter.check(
            BucketKey::per_address("kg_a", "3.3.3.3"),
            start() + chrono::Duration::seconds(2),
        );
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn test_concurrent_checks_never_overshoot() {
        let limiter = per_minute(60);
        let now = start();
        let allowed: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let limiter = limiter.clone();
                    scope.spawn(move || {
                        (0..20)
                            .filter(|_| {
                                limiter
                                    .check(BucketKey::per_address("kg_a", "1.1.1.1"), now)
                                    .is_allowed()
                            })
                            .count()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(allowed, 60);
    }
}
