//! Per-request allow/deny decision
//!
//! Checks run in a fixed order and the first failure wins:
//! missing key, unknown key (legacy fallback), inactive key, banned address,
//! daily quota, short-window rate limit. Only a request that clears every
//! check is counted, and counting re-validates quota atomically in the store.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::denial::Denial;
use super::legacy::LegacyKeys;
use crate::config::QuotaResetHint;
use crate::db::KeyStore;
use crate::domain::api_key::token_prefix;
use crate::domain::{ApiKeyRecord, KeyStatus, UsageOutcome, UsageSnapshot};
use crate::limiter::{BucketKey, RateCheck, RateLimiterCache};

/// Attached to the request after a successful authorization
#[derive(Debug, Clone)]
pub enum AuthContext {
    /// Key found in the store and counted
    Managed {
        owner_id: Uuid,
        key: ApiKeyRecord,
        usage: UsageSnapshot,
        rate: RateCheck,
    },
    /// Key accepted from static configuration
    Legacy { token: String, rate: RateCheck },
}

impl AuthContext {
    pub fn token(&self) -> &str {
        match self {
            AuthContext::Managed { key, .. } => &key.token,
            AuthContext::Legacy { token, .. } => token,
        }
    }

    pub fn owner_id(&self) -> Option<Uuid> {
        match self {
            AuthContext::Managed { owner_id, .. } => Some(*owner_id),
            AuthContext::Legacy { .. } => None,
        }
    }

    pub fn key(&self) -> Option<&ApiKeyRecord> {
        match self {
            AuthContext::Managed { key, .. } => Some(key),
            AuthContext::Legacy { .. } => None,
        }
    }

    pub fn usage(&self) -> Option<UsageSnapshot> {
        match self {
            AuthContext::Managed { usage, .. } => Some(*usage),
            AuthContext::Legacy { .. } => None,
        }
    }

    pub fn rate(&self) -> &RateCheck {
        match self {
            AuthContext::Managed { rate, .. } | AuthContext::Legacy { rate, .. } => rate,
        }
    }
}

/// Decides whether a request may proceed and records usage when it may
pub struct RequestAuthorizer {
    store: Arc<dyn KeyStore>,
    limiter: RateLimiterCache,
    legacy: LegacyKeys,
    reset_hint: QuotaResetHint,
}

impl RequestAuthorizer {
    pub fn new(
        store: Arc<dyn KeyStore>,
        limiter: RateLimiterCache,
        legacy: LegacyKeys,
        reset_hint: QuotaResetHint,
    ) -> Self {
        Self {
            store,
            limiter,
            legacy,
            reset_hint,
        }
    }

    pub fn limiter(&self) -> &RateLimiterCache {
        &self.limiter
    }

    pub async fn authorize(
        &self,
        key: Option<&str>,
        address: &str,
        endpoint: &str,
    ) -> Result<AuthContext, Denial> {
        self.authorize_at(key, address, endpoint, Utc::now()).await
    }

    pub async fn authorize_at(
        &self,
        key: Option<&str>,
        address: &str,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> Result<AuthContext, Denial> {
        let result = self.evaluate(key, address, endpoint, now).await;

        if let Err(denial) = &result {
            warn!(
                key_prefix = key.map(token_prefix).unwrap_or(""),
                address = %address,
                endpoint = %endpoint,
                reason = %denial.kind,
                "Request denied"
            );
        }

        result
    }

    async fn evaluate(
        &self,
        key: Option<&str>,
        address: &str,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> Result<AuthContext, Denial> {
        let token = match key.map(str::trim) {
            Some(token) if !token.is_empty() => token,
            _ => return Err(Denial::missing_key()),
        };

        let record = match self.store.get_key(token).await {
            Ok(Some(record)) => record,
            Ok(None) => return self.authorize_legacy(token, now),
            Err(e) => {
                error!(key_prefix = token_prefix(token), error = %e, "Key lookup failed");
                return Err(Denial::storage_failure());
            }
        };

        if record.status != KeyStatus::Active {
            return Err(Denial::inactive_key(record.status.as_str()));
        }
        if record.is_expired(now) {
            return Err(Denial::inactive_key("expired"));
        }

        if record.is_banned(address) {
            return Err(Denial::banned_ip(address));
        }

        if record.usage_today_at(now) >= record.daily_limit {
            return Err(Denial::quota_exceeded(record.daily_limit, self.quota_reset_time(now)));
        }

        let rate = self
            .limiter
            .check(BucketKey::per_address(token, address), now);
        if let RateCheck::Limited(status) = rate {
            return Err(Denial::rate_limited(status, now));
        }

        match self.store.record_usage(token, address, endpoint, now).await {
            Ok(UsageOutcome::Recorded(usage)) => {
                debug!(
                    key_prefix = record.token_prefix(),
                    usage_today = usage.usage_today,
                    daily_limit = usage.daily_limit,
                    "Request authorized"
                );
                let mut key = record;
                key.usage_today = usage.usage_today;
                key.total_usage = usage.total_usage;
                key.last_used_at = now;
                Ok(AuthContext::Managed {
                    owner_id: key.owner_id,
                    key,
                    usage,
                    rate,
                })
            }
            // Another request consumed the last unit between lookup and increment
            Ok(UsageOutcome::QuotaExhausted(usage)) => Err(Denial::quota_exceeded(
                usage.daily_limit,
                self.quota_reset_time(now),
            )),
            Ok(UsageOutcome::Inactive(status)) => Err(Denial::inactive_key(status.as_str())),
            Ok(UsageOutcome::NotFound) => Err(Denial::invalid_key()),
            Err(e) => {
                error!(key_prefix = record.token_prefix(), error = %e, "Recording usage failed");
                Err(Denial::storage_failure())
            }
        }
    }

    fn authorize_legacy(&self, token: &str, now: DateTime<Utc>) -> Result<AuthContext, Denial> {
        let spec = self.legacy.lookup(token).ok_or_else(Denial::invalid_key)?;

        match self.limiter.check_with(BucketKey::shared(token), spec, now) {
            RateCheck::Limited(status) => Err(Denial {
                reset_in: Some(status.reset_in_secs(now)),
                rate_limit: Some(status),
                ..Denial::invalid_key().with_detail("legacy_rate_limited")
            }),
            rate => Ok(AuthContext::Legacy {
                token: token.to_string(),
                rate,
            }),
        }
    }

    fn quota_reset_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.reset_hint {
            QuotaResetHint::Rolling24h => now + Duration::hours(24),
            QuotaResetHint::NextMidnight => now
                .date_naive()
                .succ_opt()
                .and_then(|day| day.and_hms_opt(0, 0, 0))
                .map(|midnight| midnight.and_utc())
                .unwrap_or_else(|| now + Duration::hours(24)),
        }
    }
}
