//! API key records, per-address reputation and usage accounting
//!
//! `ApiKeyRecord` is the persisted shape of one issued key. The mutation
//! methods here are the single source of truth for quota arithmetic: the
//! in-memory store runs them under the key's entry lock and the PostgreSQL
//! store mirrors them in one conditional `UPDATE`.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;
use uuid::Uuid;

/// Number of distinct endpoints remembered per address
pub const ENDPOINT_HISTORY_CAPACITY: usize = 10;

/// Accepted range for `daily_limit`
pub const MIN_DAILY_LIMIT: u32 = 1;
pub const MAX_DAILY_LIMIT: u32 = 100_000;

pub const DEFAULT_KEY_NAME: &str = "Default API Key";

/// Random bytes behind every generated token (hex encoded, 64 chars)
const TOKEN_ENTROPY_BYTES: usize = 32;

/// Lifecycle status of an API key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Revoked,
    Suspended,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Revoked => "revoked",
            KeyStatus::Suspended => "suspended",
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(KeyStatus::Active),
            "revoked" => Ok(KeyStatus::Revoked),
            "suspended" => Ok(KeyStatus::Suspended),
            other => Err(format!("unknown key status '{}'", other)),
        }
    }
}

/// Bounded FIFO of recently seen endpoints.
///
/// An endpoint already present is not pushed again. When full, the oldest
/// entry is evicted before the new one is appended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointHistory(VecDeque<String>);

impl EndpointHistory {
    pub fn new() -> Self {
        Self(VecDeque::with_capacity(ENDPOINT_HISTORY_CAPACITY))
    }

    /// Rebuild from persisted order (oldest first), keeping only the newest entries
    pub fn from_persisted(endpoints: Vec<String>) -> Self {
        let mut history = Self::new();
        for endpoint in endpoints {
            history.push(&endpoint);
        }
        history
    }

    pub fn push(&mut self, endpoint: &str) {
        if self.0.iter().any(|e| e == endpoint) {
            return;
        }
        if self.0.len() >= ENDPOINT_HISTORY_CAPACITY {
            self.0.pop_front();
        }
        self.0.push_back(endpoint.to_string());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

/// Reputation entry for one source address on one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpRecord {
    pub address: String,
    pub endpoints: EndpointHistory,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub banned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ban_reason: Option<String>,
}

impl IpRecord {
    pub fn new(address: &str, now: DateTime<Utc>) -> Self {
        Self {
            address: address.to_string(),
            endpoints: EndpointHistory::new(),
            first_seen: now,
            last_seen: now,
            banned: false,
            ban_reason: None,
        }
    }

    /// Refresh `last_seen` and remember the endpoint
    pub fn observe(&mut self, endpoint: &str, now: DateTime<Utc>) {
        self.last_seen = now;
        self.endpoints.push(endpoint);
    }
}

/// Counter values captured at the moment a request was admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct UsageSnapshot {
    pub usage_today: u32,
    pub daily_limit: u32,
    pub total_usage: u64,
}

impl UsageSnapshot {
    pub fn remaining(&self) -> u32 {
        self.daily_limit.saturating_sub(self.usage_today)
    }
}

/// Result of an attempt to count one request against a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageOutcome {
    /// Counters were incremented
    Recorded(UsageSnapshot),
    /// Today's allowance is already consumed; nothing was counted
    QuotaExhausted(UsageSnapshot),
    /// Key is no longer active; nothing was counted
    Inactive(KeyStatus),
    NotFound,
}

/// Owning principal of one or more keys
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Owner {
    pub id: Uuid,
    pub username: String,
    pub total_api_calls: u64,
    pub created_at: DateTime<Utc>,
}

impl Owner {
    pub fn new(username: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.to_string(),
            total_api_calls: 0,
            created_at: now,
        }
    }
}

/// Administrative edit of a key; `None` fields are left untouched
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, ToSchema)]
pub struct KeyUpdate {
    pub name: Option<String>,
    pub daily_limit: Option<u32>,
    pub status: Option<KeyStatus>,
}

impl KeyUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.daily_limit.is_none() && self.status.is_none()
    }
}

/// Persisted record of one issued API key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub token: String,
    pub owner_id: Uuid,
    pub name: String,
    pub daily_limit: u32,
    pub usage_today: u32,
    pub total_usage: u64,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub ips: BTreeMap<String, IpRecord>,
}

impl ApiKeyRecord {
    pub fn new(
        token: String,
        owner_id: Uuid,
        name: &str,
        daily_limit: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            token,
            owner_id,
            name: name.to_string(),
            daily_limit,
            usage_today: 0,
            total_usage: 0,
            status: KeyStatus::Active,
            created_at: now,
            last_used_at: now,
            expires_at: None,
            ips: BTreeMap::new(),
        }
    }

    /// Short, loggable form of the token
    pub fn token_prefix(&self) -> &str {
        token_prefix(&self.token)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// `usage_today` as it would read after lazy day rollover at `now`
    pub fn usage_today_at(&self, now: DateTime<Utc>) -> u32 {
        if self.last_used_at.date_naive() != now.date_naive() {
            0
        } else {
            self.usage_today
        }
    }

    pub fn is_banned(&self, address: &str) -> bool {
        self.ips.get(address).map(|r| r.banned).unwrap_or(false)
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> UsageSnapshot {
        UsageSnapshot {
            usage_today: self.usage_today_at(now),
            daily_limit: self.daily_limit,
            total_usage: self.total_usage,
        }
    }

    /// Count one request: lazy rollover, quota check, increment, address upsert.
    ///
    /// Must run as one indivisible step per key.
    pub fn record_usage(&mut self, address: &str, endpoint: &str, now: DateTime<Utc>) -> UsageOutcome {
        if self.status != KeyStatus::Active {
            return UsageOutcome::Inactive(self.status);
        }

        let current = self.usage_today_at(now);
        if current >= self.daily_limit {
            return UsageOutcome::QuotaExhausted(self.snapshot_at(now));
        }

        self.usage_today = current + 1;
        self.total_usage += 1;
        self.last_used_at = now;

        self.ips
            .entry(address.to_string())
            .or_insert_with(|| IpRecord::new(address, now))
            .observe(endpoint, now);

        UsageOutcome::Recorded(UsageSnapshot {
            usage_today: self.usage_today,
            daily_limit: self.daily_limit,
            total_usage: self.total_usage,
        })
    }

    /// Set or clear the ban flag for an address.
    ///
    /// Banning an unseen address creates its record; unbanning an unseen
    /// address is a no-op and returns `None`.
    pub fn set_ban(
        &mut self,
        address: &str,
        banned: bool,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<IpRecord> {
        if !banned && !self.ips.contains_key(address) {
            return None;
        }

        let record = self
            .ips
            .entry(address.to_string())
            .or_insert_with(|| IpRecord::new(address, now));
        record.banned = banned;
        record.ban_reason = if banned { reason.map(str::to_string) } else { None };
        record.last_seen = now;
        Some(record.clone())
    }

    pub fn apply_update(&mut self, update: &KeyUpdate) {
        if let Some(name) = &update.name {
            self.name = name.clone();
        }
        if let Some(limit) = update.daily_limit {
            self.daily_limit = limit;
        }
        if let Some(status) = update.status {
            self.status = status;
        }
    }
}

/// First 12 characters of a token, safe to log
pub fn token_prefix(token: &str) -> &str {
    match token.char_indices().nth(12) {
        Some((idx, _)) => &token[..idx],
        None => token,
    }
}

/// Generate a new token: `<prefix><64 hex chars>`
pub fn generate_token(prefix: &str) -> String {
    let mut bytes = [0u8; TOKEN_ENTROPY_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("{}{}", prefix, hex::encode(bytes))
}

pub fn validate_daily_limit(limit: u32) -> Result<u32, String> {
    if (MIN_DAILY_LIMIT..=MAX_DAILY_LIMIT).contains(&limit) {
        Ok(limit)
    } else {
        Err(format!(
            "daily_limit must be between {} and {}",
            MIN_DAILY_LIMIT, MAX_DAILY_LIMIT
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).unwrap()
    }

    fn record(limit: u32) -> ApiKeyRecord {
        ApiKeyRecord::new("kg_test".to_string(), Uuid::new_v4(), "test", limit, at(1, 8))
    }

    #[test]
    fn test_endpoint_history_keeps_latest_ten() {
        let mut history = EndpointHistory::new();
        for i in 0..15 {
            history.push(&format!("/v1/endpoint/{}", i));
        }

        assert_eq!(history.len(), ENDPOINT_HISTORY_CAPACITY);
        let kept = history.to_vec();
        assert_eq!(kept.first().map(String::as_str), Some("/v1/endpoint/5"));
        assert_eq!(kept.last().map(String::as_str), Some("/v1/endpoint/14"));
    }

    #[test]
    fn test_endpoint_history_ignores_repeats() {
        let mut history = EndpointHistory::new();
        history.push("/v1/a");
        history.push("/v1/b");
        history.push("/v1/a");
        assert_eq!(history.to_vec(), vec!["/v1/a".to_string(), "/v1/b".to_string()]);
    }

    #[test]
    fn test_record_usage_stops_at_limit() {
        let mut key = record(3);
        let now = at(1, 9);
        for expected in 1..=3 {
            match key.record_usage("1.2.3.4", "/v1/x", now) {
                UsageOutcome::Recorded(snap) => assert_eq!(snap.usage_today, expected),
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        assert!(matches!(
            key.record_usage("1.2.3.4", "/v1/x", now),
            UsageOutcome::QuotaExhausted(_)
        ));
        assert_eq!(key.usage_today, 3);
        assert_eq!(key.total_usage, 3);
    }

    #[test]
    fn test_lazy_rollover_on_new_day() {
        let mut key = record(2);
        key.record_usage("1.2.3.4", "/v1/x", at(1, 9));
        key.record_usage("1.2.3.4", "/v1/x", at(1, 10));
        assert_eq!(key.usage_today_at(at(1, 11)), 2);
        assert_eq!(key.usage_today_at(at(2, 0)), 0);

        match key.record_usage("1.2.3.4", "/v1/x", at(2, 1)) {
            UsageOutcome::Recorded(snap) => {
                assert_eq!(snap.usage_today, 1);
                assert_eq!(snap.total_usage, 3);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_inactive_key_is_not_counted() {
        let mut key = record(10);
        key.status = KeyStatus::Suspended;
        assert_eq!(
            key.record_usage("1.2.3.4", "/v1/x", at(1, 9)),
            UsageOutcome::Inactive(KeyStatus::Suspended)
        );
        assert_eq!(key.total_usage, 0);
        assert!(key.ips.is_empty());
    }

    #[test]
    fn test_ban_creates_record_and_unban_unknown_is_noop() {
        let mut key = record(10);
        let banned = key.set_ban("5.6.7.8", true, Some("abuse"), at(1, 9)).unwrap();
        assert!(banned.banned);
        assert_eq!(banned.ban_reason.as_deref(), Some("abuse"));
        assert!(key.is_banned("5.6.7.8"));

        assert!(key.set_ban("9.9.9.9", false, None, at(1, 9)).is_none());
        assert!(!key.ips.contains_key("9.9.9.9"));

        let unbanned = key.set_ban("5.6.7.8", false, None, at(1, 10)).unwrap();
        assert!(!unbanned.banned);
        assert!(unbanned.ban_reason.is_none());
    }

    #[test]
    fn test_expiry_and_token_format() {
        let mut key = record(10);
        assert!(!key.is_expired(at(1, 9)));
        key.expires_at = Some(at(1, 8) + Duration::minutes(30));
        assert!(key.is_expired(at(1, 9)));

        let token = generate_token("kg_");
        assert!(token.starts_with("kg_"));
        assert_eq!(token.len(), 3 + TOKEN_ENTROPY_BYTES * 2);
        assert_eq!(token_prefix(&token).len(), 12);
        assert_ne!(token, generate_token("kg_"));
    }

    #[test]
    fn test_daily_limit_bounds() {
        assert!(validate_daily_limit(0).is_err());
        assert!(validate_daily_limit(1).is_ok());
        assert!(validate_daily_limit(100_000).is_ok());
        assert!(validate_daily_limit(100_001).is_err());
    }
}
