//! Storage contracts for key records and usage telemetry
//!
//! Every mutating method is a single atomic operation at the storage
//! boundary. Callers never load a record, change it and write it back.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    ApiKeyRecord, IpRecord, KeyUpdate, Owner, RequestLogEntry, RollupDelta, RollupKey,
    UsageOutcome, UsageRollup,
};

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::CreatePoolError),
    #[error("Query error: {0}")]
    Query(#[from] tokio_postgres::Error),
    #[error("Pool get error: {0}")]
    PoolGet(#[from] deadpool_postgres::PoolError),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid stored value: {0}")]
    Invalid(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persisted API keys, their owners and per-address reputation
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Insert a new owner; fails with `Conflict` on a duplicate username
    async fn insert_owner(&self, owner: Owner) -> StoreResult<Owner>;

    async fn get_owner(&self, id: Uuid) -> StoreResult<Option<Owner>>;

    async fn list_owners(&self) -> StoreResult<Vec<Owner>>;

    /// Insert a new key; fails with `Conflict` if the token already exists
    async fn insert_key(&self, record: ApiKeyRecord) -> StoreResult<ApiKeyRecord>;

    /// Exact-match lookup by token
    async fn get_key(&self, token: &str) -> StoreResult<Option<ApiKeyRecord>>;

    async fn list_keys_by_owner(&self, owner_id: Uuid) -> StoreResult<Vec<ApiKeyRecord>>;

    async fn count_keys(&self) -> StoreResult<u64>;

    /// Lazy rollover, quota check, counter increment and address upsert as one step.
    /// Also bumps the owner's aggregate call count when the request is counted.
    async fn record_usage(
        &self,
        token: &str,
        address: &str,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<UsageOutcome>;

    /// Upsert the ban flag for an address. `NotFound` if the key does not exist.
    async fn set_ip_ban(
        &self,
        token: &str,
        address: &str,
        banned: bool,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<IpRecord>>;

    async fn update_key(&self, token: &str, update: &KeyUpdate) -> StoreResult<Option<ApiKeyRecord>>;

    async fn delete_key(&self, token: &str) -> StoreResult<bool>;

    /// Zero `usage_today` wherever it is nonzero; returns keys touched
    async fn reset_daily_usage(&self) -> StoreResult<u64>;

    /// Revoke every non-revoked key whose expiry has passed; returns keys touched
    async fn revoke_expired(&self, now: DateTime<Utc>) -> StoreResult<u64>;

    /// Set each owner's call count to the sum of its keys' `total_usage`; returns owners corrected
    async fn reconcile_owner_totals(&self) -> StoreResult<u64>;
}

/// Rollup counters and the short-retention request audit log
#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Upsert the rollup row and add the delta in one step
    async fn increment_rollup(
        &self,
        key: &RollupKey,
        delta: &RollupDelta,
        now: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn insert_log(&self, entry: RequestLogEntry) -> StoreResult<()>;

    /// Most recent unexpired entries, newest first, optionally for one key
    async fn recent_logs(
        &self,
        token: Option<&str>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<RequestLogEntry>>;

    async fn rollups_for_date(&self, date: NaiveDate) -> StoreResult<Vec<UsageRollup>>;

    /// Drop audit entries past their retention; returns entries removed
    async fn purge_expired_logs(&self, now: DateTime<Utc>) -> StoreResult<u64>;
}
