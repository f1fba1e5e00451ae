//! In-memory stores used when no database is configured, and by tests
//!
//! Atomicity comes from `DashMap` entry locks: each per-key or per-rollup
//! mutation runs while holding that entry's shard lock.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use super::store::{KeyStore, StoreError, StoreResult, UsageStore};
use crate::domain::api_key::token_prefix;
use crate::domain::{
    ApiKeyRecord, IpRecord, KeyStatus, KeyUpdate, Owner, RequestLogEntry, RollupDelta,
    RollupKey, UsageOutcome, UsageRollup,
};

/// Upper bound on retained audit entries
const DEFAULT_MAX_LOGS: usize = 100_000;

#[derive(Default)]
pub struct MemoryKeyStore {
    owners: DashMap<Uuid, Owner>,
    usernames: DashMap<String, Uuid>,
    keys: DashMap<String, ApiKeyRecord>,
    unavailable: AtomicBool,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail as if the backend were down
    #[cfg(test)]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Config("in-memory store marked unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn insert_owner(&self, owner: Owner) -> StoreResult<Owner> {
        self.check_available()?;
        match self.usernames.entry(owner.username.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "owner '{}' already exists",
                owner.username
            ))),
            Entry::Vacant(slot) => {
                slot.insert(owner.id);
                self.owners.insert(owner.id, owner.clone());
                Ok(owner)
            }
        }
    }

    async fn get_owner(&self, id: Uuid) -> StoreResult<Option<Owner>> {
        self.check_available()?;
        Ok(self.owners.get(&id).map(|o| o.clone()))
    }

    async fn list_owners(&self) -> StoreResult<Vec<Owner>> {
        self.check_available()?;
        let mut owners: Vec<Owner> = self.owners.iter().map(|o| o.clone()).collect();
        owners.sort_by_key(|o| o.created_at);
        Ok(owners)
    }

    async fn insert_key(&self, record: ApiKeyRecord) -> StoreResult<ApiKeyRecord> {
        self.check_available()?;
        match self.keys.entry(record.token.clone()) {
            Entry::Occupied(_) => Err(StoreError::Conflict(
                "api key token already exists".to_string(),
            )),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    async fn get_key(&self, token: &str) -> StoreResult<Option<ApiKeyRecord>> {
        self.check_available()?;
        Ok(self.keys.get(token).map(|k| k.clone()))
    }

    async fn list_keys_by_owner(&self, owner_id: Uuid) -> StoreResult<Vec<ApiKeyRecord>> {
        self.check_available()?;
        let mut keys: Vec<ApiKeyRecord> = self
            .keys
            .iter()
            .filter(|k| k.owner_id == owner_id)
            .map(|k| k.clone())
            .collect();
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(keys)
    }

    async fn count_keys(&self) -> StoreResult<u64> {
        self.check_available()?;
        Ok(self.keys.len() as u64)
    }

    async fn record_usage(
        &self,
        token: &str,
        address: &str,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<UsageOutcome> {
        self.check_available()?;

        let (outcome, owner_id) = match self.keys.get_mut(token) {
            Some(mut key) => {
                let outcome = key.record_usage(address, endpoint, now);
                (outcome, key.owner_id)
            }
            None => return Ok(UsageOutcome::NotFound),
        };

        if matches!(outcome, UsageOutcome::Recorded(_)) {
            if let Some(mut owner) = self.owners.get_mut(&owner_id) {
                owner.total_api_calls += 1;
            }
        }

        Ok(outcome)
    }

    async fn set_ip_ban(
        &self,
        token: &str,
        address: &str,
        banned: bool,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<IpRecord>> {
        self.check_available()?;
        let mut key = self
            .keys
            .get_mut(token)
            .ok_or_else(|| StoreError::NotFound(format!("api key {}", token_prefix(token))))?;
        Ok(key.set_ban(address, banned, reason, now))
    }

    async fn update_key(&self, token: &str, update: &KeyUpdate) -> StoreResult<Option<ApiKeyRecord>> {
        self.check_available()?;
        Ok(self.keys.get_mut(token).map(|mut key| {
            key.apply_update(update);
            key.clone()
        }))
    }

    async fn delete_key(&self, token: &str) -> StoreResult<bool> {
        self.check_available()?;
        Ok(self.keys.remove(token).is_some())
    }

    async fn reset_daily_usage(&self) -> StoreResult<u64> {
        self.check_available()?;
        let mut touched = 0;
        for mut key in self.keys.iter_mut() {
            if key.usage_today > 0 {
                key.usage_today = 0;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn revoke_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        self.check_available()?;
        let mut touched = 0;
        for mut key in self.keys.iter_mut() {
            if key.is_expired(now) && key.status != KeyStatus::Revoked {
                key.status = KeyStatus::Revoked;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn reconcile_owner_totals(&self) -> StoreResult<u64> {
        self.check_available()?;

        let mut totals: HashMap<Uuid, u64> = HashMap::new();
        for key in self.keys.iter() {
            *totals.entry(key.owner_id).or_default() += key.total_usage;
        }

        let mut corrected = 0;
        for mut owner in self.owners.iter_mut() {
            let expected = totals.get(&owner.id).copied().unwrap_or(0);
            if owner.total_api_calls != expected {
                owner.total_api_calls = expected;
                corrected += 1;
            }
        }
        Ok(corrected)
    }
}

pub struct MemoryUsageStore {
    rollups: DashMap<RollupKey, UsageRollup>,
    logs: Mutex<VecDeque<RequestLogEntry>>,
    max_logs: usize,
    unavailable: AtomicBool,
}

impl MemoryUsageStore {
    pub fn new(max_logs: usize) -> Self {
        Self {
            rollups: DashMap::new(),
            logs: Mutex::new(VecDeque::new()),
            max_logs,
            unavailable: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Config("in-memory store marked unavailable".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryUsageStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LOGS)
    }
}

#[async_trait]
impl UsageStore for MemoryUsageStore {
    async fn increment_rollup(
        &self,
        key: &RollupKey,
        delta: &RollupDelta,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        self.check_available()?;
        self.rollups
            .entry(key.clone())
            .or_insert_with(|| UsageRollup::empty(key, now))
            .apply(delta, now);
        Ok(())
    }

    async fn insert_log(&self, entry: RequestLogEntry) -> StoreResult<()> {
        self.check_available()?;
        let now = entry.created_at;
        let mut logs = self.logs.lock();
        logs.retain(|e| !e.is_expired(now));
        logs.push_back(entry);
        while logs.len() > self.max_logs {
            logs.pop_front();
        }
        Ok(())
    }

    async fn recent_logs(
        &self,
        token: Option<&str>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<RequestLogEntry>> {
        self.check_available()?;
        let logs = self.logs.lock();
        Ok(logs
            .iter()
            .rev()
            .filter(|e| !e.is_expired(now))
            .filter(|e| token.map_or(true, |t| e.key.as_deref() == Some(t)))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn rollups_for_date(&self, date: NaiveDate) -> StoreResult<Vec<UsageRollup>> {
        self.check_available()?;
        let mut rollups: Vec<UsageRollup> = self
            .rollups
            .iter()
            .filter(|r| r.date == date)
            .map(|r| r.clone())
            .collect();
        rollups.sort_by(|a, b| {
            b.total_requests
                .cmp(&a.total_requests)
                .then_with(|| a.endpoint.cmp(&b.endpoint))
        });
        Ok(rollups)
    }

    async fn purge_expired_logs(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        self.check_available()?;
        let mut logs = self.logs.lock();
        let before = logs.len();
        logs.retain(|e| !e.is_expired(now));
        Ok((before - logs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::api_key::ENDPOINT_HISTORY_CAPACITY;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 10, 12, 0, 0).unwrap()
    }

    async fn seeded(limit: u32) -> (Arc<MemoryKeyStore>, Owner, String) {
        let store = Arc::new(MemoryKeyStore::new());
        let owner = store.insert_owner(Owner::new("alice", noon())).await.unwrap();
        let record = ApiKeyRecord::new("kg_seed".to_string(), owner.id, "seed", limit, noon());
        store.insert_key(record).await.unwrap();
        (store, owner, "kg_seed".to_string())
    }

    fn log_entry(key: &str, created_at: DateTime<Utc>) -> RequestLogEntry {
        RequestLogEntry {
            request_id: Uuid::new_v4().to_string(),
            endpoint: "/v1/x".to_string(),
            method: "GET".to_string(),
            version: "v1".to_string(),
            address: "1.2.3.4".to_string(),
            key: Some(key.to_string()),
            key_name: None,
            owner_id: None,
            status_code: 200,
            response_time_ms: 5,
            success: true,
            error: None,
            usage: None,
            created_at,
            expires_at: created_at + Duration::hours(24),
        }
    }

    #[tokio::test]
    async fn test_duplicate_token_is_rejected() {
        let (store, owner, token) = seeded(5).await;
        let dup = ApiKeyRecord::new(token.clone(), owner.id, "dup", 99, noon());
        assert!(matches!(store.insert_key(dup).await, Err(StoreError::Conflict(_))));
        assert_eq!(store.get_key(&token).await.unwrap().unwrap().name, "seed");
    }

    #[tokio::test]
    async fn test_duplicate_username_is_rejected() {
        let (store, _, _) = seeded(5).await;
        let result = store.insert_owner(Owner::new("alice", noon())).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_usage_never_exceeds_limit() {
        let (store, owner, token) = seeded(25).await;

        let mut handles = Vec::new();
        for i in 0..100 {
            let store = store.clone();
            let token = token.clone();
            handles.push(tokio::spawn(async move {
                store
                    .record_usage(&token, &format!("10.0.0.{}", i % 7), "/v1/x", noon())
                    .await
                    .unwrap()
            }));
        }

        let mut recorded = 0;
        let mut exhausted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                UsageOutcome::Recorded(_) => recorded += 1,
                UsageOutcome::QuotaExhausted(_) => exhausted += 1,
                other => panic!("unexpected outcome {:?}", other),
            }
        }

        assert_eq!(recorded, 25);
        assert_eq!(exhausted, 75);
        let key = store.get_key(&token).await.unwrap().unwrap();
        assert_eq!(key.usage_today, 25);
        assert_eq!(key.total_usage, 25);
        let owner = store.get_owner(owner.id).await.unwrap().unwrap();
        assert_eq!(owner.total_api_calls, 25);
    }

    #[tokio::test]
    async fn test_ip_history_is_bounded() {
        let (store, _, token) = seeded(100).await;
        for i in 0..15 {
            store
                .record_usage(&token, "1.1.1.1", &format!("/v1/e{}", i), noon())
                .await
                .unwrap();
        }
        let key = store.get_key(&token).await.unwrap().unwrap();
        let ip = key.ips.get("1.1.1.1").unwrap();
        assert_eq!(ip.endpoints.len(), ENDPOINT_HISTORY_CAPACITY);
        assert_eq!(ip.endpoints.iter().next().map(String::as_str), Some("/v1/e5"));
    }

    #[tokio::test]
    async fn test_ban_unknown_key_is_not_found() {
        let store = MemoryKeyStore::new();
        let result = store.set_ip_ban("kg_missing", "1.1.1.1", true, None, noon()).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_maintenance_operations_are_idempotent() {
        let (store, owner, token) = seeded(10).await;
        store.record_usage(&token, "1.1.1.1", "/v1/x", noon()).await.unwrap();

        assert_eq!(store.reset_daily_usage().await.unwrap(), 1);
        assert_eq!(store.reset_daily_usage().await.unwrap(), 0);

        {
            let mut key = store.keys.get_mut(&token).unwrap();
            key.expires_at = Some(noon() - Duration::hours(1));
        }
        assert_eq!(store.revoke_expired(noon()).await.unwrap(), 1);
        assert_eq!(store.revoke_expired(noon()).await.unwrap(), 0);
        let key = store.get_key(&token).await.unwrap().unwrap();
        assert_eq!(key.status, KeyStatus::Revoked);

        {
            let mut drifted = store.owners.get_mut(&owner.id).unwrap();
            drifted.total_api_calls = 999;
        }
        assert_eq!(store.reconcile_owner_totals().await.unwrap(), 1);
        assert_eq!(store.reconcile_owner_totals().await.unwrap(), 0);
        assert_eq!(store.get_owner(owner.id).await.unwrap().unwrap().total_api_calls, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_rollup_increments_sum_exactly() {
        let store = Arc::new(MemoryUsageStore::default());
        let key = RollupKey::for_request("/v1/x", "GET", noon());

        let mut handles = Vec::new();
        for i in 0..200u64 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                let delta = RollupDelta { success: i % 4 != 0, response_time_ms: 2 };
                store.increment_rollup(&key, &delta, noon()).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let rollups = store.rollups_for_date(key.date).await.unwrap();
        assert_eq!(rollups.len(), 1);
        assert_eq!(rollups[0].total_requests, 200);
        assert_eq!(rollups[0].success_requests, 150);
        assert_eq!(rollups[0].failed_requests, 50);
        assert_eq!(rollups[0].total_response_time_ms, 400);
    }

    #[tokio::test]
    async fn test_logs_expire_after_retention() {
        let store = MemoryUsageStore::default();
        store.insert_log(log_entry("kg_a", noon())).await.unwrap();
        store.insert_log(log_entry("kg_b", noon())).await.unwrap();

        let later = noon() + Duration::hours(1);
        assert_eq!(store.recent_logs(Some("kg_a"), 50, later).await.unwrap().len(), 1);
        assert_eq!(store.recent_logs(None, 50, later).await.unwrap().len(), 2);

        let next_day = noon() + Duration::hours(25);
        assert!(store.recent_logs(None, 50, next_day).await.unwrap().is_empty());
        assert_eq!(store.purge_expired_logs(next_day).await.unwrap(), 2);
    }
}
