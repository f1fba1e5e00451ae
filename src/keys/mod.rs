//! Key lifecycle and reporting for owners and administrators

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Settings;
use crate::db::{KeyStore, StoreError, UsageStore};
use crate::domain::api_key::{generate_token, validate_daily_limit, DEFAULT_KEY_NAME};
use crate::domain::{
    ApiKeyRecord, IpRecord, KeyStatus, KeyUpdate, Owner, RequestLogEntry, UsageRollup,
    UsageSnapshot,
};

/// Attempts at generating a unique token before giving up
const TOKEN_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum KeyServiceError {
    #[error("{0}")]
    Invalid(String),
    #[error("API key not found")]
    KeyNotFound,
    #[error("Owner not found")]
    OwnerNotFound,
    #[error("{0}")]
    Conflict(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type KeyServiceResult<T> = Result<T, KeyServiceError>;

/// Per-key report
#[derive(Debug, Clone, Serialize)]
pub struct KeyStats {
    pub token: String,
    pub name: String,
    pub status: KeyStatus,
    pub usage: UsageSnapshot,
    pub remaining_today: u32,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub tracked_addresses: usize,
    pub banned_addresses: usize,
    pub recent_requests: Vec<RequestLogEntry>,
}

/// Per-owner report
#[derive(Debug, Clone, Serialize)]
pub struct OwnerSummary {
    pub owner: Owner,
    pub total_keys: usize,
    pub active_keys: usize,
    pub usage_today: u64,
    pub banned_addresses: usize,
}

/// Service-wide report for administrators
#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub owners: usize,
    pub keys: u64,
    pub total_api_calls: u64,
    pub top_owners: Vec<Owner>,
    pub rollups_today: Vec<UsageRollup>,
}

pub struct KeyService {
    keys: Arc<dyn KeyStore>,
    usage: Arc<dyn UsageStore>,
    token_prefix: String,
    default_daily_limit: u32,
    recent_log_limit: usize,
}

impl KeyService {
    pub fn new(keys: Arc<dyn KeyStore>, usage: Arc<dyn UsageStore>, settings: &Settings) -> Self {
        Self {
            keys,
            usage,
            token_prefix: settings.auth.token_prefix.clone(),
            default_daily_limit: settings.auth.default_daily_limit,
            recent_log_limit: settings.usage.recent_log_limit,
        }
    }

    /// Create an owner together with its default key
    pub async fn register_owner(&self, username: &str) -> KeyServiceResult<(Owner, ApiKeyRecord)> {
        let username = username.trim();
        if username.is_empty() {
            return Err(KeyServiceError::Invalid("username must not be empty".to_string()));
        }

        let owner = self
            .keys
            .insert_owner(Owner::new(username, Utc::now()))
            .await
            .map_err(conflict_as("username already taken"))?;
        let key = self.create_key(owner.id, None, None).await?;

        info!(owner_id = %owner.id, username = %owner.username, "Owner registered");
        Ok((owner, key))
    }

    pub async fn create_key(
        &self,
        owner_id: Uuid,
        name: Option<&str>,
        daily_limit: Option<u32>,
    ) -> KeyServiceResult<ApiKeyRecord> {
        let name = match name.map(str::trim) {
            Some(name) if !name.is_empty() => name,
            _ => DEFAULT_KEY_NAME,
        };
        let daily_limit = validate_daily_limit(daily_limit.unwrap_or(self.default_daily_limit))
            .map_err(KeyServiceError::Invalid)?;

        if self.keys.get_owner(owner_id).await?.is_none() {
            return Err(KeyServiceError::OwnerNotFound);
        }

        for attempt in 1..=TOKEN_ATTEMPTS {
            let token = generate_token(&self.token_prefix);
            let record = ApiKeyRecord::new(token, owner_id, name, daily_limit, Utc::now());
            match self.keys.insert_key(record).await {
                Ok(record) => {
                    info!(
                        owner_id = %owner_id,
                        key_prefix = record.token_prefix(),
                        daily_limit,
                        "API key created"
                    );
                    return Ok(record);
                }
                Err(StoreError::Conflict(_)) => {
                    warn!(attempt, "Generated token collided, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(KeyServiceError::Conflict(
            "could not generate a unique API key".to_string(),
        ))
    }

    pub async fn list_keys(&self, owner_id: Uuid) -> KeyServiceResult<Vec<ApiKeyRecord>> {
        Ok(self.keys.list_keys_by_owner(owner_id).await?)
    }

    /// Key owned by `owner_id`; any other key reads as not found
    pub async fn owned_key(&self, owner_id: Uuid, token: &str) -> KeyServiceResult<ApiKeyRecord> {
        match self.keys.get_key(token).await? {
            Some(key) if key.owner_id == owner_id => Ok(key),
            _ => Err(KeyServiceError::KeyNotFound),
        }
    }

    pub async fn update_key(
        &self,
        owner_id: Uuid,
        token: &str,
        update: KeyUpdate,
    ) -> KeyServiceResult<ApiKeyRecord> {
        if update.is_empty() {
            return Err(KeyServiceError::Invalid("nothing to update".to_string()));
        }
        if let Some(limit) = update.daily_limit {
            validate_daily_limit(limit).map_err(KeyServiceError::Invalid)?;
        }
        let update = KeyUpdate {
            name: match update.name {
                Some(name) if name.trim().is_empty() => {
                    return Err(KeyServiceError::Invalid("name must not be empty".to_string()))
                }
                name => name.map(|n| n.trim().to_string()),
            },
            ..update
        };

        self.owned_key(owner_id, token).await?;
        let updated = self
            .keys
            .update_key(token, &update)
            .await?
            .ok_or(KeyServiceError::KeyNotFound)?;

        info!(key_prefix = updated.token_prefix(), status = %updated.status, "API key updated");
        Ok(updated)
    }

    pub async fn delete_key(&self, owner_id: Uuid, token: &str) -> KeyServiceResult<()> {
        let key = self.owned_key(owner_id, token).await?;
        if !self.keys.delete_key(token).await? {
            return Err(KeyServiceError::KeyNotFound);
        }
        info!(key_prefix = key.token_prefix(), "API key deleted");
        Ok(())
    }

    pub async fn ban_ip(
        &self,
        owner_id: Uuid,
        token: &str,
        address: &str,
        reason: Option<&str>,
    ) -> KeyServiceResult<IpRecord> {
        let address = require_address(address)?;
        let key = self.owned_key(owner_id, token).await?;
        let record = self
            .keys
            .set_ip_ban(token, address, true, reason, Utc::now())
            .await
            .map_err(not_found_as_key)?
            .ok_or(KeyServiceError::KeyNotFound)?;

        info!(key_prefix = key.token_prefix(), address = %address, "Address banned");
        Ok(record)
    }

    /// `None` when the address was never seen on this key
    pub async fn unban_ip(
        &self,
        owner_id: Uuid,
        token: &str,
        address: &str,
    ) -> KeyServiceResult<Option<IpRecord>> {
        let address = require_address(address)?;
        let key = self.owned_key(owner_id, token).await?;
        let record = self
            .keys
            .set_ip_ban(token, address, false, None, Utc::now())
            .await
            .map_err(not_found_as_key)?;

        if record.is_some() {
            info!(key_prefix = key.token_prefix(), address = %address, "Address unbanned");
        }
        Ok(record)
    }

    /// Address records, most recently seen first
    pub async fn list_ips(&self, owner_id: Uuid, token: &str) -> KeyServiceResult<Vec<IpRecord>> {
        let key = self.owned_key(owner_id, token).await?;
        let mut ips: Vec<IpRecord> = key.ips.into_values().collect();
        ips.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(ips)
    }

    pub async fn key_stats(&self, owner_id: Uuid, token: &str) -> KeyServiceResult<KeyStats> {
        let now = Utc::now();
        let key = self.owned_key(owner_id, token).await?;
        let recent_requests = self
            .usage
            .recent_logs(Some(token), self.recent_log_limit, now)
            .await?;
        let usage = key.snapshot_at(now);

        Ok(KeyStats {
            token: key.token.clone(),
            name: key.name.clone(),
            status: key.status,
            remaining_today: usage.remaining(),
            usage,
            created_at: key.created_at,
            last_used_at: key.last_used_at,
            expires_at: key.expires_at,
            tracked_addresses: key.ips.len(),
            banned_addresses: key.ips.values().filter(|ip| ip.banned).count(),
            recent_requests,
        })
    }

    pub async fn owner_summary(&self, owner_id: Uuid) -> KeyServiceResult<OwnerSummary> {
        let now = Utc::now();
        let owner = self
            .keys
            .get_owner(owner_id)
            .await?
            .ok_or(KeyServiceError::OwnerNotFound)?;
        let keys = self.keys.list_keys_by_owner(owner_id).await?;

        Ok(OwnerSummary {
            owner,
            total_keys: keys.len(),
            active_keys: keys
                .iter()
                .filter(|k| k.status == KeyStatus::Active && !k.is_expired(now))
                .count(),
            usage_today: keys.iter().map(|k| k.usage_today_at(now) as u64).sum(),
            banned_addresses: keys
                .iter()
                .map(|k| k.ips.values().filter(|ip| ip.banned).count())
                .sum(),
        })
    }

    pub async fn rollups(&self, date: NaiveDate) -> KeyServiceResult<Vec<UsageRollup>> {
        Ok(self.usage.rollups_for_date(date).await?)
    }

    pub async fn overview(&self) -> KeyServiceResult<Overview> {
        let mut owners = self.keys.list_owners().await?;
        let keys = self.keys.count_keys().await?;
        let total_api_calls = owners.iter().map(|o| o.total_api_calls).sum();
        let rollups_today = self.usage.rollups_for_date(Utc::now().date_naive()).await?;

        let owner_count = owners.len();
        owners.sort_by(|a, b| b.total_api_calls.cmp(&a.total_api_calls));
        owners.truncate(10);

        Ok(Overview {
            owners: owner_count,
            keys,
            total_api_calls,
            top_owners: owners,
            rollups_today,
        })
    }
}

fn require_address(address: &str) -> KeyServiceResult<&str> {
    let address = address.trim();
    if address.is_empty() {
        return Err(KeyServiceError::Invalid("address must not be empty".to_string()));
    }
    Ok(address)
}

fn conflict_as(message: &'static str) -> impl Fn(StoreError) -> KeyServiceError {
    move |e| match e {
        StoreError::Conflict(_) => KeyServiceError::Conflict(message.to_string()),
        other => KeyServiceError::Store(other),
    }
}

fn not_found_as_key(e: StoreError) -> KeyServiceError {
    match e {
        StoreError::NotFound(_) => KeyServiceError::KeyNotFound,
        other => KeyServiceError::Store(other),
    }
}
