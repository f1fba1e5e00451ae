//! PostgreSQL-backed key store
//!
//! Usage counting relies on a single conditional `UPDATE ... RETURNING`:
//! row locking serializes concurrent requests for the same key and the
//! `WHERE` clause is re-checked after each wait, so the daily limit can
//! never be overshot.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tokio_postgres::Row;
use tracing::{info, warn};
use uuid::Uuid;

use super::pool::DbPool;
use super::store::{KeyStore, StoreError, StoreResult};
use crate::domain::api_key::{token_prefix, EndpointHistory, ENDPOINT_HISTORY_CAPACITY};
use crate::domain::{
    ApiKeyRecord, IpRecord, KeyStatus, KeyUpdate, Owner, UsageOutcome, UsageSnapshot,
};

const KEY_COLUMNS: &str = "token, owner_id, name, daily_limit, usage_today, total_usage, \
                           status, created_at, last_used_at, expires_at";

const IP_COLUMNS: &str = "key_token, address, endpoints, first_seen, last_seen, banned, ban_reason";

/// Key store over the `owners`, `api_keys` and `api_key_ips` tables
#[derive(Clone)]
pub struct PgKeyStore {
    pool: DbPool,
}

impl PgKeyStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn load_ips(
        client: &deadpool_postgres::Client,
        tokens: &[String],
    ) -> StoreResult<HashMap<String, BTreeMap<String, IpRecord>>> {
        let mut by_key: HashMap<String, BTreeMap<String, IpRecord>> = HashMap::new();
        if tokens.is_empty() {
            return Ok(by_key);
        }

        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM api_key_ips WHERE key_token = ANY($1) ORDER BY first_seen",
                    IP_COLUMNS
                ),
                &[&tokens],
            )
            .await?;

        for row in rows {
            let token: String = row.get("key_token");
            let record = ip_from_row(&row);
            by_key
                .entry(token)
                .or_default()
                .insert(record.address.clone(), record);
        }

        Ok(by_key)
    }
}

fn owner_from_row(row: &Row) -> Owner {
    Owner {
        id: row.get("id"),
        username: row.get("username"),
        total_api_calls: to_u64(row.get("total_api_calls")),
        created_at: row.get("created_at"),
    }
}

fn ip_from_row(row: &Row) -> IpRecord {
    IpRecord {
        address: row.get("address"),
        endpoints: EndpointHistory::from_persisted(row.get("endpoints")),
        first_seen: row.get("first_seen"),
        last_seen: row.get("last_seen"),
        banned: row.get("banned"),
        ban_reason: row.get("ban_reason"),
    }
}

fn key_from_row(row: &Row, ips: BTreeMap<String, IpRecord>) -> StoreResult<ApiKeyRecord> {
    let status: String = row.get("status");
    Ok(ApiKeyRecord {
        token: row.get("token"),
        owner_id: row.get("owner_id"),
        name: row.get("name"),
        daily_limit: to_u32(row.get("daily_limit")),
        usage_today: to_u32(row.get("usage_today")),
        total_usage: to_u64(row.get("total_usage")),
        status: status.parse().map_err(StoreError::Invalid)?,
        created_at: row.get("created_at"),
        last_used_at: row.get("last_used_at"),
        expires_at: row.get("expires_at"),
        ips,
    })
}

fn to_u32(value: i32) -> u32 {
    value.max(0) as u32
}

fn to_u64(value: i64) -> u64 {
    value.max(0) as u64
}

#[async_trait]
impl KeyStore for PgKeyStore {
    async fn insert_owner(&self, owner: Owner) -> StoreResult<Owner> {
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                r#"
                INSERT INTO owners (id, username, total_api_calls, created_at)
                VALUES ($1, $2, 0, $3)
                ON CONFLICT DO NOTHING
                RETURNING id, username, total_api_calls, created_at
                "#,
                &[&owner.id, &owner.username, &owner.created_at],
            )
            .await?;

        match row {
            Some(row) => Ok(owner_from_row(&row)),
            None => Err(StoreError::Conflict(format!(
                "owner '{}' already exists",
                owner.username
            ))),
        }
    }

    async fn get_owner(&self, id: Uuid) -> StoreResult<Option<Owner>> {
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                "SELECT id, username, total_api_calls, created_at FROM owners WHERE id = $1",
                &[&id],
            )
            .await?;

        Ok(row.map(|r| owner_from_row(&r)))
    }

    async fn list_owners(&self) -> StoreResult<Vec<Owner>> {
        let client = self.pool.get().await?;

        let rows = client
            .query(
                "SELECT id, username, total_api_calls, created_at FROM owners ORDER BY created_at",
                &[],
            )
            .await?;

        Ok(rows.iter().map(owner_from_row).collect())
    }

    async fn insert_key(&self, record: ApiKeyRecord) -> StoreResult<ApiKeyRecord> {
        let client = self.pool.get().await?;

        let daily_limit = record.daily_limit as i32;
        let inserted = client
            .query_opt(
                r#"
                INSERT INTO api_keys (
                    token, owner_id, name, daily_limit, usage_today, total_usage,
                    status, created_at, last_used_at, expires_at
                ) VALUES ($1, $2, $3, $4, 0, 0, $5, $6, $7, $8)
                ON CONFLICT (token) DO NOTHING
                RETURNING token
                "#,
                &[
                    &record.token,
                    &record.owner_id,
                    &record.name,
                    &daily_limit,
                    &record.status.as_str(),
                    &record.created_at,
                    &record.last_used_at,
                    &record.expires_at,
                ],
            )
            .await?;

        if inserted.is_none() {
            warn!(key_prefix = %record.token_prefix(), "API key token collision");
            return Err(StoreError::Conflict("api key token already exists".to_string()));
        }

        info!(
            key_prefix = %record.token_prefix(),
            owner_id = %record.owner_id,
            daily_limit = record.daily_limit,
            "Created new API key"
        );

        Ok(record)
    }

    async fn get_key(&self, token: &str) -> StoreResult<Option<ApiKeyRecord>> {
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                &format!("SELECT {} FROM api_keys WHERE token = $1", KEY_COLUMNS),
                &[&token],
            )
            .await?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let mut ips = Self::load_ips(&client, &[token.to_string()]).await?;
        let record = key_from_row(&row, ips.remove(token).unwrap_or_default())?;
        Ok(Some(record))
    }

    async fn list_keys_by_owner(&self, owner_id: Uuid) -> StoreResult<Vec<ApiKeyRecord>> {
        let client = self.pool.get().await?;

        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM api_keys WHERE owner_id = $1 ORDER BY created_at DESC",
                    KEY_COLUMNS
                ),
                &[&owner_id],
            )
            .await?;

        let tokens: Vec<String> = rows.iter().map(|r| r.get("token")).collect();
        let mut ips = Self::load_ips(&client, &tokens).await?;

        rows.iter()
            .map(|row| {
                let token: String = row.get("token");
                key_from_row(row, ips.remove(&token).unwrap_or_default())
            })
            .collect()
    }

    async fn count_keys(&self) -> StoreResult<u64> {
        let client = self.pool.get().await?;
        let row = client.query_one("SELECT COUNT(*) AS count FROM api_keys", &[]).await?;
        Ok(to_u64(row.get("count")))
    }

    async fn record_usage(
        &self,
        token: &str,
        address: &str,
        endpoint: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<UsageOutcome> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let today = now.date_naive();

        let counted = tx
            .query_opt(
                r#"
                UPDATE api_keys SET
                    usage_today = CASE
                        WHEN (last_used_at AT TIME ZONE 'UTC')::date <> $2 THEN 1
                        ELSE usage_today + 1
                    END,
                    total_usage = total_usage + 1,
                    last_used_at = $3
                WHERE token = $1
                  AND status = 'active'
                  AND ((last_used_at AT TIME ZONE 'UTC')::date <> $2 OR usage_today < daily_limit)
                RETURNING owner_id, usage_today, daily_limit, total_usage
                "#,
                &[&token, &today, &now],
            )
            .await?;

        let row = match counted {
            Some(row) => row,
            None => {
                // Nothing was counted, report why
                let current = tx
                    .query_opt(
                        "SELECT status, usage_today, daily_limit, total_usage, last_used_at \
                         FROM api_keys WHERE token = $1",
                        &[&token],
                    )
                    .await?;
                tx.rollback().await?;

                let row = match current {
                    Some(row) => row,
                    None => return Ok(UsageOutcome::NotFound),
                };
                let status: String = row.get("status");
                let status: KeyStatus = status.parse().map_err(StoreError::Invalid)?;
                if status != KeyStatus::Active {
                    return Ok(UsageOutcome::Inactive(status));
                }
                let last_used_at: DateTime<Utc> = row.get("last_used_at");
                let usage_today = if last_used_at.date_naive() == today {
                    to_u32(row.get("usage_today"))
                } else {
                    0
                };
                return Ok(UsageOutcome::QuotaExhausted(UsageSnapshot {
                    usage_today,
                    daily_limit: to_u32(row.get("daily_limit")),
                    total_usage: to_u64(row.get("total_usage")),
                }));
            }
        };

        let owner_id: Uuid = row.get("owner_id");
        let snapshot = UsageSnapshot {
            usage_today: to_u32(row.get("usage_today")),
            daily_limit: to_u32(row.get("daily_limit")),
            total_usage: to_u64(row.get("total_usage")),
        };

        let capacity = ENDPOINT_HISTORY_CAPACITY as i32;
        tx.execute(
            r#"
            INSERT INTO api_key_ips (key_token, address, endpoints, first_seen, last_seen, banned)
            VALUES ($1, $2, ARRAY[$3::TEXT], $4, $4, FALSE)
            ON CONFLICT (key_token, address) DO UPDATE SET
                last_seen = EXCLUDED.last_seen,
                endpoints = CASE
                    WHEN $3::TEXT = ANY(api_key_ips.endpoints) THEN api_key_ips.endpoints
                    ELSE (api_key_ips.endpoints || $3::TEXT)
                        [GREATEST(cardinality(api_key_ips.endpoints) + 2 - $5::INT, 1):]
                END
            "#,
            &[&token, &address, &endpoint, &now, &capacity],
        )
        .await?;

        tx.execute(
            "UPDATE owners SET total_api_calls = total_api_calls + 1 WHERE id = $1",
            &[&owner_id],
        )
        .await?;

        tx.commit().await?;

        Ok(UsageOutcome::Recorded(snapshot))
    }

    async fn set_ip_ban(
        &self,
        token: &str,
        address: &str,
        banned: bool,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<IpRecord>> {
        let client = self.pool.get().await?;

        let exists = client
            .query_opt("SELECT 1 FROM api_keys WHERE token = $1", &[&token])
            .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound(format!(
                "api key {}",
                token_prefix(token)
            )));
        }

        let row = if banned {
            client
                .query_opt(
                    &format!(
                        r#"
                        INSERT INTO api_key_ips (key_token, address, endpoints, first_seen, last_seen, banned, ban_reason)
                        VALUES ($1, $2, '{{}}', $3, $3, TRUE, $4)
                        ON CONFLICT (key_token, address) DO UPDATE SET
                            banned = TRUE,
                            ban_reason = EXCLUDED.ban_reason,
                            last_seen = EXCLUDED.last_seen
                        RETURNING {}
                        "#,
                        IP_COLUMNS
                    ),
                    &[&token, &address, &now, &reason],
                )
                .await?
        } else {
            client
                .query_opt(
                    &format!(
                        r#"
                        UPDATE api_key_ips SET banned = FALSE, ban_reason = NULL, last_seen = $3
                        WHERE key_token = $1 AND address = $2
                        RETURNING {}
                        "#,
                        IP_COLUMNS
                    ),
                    &[&token, &address, &now],
                )
                .await?
        };

        Ok(row.map(|r| ip_from_row(&r)))
    }

    async fn update_key(&self, token: &str, update: &KeyUpdate) -> StoreResult<Option<ApiKeyRecord>> {
        {
            let client = self.pool.get().await?;
            let daily_limit = update.daily_limit.map(|l| l as i32);
            let status = update.status.map(|s| s.as_str());

            let updated = client
                .execute(
                    r#"
                    UPDATE api_keys SET
                        name = COALESCE($2, name),
                        daily_limit = COALESCE($3, daily_limit),
                        status = COALESCE($4, status)
                    WHERE token = $1
                    "#,
                    &[&token, &update.name, &daily_limit, &status],
                )
                .await?;

            if updated == 0 {
                return Ok(None);
            }
        }

        self.get_key(token).await
    }

    async fn delete_key(&self, token: &str) -> StoreResult<bool> {
        let client = self.pool.get().await?;

        let result = client
            .execute("DELETE FROM api_keys WHERE token = $1", &[&token])
            .await?;

        if result > 0 {
            warn!(key_prefix = %token_prefix(token), "API key deleted");
        }

        Ok(result > 0)
    }

    async fn reset_daily_usage(&self) -> StoreResult<u64> {
        let client = self.pool.get().await?;
        Ok(client
            .execute("UPDATE api_keys SET usage_today = 0 WHERE usage_today > 0", &[])
            .await?)
    }

    async fn revoke_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let client = self.pool.get().await?;
        Ok(client
            .execute(
                r#"
                UPDATE api_keys SET status = 'revoked'
                WHERE expires_at IS NOT NULL AND expires_at <= $1 AND status <> 'revoked'
                "#,
                &[&now],
            )
            .await?)
    }

    async fn reconcile_owner_totals(&self) -> StoreResult<u64> {
        let client = self.pool.get().await?;
        Ok(client
            .execute(
                r#"
                UPDATE owners o SET total_api_calls = t.total
                FROM (
                    SELECT o2.id, COALESCE(SUM(k.total_usage), 0)::BIGINT AS total
                    FROM owners o2
                    LEFT JOIN api_keys k ON k.owner_id = o2.id
                    GROUP BY o2.id
                ) t
                WHERE o.id = t.id AND o.total_api_calls <> t.total
                "#,
                &[],
            )
            .await?)
    }
}
