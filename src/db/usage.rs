//! PostgreSQL-backed usage telemetry store

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio_postgres::Row;
use tracing::info;

use super::pool::DbPool;
use super::store::{StoreResult, UsageStore};
use crate::domain::{RequestLogEntry, RollupDelta, RollupKey, UsageRollup, UsageSnapshot};

/// Usage store over the `usage_rollups` and `request_logs` tables
#[derive(Clone)]
pub struct PgUsageStore {
    pool: DbPool,
}

impl PgUsageStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn rollup_from_row(row: &Row) -> UsageRollup {
    UsageRollup {
        date: row.get("date"),
        endpoint: row.get("endpoint"),
        method: row.get("method"),
        version: row.get("version"),
        total_requests: to_u64(row.get("total_requests")),
        success_requests: to_u64(row.get("success_requests")),
        failed_requests: to_u64(row.get("failed_requests")),
        total_response_time_ms: to_u64(row.get("total_response_time_ms")),
        updated_at: row.get("updated_at"),
    }
}

fn log_from_row(row: &Row) -> RequestLogEntry {
    let usage_today: Option<i32> = row.get("usage_today");
    let daily_limit: Option<i32> = row.get("daily_limit");
    let total_usage: Option<i64> = row.get("total_usage");
    let usage = match (usage_today, daily_limit, total_usage) {
        (Some(used), Some(limit), Some(total)) => Some(UsageSnapshot {
            usage_today: used.max(0) as u32,
            daily_limit: limit.max(0) as u32,
            total_usage: to_u64(total),
        }),
        _ => None,
    };
    let status_code: i32 = row.get("status_code");

    RequestLogEntry {
        request_id: row.get("request_id"),
        endpoint: row.get("endpoint"),
        method: row.get("method"),
        version: row.get("version"),
        address: row.get("address"),
        key: row.get("key_token"),
        key_name: row.get("key_name"),
        owner_id: row.get("owner_id"),
        status_code: status_code.clamp(0, u16::MAX as i32) as u16,
        response_time_ms: to_u64(row.get("response_time_ms")),
        success: row.get("success"),
        error: row.get("error"),
        usage,
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
    }
}

fn to_u64(value: i64) -> u64 {
    value.max(0) as u64
}

const LOG_COLUMNS: &str = "request_id, endpoint, method, version, address, key_token, key_name, \
                           owner_id, status_code, response_time_ms, success, error, usage_today, \
                           daily_limit, total_usage, created_at, expires_at";

#[async_trait]
impl UsageStore for PgUsageStore {
    async fn increment_rollup(
        &self,
        key: &RollupKey,
        delta: &RollupDelta,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        let client = self.pool.get().await?;

        let success: i64 = if delta.success { 1 } else { 0 };
        let failed: i64 = 1 - success;
        let response_time = delta.response_time_ms as i64;

        client
            .execute(
                r#"
                INSERT INTO usage_rollups (
                    date, endpoint, method, version, total_requests,
                    success_requests, failed_requests, total_response_time_ms, updated_at
                ) VALUES ($1, $2, $3, $4, 1, $5, $6, $7, $8)
                ON CONFLICT (date, endpoint, method, version) DO UPDATE SET
                    total_requests = usage_rollups.total_requests + 1,
                    success_requests = usage_rollups.success_requests + EXCLUDED.success_requests,
                    failed_requests = usage_rollups.failed_requests + EXCLUDED.failed_requests,
                    total_response_time_ms = usage_rollups.total_response_time_ms + EXCLUDED.total_response_time_ms,
                    updated_at = EXCLUDED.updated_at
                "#,
                &[
                    &key.date,
                    &key.endpoint,
                    &key.method,
                    &key.version,
                    &success,
                    &failed,
                    &response_time,
                    &now,
                ],
            )
            .await?;

        Ok(())
    }

    async fn insert_log(&self, entry: RequestLogEntry) -> StoreResult<()> {
        let client = self.pool.get().await?;

        let status_code = entry.status_code as i32;
        let response_time = entry.response_time_ms as i64;
        let usage_today = entry.usage.map(|u| u.usage_today as i32);
        let daily_limit = entry.usage.map(|u| u.daily_limit as i32);
        let total_usage = entry.usage.map(|u| u.total_usage as i64);

        client
            .execute(
                &format!(
                    "INSERT INTO request_logs ({}) VALUES \
                     ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)",
                    LOG_COLUMNS
                ),
                &[
                    &entry.request_id,
                    &entry.endpoint,
                    &entry.method,
                    &entry.version,
                    &entry.address,
                    &entry.key,
                    &entry.key_name,
                    &entry.owner_id,
                    &status_code,
                    &response_time,
                    &entry.success,
                    &entry.error,
                    &usage_today,
                    &daily_limit,
                    &total_usage,
                    &entry.created_at,
                    &entry.expires_at,
                ],
            )
            .await?;

        Ok(())
    }

    async fn recent_logs(
        &self,
        token: Option<&str>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<RequestLogEntry>> {
        let client = self.pool.get().await?;
        let limit = limit as i64;

        let rows = client
            .query(
                &format!(
                    r#"
                    SELECT {} FROM request_logs
                    WHERE expires_at > $1 AND ($2::TEXT IS NULL OR key_token = $2)
                    ORDER BY created_at DESC
                    LIMIT $3
                    "#,
                    LOG_COLUMNS
                ),
                &[&now, &token, &limit],
            )
            .await?;

        Ok(rows.iter().map(log_from_row).collect())
    }

    async fn rollups_for_date(&self, date: NaiveDate) -> StoreResult<Vec<UsageRollup>> {
        let client = self.pool.get().await?;

        let rows = client
            .query(
                r#"
                SELECT date, endpoint, method, version, total_requests, success_requests,
                       failed_requests, total_response_time_ms, updated_at
                FROM usage_rollups
                WHERE date = $1
                ORDER BY total_requests DESC, endpoint
                "#,
                &[&date],
            )
            .await?;

        Ok(rows.iter().map(rollup_from_row).collect())
    }

    async fn purge_expired_logs(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let client = self.pool.get().await?;

        let result = client
            .execute("DELETE FROM request_logs WHERE expires_at <= $1", &[&now])
            .await?;

        if result > 0 {
            info!(deleted = result, "Purged expired request logs");
        }

        Ok(result)
    }
}
