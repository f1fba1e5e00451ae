//! Periodic maintenance over the key and usage stores
//!
//! Each job is idempotent, so a redundant trigger after a restart is harmless.
//! Failures are logged and the next tick retries.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::MaintenanceSettings;
use crate::db::{KeyStore, StoreResult, UsageStore};

/// Which job ran and how many rows it changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub job: &'static str,
    pub affected: u64,
}

pub struct MaintenanceJobs {
    keys: Arc<dyn KeyStore>,
    usage: Arc<dyn UsageStore>,
}

impl MaintenanceJobs {
    pub fn new(keys: Arc<dyn KeyStore>, usage: Arc<dyn UsageStore>) -> Self {
        Self { keys, usage }
    }

    /// Zero today's usage on every key that has any
    pub async fn daily_reset(&self) -> StoreResult<JobReport> {
        let affected = self.keys.reset_daily_usage().await?;
        Ok(report("daily_reset", affected))
    }

    /// Revoke keys whose expiry has passed
    pub async fn expiry_sweep(&self, now: DateTime<Utc>) -> StoreResult<JobReport> {
        let affected = self.keys.revoke_expired(now).await?;
        Ok(report("expiry_sweep", affected))
    }

    /// Recompute owner call totals from their keys
    pub async fn reconcile(&self) -> StoreResult<JobReport> {
        let affected = self.keys.reconcile_owner_totals().await?;
        Ok(report("reconcile", affected))
    }

    pub async fn purge_logs(&self, now: DateTime<Utc>) -> StoreResult<JobReport> {
        let affected = self.usage.purge_expired_logs(now).await?;
        Ok(report("log_purge", affected))
    }

    /// Start one background loop per job
    pub fn spawn_schedulers(self: &Arc<Self>, settings: &MaintenanceSettings) -> Vec<JoinHandle<()>> {
        let expiry_every = StdDuration::from_secs(settings.expiry_interval_hours.max(1) * 3600);
        let reconcile_every =
            StdDuration::from_secs(settings.reconcile_interval_days.max(1) * 24 * 3600);

        let daily = {
            let jobs = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(until_next_midnight(Utc::now())).await;
                    log_result(jobs.daily_reset().await);
                }
            })
        };

        let expiry = {
            let jobs = Arc::clone(self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(expiry_every);
                loop {
                    interval.tick().await;
                    log_result(jobs.expiry_sweep(Utc::now()).await);
                }
            })
        };

        let reconcile = {
            let jobs = Arc::clone(self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(reconcile_every);
                // Skip the immediate first tick
                interval.tick().await;
                loop {
                    interval.tick().await;
                    log_result(jobs.reconcile().await);
                }
            })
        };

        let purge = {
            let jobs = Arc::clone(self);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(StdDuration::from_secs(3600));
                loop {
                    interval.tick().await;
                    log_result(jobs.purge_logs(Utc::now()).await);
                }
            })
        };

        info!(
            expiry_interval_hours = settings.expiry_interval_hours,
            reconcile_interval_days = settings.reconcile_interval_days,
            "Maintenance schedulers started"
        );

        vec![daily, expiry, reconcile, purge]
    }
}

fn report(job: &'static str, affected: u64) -> JobReport {
    JobReport { job, affected }
}

fn log_result(result: StoreResult<JobReport>) {
    match result {
        Ok(report) => info!(job = report.job, affected = report.affected, "Maintenance job finished"),
        Err(e) => error!(error = %e, "Maintenance job failed, will retry on next trigger"),
    }
}

/// Time left until the next UTC midnight
fn until_next_midnight(now: DateTime<Utc>) -> StdDuration {
    let next = now
        .date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc())
        .unwrap_or_else(|| now + Duration::hours(24));
    (next - now)
        .to_std()
        .unwrap_or(StdDuration::from_secs(24 * 3600))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryKeyStore, MemoryUsageStore};
    use crate::domain::{ApiKeyRecord, KeyStatus, KeyUpdate, Owner};
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 9, 1, hour, 0, 0).unwrap()
    }

    async fn seeded() -> (Arc<MemoryKeyStore>, MaintenanceJobs, Owner) {
        let keys = Arc::new(MemoryKeyStore::new());
        let owner = keys.insert_owner(Owner::new("carol", at(0))).await.unwrap();
        for (token, expires) in [("kg_one", None), ("kg_two", Some(at(5)))] {
            let mut record = ApiKeyRecord::new(token.to_string(), owner.id, token, 50, at(0));
            record.expires_at = expires;
            keys.insert_key(record).await.unwrap();
        }
        let jobs = MaintenanceJobs::new(keys.clone(), Arc::new(MemoryUsageStore::default()));
        (keys, jobs, owner)
    }

    #[tokio::test]
    async fn test_daily_reset_twice_is_noop() {
        let (keys, jobs, _) = seeded().await;
        keys.record_usage("kg_one", "1.1.1.1", "/v1/a", at(1)).await.unwrap();
        keys.record_usage("kg_two", "1.1.1.1", "/v1/a", at(1)).await.unwrap();

        assert_eq!(jobs.daily_reset().await.unwrap().affected, 2);
        assert_eq!(jobs.daily_reset().await.unwrap().affected, 0);
        let key = keys.get_key("kg_one").await.unwrap().unwrap();
        assert_eq!(key.usage_today, 0);
        assert_eq!(key.total_usage, 1);
    }

    #[tokio::test]
    async fn test_expiry_sweep_only_touches_expired() {
        let (keys, jobs, _) = seeded().await;

        assert_eq!(jobs.expiry_sweep(at(4)).await.unwrap().affected, 0);
        assert_eq!(jobs.expiry_sweep(at(6)).await.unwrap().affected, 1);
        assert_eq!(jobs.expiry_sweep(at(7)).await.unwrap().affected, 0);

        assert_eq!(keys.get_key("kg_two").await.unwrap().unwrap().status, KeyStatus::Revoked);
        assert_eq!(keys.get_key("kg_one").await.unwrap().unwrap().status, KeyStatus::Active);
    }

    #[tokio::test]
    async fn test_expiry_sweep_revokes_suspended_expired_key() {
        let (keys, jobs, _) = seeded().await;
        let update = KeyUpdate { status: Some(KeyStatus::Suspended), ..Default::default() };
        keys.update_key("kg_two", &update).await.unwrap();

        assert_eq!(jobs.expiry_sweep(at(6)).await.unwrap().affected, 1);
        assert_eq!(keys.get_key("kg_two").await.unwrap().unwrap().status, KeyStatus::Revoked);
    }

    #[tokio::test]
    async fn test_reconcile_matches_key_totals() {
        let (keys, jobs, owner) = seeded().await;
        for _ in 0..3 {
            keys.record_usage("kg_one", "1.1.1.1", "/v1/a", at(1)).await.unwrap();
        }
        keys.record_usage("kg_two", "1.1.1.1", "/v1/a", at(1)).await.unwrap();

        // Already consistent
        assert_eq!(jobs.reconcile().await.unwrap().affected, 0);
        assert_eq!(keys.get_owner(owner.id).await.unwrap().unwrap().total_api_calls, 4);

        keys.delete_key("kg_two").await.unwrap();
        assert_eq!(jobs.reconcile().await.unwrap().affected, 1);
        assert_eq!(keys.get_owner(owner.id).await.unwrap().unwrap().total_api_calls, 3);
    }

    #[tokio::test]
    async fn test_failure_is_reported_not_raised() {
        let (keys, jobs, _) = seeded().await;
        keys.set_unavailable(true);
        assert!(jobs.daily_reset().await.is_err());
        log_result(jobs.reconcile().await);
    }

    #[test]
    fn test_until_next_midnight() {
        let wait = until_next_midnight(Utc.with_ymd_and_hms(2026, 9, 1, 23, 30, 0).unwrap());
        assert_eq!(wait, StdDuration::from_secs(30 * 60));
    }
}
