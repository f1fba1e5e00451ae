//! Usage telemetry for completed requests
//!
//! Every completed request, admitted or denied, adds one increment to its
//! rollup row and writes one short-lived audit entry. Telemetry is best
//! effort: store failures are logged and dropped.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::config::UsageSettings;
use crate::db::UsageStore;
use crate::domain::usage::{extract_version, truncate_error, DEFAULT_VERSION};
use crate::domain::{RequestLogEntry, RollupDelta, RollupKey, UsageSnapshot};

/// What happened to one request, as seen by the middleware
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub request_id: String,
    pub endpoint: String,
    pub method: String,
    pub address: String,
    pub key: Option<String>,
    pub key_name: Option<String>,
    pub owner_id: Option<Uuid>,
    pub usage: Option<UsageSnapshot>,
    pub status_code: u16,
    pub response_time_ms: u64,
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl RequestOutcome {
    pub fn new(
        request_id: &str,
        endpoint: &str,
        method: &str,
        address: &str,
        status_code: u16,
        response_time_ms: u64,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            address: address.to_string(),
            key: None,
            key_name: None,
            owner_id: None,
            usage: None,
            status_code,
            response_time_ms,
            error: None,
            completed_at: Utc::now(),
        }
    }

    /// Fill key, owner and usage snapshot from an authorization
    pub fn with_auth(mut self, auth: &AuthContext) -> Self {
        self.key = Some(auth.token().to_string());
        self.key_name = auth.key().map(|k| k.name.clone());
        self.owner_id = auth.owner_id();
        self.usage = auth.usage();
        self
    }

    pub fn with_key(mut self, key: Option<&str>) -> Self {
        self.key = key.map(str::to_string);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn at(mut self, completed_at: DateTime<Utc>) -> Self {
        self.completed_at = completed_at;
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Maintains rollup counters and the audit log
pub struct UsageAggregator {
    store: Arc<dyn UsageStore>,
    retention: Duration,
    error_limit: usize,
}

impl UsageAggregator {
    pub fn new(store: Arc<dyn UsageStore>, settings: &UsageSettings) -> Self {
        Self {
            store,
            retention: Duration::hours(settings.log_retention_hours),
            error_limit: settings.error_text_limit,
        }
    }

    pub fn store(&self) -> &Arc<dyn UsageStore> {
        &self.store
    }

    /// Record one completed request. Never fails.
    pub async fn record(&self, outcome: RequestOutcome) {
        let now = outcome.completed_at;
        let key = RollupKey::for_request(&outcome.endpoint, &outcome.method, now);
        let delta = RollupDelta {
            success: outcome.is_success(),
            response_time_ms: outcome.response_time_ms,
        };

        if let Err(e) = self.store.increment_rollup(&key, &delta, now).await {
            warn!(endpoint = %outcome.endpoint, error = %e, "Failed to update usage rollup");
        }

        let entry = self.log_entry(outcome);
        let request_id = entry.request_id.clone();
        if let Err(e) = self.store.insert_log(entry).await {
            warn!(request_id = %request_id, error = %e, "Failed to write request log");
        }
    }

    /// Record on a background task so the response is never delayed
    pub fn record_detached(self: &Arc<Self>, outcome: RequestOutcome) {
        let aggregator = Arc::clone(self);
        tokio::spawn(async move {
            aggregator.record(outcome).await;
        });
    }

    fn log_entry(&self, outcome: RequestOutcome) -> RequestLogEntry {
        let success = outcome.is_success();
        let version = extract_version(&outcome.endpoint)
            .unwrap_or(DEFAULT_VERSION)
            .to_string();

        RequestLogEntry {
            request_id: outcome.request_id,
            endpoint: outcome.endpoint,
            method: outcome.method,
            version,
            address: outcome.address,
            key: outcome.key,
            key_name: outcome.key_name,
            owner_id: outcome.owner_id,
            status_code: outcome.status_code,
            response_time_ms: outcome.response_time_ms,
            success,
            error: outcome
                .error
                .map(|text| truncate_error(&text, self.error_limit)),
            usage: outcome.usage,
            created_at: outcome.completed_at,
            expires_at: outcome.completed_at + self.retention,
        }
    }
}
