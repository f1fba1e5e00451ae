//! Usage telemetry records: rollup counters and short-lived audit entries

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::api_key::UsageSnapshot;

/// Version label used when the path carries none
pub const DEFAULT_VERSION: &str = "v1";

/// Unique identity of one rollup row
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RollupKey {
    pub date: NaiveDate,
    pub endpoint: String,
    pub method: String,
    pub version: String,
}

impl RollupKey {
    pub fn for_request(endpoint: &str, method: &str, at: DateTime<Utc>) -> Self {
        Self {
            date: at.date_naive(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
            version: extract_version(endpoint).unwrap_or(DEFAULT_VERSION).to_string(),
        }
    }
}

/// Amount added to a rollup by one completed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollupDelta {
    pub success: bool,
    pub response_time_ms: u64,
}

/// Aggregate counters per (date, endpoint, method, version)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct UsageRollup {
    pub date: NaiveDate,
    pub endpoint: String,
    pub method: String,
    pub version: String,
    pub total_requests: u64,
    pub success_requests: u64,
    pub failed_requests: u64,
    pub total_response_time_ms: u64,
    pub updated_at: DateTime<Utc>,
}

impl UsageRollup {
    pub fn empty(key: &RollupKey, now: DateTime<Utc>) -> Self {
        Self {
            date: key.date,
            endpoint: key.endpoint.clone(),
            method: key.method.clone(),
            version: key.version.clone(),
            total_requests: 0,
            success_requests: 0,
            failed_requests: 0,
            total_response_time_ms: 0,
            updated_at: now,
        }
    }

    pub fn apply(&mut self, delta: &RollupDelta, now: DateTime<Utc>) {
        self.total_requests += 1;
        if delta.success {
            self.success_requests += 1;
        } else {
            self.failed_requests += 1;
        }
        self.total_response_time_ms += delta.response_time_ms;
        self.updated_at = now;
    }

    pub fn average_response_ms(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.total_response_time_ms as f64 / self.total_requests as f64
        }
    }
}

/// Immutable audit record of one completed request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLogEntry {
    pub request_id: String,
    pub endpoint: String,
    pub method: String,
    pub version: String,
    pub address: String,
    pub key: Option<String>,
    pub key_name: Option<String>,
    pub owner_id: Option<Uuid>,
    pub status_code: u16,
    pub response_time_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    pub usage: Option<UsageSnapshot>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RequestLogEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// `v1`..`v5` when the path starts with `/vN/`
pub fn extract_version(path: &str) -> Option<&str> {
    let rest = path.strip_prefix('/')?;
    let (segment, _) = rest.split_once('/')?;
    match segment {
        "v1" | "v2" | "v3" | "v4" | "v5" => Some(segment),
        _ => None,
    }
}

/// Cut error text to at most `limit` characters
pub fn truncate_error(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_extract_version() {
        assert_eq!(extract_version("/v2/images/generate"), Some("v2"));
        assert_eq!(extract_version("/v5/x"), Some("v5"));
        assert_eq!(extract_version("/v6/x"), None);
        assert_eq!(extract_version("/v1"), None);
        assert_eq!(extract_version("/api/v1/keys"), None);
    }

    #[test]
    fn test_rollup_key_defaults_version() {
        let now = Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap();
        let key = RollupKey::for_request("/maker/brat", "GET", now);
        assert_eq!(key.version, DEFAULT_VERSION);
        assert_eq!(key.date, NaiveDate::from_ymd_opt(2026, 5, 4).unwrap());
    }

    #[test]
    fn test_rollup_apply() {
        let now = Utc::now();
        let key = RollupKey::for_request("/v1/x", "GET", now);
        let mut rollup = UsageRollup::empty(&key, now);
        rollup.apply(&RollupDelta { success: true, response_time_ms: 30 }, now);
        rollup.apply(&RollupDelta { success: false, response_time_ms: 10 }, now);

        assert_eq!(rollup.total_requests, 2);
        assert_eq!(rollup.success_requests, 1);
        assert_eq!(rollup.failed_requests, 1);
        assert_eq!(rollup.average_response_ms(), 20.0);
    }

    #[test]
    fn test_truncate_error_counts_chars() {
        assert_eq!(truncate_error("héllo wörld", 5), "héllo");
        assert_eq!(truncate_error("short", 500), "short");
    }
}
