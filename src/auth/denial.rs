//! Authorization denials and their HTTP rendering

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use chrono::{DateTime, Utc};
use std::fmt;

use crate::api::headers::{RATE_LIMIT_LIMIT, RATE_LIMIT_REMAINING, RATE_LIMIT_RESET, RETRY_AFTER};
use crate::limiter::RateLimitStatus;

/// Why a request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialKind {
    MissingKey,
    InvalidKey,
    InactiveKey,
    BannedIp,
    QuotaExceeded,
    RateLimited,
    StorageFailure,
}

impl DenialKind {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DenialKind::MissingKey => StatusCode::UNAUTHORIZED,
            DenialKind::InvalidKey | DenialKind::InactiveKey | DenialKind::BannedIp => {
                StatusCode::FORBIDDEN
            }
            DenialKind::QuotaExceeded | DenialKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            DenialKind::StorageFailure => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value of the `error` field in the response body
    pub fn code(&self) -> &'static str {
        match self {
            DenialKind::MissingKey => "missing_key",
            DenialKind::InvalidKey => "invalid_key",
            DenialKind::InactiveKey => "inactive_key",
            DenialKind::BannedIp => "banned_ip",
            DenialKind::QuotaExceeded => "quota_exceeded",
            DenialKind::RateLimited => "rate_limited",
            DenialKind::StorageFailure => "internal_error",
        }
    }
}

impl fmt::Display for DenialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A refused request, with enough context to render the response
#[derive(Debug, Clone, PartialEq)]
pub struct Denial {
    pub kind: DenialKind,
    pub message: String,
    /// Machine-readable detail, e.g. the actual key status
    pub detail: Option<String>,
    pub reset_time: Option<DateTime<Utc>>,
    pub reset_in: Option<u64>,
    pub rate_limit: Option<RateLimitStatus>,
}

impl Denial {
    pub fn new(kind: DenialKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            detail: None,
            reset_time: None,
            reset_in: None,
            rate_limit: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn missing_key() -> Self {
        Self::new(
            DenialKind::MissingKey,
            "API key required. Provide it with the apikey query parameter",
        )
    }

    pub fn invalid_key() -> Self {
        Self::new(DenialKind::InvalidKey, "Invalid API key")
    }

    pub fn inactive_key(detail: &str) -> Self {
        Self::new(DenialKind::InactiveKey, format!("API key is {}", detail)).with_detail(detail)
    }

    pub fn banned_ip(address: &str) -> Self {
        Self::new(
            DenialKind::BannedIp,
            format!("Address {} is banned for this API key", address),
        )
    }

    pub fn quota_exceeded(daily_limit: u32, reset_time: DateTime<Utc>) -> Self {
        Self {
            reset_time: Some(reset_time),
            ..Self::new(
                DenialKind::QuotaExceeded,
                format!("Daily limit of {} requests reached", daily_limit),
            )
        }
    }

    pub fn rate_limited(status: RateLimitStatus, now: DateTime<Utc>) -> Self {
        let reset_in = status.reset_in_secs(now);
        Self {
            reset_in: Some(reset_in),
            rate_limit: Some(status),
            ..Self::new(
                DenialKind::RateLimited,
                format!(
                    "Too many requests. Maximum {} per window, retry in {} seconds",
                    status.limit, reset_in
                ),
            )
        }
    }

    /// Internal detail stays in the server log, never in the body
    pub fn storage_failure() -> Self {
        Self::new(
            DenialKind::StorageFailure,
            "Unable to verify API key, please retry later",
        )
    }

    /// Seconds a client should wait before retrying, for 429 responses
    pub fn retry_after(&self, now: DateTime<Utc>) -> Option<u64> {
        if let Some(secs) = self.reset_in {
            return Some(secs.max(1));
        }
        self.reset_time
            .map(|at| (at - now).num_seconds().max(1) as u64)
    }

    pub fn to_response(&self, creator: &str) -> HttpResponse {
        self.to_response_at(creator, Utc::now())
    }

    pub fn to_response_at(&self, creator: &str, now: DateTime<Utc>) -> HttpResponse {
        let mut body = serde_json::json!({
            "status": false,
            "creator": creator,
            "error": self.kind.code(),
            "message": self.message,
        });
        if let Some(detail) = &self.detail {
            body["detail"] = serde_json::json!(detail);
        }
        if let Some(reset_time) = self.reset_time {
            body["resetTime"] = serde_json::json!(reset_time.to_rfc3339());
        }
        if let Some(reset_in) = self.reset_in {
            body["resetIn"] = serde_json::json!(reset_in);
        }

        let mut response = HttpResponse::build(self.kind.status_code());
        if let Some(retry) = self.retry_after(now) {
            response.insert_header((RETRY_AFTER, retry.to_string()));
        }
        if let Some(status) = &self.rate_limit {
            response
                .insert_header((RATE_LIMIT_LIMIT, status.limit.to_string()))
                .insert_header((RATE_LIMIT_REMAINING, "0"))
                .insert_header((RATE_LIMIT_RESET, status.reset_at.timestamp().to_string()));
        }
        response.json(body)
    }
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
