//! Response headers describing rate-limit and quota state

use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::auth::AuthContext;

/// Rate limit headers
pub const RATE_LIMIT_LIMIT: &str = "X-RateLimit-Limit";
pub const RATE_LIMIT_REMAINING: &str = "X-RateLimit-Remaining";
pub const RATE_LIMIT_RESET: &str = "X-RateLimit-Reset";
pub const RETRY_AFTER: &str = "Retry-After";

/// Daily quota headers
pub const QUOTA_LIMIT: &str = "X-Quota-Limit";
pub const QUOTA_USED: &str = "X-Quota-Used";
pub const QUOTA_REMAINING: &str = "X-Quota-Remaining";

pub const REQUEST_ID: &str = "X-Request-Id";

fn insert(headers: &mut HeaderMap, name: &str, value: String) {
    if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::try_from(value)) {
        headers.insert(name, value);
    }
}

/// Add rate-limit and quota headers for an authorized request
pub fn apply_auth_headers(headers: &mut HeaderMap, auth: &AuthContext) {
    if let Some(status) = auth.rate().status() {
        insert(headers, RATE_LIMIT_LIMIT, status.limit.to_string());
        insert(headers, RATE_LIMIT_REMAINING, status.remaining().to_string());
        insert(headers, RATE_LIMIT_RESET, status.reset_at.timestamp().to_string());
    }

    if let Some(usage) = auth.usage() {
        insert(headers, QUOTA_LIMIT, usage.daily_limit.to_string());
        insert(headers, QUOTA_USED, usage.usage_today.to_string());
        insert(headers, QUOTA_REMAINING, usage.remaining().to_string());
    }
}
