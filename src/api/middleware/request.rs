//! Request attribute extraction: API key, client address, request id, endpoint

use actix_web::dev::ServiceRequest;
use uuid::Uuid;

use crate::api::headers::REQUEST_ID;

/// Query parameter carrying the API key
pub const API_KEY_PARAM: &str = "apikey";

/// Address used when none can be resolved
pub const UNKNOWN_ADDRESS: &str = "unknown";

/// API key from the `apikey` query parameter
pub fn extract_api_key(query: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == API_KEY_PARAM)
        .map(|(_, value)| value.into_owned())
}

/// Client address: first X-Forwarded-For entry, then X-Real-IP, then the peer
pub fn extract_client_ip(req: &ServiceRequest) -> String {
    // X-Forwarded-For may contain multiple IPs, take the first (client)
    if let Some(forwarded) = req.headers().get("X-Forwarded-For") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            if let Some(first_ip) = forwarded_str.split(',').next() {
                let first_ip = first_ip.trim();
                if !first_ip.is_empty() {
                    return first_ip.to_string();
                }
            }
        }
    }

    if let Some(real_ip) = req.headers().get("X-Real-IP") {
        if let Ok(ip_str) = real_ip.to_str() {
            let ip_str = ip_str.trim();
            if !ip_str.is_empty() {
                return ip_str.to_string();
            }
        }
    }

    req.peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_ADDRESS.to_string())
}

/// Endpoint label recorded for requests that match no route
pub const UNMATCHED_ENDPOINT: &str = "unmatched";

/// Route pattern the request matched, e.g. `/api/v1/keys/{key}/stats`.
///
/// Telemetry and logs use this rather than the raw path, which can carry an API key.
pub fn extract_endpoint(req: &ServiceRequest) -> String {
    req.match_pattern()
        .unwrap_or_else(|| UNMATCHED_ENDPOINT.to_string())
}

/// Caller-supplied request id, or a fresh one
pub fn extract_request_id(req: &ServiceRequest) -> String {
    req.headers()
        .get(REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty() && value.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}
