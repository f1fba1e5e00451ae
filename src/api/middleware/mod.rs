//! API Middleware Module
//!
//! Authorization, rate limiting and usage tracking for the keygate API.

pub mod request;
pub mod service;
pub mod span;

pub use request::{
    extract_api_key, extract_client_ip, extract_endpoint, extract_request_id, API_KEY_PARAM,
};
pub use service::ApiMiddleware;
pub use span::RedactedRootSpan;
