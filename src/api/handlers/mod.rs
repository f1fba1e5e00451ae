//! HTTP request handlers

pub mod admin;
pub mod health;
pub mod keys;
pub mod usage;

use actix_web::{HttpMessage, HttpRequest, HttpResponse};
use serde::Serialize;
use tracing::error;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::keys::KeyServiceError;

/// Error body returned by management endpoints
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

pub(crate) fn error_body(status: actix_web::http::StatusCode, error: &str, message: &str) -> HttpResponse {
    HttpResponse::build(status).json(ErrorResponse {
        error: error.to_string(),
        message: message.to_string(),
    })
}

/// Owner of the key that authorized this request
///
/// Legacy keys have no owner and cannot manage keys.
pub(crate) fn require_owner(req: &HttpRequest) -> Result<Uuid, HttpResponse> {
    match req.extensions().get::<AuthContext>() {
        Some(auth) => auth.owner_id().ok_or_else(|| {
            HttpResponse::Forbidden().json(ErrorResponse {
                error: "forbidden".to_string(),
                message: "This key cannot manage API keys".to_string(),
            })
        }),
        None => Err(HttpResponse::Unauthorized().json(ErrorResponse {
            error: "unauthorized".to_string(),
            message: "API key required".to_string(),
        })),
    }
}

pub(crate) fn service_error(e: KeyServiceError) -> HttpResponse {
    use actix_web::http::StatusCode;

    match &e {
        KeyServiceError::Invalid(message) => error_body(StatusCode::BAD_REQUEST, "invalid_request", message),
        KeyServiceError::KeyNotFound | KeyServiceError::OwnerNotFound => {
            error_body(StatusCode::NOT_FOUND, "not_found", &e.to_string())
        }
        KeyServiceError::Conflict(message) => error_body(StatusCode::CONFLICT, "conflict", message),
        KeyServiceError::Store(inner) => {
            error!(error = %inner, "Storage failure in management endpoint");
            error_body(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Storage temporarily unavailable",
            )
        }
    }
}
