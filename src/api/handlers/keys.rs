//! API Key Management Handlers
//!
//! Owners manage their own keys with any of their keys. Keys belonging to
//! another owner read as not found.

use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::{require_owner, service_error};
use crate::domain::{ApiKeyRecord, IpRecord, KeyStatus, KeyUpdate};
use crate::AppState;

/// Request to create a new API key
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct CreateKeyRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub daily_limit: Option<u32>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BanRequest {
    pub address: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// API key as returned to its owner
#[derive(Debug, Serialize, ToSchema)]
pub struct KeyResponse {
    pub key: String,
    pub name: String,
    pub status: KeyStatus,
    pub daily_limit: u32,
    pub usage_today: u32,
    pub total_usage: u64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub tracked_addresses: usize,
}

impl KeyResponse {
    fn from_record(record: &ApiKeyRecord, now: DateTime<Utc>) -> Self {
        Self {
            key: record.token.clone(),
            name: record.name.clone(),
            status: record.status,
            daily_limit: record.daily_limit,
            usage_today: record.usage_today_at(now),
            total_usage: record.total_usage,
            created_at: record.created_at,
            last_used_at: record.last_used_at,
            expires_at: record.expires_at,
            tracked_addresses: record.ips.len(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ListKeysResponse {
    pub keys: Vec<KeyResponse>,
    pub count: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct IpResponse {
    pub address: String,
    pub endpoints: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub banned: bool,
    pub ban_reason: Option<String>,
}

impl From<IpRecord> for IpResponse {
    fn from(record: IpRecord) -> Self {
        Self {
            endpoints: record.endpoints.to_vec(),
            address: record.address,
            first_seen: record.first_seen,
            last_seen: record.last_seen,
            banned: record.banned,
            ban_reason: record.ban_reason,
        }
    }
}

/// GET /api/v1/keys - List the caller's keys
#[utoipa::path(
    get,
    path = "/api/v1/keys",
    tag = "keys",
    params(("apikey" = String, Query, description = "Caller's API key")),
    responses(
        (status = 200, description = "Keys owned by the caller", body = ListKeysResponse),
        (status = 403, description = "Key cannot manage keys")
    )
)]
pub async fn list_keys(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let owner_id = match require_owner(&req) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.keys.list_keys(owner_id).await {
        Ok(records) => {
            let now = Utc::now();
            let keys: Vec<KeyResponse> = records
                .iter()
                .map(|record| KeyResponse::from_record(record, now))
                .collect();
            let count = keys.len();
            HttpResponse::Ok().json(ListKeysResponse { keys, count })
        }
        Err(e) => service_error(e),
    }
}

/// POST /api/v1/keys - Create a key for the caller
#[utoipa::path(
    post,
    path = "/api/v1/keys",
    tag = "keys",
    params(("apikey" = String, Query, description = "Caller's API key")),
    request_body = CreateKeyRequest,
    responses(
        (status = 201, description = "Key created", body = KeyResponse),
        (status = 400, description = "Invalid name or limit", body = super::ErrorResponse)
    )
)]
pub async fn create_key(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: Option<web::Json<CreateKeyRequest>>,
) -> HttpResponse {
    let owner_id = match require_owner(&req) {
        Ok(id) => id,
        Err(response) => return response,
    };
    let body = body.map(|b| b.into_inner()).unwrap_or_default();

    match state
        .keys
        .create_key(owner_id, body.name.as_deref(), body.daily_limit)
        .await
    {
        Ok(record) => HttpResponse::Created().json(KeyResponse::from_record(&record, Utc::now())),
        Err(e) => service_error(e),
    }
}

/// PUT /api/v1/keys/{key} - Edit name, daily limit or status
#[utoipa::path(
    put,
    path = "/api/v1/keys/{key}",
    tag = "keys",
    params(
        ("key" = String, Path, description = "Key to edit"),
        ("apikey" = String, Query, description = "Caller's API key")
    ),
    request_body = KeyUpdate,
    responses(
        (status = 200, description = "Key updated", body = KeyResponse),
        (status = 404, description = "Key not found", body = super::ErrorResponse)
    )
)]
pub async fn update_key(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<KeyUpdate>,
) -> HttpResponse {
    let owner_id = match require_owner(&req) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state
        .keys
        .update_key(owner_id, &path.into_inner(), body.into_inner())
        .await
    {
        Ok(record) => HttpResponse::Ok().json(KeyResponse::from_record(&record, Utc::now())),
        Err(e) => service_error(e),
    }
}

/// DELETE /api/v1/keys/{key}
#[utoipa::path(
    delete,
    path = "/api/v1/keys/{key}",
    tag = "keys",
    params(
        ("key" = String, Path, description = "Key to delete"),
        ("apikey" = String, Query, description = "Caller's API key")
    ),
    responses(
        (status = 204, description = "Key deleted"),
        (status = 404, description = "Key not found", body = super::ErrorResponse)
    )
)]
pub async fn delete_key(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    let owner_id = match require_owner(&req) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.keys.delete_key(owner_id, &path.into_inner()).await {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(e) => service_error(e),
    }
}

/// POST /api/v1/keys/{key}/ban-ip
#[utoipa::path(
    post,
    path = "/api/v1/keys/{key}/ban-ip",
    tag = "keys",
    params(
        ("key" = String, Path, description = "Key the ban applies to"),
        ("apikey" = String, Query, description = "Caller's API key")
    ),
    request_body = BanRequest,
    responses(
        (status = 200, description = "Address banned", body = IpResponse),
        (status = 404, description = "Key not found", body = super::ErrorResponse)
    )
)]
pub async fn ban_ip(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<BanRequest>,
) -> HttpResponse {
    let owner_id = match require_owner(&req) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state
        .keys
        .ban_ip(owner_id, &path.into_inner(), &body.address, body.reason.as_deref())
        .await
    {
        Ok(record) => HttpResponse::Ok().json(IpResponse::from(record)),
        Err(e) => service_error(e),
    }
}

/// POST /api/v1/keys/{key}/unban-ip
#[utoipa::path(
    post,
    path = "/api/v1/keys/{key}/unban-ip",
    tag = "keys",
    params(
        ("key" = String, Path, description = "Key the ban applies to"),
        ("apikey" = String, Query, description = "Caller's API key")
    ),
    request_body = BanRequest,
    responses(
        (status = 200, description = "Address unbanned", body = IpResponse),
        (status = 404, description = "Key or address not found", body = super::ErrorResponse)
    )
)]
pub async fn unban_ip(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<BanRequest>,
) -> HttpResponse {
    let owner_id = match require_owner(&req) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state
        .keys
        .unban_ip(owner_id, &path.into_inner(), &body.address)
        .await
    {
        Ok(Some(record)) => HttpResponse::Ok().json(IpResponse::from(record)),
        Ok(None) => HttpResponse::NotFound().json(serde_json::json!({
            "error": "not_found",
            "message": format!("Address {} has not been seen on this key", body.address)
        })),
        Err(e) => service_error(e),
    }
}

/// GET /api/v1/keys/{key}/ips
#[utoipa::path(
    get,
    path = "/api/v1/keys/{key}/ips",
    tag = "keys",
    params(
        ("key" = String, Path, description = "Key to inspect"),
        ("apikey" = String, Query, description = "Caller's API key")
    ),
    responses(
        (status = 200, description = "Addresses seen on the key", body = [IpResponse])
    )
)]
pub async fn list_ips(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    let owner_id = match require_owner(&req) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.keys.list_ips(owner_id, &path.into_inner()).await {
        Ok(ips) => {
            let ips: Vec<IpResponse> = ips.into_iter().map(IpResponse::from).collect();
            HttpResponse::Ok().json(ips)
        }
        Err(e) => service_error(e),
    }
}

/// GET /api/v1/keys/{key}/stats
#[utoipa::path(
    get,
    path = "/api/v1/keys/{key}/stats",
    tag = "keys",
    params(
        ("key" = String, Path, description = "Key to inspect"),
        ("apikey" = String, Query, description = "Caller's API key")
    ),
    responses(
        (status = 200, description = "Usage, addresses and recent requests for the key")
    )
)]
pub async fn key_stats(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    let owner_id = match require_owner(&req) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.keys.key_stats(owner_id, &path.into_inner()).await {
        Ok(stats) => HttpResponse::Ok().json(stats),
        Err(e) => service_error(e),
    }
}

#[cfg(test)]
mod tests {
    use crate::api::testing::{test_app, TestContext};
    use actix_web::test;

    #[actix_web::test]
    async fn test_create_list_and_delete() {
        let ctx = TestContext::new().await;
        let app = test::init_service(test_app(&ctx)).await;

        let req = test::TestRequest::post()
            .uri(&format!("/api/v1/keys?apikey={}", ctx.token))
            .set_json(serde_json::json!({ "name": "worker", "daily_limit": 25 }))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status().as_u16(), 201);
        let created: serde_json::Value = test::read_body_json(res).await;
        assert_eq!(created["name"], "worker");
        assert_eq!(created["daily_limit"], 25);
        let new_key = created["key"].as_str().unwrap().to_string();

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/keys?apikey={}", ctx.token))
            .to_request();
        let listed: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(listed["count"], 2);

        let req = test::TestRequest::delete()
            .uri(&format!("/api/v1/keys/{}?apikey={}", new_key, ctx.token))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status().as_u16(), 204);
    }

    #[actix_web::test]
    async fn test_invalid_limit_is_rejected() {
        let ctx = TestContext::new().await;
        let app = test::init_service(test_app(&ctx)).await;

        let req = test::TestRequest::put()
            .uri(&format!("/api/v1/keys/{}?apikey={}", ctx.token, ctx.token))
            .set_json(serde_json::json!({ "daily_limit": 0 }))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status().as_u16(), 400);
    }

    #[actix_web::test]
    async fn test_ban_blocks_address_then_unban_restores() {
        let ctx = TestContext::new().await;
        let app = test::init_service(test_app(&ctx)).await;

        let req = test::TestRequest::post()
            .uri(&format!("/api/v1/keys/{}/ban-ip?apikey={}", ctx.token, ctx.token))
            .insert_header(("X-Forwarded-For", "8.8.8.8"))
            .set_json(serde_json::json!({ "address": "1.2.3.4", "reason": "abuse" }))
            .to_request();
        let banned: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(banned["banned"], true);

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/keys?apikey={}", ctx.token))
            .insert_header(("X-Forwarded-For", "1.2.3.4"))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status().as_u16(), 403);
        let body: serde_json::Value = test::read_body_json(res).await;
        assert_eq!(body["error"], "banned_ip");

        let req = test::TestRequest::post()
            .uri(&format!("/api/v1/keys/{}/unban-ip?apikey={}", ctx.token, ctx.token))
            .insert_header(("X-Forwarded-For", "8.8.8.8"))
            .set_json(serde_json::json!({ "address": "1.2.3.4" }))
            .to_request();
        let unbanned: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(unbanned["banned"], false);

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/keys/{}/ips?apikey={}", ctx.token, ctx.token))
            .insert_header(("X-Forwarded-For", "1.2.3.4"))
            .to_request();
        let ips: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(ips.as_array().unwrap().len(), 2);
    }

    #[actix_web::test]
    async fn test_stats_reports_usage() {
        let ctx = TestContext::new().await;
        let app = test::init_service(test_app(&ctx)).await;

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/keys/{}/stats?apikey={}", ctx.token, ctx.token))
            .to_request();
        let stats: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(stats["usage"]["usage_today"], 1);
        assert_eq!(stats["status"], "active");
    }
}
