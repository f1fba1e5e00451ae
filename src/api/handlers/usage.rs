//! Usage statistics handlers

use actix_web::{web, HttpRequest, HttpResponse};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use super::{require_owner, service_error, ErrorResponse};
use crate::domain::UsageRollup;
use crate::AppState;

#[derive(Debug, Deserialize, IntoParams)]
pub struct RollupQuery {
    /// Day to report, `YYYY-MM-DD`; defaults to today (UTC)
    pub date: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RollupsResponse {
    pub date: NaiveDate,
    pub rollups: Vec<UsageRollup>,
    pub total_requests: u64,
}

/// GET /api/v1/usage - Summary for the caller's account
#[utoipa::path(
    get,
    path = "/api/v1/usage",
    tag = "usage",
    params(("apikey" = String, Query, description = "Caller's API key")),
    responses(
        (status = 200, description = "Call totals, key counts and banned addresses for the caller")
    )
)]
pub async fn get_usage_summary(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let owner_id = match require_owner(&req) {
        Ok(id) => id,
        Err(response) => return response,
    };

    match state.keys.owner_summary(owner_id).await {
        Ok(summary) => HttpResponse::Ok().json(summary),
        Err(e) => service_error(e),
    }
}

/// GET /api/v1/usage/rollups - Per-endpoint counters for one day
#[utoipa::path(
    get,
    path = "/api/v1/usage/rollups",
    tag = "usage",
    params(RollupQuery, ("apikey" = String, Query, description = "Caller's API key")),
    responses(
        (status = 200, description = "Rollups for the day", body = RollupsResponse),
        (status = 400, description = "Malformed date", body = ErrorResponse),
        (status = 403, description = "Caller is not a registered key owner", body = ErrorResponse)
    )
)]
pub async fn get_rollups(
    req: HttpRequest,
    state: web::Data<AppState>,
    query: web::Query<RollupQuery>,
) -> HttpResponse {
    if let Err(response) = require_owner(&req) {
        return response;
    }

    let date = match query.date.as_deref() {
        None => Utc::now().date_naive(),
        Some(raw) => match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            Ok(date) => date,
            Err(_) => {
                return HttpResponse::BadRequest().json(ErrorResponse {
                    error: "invalid_request".to_string(),
                    message: format!("date '{}' is not YYYY-MM-DD", raw),
                })
            }
        },
    };

    match state.keys.rollups(date).await {
        Ok(rollups) => {
            let total_requests = rollups.iter().map(|r| r.total_requests).sum();
            HttpResponse::Ok().json(RollupsResponse {
                date,
                rollups,
                total_requests,
            })
        }
        Err(e) => service_error(e),
    }
}

#[cfg(test)]
mod tests {
    use crate::api::testing::{test_app, TestContext};
    use actix_web::test;

    #[actix_web::test]
    async fn test_summary_counts_calls() {
        let ctx = TestContext::new().await;
        let app = test::init_service(test_app(&ctx)).await;

        for _ in 0..2 {
            let req = test::TestRequest::get()
                .uri(&format!("/api/v1/usage?apikey={}", ctx.token))
                .to_request();
            test::call_service(&app, req).await;
        }

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/usage?apikey={}", ctx.token))
            .to_request();
        let summary: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(summary["owner"]["total_api_calls"], 3);
        assert_eq!(summary["usage_today"], 3);
        assert_eq!(summary["total_keys"], 1);
    }

    #[actix_web::test]
    async fn test_rollups_reject_bad_date() {
        let ctx = TestContext::new().await;
        let app = test::init_service(test_app(&ctx)).await;

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/usage/rollups?date=yesterday&apikey={}", ctx.token))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status().as_u16(), 400);

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/usage/rollups?date=2020-01-01&apikey={}", ctx.token))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["total_requests"], 0);
    }

    #[actix_web::test]
    async fn test_rollups_never_expose_another_owners_token() {
        let ctx = TestContext::new().await;
        let app = test::init_service(test_app(&ctx)).await;
        let (_, other) = ctx.state.keys.register_owner("other").await.unwrap();

        for path in ["stats", "ips"] {
            let req = test::TestRequest::get()
                .uri(&format!("/api/v1/keys/{0}/{1}?apikey={0}", ctx.token, path))
                .to_request();
            assert!(test::call_service(&app, req).await.status().is_success());
        }

        // Usage is recorded off the request path
        let mut body = serde_json::Value::Null;
        for _ in 0..50 {
            let req = test::TestRequest::get()
                .uri(&format!("/api/v1/usage/rollups?apikey={}", other.token))
                .to_request();
            body = test::call_and_read_body_json(&app, req).await;
            if body["total_requests"].as_u64().unwrap_or(0) >= 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let text = body.to_string();
        assert!(text.contains("/api/v1/keys/{key}/stats"));
        assert!(!text.contains(&ctx.token));
    }
}
