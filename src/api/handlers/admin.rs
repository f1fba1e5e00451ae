//! Administrative handlers, authenticated by the `X-Admin-Token` header

use actix_web::{http::StatusCode, web, HttpRequest, HttpResponse};
use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};
use utoipa::ToSchema;

use super::{error_body, service_error};
use crate::db::StoreResult;
use crate::maintenance::JobReport;
use crate::AppState;

pub const ADMIN_TOKEN_HEADER: &str = "X-Admin-Token";

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateOwnerRequest {
    pub username: String,
}

fn check_admin(req: &HttpRequest, state: &AppState) -> Result<(), HttpResponse> {
    let expected = state.settings.admin.token.as_str();
    if expected.is_empty() {
        return Err(error_body(
            StatusCode::NOT_FOUND,
            "not_found",
            "Admin endpoints are disabled",
        ));
    }

    let supplied = req
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if supplied != expected {
        warn!(path = %req.path(), "Rejected admin request");
        return Err(error_body(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "Valid X-Admin-Token header required",
        ));
    }
    Ok(())
}

/// POST /admin/owners - Register an owner and its default key
#[utoipa::path(
    post,
    path = "/admin/owners",
    tag = "admin",
    request_body = CreateOwnerRequest,
    responses(
        (status = 201, description = "Owner and default key created"),
        (status = 409, description = "Username taken", body = super::ErrorResponse)
    )
)]
pub async fn create_owner(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<CreateOwnerRequest>,
) -> HttpResponse {
    if let Err(response) = check_admin(&req, &state) {
        return response;
    }

    match state.keys.register_owner(&body.username).await {
        Ok((owner, key)) => HttpResponse::Created().json(serde_json::json!({
            "owner": owner,
            "key": key.token,
            "daily_limit": key.daily_limit,
        })),
        Err(e) => service_error(e),
    }
}

/// GET /admin/stats - Service-wide overview
#[utoipa::path(
    get,
    path = "/admin/stats",
    tag = "admin",
    responses((status = 200, description = "Owner, key and traffic totals"))
)]
pub async fn get_stats(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if let Err(response) = check_admin(&req, &state) {
        return response;
    }

    match state.keys.overview().await {
        Ok(overview) => HttpResponse::Ok().json(serde_json::json!({
            "overview": overview,
            "tracked_rate_limit_buckets": state.authorizer.limiter().len(),
        })),
        Err(e) => service_error(e),
    }
}

/// POST /admin/maintenance/{job} - Run a maintenance job now
#[utoipa::path(
    post,
    path = "/admin/maintenance/{job}",
    tag = "admin",
    params(("job" = String, Path, description = "daily-reset, expiry-sweep, reconcile or log-purge")),
    responses(
        (status = 200, description = "Job finished"),
        (status = 404, description = "Unknown job", body = super::ErrorResponse)
    )
)]
pub async fn run_maintenance(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    if let Err(response) = check_admin(&req, &state) {
        return response;
    }

    let jobs = &state.maintenance;
    let result: StoreResult<JobReport> = match path.as_str() {
        "daily-reset" => jobs.daily_reset().await,
        "expiry-sweep" => jobs.expiry_sweep(Utc::now()).await,
        "reconcile" => jobs.reconcile().await,
        "log-purge" => jobs.purge_logs(Utc::now()).await,
        other => {
            return error_body(
                StatusCode::NOT_FOUND,
                "not_found",
                &format!("Unknown maintenance job '{}'", other),
            )
        }
    };

    match result {
        Ok(report) => {
            info!(job = report.job, affected = report.affected, "Maintenance job run on demand");
            HttpResponse::Ok().json(report)
        }
        Err(e) => service_error(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::ADMIN_TOKEN_HEADER;
    use crate::api::testing::{test_app, TestContext, ADMIN_TOKEN};
    use actix_web::test;

    #[actix_web::test]
    async fn test_admin_requires_token() {
        let ctx = TestContext::new().await;
        let app = test::init_service(test_app(&ctx)).await;

        let req = test::TestRequest::get().uri("/admin/stats").to_request();
        assert_eq!(test::call_service(&app, req).await.status().as_u16(), 401);

        let req = test::TestRequest::get()
            .uri("/admin/stats")
            .insert_header((ADMIN_TOKEN_HEADER, ADMIN_TOKEN))
            .to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["overview"]["owners"], 1);
        assert_eq!(body["overview"]["keys"], 1);
    }

    #[actix_web::test]
    async fn test_register_owner_issues_working_key() {
        let ctx = TestContext::new().await;
        let app = test::init_service(test_app(&ctx)).await;

        let req = test::TestRequest::post()
            .uri("/admin/owners")
            .insert_header((ADMIN_TOKEN_HEADER, ADMIN_TOKEN))
            .set_json(serde_json::json!({ "username": "newcomer" }))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status().as_u16(), 201);
        let created: serde_json::Value = test::read_body_json(res).await;
        let key = created["key"].as_str().unwrap().to_string();

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/keys?apikey={}", key))
            .to_request();
        let listed: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(listed["keys"][0]["name"], "Default API Key");
    }

    #[actix_web::test]
    async fn test_maintenance_jobs_on_demand() {
        let ctx = TestContext::new().await;
        let app = test::init_service(test_app(&ctx)).await;

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/keys?apikey={}", ctx.token))
            .to_request();
        assert!(test::call_service(&app, req).await.status().is_success());

        let req = test::TestRequest::post()
            .uri("/admin/maintenance/daily-reset")
            .insert_header((ADMIN_TOKEN_HEADER, ADMIN_TOKEN))
            .to_request();
        let report: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(report["job"], "daily_reset");
        assert_eq!(report["affected"], 1);

        let req = test::TestRequest::post()
            .uri("/admin/maintenance/defragment")
            .insert_header((ADMIN_TOKEN_HEADER, ADMIN_TOKEN))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status().as_u16(), 404);
    }
}
