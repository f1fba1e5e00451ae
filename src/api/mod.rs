//! API module - HTTP routes and handlers

pub mod handlers;
pub mod headers;
pub mod middleware;
pub mod openapi;

use actix_web::web;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api::openapi::ApiDoc;

/// Configure all API routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            // API key management endpoints
            .service(
                web::scope("/keys")
                    .route("", web::get().to(handlers::keys::list_keys))
                    .route("", web::post().to(handlers::keys::create_key))
                    .route("/{key}", web::put().to(handlers::keys::update_key))
                    .route("/{key}", web::delete().to(handlers::keys::delete_key))
                    .route("/{key}/ban-ip", web::post().to(handlers::keys::ban_ip))
                    .route("/{key}/unban-ip", web::post().to(handlers::keys::unban_ip))
                    .route("/{key}/ips", web::get().to(handlers::keys::list_ips))
                    .route("/{key}/stats", web::get().to(handlers::keys::key_stats))
            )
            // Usage statistics endpoints
            .service(
                web::scope("/usage")
                    .route("", web::get().to(handlers::usage::get_usage_summary))
                    .route("/rollups", web::get().to(handlers::usage::get_rollups))
            )
    )
    .service(
        web::scope("/admin")
            .route("/owners", web::post().to(handlers::admin::create_owner))
            .route("/stats", web::get().to(handlers::admin::get_stats))
            .route("/maintenance/{job}", web::post().to(handlers::admin::run_maintenance))
    )
    .route("/health", web::get().to(handlers::health::health_check))
    // Swagger UI and OpenAPI spec
    .service(
        SwaggerUi::new("/swagger-ui/{_:.*}")
            .url("/api-docs/openapi.json", ApiDoc::openapi())
    );
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for handler tests: an in-memory app with one owner

    use actix_web::body::MessageBody;
    use actix_web::dev::{ServiceFactory, ServiceRequest, ServiceResponse};
    use actix_web::{web, App};
    use std::sync::Arc;

    use crate::config::Settings;
    use crate::db::{MemoryKeyStore, MemoryUsageStore};
    use crate::AppState;

    pub const ADMIN_TOKEN: &str = "test-admin-token";

    pub struct TestContext {
        pub state: web::Data<AppState>,
        /// Default key of the seeded owner
        pub token: String,
    }

    impl TestContext {
        pub async fn new() -> Self {
            let mut settings = Settings::default();
            settings.admin.token = ADMIN_TOKEN.to_string();

            let state = AppState::new(
                settings,
                Arc::new(MemoryKeyStore::new()),
                Arc::new(MemoryUsageStore::default()),
                "memory",
            );
            let (_, key) = state.keys.register_owner("tester").await.unwrap();

            Self {
                state: web::Data::new(state),
                token: key.token,
            }
        }
    }

    pub fn test_app(
        ctx: &TestContext,
    ) -> App<
        impl ServiceFactory<
            ServiceRequest,
            Config = (),
            Response = ServiceResponse<impl MessageBody>,
            Error = actix_web::Error,
            InitError = (),
        >,
    > {
        App::new()
            .app_data(ctx.state.clone())
            .wrap(ctx.state.middleware())
            .configure(super::configure_routes)
    }
}
