//! OpenAPI 3.0 specification definition

use utoipa::OpenApi;

use crate::api::handlers::{
    admin::CreateOwnerRequest,
    health::HealthResponse,
    keys::{BanRequest, CreateKeyRequest, IpResponse, KeyResponse, ListKeysResponse},
    usage::RollupsResponse,
    ErrorResponse,
};
use crate::domain::{KeyStatus, KeyUpdate, UsageRollup, UsageSnapshot};

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Keygate API",
        version = "1.0.0",
        description = "API key authorization, quota enforcement and usage telemetry",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    ),
    servers(
        (url = "/", description = "Current server")
    ),
    tags(
        (name = "system", description = "System health and status endpoints"),
        (name = "keys", description = "API key management for key owners"),
        (name = "usage", description = "Usage statistics"),
        (name = "admin", description = "Administrative endpoints (X-Admin-Token)")
    ),
    paths(
        crate::api::handlers::health::health_check,
        crate::api::handlers::keys::list_keys,
        crate::api::handlers::keys::create_key,
        crate::api::handlers::keys::update_key,
        crate::api::handlers::keys::delete_key,
        crate::api::handlers::keys::ban_ip,
        crate::api::handlers::keys::unban_ip,
        crate::api::handlers::keys::list_ips,
        crate::api::handlers::keys::key_stats,
        crate::api::handlers::usage::get_usage_summary,
        crate::api::handlers::usage::get_rollups,
        crate::api::handlers::admin::create_owner,
        crate::api::handlers::admin::get_stats,
        crate::api::handlers::admin::run_maintenance,
    ),
    components(
        schemas(
            HealthResponse,
            ErrorResponse,
            // Key schemas
            CreateKeyRequest,
            BanRequest,
            KeyResponse,
            ListKeysResponse,
            IpResponse,
            KeyUpdate,
            KeyStatus,
            UsageSnapshot,
            // Usage schemas
            RollupsResponse,
            UsageRollup,
            // Admin schemas
            CreateOwnerRequest,
        )
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_lists_key_routes() {
        let doc = ApiDoc::openapi();
        let paths: Vec<&String> = doc.paths.paths.keys().collect();
        assert!(paths.iter().any(|p| p.as_str() == "/api/v1/keys/{key}/ban-ip"));
        assert!(paths.iter().any(|p| p.as_str() == "/admin/maintenance/{job}"));
    }
}
