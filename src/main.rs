//! Keygate
//!
//! API key authorization, daily quota enforcement and usage telemetry
//! service using Rust + Actix-Web.

use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use tracing_actix_web::TracingLogger;

mod api;
mod auth;
mod config;
mod db;
mod domain;
mod keys;
mod limiter;
mod maintenance;
mod usage;

use crate::api::middleware::{ApiMiddleware, RedactedRootSpan};
use crate::auth::{LegacyKeys, RequestAuthorizer};
use crate::config::Settings;
use crate::db::{DbPool, KeyStore, MemoryKeyStore, MemoryUsageStore, PgKeyStore, PgUsageStore, UsageStore};
use crate::keys::KeyService;
use crate::limiter::RateLimiterCache;
use crate::maintenance::MaintenanceJobs;
use crate::usage::UsageAggregator;

/// Application state shared across all handlers
pub struct AppState {
    pub settings: Settings,
    pub authorizer: Arc<RequestAuthorizer>,
    pub aggregator: Arc<UsageAggregator>,
    pub keys: KeyService,
    pub maintenance: Arc<MaintenanceJobs>,
    /// `postgres` or `memory`
    pub storage: &'static str,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        settings: Settings,
        key_store: Arc<dyn KeyStore>,
        usage_store: Arc<dyn UsageStore>,
        storage: &'static str,
    ) -> Self {
        let limiter = RateLimiterCache::new(settings.auth.key_rate(), settings.auth.max_tracked_clients);
        let legacy = LegacyKeys::new(settings.legacy_keys.clone());
        let authorizer = Arc::new(RequestAuthorizer::new(
            key_store.clone(),
            limiter,
            legacy,
            settings.auth.quota_reset_hint,
        ));
        let aggregator = Arc::new(UsageAggregator::new(usage_store.clone(), &settings.usage));
        let keys = KeyService::new(key_store.clone(), usage_store.clone(), &settings);
        let maintenance = Arc::new(MaintenanceJobs::new(key_store, usage_store));

        Self {
            settings,
            authorizer,
            aggregator,
            keys,
            maintenance,
            storage,
            started_at: Instant::now(),
        }
    }

    /// Build the per-worker authorization middleware
    pub fn middleware(&self) -> ApiMiddleware {
        ApiMiddleware::new(
            self.authorizer.clone(),
            self.aggregator.clone(),
            &self.settings.auth,
        )
    }
}

/// Pick PostgreSQL when a database URL is configured, in-memory stores otherwise
async fn open_stores(
    settings: &Settings,
) -> anyhow::Result<(Arc<dyn KeyStore>, Arc<dyn UsageStore>, &'static str)> {
    if settings.database.url.is_empty() {
        warn!("No database URL configured, running with in-memory stores");
        return Ok((
            Arc::new(MemoryKeyStore::new()),
            Arc::new(MemoryUsageStore::default()),
            "memory",
        ));
    }

    let pool = DbPool::new(&settings.database.url, settings.database.max_connections)
        .context("Failed to create database pool")?;
    pool.test_connection()
        .await
        .context("Database connection test failed")?;
    pool.ensure_schema()
        .await
        .context("Failed to create database schema")?;
    info!("Database pool initialized successfully");

    Ok((
        Arc::new(PgKeyStore::new(pool.clone())),
        Arc::new(PgUsageStore::new(pool)),
        "postgres",
    ))
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing subscriber for structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("keygate=info,actix_web=info")),
        )
        .json()
        .init();

    // Load configuration
    let settings = Settings::load().context("Failed to load configuration")?;
    let bind_addr = format!("{}:{}", settings.server.host, settings.server.port);
    let workers = settings.server.workers.unwrap_or_else(|| num_cpus::get() * 2);

    info!(
        "Starting Keygate v{} on {}",
        env!("CARGO_PKG_VERSION"),
        bind_addr
    );

    let (key_store, usage_store, storage) = open_stores(&settings).await?;
    let app_state = web::Data::new(AppState::new(settings.clone(), key_store, usage_store, storage));

    info!(
        legacy_keys = settings.legacy_keys.len(),
        require_apikey = settings.auth.require_apikey,
        rate_limit = %settings.auth.key_rate(),
        "Authorization configured"
    );

    // Background work lives for the whole process
    app_state.authorizer.limiter().spawn_sweeper();
    if settings.maintenance.enabled {
        app_state.maintenance.spawn_schedulers(&settings.maintenance);
    } else {
        warn!("Scheduled maintenance disabled");
    }

    // Configure and start HTTP server
    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            // API middleware for auth, rate limiting, usage tracking
            .wrap(app_state.middleware())
            // Middleware (order matters - these wrap around ApiMiddleware)
            .wrap(TracingLogger::<RedactedRootSpan>::new())
            .wrap(middleware::Compress::default())
            .wrap(
                middleware::DefaultHeaders::new()
                    .add(("X-Service", "keygate"))
                    .add(("X-Version", env!("CARGO_PKG_VERSION")))
            )
            // Routes
            .configure(api::configure_routes)
    })
    .workers(workers)
    .bind(&bind_addr)?
    .run()
    .await?;

    Ok(())
}
