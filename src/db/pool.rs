//! Database connection pool management

use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;
use tracing::info;

use super::store::StoreError;

const SCHEMA: &str = include_str!("schema.sql");

/// Database connection pool wrapper
#[derive(Clone)]
pub struct DbPool {
    pool: Pool,
}

impl DbPool {
    /// Create a new database pool from a connection string
    pub fn new(database_url: &str, max_connections: Option<usize>) -> Result<Self, StoreError> {
        let url = url::Url::parse(database_url)
            .map_err(|e| StoreError::Config(format!("Invalid database URL: {}", e)))?;

        let host = url
            .host_str()
            .ok_or_else(|| StoreError::Config("Missing host in database URL".to_string()))?;
        let port = url.port().unwrap_or(5432);
        let dbname = url.path().trim_start_matches('/');

        let mut cfg = Config::new();
        cfg.host = Some(host.to_string());
        cfg.port = Some(port);
        cfg.user = Some(url.username().to_string());
        cfg.password = Some(url.password().unwrap_or("").to_string());
        cfg.dbname = Some(dbname.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        if let Some(max) = max_connections {
            cfg.pool = Some(PoolConfig::new(max));
        }

        let pool = cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;

        info!(
            host = %host,
            port = %port,
            dbname = %dbname,
            "Database pool created"
        );

        Ok(DbPool { pool })
    }

    /// Get a connection from the pool
    pub async fn get(&self) -> Result<deadpool_postgres::Object, StoreError> {
        Ok(self.pool.get().await?)
    }

    /// Test the database connection
    pub async fn test_connection(&self) -> Result<(), StoreError> {
        let client = self.get().await?;
        client.query_one("SELECT 1", &[]).await?;
        info!("Database connection test successful");
        Ok(())
    }

    /// Create tables and indexes that do not exist yet
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let client = self.get().await?;
        client.batch_execute(SCHEMA).await?;
        info!("Database schema ensured");
        Ok(())
    }
}
