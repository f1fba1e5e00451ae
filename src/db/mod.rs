//! Persistence for API keys and usage telemetry
//!
//! PostgreSQL implementations back production; the in-memory ones run when
//! no database URL is configured and in tests.

pub mod api_keys;
pub mod memory;
pub mod pool;
pub mod store;
pub mod usage;

pub use api_keys::PgKeyStore;
pub use memory::{MemoryKeyStore, MemoryUsageStore};
pub use pool::DbPool;
pub use store::{KeyStore, StoreError, StoreResult, UsageStore};
pub use usage::PgUsageStore;
