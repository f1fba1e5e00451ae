//! Domain types for API key authorization and usage telemetry

pub mod api_key;
pub mod rate_spec;
pub mod usage;

pub use api_key::{
    ApiKeyRecord, IpRecord, KeyStatus, KeyUpdate, Owner, UsageOutcome, UsageSnapshot,
};
pub use rate_spec::RateSpec;
pub use usage::{RequestLogEntry, RollupDelta, RollupKey, UsageRollup};
