//! API key authorization
//!
//! `RequestAuthorizer` owns the decision; `Denial` describes a refusal and
//! renders it; `LegacyKeys` holds statically configured keys.

pub mod authorizer;
pub mod denial;
pub mod legacy;

pub use authorizer::{AuthContext, RequestAuthorizer};
pub use denial::{Denial, DenialKind};
pub use legacy::LegacyKeys;
