//! Statically configured keys that bypass the key store

use std::collections::HashMap;

use crate::config::LegacyKeyConfig;
use crate::domain::RateSpec;

/// Lookup table built once from `legacy_keys` configuration
#[derive(Debug, Clone, Default)]
pub struct LegacyKeys {
    keys: HashMap<String, LegacyKeyConfig>,
}

impl LegacyKeys {
    pub fn new(keys: Vec<LegacyKeyConfig>) -> Self {
        keys.into_iter().collect()
    }

    /// Allowance for an enabled legacy key; `None` if unknown or disabled.
    /// Matching is exact and case-sensitive.
    pub fn lookup(&self, token: &str) -> Option<RateSpec> {
        self.keys
            .get(token)
            .filter(|config| config.enabled)
            .map(|config| config.rate_limit)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl FromIterator<LegacyKeyConfig> for LegacyKeys {
    fn from_iter<I: IntoIterator<Item = LegacyKeyConfig>>(iter: I) -> Self {
        Self {
            keys: iter
                .into_iter()
                .map(|config| (config.key.clone(), config))
                .collect(),
        }
    }
}
