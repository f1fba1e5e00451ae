//! Rate-limit specifications for statically configured keys
//!
//! Parsed once when configuration is loaded: `"unlimited"` or `"<N>/<minute|hour|day>"`.

use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid rate limit '{0}': expected \"unlimited\" or \"<N>/<minute|hour|day>\" with N > 0")]
pub struct RateSpecError(pub String);

/// Request allowance for one rate-limit bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum RateSpec {
    Unlimited,
    PerWindow { max_requests: u32, window: Duration },
}

impl RateSpec {
    pub fn per_window(max_requests: u32, window: Duration) -> Self {
        RateSpec::PerWindow { max_requests, window }
    }
}

impl FromStr for RateSpec {
    type Err = RateSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("unlimited") {
            return Ok(RateSpec::Unlimited);
        }

        let invalid = || RateSpecError(s.to_string());
        let (count, unit) = trimmed.split_once('/').ok_or_else(invalid)?;
        let max_requests: u32 = count.parse().map_err(|_| invalid())?;
        if max_requests == 0 {
            return Err(invalid());
        }

        let window = match unit {
            "minute" => Duration::from_secs(60),
            "hour" => Duration::from_secs(60 * 60),
            "day" => Duration::from_secs(24 * 60 * 60),
            _ => return Err(invalid()),
        };

        Ok(RateSpec::PerWindow { max_requests, window })
    }
}

impl TryFrom<String> for RateSpec {
    type Error = RateSpecError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for RateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateSpec::Unlimited => f.write_str("unlimited"),
            RateSpec::PerWindow { max_requests, window } => {
                let unit = match window.as_secs() {
                    60 => "minute",
                    3600 => "hour",
                    86400 => "day",
                    secs => return write!(f, "{}/{}s", max_requests, secs),
                };
                write!(f, "{}/{}", max_requests, unit)
            }
        }
    }
}
