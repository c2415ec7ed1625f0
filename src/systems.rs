//! External POS system identifiers and their static rate limits.

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::adapters::signing::SignatureScheme;
use crate::normalization::AmountConvention;

/// A POS back-end. Keys every rate, queue and health structure in the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalSystemType {
    Shopify,
    Square,
    Clover,
    Toast,
    Lightspeed,
}

impl ExternalSystemType {
    pub const ALL: [ExternalSystemType; 5] = [
        ExternalSystemType::Shopify,
        ExternalSystemType::Square,
        ExternalSystemType::Clover,
        ExternalSystemType::Toast,
        ExternalSystemType::Lightspeed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalSystemType::Shopify => "shopify",
            ExternalSystemType::Square => "square",
            ExternalSystemType::Clover => "clover",
            ExternalSystemType::Toast => "toast",
            ExternalSystemType::Lightspeed => "lightspeed",
        }
    }

    /// Upper-case form used in environment variable names.
    pub fn env_key(&self) -> String {
        self.as_str().to_ascii_uppercase()
    }

    pub fn default_rate_limit(&self) -> RateLimit {
        match self {
            ExternalSystemType::Shopify => RateLimit::per_second(2).with_burst(2),
            ExternalSystemType::Square => RateLimit::per_second(10).with_per_minute(500),
            ExternalSystemType::Clover => RateLimit::per_second(16).with_concurrency(5),
            ExternalSystemType::Toast => RateLimit::per_second(20).with_per_hour(36_000),
            ExternalSystemType::Lightspeed => RateLimit::per_second(1).with_per_minute(60),
        }
    }

    /// Unit convention for bare numeric amounts in this system's payloads.
    pub fn default_amount_convention(&self) -> AmountConvention {
        match self {
            ExternalSystemType::Square | ExternalSystemType::Clover => {
                AmountConvention::MinorUnits
            }
            _ => AmountConvention::MajorUnits,
        }
    }

    pub fn signature_scheme(&self) -> SignatureScheme {
        match self {
            ExternalSystemType::Shopify
            | ExternalSystemType::Square
            | ExternalSystemType::Toast => SignatureScheme::Base64HmacSha256,
            ExternalSystemType::Clover | ExternalSystemType::Lightspeed => {
                SignatureScheme::HexHmacSha256
            }
        }
    }
}

impl fmt::Display for ExternalSystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown external system '{0}'")]
pub struct UnknownSystem(pub String);

impl FromStr for ExternalSystemType {
    type Err = UnknownSystem;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        ExternalSystemType::ALL
            .into_iter()
            .find(|system| system.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| UnknownSystem(s.to_string()))
    }
}

/// Static per-system request ceilings, loaded at startup and never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RateLimit {
    pub requests_per_second: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_hour: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests_per_day: Option<u32>,
    /// Extra requests tolerated in the shared one-second counter to absorb skew between
    /// gateway instances. In-process spacing still honours `requests_per_second`.
    #[serde(default)]
    pub burst_allowance: u32,
    #[serde(default = "default_concurrent_connections")]
    pub concurrent_connections: u32,
}

fn default_concurrent_connections() -> u32 {
    1
}

impl RateLimit {
    pub fn per_second(requests_per_second: u32) -> Self {
        Self {
            requests_per_second,
            requests_per_minute: None,
            requests_per_hour: None,
            requests_per_day: None,
            burst_allowance: 0,
            concurrent_connections: default_concurrent_connections(),
        }
    }

    pub fn with_per_minute(mut self, limit: u32) -> Self {
        self.requests_per_minute = Some(limit);
        self
    }

    pub fn with_per_hour(mut self, limit: u32) -> Self {
        self.requests_per_hour = Some(limit);
        self
    }

    pub fn with_per_day(mut self, limit: u32) -> Self {
        self.requests_per_day = Some(limit);
        self
    }

    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst_allowance = burst;
        self
    }

    pub fn with_concurrency(mut self, connections: u32) -> Self {
        self.concurrent_connections = connections;
        self
    }

    /// Minimum gap between two dispatches on the same system.
    pub fn min_spacing(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.requests_per_second.max(1)))
    }

    /// Ceiling applied to the shared one-second counter.
    pub fn second_ceiling(&self) -> u32 {
        self.requests_per_second + self.burst_allowance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!(
            "Square".parse::<ExternalSystemType>(),
            Ok(ExternalSystemType::Square)
        );
        assert_eq!(
            " toast ".parse::<ExternalSystemType>(),
            Ok(ExternalSystemType::Toast)
        );
        assert!("vend".parse::<ExternalSystemType>().is_err());
    }

    #[test]
    fn serde_uses_lowercase_names() {
        let json = serde_json::to_string(&ExternalSystemType::Lightspeed).unwrap();
        assert_eq!(json, "\"lightspeed\"");
    }

    #[test]
    fn spacing_derives_from_requests_per_second() {
        assert_eq!(
            RateLimit::per_second(2).min_spacing(),
            Duration::from_millis(500)
        );
        assert_eq!(
            RateLimit::per_second(16).min_spacing(),
            Duration::from_millis(62)
        );
    }

    #[test]
    fn every_system_has_a_usable_default_limit() {
        for system in ExternalSystemType::ALL {
            let limit = system.default_rate_limit();
            assert!(limit.requests_per_second >= 1, "{system}");
            assert!(limit.concurrent_connections >= 1, "{system}");
        }
    }
}
