//! Tunables for the guard, the reconciler and the indexer client.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::lease_store::MAX_LEASE_SECS;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{lower} ({lower_value}s) must be below {upper} ({upper_value}s)")]
    Ordering {
        lower: &'static str,
        lower_value: u64,
        upper: &'static str,
        upper_value: u64,
    },

    #[error("{field} ({value}s) must not exceed {max}s")]
    TooLarge {
        field: &'static str,
        value: u64,
        max: u64,
    },

    #[error("indexer base_url must be an http(s) URL, got {0:?}")]
    InvalidUrl(String),
}

fn require_nonzero(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Zero { field });
    }
    Ok(())
}

fn require_lease(field: &'static str, value: u64) -> Result<(), ConfigError> {
    require_nonzero(field, value)?;
    if value > MAX_LEASE_SECS {
        return Err(ConfigError::TooLarge {
            field,
            value,
            max: MAX_LEASE_SECS,
        });
    }
    Ok(())
}

/// Lease horizons applied by the reservation guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Lease attached by `validate` when the caller does not ask for one
    pub default_ttl_secs: u64,
    /// Lease attached by `confirm` to cover on-chain settlement
    pub confirm_ttl_secs: u64,
    /// Upper bound for any caller-requested lease
    pub max_ttl_secs: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 300,
            confirm_ttl_secs: 900,
            max_ttl_secs: 3_600,
        }
    }
}

impl GuardConfig {
    /// Lease for a `validate` call; zero or missing falls back to the default.
    pub fn reservation_ttl(&self, requested: Option<u64>) -> u64 {
        self.bounded(requested, self.default_ttl_secs)
    }

    /// Lease for a `confirm` call; zero or missing falls back to the default.
    pub fn confirm_ttl(&self, requested: Option<u64>) -> u64 {
        self.bounded(requested, self.confirm_ttl_secs)
    }

    fn bounded(&self, requested: Option<u64>, fallback: u64) -> u64 {
        requested
            .filter(|ttl| *ttl > 0)
            .unwrap_or(fallback)
            .min(self.max_ttl_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_lease("guard.default_ttl_secs", self.default_ttl_secs)?;
        require_lease("guard.confirm_ttl_secs", self.confirm_ttl_secs)?;
        require_lease("guard.max_ttl_secs", self.max_ttl_secs)?;
        Ok(())
    }
}

/// Timing policy of the background reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub interval_secs: u64,
    /// Unconfirmed entries older than this are deleted
    pub max_age_secs: u64,
    /// Unconfirmed entries older than this have their lease cut to `grace_secs`
    pub mid_age_secs: u64,
    pub grace_secs: u64,
    /// Entries older than this are deleted when the authority cannot be reached
    pub error_max_age_secs: u64,
    /// Entries checked concurrently within one pass
    pub concurrency: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            max_age_secs: 3_600,
            mid_age_secs: 1_200,
            grace_secs: 300,
            error_max_age_secs: 1_800,
            concurrency: 8,
        }
    }
}

impl ReconcilerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_nonzero("reconciler.interval_secs", self.interval_secs)?;
        require_lease("reconciler.grace_secs", self.grace_secs)?;
        require_nonzero("reconciler.concurrency", self.concurrency as u64)?;
        if self.mid_age_secs >= self.max_age_secs {
            return Err(ConfigError::Ordering {
                lower: "reconciler.mid_age_secs",
                lower_value: self.mid_age_secs,
                upper: "reconciler.max_age_secs",
                upper_value: self.max_age_secs,
            });
        }
        // Outages must never keep an entry alive past the hard age limit.
        if self.error_max_age_secs > self.max_age_secs {
            return Err(ConfigError::Ordering {
                lower: "reconciler.error_max_age_secs",
                lower_value: self.error_max_age_secs,
                upper: "reconciler.max_age_secs",
                upper_value: self.max_age_secs,
            });
        }
        Ok(())
    }
}

/// Connection settings for the HTTP ownership indexer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            timeout_ms: 5_000,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl IndexerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.base_url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::InvalidUrl(self.base_url.clone()));
        }
        require_nonzero("indexer.timeout_ms", self.timeout_ms)?;
        require_nonzero(
            "indexer.circuit_breaker.failure_threshold",
            u64::from(self.circuit_breaker.failure_threshold),
        )?;
        Ok(())
    }
}
