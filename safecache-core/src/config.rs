//! Configuration types

use crate::{ConfigError, RetryPolicy, MIN_CONFIGURED_RETRIES};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default base delay between attempts, in seconds.
pub const DEFAULT_BACKOFF_BASE_SECS: f64 = 0.1;

/// Default LMDB map size in megabytes.
pub const DEFAULT_MAP_SIZE_MB: usize = 64;

/// Default user-facing retry count.
pub const DEFAULT_RETRIES: u32 = 3;

/// Default store directory when none is configured.
pub const DEFAULT_STORE_DIR: &str = "safecache";

fn default_backoff_base_secs() -> f64 {
    DEFAULT_BACKOFF_BASE_SECS
}

fn default_map_size_mb() -> usize {
    DEFAULT_MAP_SIZE_MB
}

/// Construction parameters for a resilient cache.
///
/// Immutable once the cache is built. `retries` is the user-facing count and
/// includes the single retry the store performs on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Number of attempts before giving up (minimum 2).
    pub retries: u32,
    /// Base delay for exponential backoff, in seconds.
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: f64,
    /// Directory holding the on-disk store.
    pub store_location: PathBuf,
    /// Upper bound of the memory map backing the store.
    #[serde(default = "default_map_size_mb")]
    pub map_size_mb: usize,
}

impl CacheConfig {
    /// Config with default backoff and map size.
    pub fn new(retries: u32, store_location: impl Into<PathBuf>) -> Self {
        Self {
            retries,
            backoff_base_secs: DEFAULT_BACKOFF_BASE_SECS,
            store_location: store_location.into(),
            map_size_mb: DEFAULT_MAP_SIZE_MB,
        }
    }

    /// Override the backoff base.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base_secs = base.as_secs_f64();
        self
    }

    /// Override the map size.
    pub fn with_map_size_mb(mut self, map_size_mb: usize) -> Self {
        self.map_size_mb = map_size_mb;
        self
    }

    /// The configured store directory.
    pub fn store_location(&self) -> &Path {
        &self.store_location
    }

    /// Backoff base as a [`Duration`].
    ///
    /// Only meaningful after [`validate`](Self::validate) has accepted the config.
    pub fn backoff_base(&self) -> Duration {
        Duration::try_from_secs_f64(self.backoff_base_secs).unwrap_or(Duration::ZERO)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - retries >= 2
    /// - backoff_base_secs is finite and non-negative
    /// - store_location is not empty
    /// - map_size_mb > 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retries < MIN_CONFIGURED_RETRIES {
            return Err(ConfigError::InvalidValue {
                field: "retries".to_string(),
                value: self.retries.to_string(),
                reason: "the minimum number of retries is two".to_string(),
            });
        }

        if !self.backoff_base_secs.is_finite() || self.backoff_base_secs < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "backoff_base_secs".to_string(),
                value: self.backoff_base_secs.to_string(),
                reason: "backoff_base_secs must be a finite, non-negative number".to_string(),
            });
        }

        if Duration::try_from_secs_f64(self.backoff_base_secs).is_err() {
            return Err(ConfigError::InvalidValue {
                field: "backoff_base_secs".to_string(),
                value: self.backoff_base_secs.to_string(),
                reason: "backoff_base_secs does not fit in a duration".to_string(),
            });
        }

        if self.store_location.as_os_str().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "store_location".to_string(),
            });
        }

        if self.map_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "map_size_mb".to_string(),
                value: self.map_size_mb.to_string(),
                reason: "map_size_mb must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Validate and derive the retry policy.
    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        self.validate()?;
        RetryPolicy::from_configured_retries(self.retries, self.backoff_base())
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `SAFECACHE_RETRIES`: retry count (default: 3)
    /// - `SAFECACHE_BACKOFF_BASE_SECS`: backoff base in seconds (default: 0.1)
    /// - `SAFECACHE_STORE_DIR`: store directory (default: `./safecache`)
    /// - `SAFECACHE_MAP_SIZE_MB`: LMDB map size (default: 64)
    ///
    /// Unparseable values fall back to the default; call
    /// [`validate`](Self::validate) to reject out-of-range ones.
    pub fn from_env() -> Self {
        Self {
            retries: std::env::var("SAFECACHE_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_RETRIES),
            backoff_base_secs: std::env::var("SAFECACHE_BACKOFF_BASE_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_BACKOFF_BASE_SECS),
            store_location: std::env::var("SAFECACHE_STORE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_STORE_DIR)),
            map_size_mb: std::env::var("SAFECACHE_MAP_SIZE_MB")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_MAP_SIZE_MB),
        }
    }

    /// Parse a TOML document and validate it.
    ///
    /// ```toml
    /// retries = 3
    /// store_location = "/var/cache/app"
    /// backoff_base_secs = 0.05
    /// ```
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// TESTS
// =============================================================================
