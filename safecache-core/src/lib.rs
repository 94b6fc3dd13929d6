//! safecache core types
//!
//! Shared vocabulary for the resilience layer that sits in front of a
//! disk-backed key-value store: the error taxonomy, construction-time
//! configuration, and the retry policy that decides how long to keep trying
//! before a cache operation falls back to its default.
//!
//! Nothing in this crate performs I/O. Storage engines and the resilient
//! wrapper itself live in `safecache-storage`.

pub mod config;
pub mod error;
pub mod health;
pub mod retry;

pub use config::{
    CacheConfig, DEFAULT_BACKOFF_BASE_SECS, DEFAULT_MAP_SIZE_MB, DEFAULT_RETRIES,
    DEFAULT_STORE_DIR,
};
pub use error::{ConfigError, SafeCacheError, SafeCacheResult, StorageError};
pub use health::{HealthCheck, HealthStatus};
pub use retry::RetryPolicy;

use serde::{de::DeserializeOwned, Serialize};

/// Smallest user-facing retry count a cache accepts.
///
/// The store retries once internally, so anything lower would leave the
/// wrapper with no attempts of its own.
pub const MIN_CONFIGURED_RETRIES: u32 = 2;

/// Name of the write lock shared by every cache at one store location.
pub const GLOBAL_LOCK_NAME: &str = "global_lock";

/// Marker trait for values that can be stored in a cache.
///
/// Values travel through the store as JSON, so they must round-trip through
/// serde. Use `Option<T>` as the value type when "stored null" has to be
/// distinguished from "absent".
pub trait CacheValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}
