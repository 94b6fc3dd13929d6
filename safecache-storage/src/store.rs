//! Persistent store contract consumed by the resilient cache.
//!
//! A store is an opaque disk-backed key-value engine keyed by strings and
//! holding byte values. Value encoding, page layout, and the store's own
//! locking are its business; the cache only relies on the operations below.
//!
//! # Timeouts
//!
//! Any operation may fail with [`StorageError::Timeout`](safecache_core::StorageError::Timeout)
//! when the engine could not finish within its own bound. When `retry` is
//! `true` the store retries such a failure once before reporting it. All other
//! errors are reported immediately.

use safecache_core::SafeCacheResult;
use std::path::Path;
use std::time::Duration;

/// Disk-backed key-value store with per-entry expiry.
pub trait PersistentStore: Send + Sync + Sized + 'static {
    /// Engine-specific open parameters.
    type Options: Clone + Send + Sync + 'static;

    /// Open the store at `location`, creating it if absent.
    ///
    /// Opening is idempotent, and entries never get evicted automatically.
    fn open(location: &Path, options: &Self::Options) -> SafeCacheResult<Self>;

    /// Canonical location of this store.
    fn location(&self) -> &Path;

    /// Stored bytes for `key`, or `None` if absent or expired.
    fn get(&self, key: &str, retry: bool) -> SafeCacheResult<Option<Vec<u8>>>;

    /// Store `value` under `key`. `ttl` of `None` means no expiry.
    ///
    /// Returns whether the write was acknowledged.
    fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
        retry: bool,
    ) -> SafeCacheResult<bool>;

    /// Remove `key`. Returns whether a visible entry was removed.
    fn delete(&self, key: &str, retry: bool) -> SafeCacheResult<bool>;

    /// Drop every expired entry, returning how many were removed.
    fn purge_expired(&self, retry: bool) -> SafeCacheResult<u64>;

    /// Release the handle. Safe to call more than once and on a degraded handle.
    ///
    /// Operations on a closed handle fail with
    /// [`StorageError::Closed`](safecache_core::StorageError::Closed).
    fn close(&self);
}
