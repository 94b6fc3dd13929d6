//! Resilient cache over a persistent store.
//!
//! [`ResilientCache`] puts retry, backoff, recovery, and default-value handling
//! in front of a [`PersistentStore`]. Callers see a value, a default standing in
//! for a degraded operation, or a hard error that is not a timeout. They never
//! see a raw timeout.
//!
//! # Store handle lifecycle
//!
//! ```text
//! Open ── all attempts time out ──→ Degraded ── close + reopen ──→ Open
//!                                                  │
//!                                            reopen fails
//!                                                  ↓
//!                                   Empty ── next operation reopens ──→ Open
//! ```
//!
//! The handle lives in a slot tagged with a generation number. Recovery swaps
//! the whole handle under the slot's write lock, and only when the generation
//! still matches the one the failing operation started from, so callers that
//! exhaust their retries at the same moment trigger a single reopen.
//!
//! # Locking
//!
//! `put`, `delete`, and `purge_expired` hold the location's named write lock
//! for each attempt, never across a backoff sleep. Reads take no lock.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use safecache_core::{
    CacheConfig, CacheValue, HealthCheck, RetryPolicy, SafeCacheResult, StorageError,
    GLOBAL_LOCK_NAME,
};

use crate::lmdb_store::{LmdbOptions, LmdbStore};
use crate::lock::{LockRegistry, NamedLock};
use crate::retry::{with_retry, Attempted};
use crate::store::PersistentStore;

// ============================================================================
// CALL OPTIONS
// ============================================================================

/// Per-call options for reads.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadOptions<V> {
    /// Returned when the key is absent or the read degrades. `None` means
    /// "use the cache's configured default".
    pub default: Option<V>,
    /// Let the store retry a timeout once internally.
    pub retry: bool,
}

impl<V> Default for ReadOptions<V> {
    fn default() -> Self {
        Self {
            default: None,
            retry: true,
        }
    }
}

impl<V> ReadOptions<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(mut self, default: V) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }
}

/// Per-call options for writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Time until the entry expires. `None` keeps it until deleted.
    pub ttl: Option<Duration>,
    /// Let the store retry a timeout once internally.
    pub retry: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            ttl: None,
            retry: true,
        }
    }
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_retry(mut self, retry: bool) -> Self {
        self.retry = retry;
        self
    }
}

// ============================================================================
// STATISTICS
// ============================================================================

/// Counters describing how a cache has behaved so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads that found a value.
    pub hits: u64,
    /// Reads that found nothing and returned the default.
    pub misses: u64,
    /// Individual attempts that timed out.
    pub timeouts: u64,
    /// Operations that exhausted their retries and returned a fallback.
    pub fallbacks: u64,
    /// Store handles successfully rebuilt.
    pub recoveries: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    timeouts: AtomicU64,
    fallbacks: AtomicU64,
    recoveries: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// STORE SLOT
// ============================================================================

struct StoreSlot<S> {
    handle: Option<Arc<S>>,
    generation: u64,
}

/// A handle borrowed from the slot, remembering which generation it came from.
struct Handle<S> {
    store: Arc<S>,
    generation: u64,
}

// ============================================================================
// RESILIENT CACHE
// ============================================================================

/// A cache that absorbs transient store timeouts.
///
/// # Example
///
/// ```ignore
/// use safecache_storage::ResilientCache;
///
/// let cache = ResilientCache::new(3, "/tmp/cache", "DEFAULT_VALUE".to_string())?;
/// assert!(cache.put("foo", &"bar".to_string())?);
/// assert_eq!(cache.get("foo")?, "bar");
/// assert_eq!(cache.get("missing")?, "DEFAULT_VALUE");
/// assert_eq!(cache.get_or("missing", "X".to_string())?, "X");
/// assert!(cache.delete("foo")?);
/// ```
pub struct ResilientCache<V: CacheValue, S: PersistentStore = LmdbStore> {
    config: CacheConfig,
    policy: RetryPolicy,
    default_value: V,
    options: S::Options,
    location: PathBuf,
    slot: RwLock<StoreSlot<S>>,
    write_lock: Arc<NamedLock>,
    counters: Counters,
    degraded: AtomicBool,
}

impl<V: CacheValue> ResilientCache<V, LmdbStore> {
    /// Open an LMDB-backed cache with default tuning.
    ///
    /// # Errors
    ///
    /// Returns a config error if `retries < 2`, or a storage error if the
    /// store cannot be opened.
    pub fn new(
        retries: u32,
        location: impl Into<PathBuf>,
        default_value: V,
    ) -> SafeCacheResult<Self> {
        Self::open(CacheConfig::new(retries, location), default_value)
    }

    /// Open an LMDB-backed cache using the process-wide lock registry.
    pub fn open(config: CacheConfig, default_value: V) -> SafeCacheResult<Self> {
        let options = LmdbOptions::from(&config);
        Self::with_store(config, default_value, options, LockRegistry::global())
    }
}

impl<V: CacheValue, S: PersistentStore> ResilientCache<V, S> {
    /// Open a cache over any store, taking its write lock from `registry`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`](safecache_core::ConfigError) for invalid
    /// parameters (checked before the store is touched), or whatever the
    /// store reports when it fails to open.
    pub fn with_store(
        config: CacheConfig,
        default_value: V,
        options: S::Options,
        registry: &LockRegistry,
    ) -> SafeCacheResult<Self> {
        let policy = config.retry_policy()?;
        let store = S::open(config.store_location(), &options)?;
        let location = store.location().to_path_buf();
        let write_lock = registry.lock_for(&location, GLOBAL_LOCK_NAME);

        tracing::debug!(
            location = %location.display(),
            retry_limit = policy.retry_limit(),
            backoff_base_ms = policy.backoff_base().as_millis() as u64,
            "opened resilient cache"
        );

        Ok(Self {
            config,
            policy,
            default_value,
            options,
            location,
            slot: RwLock::new(StoreSlot {
                handle: Some(Arc::new(store)),
                generation: 0,
            }),
            write_lock,
            counters: Counters::default(),
            degraded: AtomicBool::new(false),
        })
    }

    // === Reads ===

    /// Value for `key`, or the configured default.
    pub fn get(&self, key: &str) -> SafeCacheResult<V> {
        self.get_with(key, ReadOptions::default())
    }

    /// Value for `key`, or `default`.
    pub fn get_or(&self, key: &str, default: V) -> SafeCacheResult<V> {
        self.get_with(key, ReadOptions::new().with_default(default))
    }

    /// Value for `key` with explicit options.
    ///
    /// Returns the resolved default when the key is absent, expired, or every
    /// attempt timed out.
    pub fn get_with(&self, key: &str, options: ReadOptions<V>) -> SafeCacheResult<V> {
        let retry = options.retry;
        let default = options
            .default
            .unwrap_or_else(|| self.default_value.clone());

        match self.execute("get", |store| store.get(key, retry))? {
            Some(Some(bytes)) => {
                Counters::bump(&self.counters.hits);
                Ok(serde_json::from_slice(&bytes)?)
            }
            Some(None) => {
                Counters::bump(&self.counters.misses);
                Ok(default)
            }
            None => Ok(default),
        }
    }

    // === Writes ===

    /// Store `value` under `key` with no expiry.
    pub fn put(&self, key: &str, value: &V) -> SafeCacheResult<bool> {
        self.put_with(key, value, WriteOptions::default())
    }

    /// Store `value` under `key` with explicit options.
    ///
    /// Returns `true` if the store acknowledged the write, `false` otherwise,
    /// including when every attempt timed out.
    pub fn put_with(&self, key: &str, value: &V, options: WriteOptions) -> SafeCacheResult<bool> {
        let bytes = serde_json::to_vec(value)?;
        let outcome = self.execute("put", |store| {
            let _guard = self.write_lock.acquire();
            store.set(key, &bytes, options.ttl, options.retry)
        })?;
        Ok(outcome.unwrap_or(false))
    }

    /// Remove `key`. Missing keys are ignored.
    pub fn delete(&self, key: &str) -> SafeCacheResult<bool> {
        self.delete_with(key, true)
    }

    /// Remove `key`, choosing whether the store may retry internally.
    ///
    /// Returns `true` only if an entry was actually removed.
    pub fn delete_with(&self, key: &str, retry: bool) -> SafeCacheResult<bool> {
        let outcome = self.execute("delete", |store| {
            let _guard = self.write_lock.acquire();
            store.delete(key, retry)
        })?;
        Ok(outcome.unwrap_or(false))
    }

    /// Drop expired entries, returning how many went. Degrades to zero.
    pub fn purge_expired(&self) -> SafeCacheResult<u64> {
        let outcome = self.execute("purge_expired", |store| {
            let _guard = self.write_lock.acquire();
            store.purge_expired(true)
        })?;
        Ok(outcome.unwrap_or(0))
    }

    // === Introspection ===

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Canonical store location.
    pub fn location(&self) -> &Path {
        &self.location
    }

    /// The write lock shared with every cache at this location.
    pub fn write_lock(&self) -> &Arc<NamedLock> {
        &self.write_lock
    }

    /// How many times the store handle has been replaced.
    pub fn generation(&self) -> u64 {
        match self.slot.read() {
            Ok(slot) => slot.generation,
            Err(poisoned) => poisoned.into_inner().generation,
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    pub fn health(&self) -> HealthCheck {
        let component = format!("safecache:{}", self.location.display());
        let (open, generation) = match self.slot.read() {
            Ok(slot) => (slot.handle.is_some(), slot.generation),
            Err(_) => (false, 0),
        };

        let check = if !open {
            HealthCheck::unhealthy(component, "no store handle open; the last reopen failed")
        } else if self.degraded.load(Ordering::Relaxed) {
            HealthCheck::degraded(component, "last operation exhausted its retries")
        } else {
            HealthCheck::healthy(component)
        };

        check
            .with_metadata("generation", serde_json::json!(generation))
            .with_metadata("recoveries", serde_json::json!(self.stats().recoveries))
    }

    /// Close the store handle. The named lock stays with its registry.
    pub fn close(self) {
        drop(self);
    }

    // === Retry machinery ===

    /// Run `op` under the retry policy.
    ///
    /// `Ok(None)` means every attempt timed out and the store was recovered.
    fn execute<T>(
        &self,
        operation: &'static str,
        op: impl Fn(&S) -> SafeCacheResult<T>,
    ) -> SafeCacheResult<Option<T>> {
        let mut handle = self.current()?;

        let outcome = with_retry(&self.policy, operation, |_| {
            let result = match op(handle.store.as_ref()) {
                // Another caller recovered the store while this attempt was in
                // flight. Move to the new handle and go again.
                Err(e) if e.is_closed() => {
                    handle = self.superseding(&handle)?;
                    op(handle.store.as_ref())
                }
                other => other,
            };
            if matches!(&result, Err(e) if e.is_timeout()) {
                Counters::bump(&self.counters.timeouts);
            }
            result
        })?;

        match outcome {
            Attempted::Completed(value) => {
                self.degraded.store(false, Ordering::Relaxed);
                Ok(Some(value))
            }
            Attempted::Exhausted { attempts } => {
                tracing::error!(
                    operation,
                    attempts,
                    location = %self.location.display(),
                    "store operation exhausted its retries, recovering store handle"
                );
                let generation = handle.generation;
                drop(handle);

                Counters::bump(&self.counters.fallbacks);
                self.degraded.store(true, Ordering::Relaxed);
                self.recover(generation)?;
                Ok(None)
            }
        }
    }

    fn read_slot(&self) -> SafeCacheResult<RwLockReadGuard<'_, StoreSlot<S>>> {
        Ok(self.slot.read().map_err(|_| StorageError::LockPoisoned)?)
    }

    fn write_slot(&self) -> SafeCacheResult<RwLockWriteGuard<'_, StoreSlot<S>>> {
        Ok(self.slot.write().map_err(|_| StorageError::LockPoisoned)?)
    }

    /// The current handle, reopening the store if a previous recovery left
    /// the slot empty.
    fn current(&self) -> SafeCacheResult<Handle<S>> {
        {
            let slot = self.read_slot()?;
            if let Some(store) = &slot.handle {
                return Ok(Handle {
                    store: Arc::clone(store),
                    generation: slot.generation,
                });
            }
        }

        let mut slot = self.write_slot()?;
        if slot.handle.is_none() {
            let store = S::open(&self.location, &self.options)?;
            slot.handle = Some(Arc::new(store));
            slot.generation += 1;
            tracing::info!(
                location = %self.location.display(),
                generation = slot.generation,
                "reopened store after failed recovery"
            );
        }

        match &slot.handle {
            Some(store) => Ok(Handle {
                store: Arc::clone(store),
                generation: slot.generation,
            }),
            None => Err(StorageError::Closed {
                location: self.location.display().to_string(),
            }
            .into()),
        }
    }

    /// A newer handle than `stale`, or the closed error if there is none.
    fn superseding(&self, stale: &Handle<S>) -> SafeCacheResult<Handle<S>> {
        let current = self.current()?;
        if current.generation == stale.generation {
            return Err(StorageError::Closed {
                location: self.location.display().to_string(),
            }
            .into());
        }
        Ok(current)
    }

    /// Close the degraded handle and open a fresh one at the same location,
    /// unless another caller has already done so since `observed_generation`.
    fn recover(&self, observed_generation: u64) -> SafeCacheResult<()> {
        let mut slot = self.write_slot()?;
        if slot.generation != observed_generation {
            tracing::debug!(
                observed_generation,
                generation = slot.generation,
                "store already recovered by another caller"
            );
            return Ok(());
        }

        if let Some(old) = slot.handle.take() {
            old.close();
        }
        slot.generation += 1;

        match S::open(&self.location, &self.options) {
            Ok(store) => {
                slot.handle = Some(Arc::new(store));
                Counters::bump(&self.counters.recoveries);
                tracing::info!(
                    location = %self.location.display(),
                    generation = slot.generation,
                    "store handle recovered"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    location = %self.location.display(),
                    generation = slot.generation,
                    error = %e,
                    "failed to reopen store after retry exhaustion"
                );
                Err(e)
            }
        }
    }
}

impl<V: CacheValue, S: PersistentStore> Drop for ResilientCache<V, S> {
    fn drop(&mut self) {
        let slot = match self.slot.get_mut() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(store) = slot.handle.take() {
            store.close();
        }
    }
}
