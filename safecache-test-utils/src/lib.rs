//! safecache Test Utilities
//!
//! Shared test infrastructure for the safecache workspace:
//! - A fault-injecting in-memory store for driving retry and recovery paths
//! - Proptest generators for keys, values, and configs
//! - Fixtures for caches over LMDB and over the faulty store
//! - Custom assertions for safecache results and health

pub use safecache_core::{
    CacheConfig, CacheValue, ConfigError, HealthCheck, HealthStatus, RetryPolicy, SafeCacheError,
    SafeCacheResult, StorageError,
};
pub use safecache_storage::{
    CacheStats, LmdbOptions, LmdbStore, LockRegistry, PersistentStore, ReadOptions,
    ResilientCache, WriteOptions,
};

use chrono::Utc;
use safecache_storage::{encode_entry, StoredEntry};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

// ============================================================================
// FAULT INJECTION
// ============================================================================

/// Failure a [`FaultyStore`] can be scripted to raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Timeout,
    Corrupted,
    Io,
}

impl FaultKind {
    fn into_error(self, operation: &str) -> SafeCacheError {
        match self {
            FaultKind::Timeout => StorageError::timeout(operation, "injected timeout").into(),
            FaultKind::Corrupted => StorageError::Corrupted {
                reason: format!("injected corruption during {operation}"),
            }
            .into(),
            FaultKind::Io => StorageError::Io {
                reason: format!("injected I/O failure during {operation}"),
            }
            .into(),
        }
    }
}

#[derive(Debug, Default)]
struct InjectorState {
    data: Mutex<HashMap<String, Vec<u8>>>,
    scripted: Mutex<VecDeque<FaultKind>>,
    always: Mutex<Option<FaultKind>>,
    failing_opens: Mutex<u32>,
    write_delay: Mutex<Duration>,
    calls: AtomicU64,
    opens: AtomicU64,
    closes: AtomicU64,
    active_writers: AtomicUsize,
    max_writers: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Shared control surface for every [`FaultyStore`] opened with it.
///
/// The injector owns the data, so entries survive the close-and-reopen cycle
/// a recovering cache goes through, just as they would on disk.
#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    state: Arc<InjectorState>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise `kind` on the next `count` store attempts.
    pub fn fail_next(&self, count: usize, kind: FaultKind) {
        lock(&self.state.scripted).extend(std::iter::repeat(kind).take(count));
    }

    /// Raise `kind` on every attempt until [`clear`](Self::clear).
    pub fn fail_always(&self, kind: FaultKind) {
        *lock(&self.state.always) = Some(kind);
    }

    /// Make the next `count` opens fail with an I/O error.
    pub fn fail_opens(&self, count: u32) {
        *lock(&self.state.failing_opens) = count;
    }

    /// Remove every scripted fault.
    pub fn clear(&self) {
        lock(&self.state.scripted).clear();
        *lock(&self.state.always) = None;
        *lock(&self.state.failing_opens) = 0;
    }

    /// Hold each write for `delay` so overlapping writers become observable.
    pub fn set_write_delay(&self, delay: Duration) {
        *lock(&self.state.write_delay) = delay;
    }

    /// Store attempts made so far, internal retries included.
    pub fn calls(&self) -> u64 {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Successful opens so far.
    pub fn opens(&self) -> u64 {
        self.state.opens.load(Ordering::SeqCst)
    }

    /// Handles closed so far.
    pub fn closes(&self) -> u64 {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Most writers ever seen inside a write at once.
    pub fn max_concurrent_writers(&self) -> usize {
        self.state.max_writers.load(Ordering::SeqCst)
    }

    /// Raw payload stored for `key`, ignoring expiry.
    pub fn raw_payload(&self, key: &str) -> Option<Vec<u8>> {
        lock(&self.state.data)
            .get(key)
            .and_then(|bytes| StoredEntry::decode(bytes).map(|e| e.payload().to_vec()))
    }

    fn next_fault(&self) -> Option<FaultKind> {
        if let Some(kind) = *lock(&self.state.always) {
            return Some(kind);
        }
        lock(&self.state.scripted).pop_front()
    }

    fn take_failing_open(&self) -> bool {
        let mut remaining = lock(&self.state.failing_opens);
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }
}

/// In-memory [`PersistentStore`] whose failures are scripted by a
/// [`FaultInjector`].
#[derive(Debug)]
pub struct FaultyStore {
    location: PathBuf,
    injector: FaultInjector,
    closed: AtomicBool,
}

impl FaultyStore {
    fn attempt<T>(
        &self,
        operation: &str,
        retry: bool,
        op: impl Fn() -> SafeCacheResult<T>,
    ) -> SafeCacheResult<T> {
        match self.attempt_once(operation, &op) {
            Err(e) if retry && e.is_timeout() => self.attempt_once(operation, &op),
            result => result,
        }
    }

    fn attempt_once<T>(
        &self,
        operation: &str,
        op: &impl Fn() -> SafeCacheResult<T>,
    ) -> SafeCacheResult<T> {
        self.injector.state.calls.fetch_add(1, Ordering::SeqCst);
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Closed {
                location: self.location.display().to_string(),
            }
            .into());
        }
        if let Some(kind) = self.injector.next_fault() {
            return Err(kind.into_error(operation));
        }
        op()
    }

    fn write<T>(&self, op: impl FnOnce(&mut HashMap<String, Vec<u8>>) -> T) -> T {
        let state = &self.injector.state;
        let now = state.active_writers.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_writers.fetch_max(now, Ordering::SeqCst);

        let delay = *lock(&state.write_delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let result = op(&mut lock(&state.data));

        state.active_writers.fetch_sub(1, Ordering::SeqCst);
        result
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl PersistentStore for FaultyStore {
    type Options = FaultInjector;

    fn open(location: &Path, injector: &Self::Options) -> SafeCacheResult<Self> {
        if injector.take_failing_open() {
            return Err(StorageError::Io {
                reason: format!("injected open failure at {}", location.display()),
            }
            .into());
        }
        injector.state.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Self {
            location: location.to_path_buf(),
            injector: injector.clone(),
            closed: AtomicBool::new(false),
        })
    }

    fn location(&self) -> &Path {
        &self.location
    }

    fn get(&self, key: &str, retry: bool) -> SafeCacheResult<Option<Vec<u8>>> {
        self.attempt("get", retry, || {
            let data = lock(&self.injector.state.data);
            let payload = data
                .get(key)
                .and_then(|bytes| StoredEntry::decode(bytes))
                .filter(|entry| !entry.is_expired(Utc::now()))
                .map(|entry| entry.payload().to_vec());
            Ok(payload)
        })
    }

    fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
        retry: bool,
    ) -> SafeCacheResult<bool> {
        self.attempt("set", retry, || {
            let bytes = encode_entry(value, ttl, Utc::now());
            self.write(|data| data.insert(key.to_string(), bytes));
            Ok(true)
        })
    }

    fn delete(&self, key: &str, retry: bool) -> SafeCacheResult<bool> {
        self.attempt("delete", retry, || {
            Ok(self.write(|data| {
                let now = Utc::now();
                data.remove(key)
                    .and_then(|bytes| StoredEntry::decode(&bytes).map(|e| !e.is_expired(now)))
                    .unwrap_or(false)
            }))
        })
    }

    fn purge_expired(&self, retry: bool) -> SafeCacheResult<u64> {
        self.attempt("purge_expired", retry, || {
            Ok(self.write(|data| {
                let now = Utc::now();
                let before = data.len();
                data.retain(|_, bytes| {
                    StoredEntry::decode(bytes).is_some_and(|entry| !entry.is_expired(now))
                });
                (before - data.len()) as u64
            }))
        })
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.injector.state.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ============================================================================
// TRACING
// ============================================================================

/// Route `tracing` output through the test harness, filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating test data.

    use super::*;
    use proptest::prelude::*;

    /// Generate a cache key.
    pub fn arb_key() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_:-]{0,31}"
    }

    /// Generate a printable string value.
    pub fn arb_value() -> impl Strategy<Value = String> {
        ".{0,128}"
    }

    /// Generate a valid user-facing retry count.
    pub fn arb_retries() -> impl Strategy<Value = u32> {
        2u32..=8
    }

    /// Generate a small backoff base.
    pub fn arb_backoff_base() -> impl Strategy<Value = Duration> {
        (0u64..=50).prop_map(Duration::from_millis)
    }

    /// Generate a fault kind.
    pub fn arb_fault_kind() -> impl Strategy<Value = FaultKind> {
        prop_oneof![
            Just(FaultKind::Timeout),
            Just(FaultKind::Corrupted),
            Just(FaultKind::Io),
        ]
    }

    /// Generate a valid config rooted at `location`.
    pub fn arb_valid_config(location: PathBuf) -> impl Strategy<Value = CacheConfig> {
        (arb_retries(), arb_backoff_base(), 1usize..=256).prop_map(move |(retries, base, map)| {
            CacheConfig::new(retries, location.clone())
                .with_backoff_base(base)
                .with_map_size_mb(map)
        })
    }

    /// Generate a list of distinct keys with values.
    pub fn arb_entries(max: usize) -> impl Strategy<Value = HashMap<String, String>> {
        proptest::collection::hash_map(arb_key(), arb_value(), 0..=max)
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common scenarios.

    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    /// The default value used by the reference scenario.
    pub const DEFAULT_VALUE: &str = "DEFAULT_VALUE";

    /// A structured value for exercising non-string payloads.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Profile {
        pub name: String,
        pub visits: u32,
        pub tags: Vec<String>,
    }

    pub fn test_profile() -> Profile {
        Profile {
            name: "ada".to_string(),
            visits: 3,
            tags: vec!["admin".to_string(), "beta".to_string()],
        }
    }

    /// Config with a 1ms backoff base so retry paths stay fast.
    pub fn fast_config(retries: u32, location: impl Into<PathBuf>) -> CacheConfig {
        CacheConfig::new(retries, location)
            .with_backoff_base(Duration::from_millis(1))
            .with_map_size_mb(10)
    }

    /// LMDB-backed string cache in a fresh temp dir with its own lock registry.
    pub fn lmdb_cache(retries: u32) -> (ResilientCache<String>, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let registry = LockRegistry::new();
        let cache = lmdb_cache_at(retries, temp_dir.path(), &registry);
        (cache, temp_dir)
    }

    /// LMDB-backed string cache at `location`, sharing `registry`.
    pub fn lmdb_cache_at(
        retries: u32,
        location: &Path,
        registry: &LockRegistry,
    ) -> ResilientCache<String> {
        ResilientCache::with_store(
            fast_config(retries, location),
            DEFAULT_VALUE.to_string(),
            LmdbOptions { map_size_mb: 10 },
            registry,
        )
        .expect("cache creation should succeed")
    }

    /// String cache over a [`FaultyStore`], plus the injector controlling it.
    pub fn faulty_cache(retries: u32) -> (ResilientCache<String, FaultyStore>, FaultInjector) {
        let injector = FaultInjector::new();
        let registry = LockRegistry::new();
        let cache = faulty_cache_with(retries, "/faulty/store", &injector, &registry);
        (cache, injector)
    }

    /// String cache over a [`FaultyStore`] at `location`, sharing `injector`
    /// and `registry`.
    pub fn faulty_cache_with(
        retries: u32,
        location: impl Into<PathBuf>,
        injector: &FaultInjector,
        registry: &LockRegistry,
    ) -> ResilientCache<String, FaultyStore> {
        ResilientCache::with_store(
            fast_config(retries, location),
            DEFAULT_VALUE.to_string(),
            injector.clone(),
            registry,
        )
        .expect("cache creation should succeed")
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertions for safecache-specific validation.

    use super::*;

    /// Assert that a SafeCacheResult is Ok.
    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &SafeCacheResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }

    /// Assert that a SafeCacheResult is a Storage error.
    #[track_caller]
    pub fn assert_storage_error<T: std::fmt::Debug>(result: &SafeCacheResult<T>) {
        match result {
            Err(SafeCacheError::Storage(_)) => {}
            other => panic!("Expected Storage error, got: {:?}", other),
        }
    }

    /// Assert that a SafeCacheResult is a Corrupted storage error.
    #[track_caller]
    pub fn assert_corrupted<T: std::fmt::Debug>(result: &SafeCacheResult<T>) {
        match result {
            Err(SafeCacheError::Storage(StorageError::Corrupted { .. })) => {}
            other => panic!("Expected Corrupted error, got: {:?}", other),
        }
    }

    /// Assert that a SafeCacheResult is a Config error naming `field`.
    #[track_caller]
    pub fn assert_config_error<T: std::fmt::Debug>(result: &SafeCacheResult<T>, field: &str) {
        match result {
            Err(SafeCacheError::Config(ConfigError::InvalidValue { field: f, .. }))
            | Err(SafeCacheError::Config(ConfigError::MissingRequired { field: f })) => {
                assert_eq!(f, field, "Config error for wrong field");
            }
            other => panic!("Expected Config error for {}, got: {:?}", field, other),
        }
    }

    /// Assert a health snapshot has the expected status.
    #[track_caller]
    pub fn assert_health(check: &HealthCheck, expected: HealthStatus) {
        assert_eq!(
            check.status, expected,
            "Health status mismatch: expected {:?}, got {:?} ({:?})",
            expected, check.status, check.message
        );
    }

    /// Assert that a CacheConfig is valid.
    #[track_caller]
    pub fn assert_config_valid(config: &CacheConfig) {
        match config.validate() {
            Ok(()) => {}
            Err(e) => panic!("Config validation failed: {:?}", e),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
