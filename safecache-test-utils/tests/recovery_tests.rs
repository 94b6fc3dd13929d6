//! Integration tests for retry, backoff, and store recovery
//!
//! Every test drives a cache over the fault-injecting store. With `retries = 3`
//! the cache makes two attempts of its own, and each attempt with internal
//! retry enabled costs the store two calls.
//!
//! Tests verify:
//! - Timeouts absorbed by retries are invisible to the caller
//! - Exhaustion returns the fallback (false / default / 0) and rebuilds the handle
//! - Non-timeout errors propagate untouched, with no recovery
//! - A failed reopen surfaces its error and the next operation reopens lazily
//! - Writers are serialized through the shared named lock
//! - A read caught on a handle that recovery replaced moves to the new handle

use safecache_test_utils::fixtures::{self, DEFAULT_VALUE};
use safecache_test_utils::{
    assertions, FaultInjector, FaultKind, FaultyStore, HealthStatus, LockRegistry,
    PersistentStore, ReadOptions, ResilientCache, SafeCacheError, SafeCacheResult, StorageError,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn test_single_timeout_absorbed_by_store() {
    let (cache, injector) = fixtures::faulty_cache(3);
    injector.fail_next(1, FaultKind::Timeout);

    assert!(cache.put("k", &"v".to_string()).expect("put should succeed"));
    assert_eq!(cache.stats().timeouts, 0);
    assert_eq!(injector.calls(), 2);
}

#[test]
fn test_timed_out_attempt_is_retried() {
    safecache_test_utils::init_test_tracing();
    let (cache, injector) = fixtures::faulty_cache(3);
    injector.fail_next(2, FaultKind::Timeout);

    assert!(cache.put("k", &"v".to_string()).expect("put should succeed"));
    assert_eq!(cache.get("k").expect("get should succeed"), "v");

    let stats = cache.stats();
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.fallbacks, 0);
    assert_eq!(cache.generation(), 0);
    assert_eq!(injector.opens(), 1);
}

#[test]
fn test_read_without_internal_retry() {
    let (cache, injector) = fixtures::faulty_cache(3);
    cache.put("k", &"v".to_string()).expect("put should succeed");
    injector.fail_next(1, FaultKind::Timeout);

    let value = cache
        .get_with("k", ReadOptions::new().with_retry(false))
        .expect("get should succeed");
    assert_eq!(value, "v");
    assert_eq!(cache.stats().timeouts, 1);
}

#[test]
fn test_put_exhaustion_returns_false_and_recovers() {
    let (cache, injector) = fixtures::faulty_cache(3);
    injector.fail_always(FaultKind::Timeout);

    assert!(!cache.put("k", &"v".to_string()).expect("exhaustion is not an error"));
    assert_eq!(injector.calls(), 4);
    assert_eq!(injector.opens(), 2);
    assert_eq!(injector.closes(), 1);
    assert_eq!(cache.generation(), 1);

    let stats = cache.stats();
    assert_eq!(stats.timeouts, 2);
    assert_eq!(stats.fallbacks, 1);
    assert_eq!(stats.recoveries, 1);

    let check = cache.health();
    assertions::assert_health(&check, HealthStatus::Degraded);
    let metadata = check.metadata.expect("metadata should be set");
    assert_eq!(metadata["generation"], serde_json::json!(1));

    injector.clear();
    assert!(cache.put("k", &"v".to_string()).expect("put should succeed"));
    assert_eq!(cache.get("k").expect("get should succeed"), "v");
    assertions::assert_health(&cache.health(), HealthStatus::Healthy);
}

#[test]
fn test_get_exhaustion_returns_resolved_default() {
    let (cache, injector) = fixtures::faulty_cache(3);
    cache.put("k", &"stored".to_string()).expect("put should succeed");
    injector.fail_always(FaultKind::Timeout);

    assert_eq!(cache.get("k").expect("exhaustion is not an error"), DEFAULT_VALUE);
    assert_eq!(
        cache
            .get_or("k", "X".to_string())
            .expect("exhaustion is not an error"),
        "X"
    );
    assert_eq!(cache.generation(), 2);

    injector.clear();
    assert_eq!(cache.get("k").expect("get should succeed"), "stored");
}

#[test]
fn test_delete_exhaustion_returns_false() {
    let (cache, injector) = fixtures::faulty_cache(3);
    cache.put("k", &"v".to_string()).expect("put should succeed");
    injector.fail_always(FaultKind::Timeout);

    assert!(!cache.delete("k").expect("exhaustion is not an error"));

    injector.clear();
    assert_eq!(cache.get("k").expect("get should succeed"), "v");
    assert!(cache.delete("k").expect("delete should succeed"));
}

#[test]
fn test_purge_exhaustion_returns_zero() {
    let (cache, injector) = fixtures::faulty_cache(3);
    injector.fail_always(FaultKind::Timeout);
    assert_eq!(cache.purge_expired().expect("exhaustion is not an error"), 0);
    assert_eq!(cache.stats().fallbacks, 1);
}

#[test]
fn test_backoff_doubles_between_attempts() {
    let injector = FaultInjector::new();
    let registry = LockRegistry::new();
    let config =
        fixtures::fast_config(4, "/faulty/backoff").with_backoff_base(Duration::from_millis(10));
    let cache: ResilientCache<String, FaultyStore> = ResilientCache::with_store(
        config,
        DEFAULT_VALUE.to_string(),
        injector.clone(),
        &registry,
    )
    .expect("cache creation should succeed");
    injector.fail_always(FaultKind::Timeout);

    // 10ms + 20ms + 40ms, the last sleep included
    let started = Instant::now();
    assert!(!cache.put("k", &"v".to_string()).expect("exhaustion is not an error"));
    assert!(started.elapsed() >= Duration::from_millis(70));
    assert_eq!(cache.stats().timeouts, 3);
}

#[test]
fn test_non_timeout_errors_propagate() {
    let (cache, injector) = fixtures::faulty_cache(3);

    injector.fail_next(1, FaultKind::Corrupted);
    assertions::assert_corrupted(&cache.get("k"));

    injector.fail_next(1, FaultKind::Io);
    let err = cache
        .put("k", &"v".to_string())
        .expect_err("I/O failures should propagate");
    assert!(matches!(err, SafeCacheError::Storage(StorageError::Io { .. })));

    assert_eq!(injector.calls(), 2);
    assert_eq!(cache.generation(), 0);
    assert_eq!(cache.stats().fallbacks, 0);
}

#[test]
fn test_hard_error_after_timeout_propagates() {
    let (cache, injector) = fixtures::faulty_cache(4);
    injector.fail_next(2, FaultKind::Timeout);
    injector.fail_next(1, FaultKind::Corrupted);

    assertions::assert_corrupted(&cache.delete("k"));
    assert_eq!(cache.stats().timeouts, 1);
    assert_eq!(cache.generation(), 0);
}

#[test]
fn test_failed_reopen_surfaces_error_then_reopens_lazily() {
    let (cache, injector) = fixtures::faulty_cache(3);
    cache.put("k", &"v".to_string()).expect("put should succeed");
    injector.fail_always(FaultKind::Timeout);
    injector.fail_opens(1);

    let result = cache.put("k", &"w".to_string());
    assertions::assert_storage_error(&result);
    assertions::assert_health(&cache.health(), HealthStatus::Unhealthy);

    injector.clear();
    assert_eq!(cache.get("k").expect("get should succeed"), "v");
    assert_eq!(cache.generation(), 2);
    assert_eq!(injector.opens(), 2);
    assertions::assert_health(&cache.health(), HealthStatus::Healthy);
}

#[test]
fn test_writers_are_serialized() {
    let (cache, injector) = fixtures::faulty_cache(3);
    injector.set_write_delay(Duration::from_millis(2));

    thread::scope(|s| {
        for worker in 0..6 {
            let cache = &cache;
            s.spawn(move || {
                for i in 0..5 {
                    cache
                        .put(&format!("w{worker}:{i}"), &"v".to_string())
                        .expect("put should succeed");
                }
            });
        }
    });

    assert_eq!(injector.max_concurrent_writers(), 1);
}

#[test]
fn test_caches_sharing_location_serialize_writers() {
    let injector = FaultInjector::new();
    let registry = LockRegistry::new();
    let a = fixtures::faulty_cache_with(3, "/faulty/shared", &injector, &registry);
    let b = fixtures::faulty_cache_with(3, "/faulty/shared", &injector, &registry);
    injector.set_write_delay(Duration::from_millis(2));

    thread::scope(|s| {
        s.spawn(|| {
            for i in 0..10 {
                a.put(&format!("a{i}"), &"v".to_string()).expect("put should succeed");
                a.delete(&format!("a{i}")).expect("delete should succeed");
            }
        });
        s.spawn(|| {
            for i in 0..10 {
                b.put(&format!("b{i}"), &"v".to_string()).expect("put should succeed");
            }
        });
    });

    assert_eq!(injector.max_concurrent_writers(), 1);
    assert_eq!(a.get("b9").expect("get should succeed"), "v");
}

#[test]
fn test_concurrent_exhaustion_leaves_cache_usable() {
    let (cache, injector) = fixtures::faulty_cache(3);
    injector.fail_always(FaultKind::Timeout);

    thread::scope(|s| {
        for _ in 0..4 {
            let cache = &cache;
            s.spawn(move || {
                assert_eq!(cache.get("k").expect("exhaustion is not an error"), DEFAULT_VALUE);
            });
        }
    });

    assert!(cache.generation() >= 1);
    assert_eq!(cache.generation(), cache.stats().recoveries);

    injector.clear();
    assert!(cache.put("k", &"v".to_string()).expect("put should succeed"));
    assert_eq!(cache.get("k").expect("get should succeed"), "v");
}

#[test]
fn test_close_releases_store_handle() {
    let (cache, injector) = fixtures::faulty_cache(3);
    cache.close();
    assert_eq!(injector.closes(), 1);
}

// ============================================================================
// HANDLE HANDOVER
// ============================================================================

/// Lets one read on the first handle stall until the test releases it.
#[derive(Default)]
struct ReadGate {
    state: Mutex<(bool, bool)>,
    changed: Condvar,
}

impl ReadGate {
    fn enter_and_wait(&self) {
        let mut state = self.state.lock().expect("gate lock");
        state.0 = true;
        self.changed.notify_all();
        while !state.1 {
            state = self.changed.wait(state).expect("gate wait");
        }
    }

    fn wait_entered(&self) {
        let mut state = self.state.lock().expect("gate lock");
        while !state.0 {
            state = self.changed.wait(state).expect("gate wait");
        }
    }

    fn release(&self) {
        let mut state = self.state.lock().expect("gate lock");
        state.1 = true;
        self.changed.notify_all();
    }
}

#[derive(Default)]
struct HandoverState {
    opens: AtomicU64,
    gate: ReadGate,
    stall_first_read: AtomicBool,
    always_closed: AtomicBool,
}

#[derive(Clone, Default)]
struct Handover {
    state: Arc<HandoverState>,
}

/// Store whose first handle times out on every write. Reads return the
/// handle's generation as the value.
struct HandoverStore {
    generation: u64,
    location: PathBuf,
    shared: Handover,
    closed: AtomicBool,
}

impl HandoverStore {
    fn check_open(&self) -> SafeCacheResult<()> {
        let closed = self.closed.load(Ordering::SeqCst)
            || self.shared.state.always_closed.load(Ordering::SeqCst);
        if closed {
            return Err(StorageError::Closed {
                location: self.location.display().to_string(),
            }
            .into());
        }
        Ok(())
    }
}

impl PersistentStore for HandoverStore {
    type Options = Handover;

    fn open(location: &Path, shared: &Self::Options) -> SafeCacheResult<Self> {
        Ok(Self {
            generation: shared.state.opens.fetch_add(1, Ordering::SeqCst),
            location: location.to_path_buf(),
            shared: shared.clone(),
            closed: AtomicBool::new(false),
        })
    }

    fn location(&self) -> &Path {
        &self.location
    }

    fn get(&self, _key: &str, _retry: bool) -> SafeCacheResult<Option<Vec<u8>>> {
        let stall = self.generation == 0
            && self.shared.state.stall_first_read.swap(false, Ordering::SeqCst);
        if stall {
            self.shared.state.gate.enter_and_wait();
        }
        self.check_open()?;
        Ok(Some(serde_json::to_vec(&format!("gen{}", self.generation))?))
    }

    fn set(
        &self,
        key: &str,
        _value: &[u8],
        _ttl: Option<Duration>,
        _retry: bool,
    ) -> SafeCacheResult<bool> {
        self.check_open()?;
        if self.generation == 0 {
            return Err(StorageError::timeout("set", format!("first handle stuck on {key}")).into());
        }
        Ok(true)
    }

    fn delete(&self, _key: &str, _retry: bool) -> SafeCacheResult<bool> {
        self.check_open()?;
        Ok(false)
    }

    fn purge_expired(&self, _retry: bool) -> SafeCacheResult<u64> {
        self.check_open()?;
        Ok(0)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn handover_cache(location: &str, handover: &Handover) -> ResilientCache<String, HandoverStore> {
    ResilientCache::with_store(
        fixtures::fast_config(2, location),
        DEFAULT_VALUE.to_string(),
        handover.clone(),
        &LockRegistry::new(),
    )
    .expect("cache creation should succeed")
}

#[test]
fn test_read_on_replaced_handle_moves_to_new_handle() {
    let handover = Handover::default();
    handover.state.stall_first_read.store(true, Ordering::SeqCst);
    let cache = handover_cache("/handover/replaced", &handover);

    thread::scope(|s| {
        let reader = s.spawn(|| cache.get("k"));
        handover.state.gate.wait_entered();

        // The write exhausts on the first handle and recovery swaps in the second
        // while the read is still holding the first.
        assert!(!cache.put("k", &"v".to_string()).expect("exhaustion is not an error"));
        assert_eq!(cache.generation(), 1);

        handover.state.gate.release();
        let value = reader
            .join()
            .expect("reader should not panic")
            .expect("get should succeed");
        assert_eq!(value, "gen1");
    });

    assert_eq!(handover.state.opens.load(Ordering::SeqCst), 2);
    assert_eq!(cache.stats().recoveries, 1);
}

#[test]
fn test_closed_handle_without_replacement_propagates() {
    let handover = Handover::default();
    let cache = handover_cache("/handover/closed", &handover);
    handover.state.always_closed.store(true, Ordering::SeqCst);

    let err = cache.get("k").expect_err("a closed handle with no successor should fail");
    assert!(err.is_closed());
    assert_eq!(cache.generation(), 0);
    assert_eq!(cache.stats().fallbacks, 0);
    assert_eq!(handover.state.opens.load(Ordering::SeqCst), 1);
}
