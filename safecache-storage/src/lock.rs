//! Named write locks keyed by store location.
//!
//! Every cache pointed at the same store location must serialize its writes
//! through the same lock, so locks are handed out by a [`LockRegistry`] rather
//! than owned by any one cache. A lock lives as long as its registry; closing
//! a cache never releases it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use once_cell::sync::Lazy;

static GLOBAL_REGISTRY: Lazy<LockRegistry> = Lazy::new(LockRegistry::new);

/// A mutual-exclusion lock identified by a store location and a name.
#[derive(Debug)]
pub struct NamedLock {
    location: PathBuf,
    name: String,
    mutex: Mutex<()>,
}

/// Proof that a [`NamedLock`] is held. Releases the lock on drop.
#[derive(Debug)]
pub struct NamedLockGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

impl NamedLock {
    fn new(location: PathBuf, name: String) -> Self {
        Self {
            location,
            name,
            mutex: Mutex::new(()),
        }
    }

    /// Block until the lock is free, then hold it.
    pub fn acquire(&self) -> NamedLockGuard<'_> {
        // The mutex guards no data, so a holder that panicked left nothing
        // inconsistent behind.
        let guard = match self.mutex.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        NamedLockGuard { _guard: guard }
    }

    /// Hold the lock if it is free right now.
    pub fn try_acquire(&self) -> Option<NamedLockGuard<'_>> {
        match self.mutex.try_lock() {
            Ok(guard) => Some(NamedLockGuard { _guard: guard }),
            Err(std::sync::TryLockError::Poisoned(poisoned)) => Some(NamedLockGuard {
                _guard: poisoned.into_inner(),
            }),
            Err(std::sync::TryLockError::WouldBlock) => None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> &Path {
        &self.location
    }
}

/// Hands out one [`NamedLock`] per `(location, name)` pair.
#[derive(Debug, Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<(PathBuf, String), Arc<NamedLock>>>,
}

impl LockRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry used when no registry is injected.
    pub fn global() -> &'static LockRegistry {
        &GLOBAL_REGISTRY
    }

    /// The lock named `name` for `location`, created on first use.
    ///
    /// Locations are canonicalized when they exist, so different spellings
    /// of one directory share a lock.
    pub fn lock_for(&self, location: &Path, name: &str) -> Arc<NamedLock> {
        let location =
            std::fs::canonicalize(location).unwrap_or_else(|_| location.to_path_buf());
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        let lock = locks
            .entry((location.clone(), name.to_string()))
            .or_insert_with(|| Arc::new(NamedLock::new(location, name.to_string())));
        Arc::clone(lock)
    }

    /// Number of distinct locks handed out so far.
    pub fn len(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
