//! LMDB-backed persistent store.
//!
//! Uses the heed crate (Rust bindings for LMDB) as the disk-backed engine
//! behind the resilient cache.
//!
//! # Environments
//!
//! LMDB permits one environment per path per process. Every handle opened at
//! the same location therefore shares one refcounted environment from a
//! process-wide table; closing the last handle drops it, which lets a later
//! open build a fresh one.
//!
//! # Thread Safety
//!
//! - Read transactions for `get`
//! - Write transactions for `set`, `delete`, and `purge_expired`
//! - `close` waits for in-flight operations on the same handle to finish

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions, MdbError};
use once_cell::sync::Lazy;
use safecache_core::{CacheConfig, SafeCacheError, SafeCacheResult, StorageError};

use crate::entry::{encode_entry, StoredEntry};
use crate::store::PersistentStore;

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Error reported by LMDB or heed.
    #[error("LMDB error: {0}")]
    Lmdb(#[from] heed::Error),

    /// I/O error while preparing the store directory.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Stored bytes do not follow the entry layout.
    #[error("Malformed entry for key {key}")]
    MalformedEntry { key: String },

    /// The process-wide environment table is poisoned.
    #[error("Environment table poisoned")]
    TablePoisoned,
}

impl LmdbStoreError {
    /// Whether LMDB reported a condition that clears up on its own.
    ///
    /// Reader-table and thread-slot exhaustion free up as other transactions
    /// finish, and a resized map is picked up by the next transaction.
    pub fn is_transient(&self) -> bool {
        match self {
            LmdbStoreError::Lmdb(heed::Error::Mdb(e)) => matches!(
                e,
                MdbError::ReadersFull | MdbError::TlsFull | MdbError::MapResized
            ),
            LmdbStoreError::Lmdb(heed::Error::Io(e)) | LmdbStoreError::Io(e) => {
                is_transient_io(e)
            }
            _ => false,
        }
    }

    /// Convert into the shared error taxonomy, tagging timeouts with `operation`.
    pub fn into_error(self, operation: &str) -> SafeCacheError {
        if self.is_transient() {
            return StorageError::timeout(operation, self.to_string()).into();
        }

        let reason = self.to_string();
        match self {
            LmdbStoreError::Lmdb(heed::Error::Mdb(
                MdbError::Corrupted
                | MdbError::Panic
                | MdbError::VersionMismatch
                | MdbError::Invalid,
            ))
            | LmdbStoreError::MalformedEntry { .. } => StorageError::Corrupted { reason }.into(),
            LmdbStoreError::Lmdb(heed::Error::Io(_)) | LmdbStoreError::Io(_) => {
                StorageError::Io { reason }.into()
            }
            LmdbStoreError::Lmdb(heed::Error::Encoding(_) | heed::Error::Decoding(_)) => {
                SafeCacheError::Serialization { reason }
            }
            LmdbStoreError::TablePoisoned => StorageError::LockPoisoned.into(),
            LmdbStoreError::Lmdb(_) => StorageError::TransactionFailed { reason }.into(),
        }
    }
}

impl From<LmdbStoreError> for SafeCacheError {
    fn from(e: LmdbStoreError) -> Self {
        e.into_error("lmdb")
    }
}

fn is_transient_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

// ============================================================================
// ENVIRONMENT TABLE
// ============================================================================

/// An open environment and its single unnamed database.
#[derive(Clone)]
struct OpenEnv {
    env: Env,
    db: Database<Str, Bytes>,
}

struct SharedEnv {
    open: OpenEnv,
    map_size_mb: usize,
    handles: usize,
}

static ENVIRONMENTS: Lazy<Mutex<HashMap<PathBuf, SharedEnv>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn acquire_env(path: &Path, map_size_mb: usize) -> Result<OpenEnv, LmdbStoreError> {
    let mut table = ENVIRONMENTS
        .lock()
        .map_err(|_| LmdbStoreError::TablePoisoned)?;

    if let Some(shared) = table.get_mut(path) {
        if shared.map_size_mb != map_size_mb {
            tracing::debug!(
                location = %path.display(),
                requested_mb = map_size_mb,
                active_mb = shared.map_size_mb,
                "environment already open, keeping its map size"
            );
        }
        shared.handles += 1;
        return Ok(shared.open.clone());
    }

    let env = unsafe {
        EnvOpenOptions::new()
            .map_size(map_size_mb * 1024 * 1024)
            .max_dbs(1)
            .open(path)
    }?;

    let mut wtxn = env.write_txn()?;
    let db: Database<Str, Bytes> = env.create_database(&mut wtxn, None)?;
    wtxn.commit()?;

    let open = OpenEnv { env, db };
    table.insert(
        path.to_path_buf(),
        SharedEnv {
            open: open.clone(),
            map_size_mb,
            handles: 1,
        },
    );
    Ok(open)
}

fn release_env(path: &Path) {
    let mut table = match ENVIRONMENTS.lock() {
        Ok(table) => table,
        Err(poisoned) => poisoned.into_inner(),
    };
    let last = match table.get_mut(path) {
        Some(shared) => {
            shared.handles = shared.handles.saturating_sub(1);
            shared.handles == 0
        }
        None => false,
    };
    if last {
        table.remove(path);
    }
}

// ============================================================================
// STORE
// ============================================================================

/// Open parameters for [`LmdbStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LmdbOptions {
    /// Maximum size of the memory map in megabytes.
    ///
    /// Applied only when the environment for a location is first opened in
    /// this process. Later handles on the same location share that environment
    /// and its map size, whatever they request.
    pub map_size_mb: usize,
}

impl Default for LmdbOptions {
    fn default() -> Self {
        Self {
            map_size_mb: safecache_core::DEFAULT_MAP_SIZE_MB,
        }
    }
}

impl From<&CacheConfig> for LmdbOptions {
    fn from(config: &CacheConfig) -> Self {
        Self {
            map_size_mb: config.map_size_mb,
        }
    }
}

/// LMDB-backed store handle.
///
/// # Example
///
/// ```ignore
/// use safecache_storage::{LmdbOptions, LmdbStore, PersistentStore};
///
/// let store = LmdbStore::open("/tmp/cache".as_ref(), &LmdbOptions::default())?;
/// store.set("foo", b"bar", None, true)?;
/// assert_eq!(store.get("foo", true)?, Some(b"bar".to_vec()));
/// store.close();
/// ```
pub struct LmdbStore {
    location: PathBuf,
    inner: RwLock<Option<OpenEnv>>,
}

impl LmdbStore {
    /// Run `op` against the open environment, retrying it once on a transient
    /// failure when `retry` is set.
    fn run<T>(
        &self,
        operation: &str,
        retry: bool,
        op: impl Fn(&OpenEnv) -> Result<T, LmdbStoreError>,
    ) -> SafeCacheResult<T> {
        let guard = self
            .inner
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        let open = guard.as_ref().ok_or_else(|| StorageError::Closed {
            location: self.location.display().to_string(),
        })?;

        match op(open) {
            Err(e) if retry && e.is_transient() => {
                tracing::debug!(operation, error = %e, "transient LMDB error, retrying once");
                op(open).map_err(|e| e.into_error(operation))
            }
            result => result.map_err(|e| e.into_error(operation)),
        }
    }

    /// Whether this handle has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.read().map(|g| g.is_none()).unwrap_or(true)
    }

    /// Number of entries currently stored, expired ones included.
    pub fn len(&self) -> SafeCacheResult<u64> {
        self.run("len", true, |open| {
            let rtxn = open.env.read_txn()?;
            Ok(open.db.len(&rtxn)?)
        })
    }

    pub fn is_empty(&self) -> SafeCacheResult<bool> {
        Ok(self.len()? == 0)
    }
}

impl PersistentStore for LmdbStore {
    type Options = LmdbOptions;

    fn open(location: &Path, options: &Self::Options) -> SafeCacheResult<Self> {
        std::fs::create_dir_all(location).map_err(|e| LmdbStoreError::from(e).into_error("open"))?;
        let canonical = std::fs::canonicalize(location)
            .map_err(|e| LmdbStoreError::from(e).into_error("open"))?;

        let open = acquire_env(&canonical, options.map_size_mb).map_err(|e| e.into_error("open"))?;
        tracing::debug!(location = %canonical.display(), "opened LMDB store");

        Ok(Self {
            location: canonical,
            inner: RwLock::new(Some(open)),
        })
    }

    fn location(&self) -> &Path {
        &self.location
    }

    fn get(&self, key: &str, retry: bool) -> SafeCacheResult<Option<Vec<u8>>> {
        self.run("get", retry, |open| {
            let rtxn = open.env.read_txn()?;
            let Some(bytes) = open.db.get(&rtxn, key)? else {
                return Ok(None);
            };
            let entry = StoredEntry::decode(bytes).ok_or_else(|| LmdbStoreError::MalformedEntry {
                key: key.to_string(),
            })?;
            if entry.is_expired(Utc::now()) {
                Ok(None)
            } else {
                Ok(Some(entry.payload().to_vec()))
            }
        })
    }

    fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
        retry: bool,
    ) -> SafeCacheResult<bool> {
        let bytes = encode_entry(value, ttl, Utc::now());
        self.run("set", retry, |open| {
            let mut wtxn = open.env.write_txn()?;
            open.db.put(&mut wtxn, key, bytes.as_slice())?;
            wtxn.commit()?;
            Ok(true)
        })
    }

    fn delete(&self, key: &str, retry: bool) -> SafeCacheResult<bool> {
        self.run("delete", retry, |open| {
            let mut wtxn = open.env.write_txn()?;
            // Expired entries are removed too, but they were not visible.
            let visible = match open.db.get(&wtxn, key)? {
                Some(bytes) => StoredEntry::decode(bytes)
                    .map(|entry| !entry.is_expired(Utc::now()))
                    .unwrap_or(true),
                None => false,
            };
            let deleted = open.db.delete(&mut wtxn, key)?;
            wtxn.commit()?;
            Ok(deleted && visible)
        })
    }

    fn purge_expired(&self, retry: bool) -> SafeCacheResult<u64> {
        self.run("purge_expired", retry, |open| {
            let now = Utc::now();
            let mut wtxn = open.env.write_txn()?;

            let mut expired = Vec::new();
            for result in open.db.iter(&wtxn)? {
                let (key, bytes) = result?;
                if StoredEntry::decode(bytes).is_some_and(|entry| entry.is_expired(now)) {
                    expired.push(key.to_string());
                }
            }

            let mut purged = 0u64;
            for key in &expired {
                if open.db.delete(&mut wtxn, key)? {
                    purged += 1;
                }
            }
            wtxn.commit()?;
            Ok(purged)
        })
    }

    fn close(&self) {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if guard.take().is_some() {
            release_env(&self.location);
            tracing::debug!(location = %self.location.display(), "closed LMDB store");
        }
    }
}

impl Drop for LmdbStore {
    fn drop(&mut self) {
        self.close();
    }
}
