//! safecache storage
//!
//! The LMDB-backed [`LmdbStore`], the named write locks that serialize
//! mutations per store location, and [`ResilientCache`], which retries
//! timed-out store operations with exponential backoff and rebuilds the store
//! handle once the retries run out.

pub mod entry;
pub mod lmdb_store;
pub mod lock;
pub mod resilient;
pub mod retry;
pub mod store;

pub use entry::{encode_entry, StoredEntry, HEADER_LEN};
pub use lmdb_store::{LmdbOptions, LmdbStore, LmdbStoreError};
pub use lock::{LockRegistry, NamedLock, NamedLockGuard};
pub use resilient::{CacheStats, ReadOptions, ResilientCache, WriteOptions};
pub use retry::{with_retry, Attempted};
pub use store::PersistentStore;
