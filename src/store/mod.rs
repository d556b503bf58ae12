//! Shared key-value store holding encoded timer metadata.
//!
//! Keys and values are opaque bytes; typed access lives in
//! [`crate::registry::TimerRegistry`].

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use tracing::info;

use crate::config::{AppConfig, StoreKind};
use crate::error::Result;

pub use memory::InMemoryTimerStore;
pub use sqlite::SqliteTimerStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Merge function handed to [`TimerStore::compute_and_merge`].
///
/// It may run several times for one call and must depend on nothing but its argument.
pub type RemapFn<'a> = dyn Fn(&[u8]) -> Result<Vec<u8>> + 'a;

pub trait TimerStore: Send + Sync {
    /// Inserts `value` unless `key` exists. Returns whether this call created it.
    fn create(&self, key: &[u8], value: &[u8]) -> Result<bool>;

    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Atomically replaces the value of `key` with `remap(value)`.
    /// Returns the merged value, or `None` if the key is absent.
    fn compute_and_merge(
        &self,
        key: &[u8],
        remap: &RemapFn<'_>,
    ) -> Result<Option<Vec<u8>>>;

    /// Returns whether a value was removed.
    fn remove(&self, key: &[u8]) -> Result<bool>;

    /// All entries whose key starts with `prefix`, ordered by key.
    fn scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

pub fn open_store(config: &AppConfig) -> Result<Arc<dyn TimerStore>> {
    match config.store {
        StoreKind::Memory => {
            info!("Store: in-memory");
            Ok(Arc::new(InMemoryTimerStore::new()))
        }
        StoreKind::Sqlite => {
            let path = config.data_dir.join("timers.db");
            info!("Store: sqlite at {}", path.display());
            Ok(Arc::new(SqliteTimerStore::open(&path)?))
        }
    }
}
