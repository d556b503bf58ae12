use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::{RemapFn, StoreError, TimerStore};
use crate::error::Result;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS timer_entries (
    key   BLOB PRIMARY KEY,
    value BLOB NOT NULL
);";

/// File-backed store. Every process opening the same file shares its timers.
pub struct SqliteTimerStore {
    conn: Mutex<Connection>,
}

fn db<T>(result: rusqlite::Result<T>) -> Result<T> {
    result.map_err(|e| StoreError::from(e).into())
}

impl SqliteTimerStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(StoreError::from)?;
        }
        Self::init(db(Connection::open(path))?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(db(Connection::open_in_memory())?)
    }

    fn init(conn: Connection) -> Result<Self> {
        db(conn.busy_timeout(std::time::Duration::from_secs(5)))?;
        db(conn.execute_batch(SCHEMA))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TimerStore for SqliteTimerStore {
    fn create(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let inserted = db(self.conn().execute(
            "INSERT OR IGNORE INTO timer_entries (key, value) VALUES (?1, ?2)",
            params![key, value],
        ))?;
        Ok(inserted == 1)
    }

    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        db(self
            .conn()
            .query_row(
                "SELECT value FROM timer_entries WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional())
    }

    fn compute_and_merge(&self, key: &[u8], remap: &RemapFn<'_>) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn();
        let tx = db(conn.transaction_with_behavior(TransactionBehavior::Immediate))?;
        let current: Option<Vec<u8>> = db(tx
            .query_row(
                "SELECT value FROM timer_entries WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional())?;
        let Some(current) = current else {
            return Ok(None);
        };
        let merged = remap(&current)?;
        db(tx.execute(
            "UPDATE timer_entries SET value = ?2 WHERE key = ?1",
            params![key, merged],
        ))?;
        db(tx.commit())?;
        Ok(Some(merged))
    }

    fn remove(&self, key: &[u8]) -> Result<bool> {
        let removed = db(self
            .conn()
            .execute("DELETE FROM timer_entries WHERE key = ?1", params![key]))?;
        Ok(removed > 0)
    }

    fn scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let conn = self.conn();
        let mut stmt = db(conn.prepare(
            "SELECT key, value FROM timer_entries WHERE substr(key, 1, ?2) = ?1 ORDER BY key",
        ))?;
        let rows = db(stmt.query_map(params![prefix, prefix.len() as i64], |row| {
            Ok((row.get(0)?, row.get(1)?))
        }))?;
        db(rows.collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TimerError;

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("timers.db");
        {
            let store = SqliteTimerStore::open(&path).unwrap();
            assert!(store.create(b"timer/1", b"v1").unwrap());
            assert!(!store.create(b"timer/1", b"v2").unwrap());
        }
        let store = SqliteTimerStore::open(&path).unwrap();
        assert_eq!(store.read(b"timer/1").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn failed_remap_rolls_back() {
        let store = SqliteTimerStore::open_in_memory().unwrap();
        store.create(b"k", b"before").unwrap();
        let result = store.compute_and_merge(b"k", &|_| {
            Err(TimerError::NegativeTimeout(chrono::TimeDelta::seconds(-1)))
        });
        assert!(result.is_err());
        assert_eq!(store.read(b"k").unwrap(), Some(b"before".to_vec()));

        let merged = store
            .compute_and_merge(b"k", &|bytes| Ok([bytes, b"+after"].concat()))
            .unwrap();
        assert_eq!(merged, Some(b"before+after".to_vec()));
        assert_eq!(store.read(b"k").unwrap(), Some(b"before+after".to_vec()));
    }

    #[test]
    fn table_holds_only_keys_and_values() {
        let store = SqliteTimerStore::open_in_memory().unwrap();
        let conn = store.conn();
        let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('timer_entries')").unwrap();
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(columns, ["key", "value"]);
    }

    #[test]
    fn scan_and_remove() {
        let store = SqliteTimerStore::open_in_memory().unwrap();
        store.create(b"timer/a", b"1").unwrap();
        store.create(b"timer/b", b"2").unwrap();
        store.create(b"index/a", b"3").unwrap();

        let scanned = store.scan(b"timer/").unwrap();
        assert_eq!(
            scanned,
            vec![
                (b"timer/a".to_vec(), b"1".to_vec()),
                (b"timer/b".to_vec(), b"2".to_vec()),
            ]
        );
        assert!(store.remove(b"timer/a").unwrap());
        assert!(!store.remove(b"timer/a").unwrap());
        assert_eq!(store.scan(b"timer/").unwrap().len(), 1);
        assert!(store.compute_and_merge(b"timer/a", &|b| Ok(b.to_vec())).unwrap().is_none());
    }
}
