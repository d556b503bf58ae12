use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use tracing::debug;

use super::{RemapFn, TimerStore};
use crate::error::Result;

struct Versioned {
    version: u64,
    value: Vec<u8>,
}

/// Process-local store with optimistic merges.
///
/// `compute_and_merge` runs the remap outside the lock and commits only if no
/// other writer got in first; otherwise it re-reads and runs the remap again.
#[derive(Default)]
pub struct InMemoryTimerStore {
    entries: RwLock<BTreeMap<Vec<u8>, Versioned>>,
}

impl InMemoryTimerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TimerStore for InMemoryTimerStore {
    fn create(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(
            key.to_vec(),
            Versioned {
                version: 0,
                value: value.to_vec(),
            },
        );
        Ok(true)
    }

    fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).map(|entry| entry.value.clone()))
    }

    fn compute_and_merge(&self, key: &[u8], remap: &RemapFn<'_>) -> Result<Option<Vec<u8>>> {
        loop {
            let (version, current) = {
                let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
                match entries.get(key) {
                    Some(entry) => (entry.version, entry.value.clone()),
                    None => return Ok(None),
                }
            };
            let merged = remap(&current)?;

            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            match entries.get_mut(key) {
                None => return Ok(None),
                Some(entry) if entry.version == version => {
                    entry.version += 1;
                    entry.value = merged.clone();
                    return Ok(Some(merged));
                }
                Some(_) => debug!("Concurrent write to {}, retrying merge", hex::encode(key)),
            }
        }
    }

    fn remove(&self, key: &[u8]) -> Result<bool> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.remove(key).is_some())
    }

    fn scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect())
    }
}
