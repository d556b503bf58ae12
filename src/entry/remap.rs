use chrono::TimeDelta;
use tracing::debug;

use super::TimerMetaDataEntry;
use crate::error::{Result, TimerError};
use crate::offset::{DurationOffset, Offset};

/// Folds a last-timeout delta into whatever entry the store currently holds.
///
/// The store may invoke [`TimeoutRemapper::remap`] any number of times while it
/// retries a conflicting write. Each call reads only its argument and the
/// captured offset and returns a fresh entry.
#[derive(Clone, Debug)]
pub struct TimeoutRemapper<O = DurationOffset> {
    offset: O,
}

impl<O: Offset<TimeDelta>> TimeoutRemapper<O> {
    pub fn new(offset: O) -> Self {
        Self { offset }
    }

    pub fn from_supplier(supplier: impl FnOnce() -> O) -> Self {
        Self::new(supplier())
    }

    pub fn offset(&self) -> &O {
        &self.offset
    }

    /// An entry that never fired is treated as having a zero last timeout.
    pub fn remap<C: Clone>(&self, entry: &TimerMetaDataEntry<C>) -> Result<TimerMetaDataEntry<C>> {
        let current = entry.last_timeout().unwrap_or_else(TimeDelta::zero);
        let updated = self.offset.apply(current);
        if updated < TimeDelta::zero() {
            return Err(TimerError::NegativeTimeout(updated));
        }
        debug!(
            "Remapped last timeout {:?} -> {} ms",
            entry.last_timeout().map(|d| d.num_milliseconds()),
            updated.num_milliseconds()
        );
        Ok(entry.with_last_timeout(Some(updated)))
    }
}
