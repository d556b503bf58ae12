use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::TimeDelta;

const NEVER: i64 = i64::MIN;

/// Millisecond duration slot with acquire/release visibility.
///
/// Replication may install a merged value while a scheduling thread reads it.
pub(crate) struct LastTimeoutCell(AtomicI64);

impl LastTimeoutCell {
    pub(crate) fn new(value: Option<TimeDelta>) -> Self {
        Self(AtomicI64::new(encode(value)))
    }

    pub(crate) fn get(&self) -> Option<TimeDelta> {
        decode(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, value: Option<TimeDelta>) {
        self.0.store(encode(value), Ordering::Release);
    }
}

fn encode(value: Option<TimeDelta>) -> i64 {
    value.map_or(NEVER, |d| d.num_milliseconds().max(NEVER + 1))
}

fn decode(raw: i64) -> Option<TimeDelta> {
    (raw != NEVER).then(|| TimeDelta::milliseconds(raw))
}

impl Clone for LastTimeoutCell {
    fn clone(&self) -> Self {
        Self::new(self.get())
    }
}

impl fmt::Debug for LastTimeoutCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.get(), f)
    }
}
