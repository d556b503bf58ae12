//! Typed access to the timers of a cluster sharing one [`TimerStore`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::entry::{TimeoutRemapper, TimerMetaDataEntry};
use crate::error::{Result, TimerError};
use crate::identity::TimerIndex;
use crate::offset::OffsetValue;
use crate::schedule::ScheduleTimeoutFactory;
use crate::store::TimerStore;
use crate::wire::{
    ContextMarshaller, EntryMarshaller, JsonContextMarshaller, Marshaller, TimerIndexMarshaller,
};

const TIMER_PREFIX: &str = "timer/";
const INDEX_PREFIX: &str = "index/";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimerId(Uuid);

impl TimerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    fn key(&self) -> Vec<u8> {
        format!("{TIMER_PREFIX}{}", self.0).into_bytes()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Uuid::from_slice(bytes)
            .map(Self)
            .map_err(|e| TimerError::invalid_argument("malformed timer id", e))
    }
}

impl Default for TimerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for TimerId {
    type Err = TimerError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| TimerError::invalid_argument(format!("malformed timer id '{s}'"), e))
    }
}

/// Outcome of [`TimerRegistry::create_auto`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AutoTimer {
    Created(TimerId),
    /// Another member created the timer for this index first.
    Existing(TimerId),
}

impl AutoTimer {
    pub fn id(&self) -> TimerId {
        match self {
            AutoTimer::Created(id) | AutoTimer::Existing(id) => *id,
        }
    }
}

pub struct TimerRegistry<C, M = JsonContextMarshaller> {
    store: Arc<dyn TimerStore>,
    marshaller: EntryMarshaller<C, M>,
}

impl<C: Clone, M: ContextMarshaller<C> + Clone> TimerRegistry<C, M> {
    pub fn new(store: Arc<dyn TimerStore>, context: M, factory: ScheduleTimeoutFactory) -> Self {
        Self {
            store,
            marshaller: EntryMarshaller::new(context, factory),
        }
    }

    pub fn marshaller(&self) -> &EntryMarshaller<C, M> {
        &self.marshaller
    }

    pub fn create(&self, entry: &TimerMetaDataEntry<C>) -> Result<TimerId> {
        let id = self.insert(entry)?;
        info!("Created {} timer {}", entry.timer_type(), id);
        Ok(id)
    }

    fn insert(&self, entry: &TimerMetaDataEntry<C>) -> Result<TimerId> {
        let value = self.marshaller.encode(entry)?;
        loop {
            let id = TimerId::new();
            if self.store.create(&id.key(), &value)? {
                return Ok(id);
            }
        }
    }

    /// Creates the timer for `index` unless some member already has.
    ///
    /// The entry is stored before the index is claimed, so a claimed index
    /// always names a stored timer. An index left pointing at a missing timer
    /// is taken over.
    pub fn create_auto(
        &self,
        index: &TimerIndex,
        entry: &TimerMetaDataEntry<C>,
    ) -> Result<AutoTimer> {
        let index_key = index_key(index)?;
        let id = self.insert(entry)?;
        let claimed = self.claim_index(index, &index_key, id);
        if !matches!(claimed, Ok(AutoTimer::Created(_))) {
            if let Err(e) = self.store.remove(&id.key()) {
                warn!("Failed to remove unclaimed timer {}: {}", id, e);
            }
        }
        claimed
    }

    fn claim_index(&self, index: &TimerIndex, index_key: &[u8], id: TimerId) -> Result<AutoTimer> {
        let ours = id.as_uuid().as_bytes().as_slice();
        loop {
            if self.store.create(index_key, ours)? {
                info!("Created automatic timer {} for {}", id, index);
                return Ok(AutoTimer::Created(id));
            }
            let Some(current) = self.store.read(index_key)? else {
                continue;
            };
            let existing = TimerId::from_bytes(&current)?;
            if self.store.read(&existing.key())?.is_some() {
                debug!("Automatic timer {} already exists as {}", index, existing);
                return Ok(AutoTimer::Existing(existing));
            }

            let swapped = self.store.compute_and_merge(index_key, &|value| {
                Ok(if value == current.as_slice() {
                    ours.to_vec()
                } else {
                    value.to_vec()
                })
            })?;
            if swapped.as_deref() == Some(ours) {
                warn!("Index {} named missing timer {}, replaced by {}", index, existing, id);
                return Ok(AutoTimer::Created(id));
            }
        }
    }

    pub fn read(&self, id: TimerId) -> Result<Option<TimerMetaDataEntry<C>>> {
        self.store
            .read(&id.key())?
            .map(|bytes| self.marshaller.decode(&bytes))
            .transpose()
    }

    /// Records `timeout` as the last timeout of `id`.
    ///
    /// Only the delta against the last timeout observed here is submitted, so
    /// concurrent records from other members are preserved. Returns the merged
    /// entry, or `None` if the timer no longer exists.
    pub fn record_timeout(
        &self,
        id: TimerId,
        timeout: DateTime<Utc>,
    ) -> Result<Option<TimerMetaDataEntry<C>>> {
        let Some(observed) = self.read(id)? else {
            return Ok(None);
        };
        let mut last_timeout =
            OffsetValue::new(observed.last_timeout().unwrap_or_else(TimeDelta::zero));
        observed.mutable(|| ()).set_last_timeout(Some(timeout))?;
        if let Some(relative) = observed.last_timeout() {
            last_timeout.set(relative);
        }

        let remapper = TimeoutRemapper::from_supplier(|| last_timeout.offset());
        let merged = self.store.compute_and_merge(&id.key(), &|bytes| {
            let current = self.marshaller.decode(bytes)?;
            let merged = remapper.remap(&current)?;
            Ok(self.marshaller.encode(&merged)?.to_vec())
        })?;
        merged.map(|bytes| self.marshaller.decode(&bytes)).transpose()
    }

    /// Removes the timer and any automatic index pointing at it.
    pub fn cancel(&self, id: TimerId) -> Result<bool> {
        let removed = self.store.remove(&id.key())?;
        for (key, value) in self.store.scan(INDEX_PREFIX.as_bytes())? {
            if value == id.as_uuid().as_bytes() {
                self.store.remove(&key)?;
            }
        }
        if removed {
            info!("Cancelled timer {}", id);
        }
        Ok(removed)
    }

    /// Removes the automatic timer created for `index`, if any.
    pub fn remove_auto(&self, index: &TimerIndex) -> Result<Option<TimerId>> {
        let index_key = index_key(index)?;
        let Some(value) = self.store.read(&index_key)? else {
            return Ok(None);
        };
        let id = TimerId::from_bytes(&value)?;
        self.store.remove(&id.key())?;
        self.store.remove(&index_key)?;
        info!("Removed automatic timer {} for {}", id, index);
        Ok(Some(id))
    }

    /// Every stored timer, ordered by id. Undecodable entries are logged and skipped.
    pub fn timers(&self) -> Result<Vec<(TimerId, TimerMetaDataEntry<C>)>> {
        let mut timers = Vec::new();
        for (key, value) in self.store.scan(TIMER_PREFIX.as_bytes())? {
            let suffix = String::from_utf8_lossy(&key[TIMER_PREFIX.len()..]).into_owned();
            let decoded = suffix
                .parse::<TimerId>()
                .and_then(|id| Ok((id, self.marshaller.decode(&value)?)));
            match decoded {
                Ok(timer) => timers.push(timer),
                Err(e) => warn!("Skipping unreadable timer {}: {}", suffix, e),
            }
        }
        Ok(timers)
    }
}

fn index_key(index: &TimerIndex) -> Result<Vec<u8>> {
    let encoded = TimerIndexMarshaller.encode(index)?;
    Ok(format!("{INDEX_PREFIX}{}", hex::encode(encoded)).into_bytes())
}
