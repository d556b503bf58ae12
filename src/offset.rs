//! Commutative deltas over durations and instants.
//!
//! A node never ships an absolute "last fired" value to the store. It ships the
//! difference between what it observed and what it wants, and the store folds
//! that difference into whatever the authoritative copy holds at merge time.

use chrono::{DateTime, TimeDelta, Utc};

/// A pure, composable change to a value of type `V`.
///
/// Implementations must make `combine` commutative and associative so that
/// offsets from different nodes converge regardless of merge order.
pub trait Offset<V>: Clone + Send + Sync {
    fn is_zero(&self) -> bool;

    fn apply(&self, value: V) -> V;

    fn combine(&self, other: &Self) -> Self;
}

/// Values that can describe the offset leading from one value to another.
pub trait Offsettable: Clone {
    type Offset: Offset<Self>;

    fn offset_to(&self, target: &Self) -> Self::Offset;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DurationOffset(TimeDelta);

impl DurationOffset {
    pub const ZERO: Self = Self(TimeDelta::zero());

    pub const fn new(delta: TimeDelta) -> Self {
        Self(delta)
    }

    pub const fn delta(&self) -> TimeDelta {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn combine(&self, other: &Self) -> Self {
        Self(self.apply(other.0))
    }
}

impl From<TimeDelta> for DurationOffset {
    fn from(delta: TimeDelta) -> Self {
        Self(delta)
    }
}

impl Offset<TimeDelta> for DurationOffset {
    fn is_zero(&self) -> bool {
        DurationOffset::is_zero(self)
    }

    fn apply(&self, value: TimeDelta) -> TimeDelta {
        value
            .checked_add(&self.0)
            .unwrap_or(if self.0 < TimeDelta::zero() {
                TimeDelta::MIN
            } else {
                TimeDelta::MAX
            })
    }

    fn combine(&self, other: &Self) -> Self {
        DurationOffset::combine(self, other)
    }
}

impl Offset<DateTime<Utc>> for DurationOffset {
    fn is_zero(&self) -> bool {
        DurationOffset::is_zero(self)
    }

    fn apply(&self, value: DateTime<Utc>) -> DateTime<Utc> {
        value.checked_add_signed(self.0).unwrap_or(value)
    }

    fn combine(&self, other: &Self) -> Self {
        DurationOffset::combine(self, other)
    }
}

impl Offsettable for TimeDelta {
    type Offset = DurationOffset;

    fn offset_to(&self, target: &Self) -> DurationOffset {
        DurationOffset(target.checked_sub(self).unwrap_or(TimeDelta::zero()))
    }
}

impl Offsettable for DateTime<Utc> {
    type Offset = DurationOffset;

    fn offset_to(&self, target: &Self) -> DurationOffset {
        DurationOffset(target.signed_duration_since(*self))
    }
}

/// A local cell pairing the value last observed from the store with a pending
/// value that has not been committed yet.
#[derive(Clone, Debug, PartialEq)]
pub struct OffsetValue<V: Offsettable> {
    base: V,
    value: V,
}

impl<V: Offsettable> OffsetValue<V> {
    pub fn new(base: V) -> Self {
        Self {
            value: base.clone(),
            base,
        }
    }

    pub fn base(&self) -> &V {
        &self.base
    }

    pub fn get(&self) -> &V {
        &self.value
    }

    pub fn set(&mut self, value: V) {
        self.value = value;
    }

    /// The delta that, applied to the base, yields the pending value.
    pub fn offset(&self) -> V::Offset {
        self.base.offset_to(&self.value)
    }

    /// Marks the pending value as committed.
    pub fn rebase(&mut self) {
        self.base = self.value.clone();
    }
}
