//! Callback identity and the cluster-wide key for automatic timers.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const DEFAULT_TIMEOUT_METHOD_NAME: &str = "ejbTimeout";

/// Identifies the timeout callback of a component by name and arity only.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutDescriptor {
    method_name: String,
    parameter_count: u32,
}

/// A method a component exposes, as seen by the timeout dispatcher.
pub trait TimeoutMethod {
    fn name(&self) -> &str;

    fn parameter_count(&self) -> u32;
}

impl TimeoutDescriptor {
    pub fn new(method_name: impl Into<String>, parameter_count: u32) -> Self {
        Self {
            method_name: method_name.into(),
            parameter_count,
        }
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn parameter_count(&self) -> u32 {
        self.parameter_count
    }

    pub fn matches<M: TimeoutMethod + ?Sized>(&self, candidate: &M) -> bool {
        self.method_name == candidate.name() && self.parameter_count == candidate.parameter_count()
    }

    /// Locates the callback among a component's methods.
    pub fn find<'m, M: TimeoutMethod>(
        &self,
        methods: impl IntoIterator<Item = &'m M>,
    ) -> Option<&'m M>
    where
        M: 'm,
    {
        methods.into_iter().find(|method| self.matches(*method))
    }
}

/// The conventional `ejbTimeout(Timer)` callback.
impl Default for TimeoutDescriptor {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT_METHOD_NAME, 1)
    }
}

impl fmt::Display for TimeoutDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.method_name, self.parameter_count)
    }
}

impl TimeoutMethod for TimeoutDescriptor {
    fn name(&self) -> &str {
        &self.method_name
    }

    fn parameter_count(&self) -> u32 {
        self.parameter_count
    }
}

impl TimeoutMethod for (&str, u32) {
    fn name(&self) -> &str {
        self.0
    }

    fn parameter_count(&self) -> u32 {
        self.1
    }
}

/// Dedup key of a declaratively defined timer.
///
/// Every node deploying the same component derives the same index for the same
/// declaration, so an atomic create against the shared store admits exactly one
/// of them. `index` disambiguates several declarations on the same method.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerIndex {
    declaring_class_name: String,
    #[serde(flatten)]
    descriptor: TimeoutDescriptor,
    index: u32,
}

impl TimerIndex {
    pub fn new(
        declaring_class_name: impl Into<String>,
        descriptor: TimeoutDescriptor,
        index: u32,
    ) -> Self {
        Self {
            declaring_class_name: declaring_class_name.into(),
            descriptor,
            index,
        }
    }

    pub fn declaring_class_name(&self) -> &str {
        &self.declaring_class_name
    }

    pub fn descriptor(&self) -> &TimeoutDescriptor {
        &self.descriptor
    }

    pub fn method_name(&self) -> &str {
        self.descriptor.method_name()
    }

    pub fn parameter_count(&self) -> u32 {
        self.descriptor.parameter_count()
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for TimerIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}[{}]",
            self.declaring_class_name, self.descriptor, self.index
        )
    }
}
