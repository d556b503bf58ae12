//! Clustered timer metadata: timer entries, last-timeout merging, lazily
//! computed calendar schedules and their tagged binary encoding.

pub mod config;
pub mod entry;
pub mod error;
pub mod identity;
pub mod offset;
pub mod registry;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod wire;

pub use error::{Result, TimerError};
