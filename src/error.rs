use chrono::{DateTime, TimeDelta, Utc};

use crate::store::StoreError;
use crate::wire::WireError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T> = std::result::Result<T, TimerError>;

#[derive(Debug, thiserror::Error)]
pub enum TimerError {
    #[error("No schedule provider is registered; calendar timers cannot be computed")]
    MissingScheduleProvider,

    #[error("Invalid schedule expression '{expression}': {reason}")]
    InvalidSchedule { expression: String, reason: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument {
        message: String,
        #[source]
        source: BoxError,
    },

    #[error("Timeout {timeout} precedes timer start {start}")]
    TimeoutBeforeStart {
        start: DateTime<Utc>,
        timeout: DateTime<Utc>,
    },

    #[error("Remap produced a negative last timeout ({0})")]
    NegativeTimeout(TimeDelta),

    #[error("Wire format error: {0}")]
    Wire(#[from] WireError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl TimerError {
    pub fn invalid_argument(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
            source: source.into(),
        }
    }
}
