//! Calendar schedules and the lazily bound next-timeout function.

pub mod cron;

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TimerError};

pub use self::cron::CronScheduleProvider;

pub const DEFAULT_TIME_FIELD: &str = "0";
pub const DEFAULT_DATE_FIELD: &str = "*";

/// Cron-like calendar expression with optional zone and validity window.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScheduleExpression {
    pub second: String,
    pub minute: String,
    pub hour: String,
    pub day_of_month: String,
    pub month: String,
    pub day_of_week: String,
    pub year: String,
    pub zone: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl Default for ScheduleExpression {
    fn default() -> Self {
        Self {
            second: DEFAULT_TIME_FIELD.to_string(),
            minute: DEFAULT_TIME_FIELD.to_string(),
            hour: DEFAULT_TIME_FIELD.to_string(),
            day_of_month: DEFAULT_DATE_FIELD.to_string(),
            month: DEFAULT_DATE_FIELD.to_string(),
            day_of_week: DEFAULT_DATE_FIELD.to_string(),
            year: DEFAULT_DATE_FIELD.to_string(),
            zone: None,
            start: None,
            end: None,
        }
    }
}

impl ScheduleExpression {
    pub fn second(mut self, second: impl Into<String>) -> Self {
        self.second = second.into();
        self
    }

    pub fn minute(mut self, minute: impl Into<String>) -> Self {
        self.minute = minute.into();
        self
    }

    pub fn hour(mut self, hour: impl Into<String>) -> Self {
        self.hour = hour.into();
        self
    }

    pub fn day_of_month(mut self, day_of_month: impl Into<String>) -> Self {
        self.day_of_month = day_of_month.into();
        self
    }

    pub fn month(mut self, month: impl Into<String>) -> Self {
        self.month = month.into();
        self
    }

    pub fn day_of_week(mut self, day_of_week: impl Into<String>) -> Self {
        self.day_of_week = day_of_week.into();
        self
    }

    pub fn year(mut self, year: impl Into<String>) -> Self {
        self.year = year.into();
        self
    }

    pub fn zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    pub fn start(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    pub fn end(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }
}

impl fmt::Display for ScheduleExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "second={} minute={} hour={} dayOfMonth={} month={} dayOfWeek={} year={}",
            self.second,
            self.minute,
            self.hour,
            self.day_of_month,
            self.month,
            self.day_of_week,
            self.year
        )?;
        if let Some(zone) = &self.zone {
            write!(f, " zone={zone}")?;
        }
        if let Some(start) = &self.start {
            write!(f, " start={}", start.to_rfc3339())?;
        }
        if let Some(end) = &self.end {
            write!(f, " end={}", end.to_rfc3339())?;
        }
        Ok(())
    }
}

/// Maps the previous timeout (or none, for the first one) to the next timeout.
pub type ScheduleOperator = Arc<dyn Fn(Option<DateTime<Utc>>) -> Option<DateTime<Utc>> + Send + Sync>;

/// Pluggable calendar math.
pub trait ScheduleProvider: Send + Sync {
    fn create_operator(&self, expression: &ScheduleExpression) -> Result<ScheduleOperator>;
}

static REGISTERED_PROVIDER: OnceLock<Arc<dyn ScheduleProvider>> = OnceLock::new();

/// Registers the process-wide provider. Returns false if one was already registered.
pub fn register_schedule_provider(provider: Arc<dyn ScheduleProvider>) -> bool {
    REGISTERED_PROVIDER.set(provider).is_ok()
}

/// Binds schedule expressions to a provider.
///
/// A factory without a provider is valid to construct; the failure surfaces as
/// [`TimerError::MissingScheduleProvider`] when a timeout is first computed.
#[derive(Clone, Default)]
pub struct ScheduleTimeoutFactory {
    provider: Option<Arc<dyn ScheduleProvider>>,
}

impl ScheduleTimeoutFactory {
    pub fn new(provider: Arc<dyn ScheduleProvider>) -> Self {
        Self {
            provider: Some(provider),
        }
    }

    pub fn unconfigured() -> Self {
        Self { provider: None }
    }

    /// Uses whatever provider was registered with [`register_schedule_provider`].
    pub fn discover() -> Self {
        Self {
            provider: REGISTERED_PROVIDER.get().cloned(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.provider.is_some()
    }

    pub fn bind(&self, expression: ScheduleExpression) -> LazyScheduleOperator {
        LazyScheduleOperator {
            expression,
            provider: self.provider.clone(),
            operator: OnceLock::new(),
            init: Mutex::new(()),
        }
    }
}

impl fmt::Debug for ScheduleTimeoutFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleTimeoutFactory")
            .field("configured", &self.is_configured())
            .finish()
    }
}

/// An expression whose operator is computed on first use and reused afterwards.
pub struct LazyScheduleOperator {
    expression: ScheduleExpression,
    provider: Option<Arc<dyn ScheduleProvider>>,
    operator: OnceLock<ScheduleOperator>,
    init: Mutex<()>,
}

impl LazyScheduleOperator {
    pub fn expression(&self) -> &ScheduleExpression {
        &self.expression
    }

    pub fn is_computed(&self) -> bool {
        self.operator.get().is_some()
    }

    pub fn operator(&self) -> Result<ScheduleOperator> {
        if let Some(operator) = self.operator.get() {
            return Ok(operator.clone());
        }
        let _guard = self.init.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(operator) = self.operator.get() {
            return Ok(operator.clone());
        }
        let provider = self
            .provider
            .as_ref()
            .ok_or(TimerError::MissingScheduleProvider)?;
        debug!("Computing schedule operator for {}", self.expression);
        let operator = provider.create_operator(&self.expression)?;
        let _ = self.operator.set(operator.clone());
        Ok(operator)
    }

    pub fn next_timeout(&self, last: Option<DateTime<Utc>>) -> Result<Option<DateTime<Utc>>> {
        let operator = self.operator()?;
        Ok(operator(last))
    }
}

impl fmt::Debug for LazyScheduleOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyScheduleOperator")
            .field("expression", &self.expression)
            .field("computed", &self.is_computed())
            .finish()
    }
}
