//! Timer metadata: identity, fire schedule and the replicated last-timeout marker.

mod cell;
pub mod remap;

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TimerError};
use crate::identity::TimeoutDescriptor;
use crate::schedule::{LazyScheduleOperator, ScheduleExpression, ScheduleTimeoutFactory};

use self::cell::LastTimeoutCell;

pub use self::remap::TimeoutRemapper;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimerType {
    Interval,
    Schedule,
}

impl fmt::Display for TimerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerType::Interval => f.write_str("INTERVAL"),
            TimerType::Schedule => f.write_str("SCHEDULE"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct IntervalTimerConfig {
    pub start: DateTime<Utc>,
    /// `None` makes the timer single-action.
    pub interval: Option<TimeDelta>,
}

#[derive(Clone, Debug, Default)]
pub struct ScheduleTimerConfig {
    pub expression: ScheduleExpression,
    pub timeout_method: TimeoutDescriptor,
}

#[derive(Clone, Debug)]
pub enum TimerSchedule {
    Interval {
        interval: Option<TimeDelta>,
    },
    Calendar {
        timeout_matcher: TimeoutDescriptor,
        operator: Arc<LazyScheduleOperator>,
    },
}

impl TimerSchedule {
    pub fn calendar(
        expression: ScheduleExpression,
        timeout_matcher: TimeoutDescriptor,
        factory: &ScheduleTimeoutFactory,
    ) -> Self {
        TimerSchedule::Calendar {
            timeout_matcher,
            operator: Arc::new(factory.bind(expression)),
        }
    }

    pub fn timer_type(&self) -> TimerType {
        match self {
            TimerSchedule::Interval { .. } => TimerType::Interval,
            TimerSchedule::Calendar { .. } => TimerType::Schedule,
        }
    }
}

impl PartialEq for TimerSchedule {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TimerSchedule::Interval { interval: a }, TimerSchedule::Interval { interval: b }) => {
                a == b
            }
            (
                TimerSchedule::Calendar {
                    timeout_matcher: a,
                    operator: x,
                },
                TimerSchedule::Calendar {
                    timeout_matcher: b,
                    operator: y,
                },
            ) => a == b && x.expression() == y.expression(),
            _ => false,
        }
    }
}

/// Metadata of a single timer.
///
/// Everything but the last timeout is fixed at construction. The last timeout is
/// stored relative to `start` and is readable from any thread while another
/// installs a merged value. Updates meant for the store go through
/// [`TimerMetaDataEntry::with_last_timeout`], which leaves this value untouched.
#[derive(Clone, Debug)]
pub struct TimerMetaDataEntry<C> {
    context: C,
    start: DateTime<Utc>,
    last_timeout: LastTimeoutCell,
    schedule: TimerSchedule,
}

impl<C> TimerMetaDataEntry<C> {
    pub fn interval(context: C, config: IntervalTimerConfig) -> Self {
        Self::from_parts(
            context,
            config.start,
            None,
            TimerSchedule::Interval {
                interval: config.interval,
            },
        )
    }

    /// Creates a calendar timer whose start is the first timeout of its expression.
    pub fn schedule(
        context: C,
        config: ScheduleTimerConfig,
        factory: &ScheduleTimeoutFactory,
    ) -> Result<Self> {
        let operator = Arc::new(factory.bind(config.expression));
        let start = operator
            .next_timeout(None)?
            .ok_or_else(|| TimerError::InvalidSchedule {
                expression: operator.expression().to_string(),
                reason: "expression never produces a timeout".to_string(),
            })?;
        let schedule = TimerSchedule::Calendar {
            timeout_matcher: config.timeout_method,
            operator,
        };
        Ok(Self::from_parts(context, start, None, schedule))
    }

    pub fn from_parts(
        context: C,
        start: DateTime<Utc>,
        last_timeout: Option<TimeDelta>,
        schedule: TimerSchedule,
    ) -> Self {
        Self {
            context,
            start: truncate_millis(start),
            last_timeout: LastTimeoutCell::new(last_timeout),
            schedule,
        }
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// Last timeout relative to `start`; `None` if the timer never fired.
    pub fn last_timeout(&self) -> Option<TimeDelta> {
        self.last_timeout.get()
    }

    pub fn last_timeout_instant(&self) -> Option<DateTime<Utc>> {
        self.last_timeout()
            .and_then(|offset| self.start.checked_add_signed(offset))
    }

    pub fn timer_type(&self) -> TimerType {
        self.schedule.timer_type()
    }

    pub fn schedule_kind(&self) -> &TimerSchedule {
        &self.schedule
    }

    /// Period of an interval timer; `None` for single-action and calendar timers.
    pub fn interval_period(&self) -> Option<TimeDelta> {
        match &self.schedule {
            TimerSchedule::Interval { interval } => *interval,
            TimerSchedule::Calendar { .. } => None,
        }
    }

    pub fn expression(&self) -> Option<&ScheduleExpression> {
        match &self.schedule {
            TimerSchedule::Interval { .. } => None,
            TimerSchedule::Calendar { operator, .. } => Some(operator.expression()),
        }
    }

    /// Callback to invoke on timeout.
    pub fn timeout_method(&self) -> TimeoutDescriptor {
        match &self.schedule {
            TimerSchedule::Interval { .. } => TimeoutDescriptor::default(),
            TimerSchedule::Calendar {
                timeout_matcher, ..
            } => timeout_matcher.clone(),
        }
    }

    /// Next timeout after `last`, or `start` when `last` is `None`.
    pub fn compute_next(&self, last: Option<DateTime<Utc>>) -> Result<Option<DateTime<Utc>>> {
        let Some(last) = last else {
            return Ok(Some(self.start));
        };
        match &self.schedule {
            TimerSchedule::Interval { interval } => {
                Ok(interval.and_then(|interval| last.checked_add_signed(interval)))
            }
            TimerSchedule::Calendar { operator, .. } => operator.next_timeout(Some(last)),
        }
    }

    pub fn next_timeout(&self) -> Result<Option<DateTime<Utc>>> {
        match self.last_timeout_instant() {
            Some(last) => self.compute_next(Some(last)),
            None => Ok(Some(self.start)),
        }
    }

    /// Copy of this entry carrying a different last timeout.
    pub fn with_last_timeout(&self, last_timeout: Option<TimeDelta>) -> Self
    where
        C: Clone,
    {
        Self {
            context: self.context.clone(),
            start: self.start,
            last_timeout: LastTimeoutCell::new(last_timeout),
            schedule: self.schedule.clone(),
        }
    }

    /// Installs a merged value delivered by replication.
    pub fn install_last_timeout(&self, last_timeout: Option<TimeDelta>) {
        self.last_timeout.set(last_timeout);
    }

    pub fn into_context(self) -> C {
        self.context
    }

    pub fn mutable<F: Fn()>(&self, observer: F) -> MutableTimerMetaData<'_, C, F> {
        MutableTimerMetaData {
            entry: self,
            observer,
        }
    }
}

impl<C: PartialEq> PartialEq for TimerMetaDataEntry<C> {
    fn eq(&self, other: &Self) -> bool {
        self.context == other.context
            && self.start == other.start
            && self.last_timeout() == other.last_timeout()
            && self.schedule == other.schedule
    }
}

/// Writable view over an entry; every change is reported to the observer.
pub struct MutableTimerMetaData<'a, C, F: Fn()> {
    entry: &'a TimerMetaDataEntry<C>,
    observer: F,
}

impl<C, F: Fn()> MutableTimerMetaData<'_, C, F> {
    /// Records `timeout` as the last timeout; `None` clears the fire history.
    pub fn set_last_timeout(&self, timeout: Option<DateTime<Utc>>) -> Result<()> {
        let relative = match timeout {
            Some(timeout) => {
                let timeout = truncate_millis(timeout);
                if timeout < self.entry.start {
                    return Err(TimerError::TimeoutBeforeStart {
                        start: self.entry.start,
                        timeout,
                    });
                }
                Some(timeout.signed_duration_since(self.entry.start))
            }
            None => None,
        };
        self.entry.last_timeout.set(relative);
        (self.observer)();
        Ok(())
    }
}

impl<C, F: Fn()> Deref for MutableTimerMetaData<'_, C, F> {
    type Target = TimerMetaDataEntry<C>;

    fn deref(&self) -> &Self::Target {
        self.entry
    }
}

pub(crate) fn truncate_millis(instant: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(instant.timestamp_millis()).unwrap_or(instant)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::tests::SteppingProvider;
    use chrono::TimeZone;
    use std::cell::Cell;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn interval_entry(interval: Option<TimeDelta>) -> TimerMetaDataEntry<String> {
        TimerMetaDataEntry::interval(
            "payload".to_string(),
            IntervalTimerConfig {
                start: t0(),
                interval,
            },
        )
    }

    #[test]
    fn start_is_truncated_to_millis() {
        let start = t0() + TimeDelta::nanoseconds(1_234_567);
        let entry = TimerMetaDataEntry::interval(
            (),
            IntervalTimerConfig {
                start,
                interval: None,
            },
        );
        assert_eq!(entry.start(), t0() + TimeDelta::milliseconds(1));
    }

    #[test]
    fn never_fired_entry_times_out_at_start() {
        let entry = interval_entry(Some(TimeDelta::minutes(5)));
        assert_eq!(entry.last_timeout(), None);
        assert_eq!(entry.last_timeout_instant(), None);
        assert_eq!(entry.next_timeout().unwrap(), Some(t0()));
        assert_eq!(entry.timer_type(), TimerType::Interval);
    }

    #[test]
    fn interval_adds_period_to_last_timeout() {
        let entry = interval_entry(Some(TimeDelta::minutes(5)));
        let last = t0() + TimeDelta::minutes(15);
        assert_eq!(
            entry.compute_next(Some(last)).unwrap(),
            Some(last + TimeDelta::minutes(5))
        );

        let fired = entry.with_last_timeout(Some(TimeDelta::minutes(15)));
        assert_eq!(fired.last_timeout_instant(), Some(last));
        assert_eq!(fired.next_timeout().unwrap(), Some(t0() + TimeDelta::minutes(20)));
    }

    #[test]
    fn single_action_timer_is_terminal() {
        let entry = interval_entry(None);
        assert_eq!(entry.compute_next(Some(t0())).unwrap(), None);
        let fired = entry.with_last_timeout(Some(TimeDelta::zero()));
        assert_eq!(fired.next_timeout().unwrap(), None);
    }

    #[test]
    fn with_last_timeout_leaves_original_untouched() {
        let entry = interval_entry(Some(TimeDelta::seconds(1)));
        let copy = entry.with_last_timeout(Some(TimeDelta::seconds(3)));
        assert_eq!(entry.last_timeout(), None);
        assert_eq!(copy.last_timeout(), Some(TimeDelta::seconds(3)));
        assert_ne!(entry, copy);
        assert_eq!(entry, copy.with_last_timeout(None));
    }

    #[test]
    fn mutable_view_notifies_observer() {
        let entry = interval_entry(Some(TimeDelta::seconds(30)));
        let dirty = Cell::new(0);
        let view = entry.mutable(|| dirty.set(dirty.get() + 1));

        view.set_last_timeout(Some(t0() + TimeDelta::seconds(30))).unwrap();
        assert_eq!(view.last_timeout(), Some(TimeDelta::seconds(30)));
        assert_eq!(dirty.get(), 1);

        let early = view.set_last_timeout(Some(t0() - TimeDelta::seconds(1)));
        assert!(matches!(early, Err(TimerError::TimeoutBeforeStart { .. })));
        assert_eq!(dirty.get(), 1);

        view.set_last_timeout(None).unwrap();
        assert_eq!(entry.last_timeout(), None);
        assert_eq!(dirty.get(), 2);
    }

    #[test]
    fn schedule_entry_starts_at_first_timeout() {
        let provider = Arc::new(SteppingProvider::new(t0(), TimeDelta::hours(1)));
        let factory = ScheduleTimeoutFactory::new(provider.clone());
        let entry =
            TimerMetaDataEntry::schedule(7u32, ScheduleTimerConfig::default(), &factory).unwrap();

        assert_eq!(entry.timer_type(), TimerType::Schedule);
        assert_eq!(entry.start(), t0());
        assert_eq!(entry.next_timeout().unwrap(), Some(t0()));
        assert_eq!(entry.timeout_method(), TimeoutDescriptor::default());

        let fired = entry.with_last_timeout(Some(TimeDelta::hours(2)));
        assert_eq!(fired.next_timeout().unwrap(), Some(t0() + TimeDelta::hours(3)));
        assert_eq!(provider.created.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn schedule_entry_requires_provider() {
        let result = TimerMetaDataEntry::schedule(
            (),
            ScheduleTimerConfig::default(),
            &ScheduleTimeoutFactory::unconfigured(),
        );
        assert!(matches!(result, Err(TimerError::MissingScheduleProvider)));
    }

    #[test]
    fn first_calendar_timeout_is_start_regardless_of_clock() {
        let start = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let factory =
            ScheduleTimeoutFactory::new(Arc::new(crate::schedule::cron::CronScheduleProvider));
        let entry = TimerMetaDataEntry::from_parts(
            (),
            start,
            None,
            TimerSchedule::calendar(
                ScheduleExpression::default(),
                TimeoutDescriptor::default(),
                &factory,
            ),
        );
        assert_eq!(entry.compute_next(None).unwrap(), Some(start));
        assert_eq!(entry.next_timeout().unwrap(), Some(start));
        assert_eq!(
            entry.compute_next(Some(start)).unwrap(),
            Some(start + TimeDelta::days(1))
        );
    }

    #[test]
    fn variant_getters() {
        let interval = interval_entry(Some(TimeDelta::minutes(5)));
        assert_eq!(interval.interval_period(), Some(TimeDelta::minutes(5)));
        assert!(matches!(interval.schedule_kind(), TimerSchedule::Interval { .. }));
        assert!(interval.expression().is_none());

        let factory = ScheduleTimeoutFactory::new(Arc::new(SteppingProvider::new(
            t0(),
            TimeDelta::hours(1),
        )));
        let calendar =
            TimerMetaDataEntry::schedule((), ScheduleTimerConfig::default(), &factory).unwrap();
        assert_eq!(calendar.interval_period(), None);
        assert!(matches!(calendar.schedule_kind(), TimerSchedule::Calendar { .. }));
        assert_eq!(calendar.expression(), Some(&ScheduleExpression::default()));
    }
}
