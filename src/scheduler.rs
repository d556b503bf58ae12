use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{error, info};

use crate::entry::TimerMetaDataEntry;
use crate::error::{BoxError, Result};
use crate::identity::TimeoutDescriptor;
use crate::registry::{TimerId, TimerRegistry};
use crate::wire::{ContextMarshaller, JsonContextMarshaller};

/// Receives the timeouts of due timers.
pub trait TimeoutHandler<C>: Send + Sync {
    fn on_timeout(
        &self,
        id: TimerId,
        method: &TimeoutDescriptor,
        entry: &TimerMetaDataEntry<C>,
    ) -> std::result::Result<(), BoxError>;
}

impl<C, F> TimeoutHandler<C> for F
where
    F: Fn(TimerId, &TimeoutDescriptor, &TimerMetaDataEntry<C>) -> std::result::Result<(), BoxError>
        + Send
        + Sync,
{
    fn on_timeout(
        &self,
        id: TimerId,
        method: &TimeoutDescriptor,
        entry: &TimerMetaDataEntry<C>,
    ) -> std::result::Result<(), BoxError> {
        self(id, method, entry)
    }
}

struct SchedulerInner<C, M> {
    registry: TimerRegistry<C, M>,
    handler: Box<dyn TimeoutHandler<C>>,
    notify: Notify,
    poll_interval: Duration,
}

/// Fires the timers of a registry as they fall due.
///
/// The store is re-read on every pass so timers created by other processes
/// sharing it are picked up within one poll interval.
pub struct TimerScheduler<C, M = JsonContextMarshaller> {
    inner: Arc<SchedulerInner<C, M>>,
}

impl<C, M> Clone for TimerScheduler<C, M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C, M> TimerScheduler<C, M>
where
    C: Clone + Send + Sync + 'static,
    M: ContextMarshaller<C> + Clone + 'static,
{
    pub fn new(
        registry: TimerRegistry<C, M>,
        handler: impl TimeoutHandler<C> + 'static,
        poll_interval: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                registry,
                handler: Box::new(handler),
                notify: Notify::new(),
                poll_interval,
            }),
        }
    }

    pub fn registry(&self) -> &TimerRegistry<C, M> {
        &self.inner.registry
    }

    /// Wakes the loop so it recomputes its next wake-up.
    pub fn notify(&self) {
        self.inner.notify.notify_one();
    }

    /// Earliest pending timeout across all timers.
    pub fn next_wake(&self) -> Result<Option<DateTime<Utc>>> {
        let mut next: Option<DateTime<Utc>> = None;
        for (_, entry) in self.inner.registry.timers()? {
            if let Ok(Some(timeout)) = entry.next_timeout() {
                next = Some(next.map_or(timeout, |n| n.min(timeout)));
            }
        }
        Ok(next)
    }

    pub fn start(&self) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            info!(
                "Timer scheduler started, polling every {:?}",
                service.inner.poll_interval
            );
            loop {
                let next_wake = service.next_wake().unwrap_or_else(|e| {
                    error!("Failed to compute next wake-up: {}", e);
                    None
                });
                let now = Utc::now();
                let sleep = next_wake
                    .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
                    .unwrap_or(service.inner.poll_interval)
                    .min(service.inner.poll_interval);

                tokio::select! {
                    _ = service.inner.notify.notified() => {}
                    _ = time::sleep(sleep) => {
                        if let Err(e) = service.process_due(Utc::now()) {
                            error!("Failed to process due timers: {}", e);
                        }
                    }
                }
            }
        })
    }

    /// Fires every timer due at `now` once and records the timeout. Timers left
    /// without a next timeout are removed. Returns the number of timers fired.
    pub fn process_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let registry = &self.inner.registry;
        let mut fired = 0;
        for (id, entry) in registry.timers()? {
            let next = match entry.next_timeout() {
                Ok(next) => next,
                Err(e) => {
                    error!("Cannot compute next timeout of {}: {}", id, e);
                    continue;
                }
            };
            let Some(due) = next else {
                self.expire(id)?;
                continue;
            };
            if due > now {
                continue;
            }

            let method = entry.timeout_method();
            info!("Timer {} fired ({}) for {}", id, method, due.to_rfc3339());
            if let Err(e) = self.inner.handler.on_timeout(id, &method, &entry) {
                error!("Timeout handler failed for {}: {}", id, e);
            }
            fired += 1;

            match registry.record_timeout(id, due) {
                Ok(Some(merged)) if matches!(merged.next_timeout(), Ok(None)) => self.expire(id)?,
                Ok(_) => {}
                Err(e) => error!("Failed to record timeout of {}: {}", id, e),
            }
        }
        Ok(fired)
    }

    fn expire(&self, id: TimerId) -> Result<()> {
        if self.inner.registry.cancel(id)? {
            info!("Timer {} expired", id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{IntervalTimerConfig, ScheduleTimerConfig};
    use crate::schedule::tests::SteppingProvider;
    use crate::schedule::ScheduleTimeoutFactory;
    use crate::store::{InMemoryTimerStore, RemapFn, StoreError, TimerStore};
    use chrono::{TimeDelta, TimeZone};
    use std::sync::Mutex;

    type Fired = Arc<Mutex<Vec<(TimerId, TimeoutDescriptor)>>>;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()
    }

    fn factory() -> ScheduleTimeoutFactory {
        ScheduleTimeoutFactory::new(Arc::new(SteppingProvider::new(t0(), TimeDelta::hours(1))))
    }

    fn scheduler() -> (TimerScheduler<String>, Fired) {
        scheduler_on(Arc::new(InMemoryTimerStore::new()))
    }

    fn scheduler_on(store: Arc<dyn TimerStore>) -> (TimerScheduler<String>, Fired) {
        let registry = TimerRegistry::new(store, JsonContextMarshaller, factory());
        let fired: Fired = Arc::default();
        let sink = fired.clone();
        let handler = move |id: TimerId,
                            method: &TimeoutDescriptor,
                            _: &TimerMetaDataEntry<String>|
              -> std::result::Result<(), BoxError> {
            sink.lock().unwrap().push((id, method.clone()));
            Ok(())
        };
        (
            TimerScheduler::new(registry, handler, Duration::from_millis(20)),
            fired,
        )
    }

    fn interval(interval: Option<TimeDelta>) -> TimerMetaDataEntry<String> {
        TimerMetaDataEntry::interval(
            "job".to_string(),
            IntervalTimerConfig {
                start: t0(),
                interval,
            },
        )
    }

    #[test]
    fn fires_due_timer_once() {
        let (scheduler, fired) = scheduler();
        let id = scheduler
            .registry()
            .create(&interval(Some(TimeDelta::minutes(1))))
            .unwrap();

        let now = t0() + TimeDelta::seconds(30);
        assert_eq!(scheduler.process_due(now).unwrap(), 1);
        assert_eq!(scheduler.process_due(now).unwrap(), 0);
        assert_eq!(fired.lock().unwrap()[0], (id, TimeoutDescriptor::default()));

        let entry = scheduler.registry().read(id).unwrap().unwrap();
        assert_eq!(entry.last_timeout(), Some(TimeDelta::zero()));
        assert_eq!(scheduler.next_wake().unwrap(), Some(t0() + TimeDelta::minutes(1)));
    }

    #[test]
    fn missed_timeouts_are_caught_up() {
        let (scheduler, fired) = scheduler();
        let id = scheduler
            .registry()
            .create(&interval(Some(TimeDelta::minutes(1))))
            .unwrap();

        let now = t0() + TimeDelta::seconds(210);
        for _ in 0..4 {
            assert_eq!(scheduler.process_due(now).unwrap(), 1);
        }
        assert_eq!(scheduler.process_due(now).unwrap(), 0);
        assert_eq!(fired.lock().unwrap().len(), 4);

        let entry = scheduler.registry().read(id).unwrap().unwrap();
        assert_eq!(entry.last_timeout(), Some(TimeDelta::minutes(3)));
    }

    #[test]
    fn single_action_timer_expires_after_firing() {
        let (scheduler, fired) = scheduler();
        let id = scheduler.registry().create(&interval(None)).unwrap();

        assert_eq!(scheduler.process_due(t0()).unwrap(), 1);
        assert_eq!(fired.lock().unwrap().len(), 1);
        assert!(scheduler.registry().read(id).unwrap().is_none());
        assert_eq!(scheduler.next_wake().unwrap(), None);
    }

    /// Rejects merges of one key.
    #[derive(Default)]
    struct RejectingMerge {
        inner: InMemoryTimerStore,
        rejected: Mutex<Vec<u8>>,
    }

    impl TimerStore for RejectingMerge {
        fn create(&self, key: &[u8], value: &[u8]) -> Result<bool> {
            self.inner.create(key, value)
        }

        fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
            self.inner.read(key)
        }

        fn compute_and_merge(&self, key: &[u8], remap: &RemapFn<'_>) -> Result<Option<Vec<u8>>> {
            if *self.rejected.lock().unwrap() == key {
                let e = std::io::Error::other("replica unavailable");
                return Err(StoreError::from(e).into());
            }
            self.inner.compute_and_merge(key, remap)
        }

        fn remove(&self, key: &[u8]) -> Result<bool> {
            self.inner.remove(key)
        }

        fn scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
            self.inner.scan(prefix)
        }
    }

    #[test]
    fn failed_record_does_not_hold_back_other_timers() {
        let store = Arc::new(RejectingMerge::default());
        let (scheduler, fired) = scheduler_on(store.clone());
        let every_minute = interval(Some(TimeDelta::minutes(1)));
        let first = scheduler.registry().create(&every_minute).unwrap();
        let second = scheduler.registry().create(&every_minute).unwrap();
        *store.rejected.lock().unwrap() = format!("timer/{first}").into_bytes();

        assert_eq!(scheduler.process_due(t0()).unwrap(), 2);
        assert_eq!(fired.lock().unwrap().len(), 2);
        let last = |id| scheduler.registry().read(id).unwrap().unwrap().last_timeout();
        assert_eq!(last(first), None);
        assert_eq!(last(second), Some(TimeDelta::zero()));
    }

    #[test]
    fn future_timers_are_left_alone() {
        let (scheduler, fired) = scheduler();
        scheduler.registry().create(&interval(None)).unwrap();
        assert_eq!(scheduler.process_due(t0() - TimeDelta::seconds(1)).unwrap(), 0);
        assert!(fired.lock().unwrap().is_empty());
    }

    #[test]
    fn calendar_timer_receives_its_timeout_method() {
        let (scheduler, fired) = scheduler();
        let config = ScheduleTimerConfig {
            timeout_method: TimeoutDescriptor::new("closeBooks", 0),
            ..ScheduleTimerConfig::default()
        };
        let entry = TimerMetaDataEntry::schedule("books".to_string(), config, &factory()).unwrap();
        let id = scheduler.registry().create(&entry).unwrap();

        assert_eq!(scheduler.process_due(t0()).unwrap(), 1);
        assert_eq!(
            fired.lock().unwrap()[0],
            (id, TimeoutDescriptor::new("closeBooks", 0))
        );
        assert_eq!(scheduler.next_wake().unwrap(), Some(t0() + TimeDelta::hours(1)));
    }

    #[tokio::test]
    async fn loop_fires_due_timers() {
        let registry = TimerRegistry::new(
            Arc::new(InMemoryTimerStore::new()),
            JsonContextMarshaller,
            factory(),
        );
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let handler = move |id: TimerId,
                            _: &TimeoutDescriptor,
                            _: &TimerMetaDataEntry<String>|
              -> std::result::Result<(), BoxError> {
            tx.send(id)?;
            Ok(())
        };
        let scheduler = TimerScheduler::new(registry, handler, Duration::from_millis(20));
        let handle = scheduler.start();

        let entry = TimerMetaDataEntry::interval(
            "now".to_string(),
            IntervalTimerConfig {
                start: Utc::now() - TimeDelta::seconds(1),
                interval: None,
            },
        );
        let id = scheduler.registry().create(&entry).unwrap();
        scheduler.notify();

        let received = time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(received, Some(id));
        handle.abort();
    }
}
