//! Cooperative timers.
//!
//! The container never spawns threads. Debounce windows, the selector
//! eviction interval and the parameter-cache sweep are timers held here,
//! and they run when the host drives the scheduler (`Store::tick` or
//! [`Scheduler::run_pending`]) from its own event loop. The clock is
//! injectable so tests can move time forward deterministically.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Source of the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

/// Handle to a scheduled timer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl fmt::Debug for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimerId({})", self.0)
    }
}

type Task = Arc<dyn Fn() + Send + Sync>;

struct Timer {
    due: Instant,
    /// `Some` for repeating timers.
    period: Option<Duration>,
    task: Task,
}

struct SchedulerInner {
    next_id: u64,
    timers: HashMap<TimerId, Timer>,
}

/// One-shot and interval timers driven by an explicit pump.
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    inner: Mutex<SchedulerInner>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(SchedulerInner {
                next_id: 1,
                timers: HashMap::new(),
            }),
        }
    }

    pub fn now(&self) -> Instant {
        self.clock.now()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Run `task` once after `delay`.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TimerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.insert(delay, None, Arc::new(task))
    }

    /// Run `task` every `period` until cancelled.
    pub fn schedule_interval<F>(&self, period: Duration, task: F) -> TimerId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.insert(period, Some(period), Arc::new(task))
    }

    fn insert(&self, delay: Duration, period: Option<Duration>, task: Task) -> TimerId {
        let due = self.clock.now() + delay;
        let mut inner = self.inner.lock();
        let id = TimerId(inner.next_id);
        inner.next_id += 1;
        inner.timers.insert(id, Timer { due, period, task });
        id
    }

    /// Push a pending timer's deadline to `delay` from now. Returns false
    /// if the timer no longer exists.
    pub fn reschedule(&self, id: TimerId, delay: Duration) -> bool {
        let due = self.clock.now() + delay;
        match self.inner.lock().timers.get_mut(&id) {
            Some(timer) => {
                timer.due = due;
                true
            }
            None => false,
        }
    }

    /// Cancel a timer. Idempotent; returns whether it was pending.
    pub fn cancel(&self, id: TimerId) -> bool {
        self.inner.lock().timers.remove(&id).is_some()
    }

    /// Number of live timers.
    pub fn pending(&self) -> usize {
        self.inner.lock().timers.len()
    }

    /// Cancel everything.
    pub fn clear(&self) {
        self.inner.lock().timers.clear();
    }

    /// Run every timer whose deadline has passed, earliest first.
    ///
    /// Tasks run without the scheduler lock held, so they may schedule or
    /// cancel timers. A timer cancelled by an earlier task in the same
    /// pass does not run.
    pub fn run_pending(&self) -> usize {
        let now = self.clock.now();

        let mut due: Vec<(Instant, TimerId)> = self
            .inner
            .lock()
            .timers
            .iter()
            .filter(|(_, t)| t.due <= now)
            .map(|(id, t)| (t.due, *id))
            .collect();
        due.sort();

        let mut ran = 0;
        for (_, id) in due {
            let task = {
                let mut inner = self.inner.lock();
                let Some(timer) = inner.timers.get_mut(&id) else {
                    continue;
                };
                if timer.due > now {
                    continue;
                }
                match timer.period {
                    Some(period) => {
                        timer.due = now + period;
                        Arc::clone(&timer.task)
                    }
                    None => match inner.timers.remove(&id) {
                        Some(timer) => timer.task,
                        None => continue,
                    },
                }
            };
            task();
            ran += 1;
        }
        ran
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (Arc<ManualClock>, Scheduler) {
        let clock = Arc::new(ManualClock::new());
        let scheduler = Scheduler::new(clock.clone());
        (clock, scheduler)
    }

    #[test]
    fn test_one_shot_runs_once_when_due() {
        let (clock, scheduler) = setup();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        scheduler.schedule(Duration::from_millis(100), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(scheduler.run_pending(), 0);
        clock.advance(Duration::from_millis(100));
        assert_eq!(scheduler.run_pending(), 1);
        clock.advance(Duration::from_millis(100));
        assert_eq!(scheduler.run_pending(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_interval_repeats_until_cancelled() {
        let (clock, scheduler) = setup();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = scheduler.schedule_interval(Duration::from_secs(1), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..3 {
            clock.advance(Duration::from_secs(1));
            scheduler.run_pending();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        assert!(scheduler.cancel(id));
        assert!(!scheduler.cancel(id));
        clock.advance(Duration::from_secs(1));
        assert_eq!(scheduler.run_pending(), 0);
    }

    #[test]
    fn test_reschedule_pushes_deadline() {
        let (clock, scheduler) = setup();
        let id = scheduler.schedule(Duration::from_millis(100), || {});

        clock.advance(Duration::from_millis(80));
        assert!(scheduler.reschedule(id, Duration::from_millis(100)));
        clock.advance(Duration::from_millis(80));
        assert_eq!(scheduler.run_pending(), 0);
        clock.advance(Duration::from_millis(20));
        assert_eq!(scheduler.run_pending(), 1);
        assert!(!scheduler.reschedule(id, Duration::from_millis(1)));
    }

    #[test]
    fn test_cancel_from_earlier_task_is_effective() {
        let (clock, scheduler) = setup();
        let scheduler = Arc::new(scheduler);
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let victim = scheduler.schedule(Duration::from_millis(20), move || {
            h.fetch_add(1, Ordering::SeqCst);
        });
        let s = Arc::clone(&scheduler);
        scheduler.schedule(Duration::from_millis(10), move || {
            s.cancel(victim);
        });

        clock.advance(Duration::from_millis(50));
        assert_eq!(scheduler.run_pending(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
