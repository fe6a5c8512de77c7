//! # Clock Capability
//!
//! Every timer the core uses (heartbeat interval, reconnect backoff, the per-frame
//! sampling loop) goes through the [`Clock`] trait instead of calling tokio directly.
//!
//! ## Implementations:
//! - [`TokioClock`]: real time, each timer is a spawned tokio task
//! - [`ManualClock`]: virtual time that only moves when `advance` is called
//!
//! ## Cancellation:
//! `TimerHandle::cancel` flips a shared flag before aborting the task, so a cancelled
//! timer never runs its callback again, even if the tokio task is already scheduled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Callback run once after a delay.
pub type OnceTask = Box<dyn FnOnce() + Send + 'static>;

/// Callback run on every tick of a repeating timer.
pub type RepeatingTask = Box<dyn FnMut() + Send + 'static>;

/// Timer source injected into the channel manager and the playback analyzer.
pub trait Clock: Send + Sync {
    /// Wall-clock time in milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;

    /// Run `task` once after `delay`.
    fn schedule_after(&self, delay: Duration, task: OnceTask) -> TimerHandle;

    /// Run `task` every `period`, first tick one period from now.
    fn schedule_repeating(&self, period: Duration, task: RepeatingTask) -> TimerHandle;
}

/// Handle to a scheduled timer. Dropping it does not cancel the timer.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    task: Option<AbortHandle>,
}

impl TimerHandle {
    fn new(cancelled: Arc<AtomicBool>, task: Option<AbortHandle>) -> Self {
        Self { cancelled, task }
    }

    /// Stop the timer. Takes effect before the next tick; safe to call repeatedly.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Real-time clock backed by the tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioClock {
    handle: Handle,
}

impl TokioClock {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Clock bound to the runtime the caller is running on.
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Clock for TokioClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn schedule_after(&self, delay: Duration, task: OnceTask) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();

        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if !flag.load(Ordering::SeqCst) {
                task();
            }
        });

        TimerHandle::new(cancelled, Some(join.abort_handle()))
    }

    fn schedule_repeating(&self, period: Duration, mut task: RepeatingTask) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();

        let join = self.handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                task();
            }
        });

        TimerHandle::new(cancelled, Some(join.abort_handle()))
    }
}

enum ManualTask {
    Once(OnceTask),
    Repeating(RepeatingTask),
}

struct ManualTimer {
    due_ms: i64,
    seq: u64,
    period_ms: Option<i64>,
    task: ManualTask,
    cancelled: Arc<AtomicBool>,
}

struct ManualState {
    now_ms: i64,
    next_seq: u64,
    timers: Vec<ManualTimer>,
}

/// Virtual clock for deterministic tests and simulations.
///
/// Timers fire in due order (ties in scheduling order) while [`ManualClock::advance`]
/// runs. Callbacks run without the clock's lock held, so they may schedule or cancel
/// other timers.
pub struct ManualClock {
    state: Mutex<ManualState>,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            state: Mutex::new(ManualState {
                now_ms: start_ms,
                next_seq: 0,
                timers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, delay: Duration, period_ms: Option<i64>, task: ManualTask) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        let due_ms = state.now_ms + delay.as_millis() as i64;
        state.timers.push(ManualTimer {
            due_ms,
            seq,
            period_ms,
            task,
            cancelled: cancelled.clone(),
        });
        TimerHandle::new(cancelled, None)
    }

    /// Move virtual time forward by `by`, firing every timer that falls due.
    pub fn advance(&self, by: Duration) {
        let target = self.lock().now_ms + by.as_millis() as i64;

        loop {
            let next = {
                let mut state = self.lock();
                state.timers.retain(|t| !t.cancelled.load(Ordering::SeqCst));
                let index = state
                    .timers
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| t.due_ms <= target)
                    .min_by_key(|(_, t)| (t.due_ms, t.seq))
                    .map(|(i, _)| i);

                match index {
                    Some(i) => {
                        let timer = state.timers.swap_remove(i);
                        state.now_ms = timer.due_ms;
                        Some(timer)
                    }
                    None => {
                        state.now_ms = target;
                        None
                    }
                }
            };

            let Some(timer) = next else { break };

            match timer.task {
                ManualTask::Once(task) => task(),
                ManualTask::Repeating(mut task) => {
                    task();
                    if !timer.cancelled.load(Ordering::SeqCst) {
                        let mut state = self.lock();
                        let seq = state.next_seq;
                        state.next_seq += 1;
                        let period = timer.period_ms.unwrap_or(1);
                        state.timers.push(ManualTimer {
                            due_ms: timer.due_ms + period,
                            seq,
                            period_ms: timer.period_ms,
                            task: ManualTask::Repeating(task),
                            cancelled: timer.cancelled,
                        });
                    }
                }
            }
        }
    }

    /// Number of timers that are scheduled and not cancelled.
    pub fn pending_timers(&self) -> usize {
        self.lock()
            .timers
            .iter()
            .filter(|t| !t.cancelled.load(Ordering::SeqCst))
            .count()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(1_700_000_000_000)
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.lock().now_ms
    }

    fn schedule_after(&self, delay: Duration, task: OnceTask) -> TimerHandle {
        self.push(delay, None, ManualTask::Once(task))
    }

    fn schedule_repeating(&self, period: Duration, task: RepeatingTask) -> TimerHandle {
        let period_ms = (period.as_millis() as i64).max(1);
        self.push(
            Duration::from_millis(period_ms as u64),
            Some(period_ms),
            ManualTask::Repeating(task),
        )
    }
}
