//! Background task scheduling
//!
//! Two facilities share one [`Scheduler`]:
//!
//! - a periodic worker that runs registered tasks once their period elapsed,
//!   checked on a coarse tick (500ms by default)
//! - a debounced scheduler that runs each named one-shot task at most once per
//!   pending interval; repeated requests while a task is pending are dropped
//!
//! Both tickers are tokio tasks started on first use, and each stops again once
//! it has nothing to run. Tasks run outside every scheduler lock, and a
//! panicking task is logged without taking the ticker down.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, error, trace};

/// Identifier of a periodic task
pub type TaskId = u64;

fn run_guarded(name: &str, work: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(work)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(task = name, panic = %message, "Scheduled task panicked");
    }
}

struct PeriodicTask {
    id: TaskId,
    name: String,
    period: Duration,
    last_run: Mutex<Instant>,
    work: Box<dyn Fn() + Send + Sync>,
}

#[derive(Default)]
struct PeriodicState {
    tasks: Vec<Arc<PeriodicTask>>,
    ticker: Option<JoinHandle<()>>,
}

/// Runs registered tasks on a fixed coarse tick
pub struct PeriodicWorker {
    state: Arc<Mutex<PeriodicState>>,
    next_id: AtomicU64,
    tick: Duration,
}

impl PeriodicWorker {
    pub fn new(tick: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(PeriodicState::default())),
            next_id: AtomicU64::new(1),
            tick,
        }
    }

    /// Registers `work` to run every `period`, first after one period
    ///
    /// Must be called within a tokio runtime.
    pub fn add<F>(&self, name: &str, period: Duration, work: F) -> TaskId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let task = Arc::new(PeriodicTask {
            id,
            name: name.to_string(),
            period,
            last_run: Mutex::new(Instant::now()),
            work: Box::new(work),
        });

        let mut state = self.state.lock();
        state.tasks.push(task);
        if state.ticker.is_none() {
            state.ticker = Some(tokio::spawn(run_periodic(self.state.clone(), self.tick)));
        }
        debug!(task = name, id, period_ms = period.as_millis() as u64, "Registered periodic task");
        id
    }

    /// Unregisters a task; a run already in progress completes
    pub fn remove(&self, id: TaskId) -> bool {
        let mut state = self.state.lock();
        let before = state.tasks.len();
        state.tasks.retain(|t| t.id != id);
        state.tasks.len() != before
    }

    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the ticker task is alive; it stops once no task is registered
    pub fn is_ticking(&self) -> bool {
        self.state.lock().ticker.is_some()
    }

    /// Stops the ticker and drops every task
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.tasks.clear();
        if let Some(ticker) = state.ticker.take() {
            ticker.abort();
        }
    }
}

async fn run_periodic(state: Arc<Mutex<PeriodicState>>, tick: Duration) {
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let tasks = {
            let mut state = state.lock();
            if state.tasks.is_empty() {
                // Detach; the next add() starts a fresh ticker
                state.ticker = None;
                trace!("Periodic ticker stopped");
                return;
            }
            state.tasks.clone()
        };
        for task in tasks {
            let due = task.last_run.lock().elapsed() >= task.period;
            if due {
                trace!(task = task.name.as_str(), "Running periodic task");
                run_guarded(&task.name, || (task.work)());
                *task.last_run.lock() = Instant::now();
            }
        }
    }
}

struct PendingWork {
    due: Instant,
    work: Box<dyn FnOnce() + Send>,
}

#[derive(Default)]
struct DebounceState {
    pending: HashMap<String, PendingWork>,
    ticker: Option<JoinHandle<()>>,
}

/// Runs named one-shot tasks no sooner than requested, coalescing repeats
pub struct DebouncedScheduler {
    state: Arc<Mutex<DebounceState>>,
    tick: Duration,
}

impl DebouncedScheduler {
    pub fn new(tick: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(DebounceState::default())),
            tick,
        }
    }

    /// Schedules `work` under `name` to run after about `max_delay`
    ///
    /// Returns false, dropping `work`, while a task with the same name is still
    /// pending. Once it has been taken off the pending set to run, the name may
    /// be scheduled again. Must be called within a tokio runtime.
    pub fn schedule_work<F>(&self, name: &str, max_delay: Duration, work: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.state.lock();
        if state.pending.contains_key(name) {
            trace!(task = name, "Work already pending");
            return false;
        }

        state.pending.insert(
            name.to_string(),
            PendingWork {
                due: Instant::now() + max_delay,
                work: Box::new(work),
            },
        );
        if state.ticker.is_none() {
            state.ticker = Some(tokio::spawn(run_debounced(self.state.clone(), self.tick)));
        }
        true
    }

    /// Drops pending work under `name` without running it
    pub fn cancel_work(&self, name: &str) -> bool {
        self.state.lock().pending.remove(name).is_some()
    }

    pub fn is_pending(&self, name: &str) -> bool {
        self.state.lock().pending.contains_key(name)
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Stops the ticker and drops pending work
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        state.pending.clear();
        if let Some(ticker) = state.ticker.take() {
            ticker.abort();
        }
    }
}

async fn run_debounced(state: Arc<Mutex<DebounceState>>, tick: Duration) {
    loop {
        sleep(tick).await;

        let (due, idle) = {
            let mut state = state.lock();
            let now = Instant::now();
            let names: Vec<String> = state
                .pending
                .iter()
                .filter(|(_, w)| w.due <= now)
                .map(|(name, _)| name.clone())
                .collect();
            let due: Vec<(String, PendingWork)> = names
                .into_iter()
                .filter_map(|name| state.pending.remove_entry(&name))
                .collect();

            // Detach rather than abort; this task finishes the batch and exits
            let idle = state.pending.is_empty();
            if idle {
                state.ticker = None;
            }
            (due, idle)
        };

        for (name, pending) in due {
            trace!(task = name.as_str(), "Running debounced task");
            run_guarded(&name, pending.work);
        }

        if idle {
            trace!("Debounce ticker stopped");
            return;
        }
    }
}

/// Periodic and debounced scheduling for one proxy instance
pub struct Scheduler {
    periodic: PeriodicWorker,
    debounced: DebouncedScheduler,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(&tapline_config::Scheduler::default())
    }
}

impl Scheduler {
    pub fn new(config: &tapline_config::Scheduler) -> Self {
        Self {
            periodic: PeriodicWorker::new(Duration::from_millis(config.periodic_tick_ms.max(1))),
            debounced: DebouncedScheduler::new(Duration::from_millis(config.debounce_tick_ms.max(1))),
        }
    }

    /// See [`PeriodicWorker::add`]
    pub fn add_periodic<F>(&self, name: &str, period: Duration, work: F) -> TaskId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.periodic.add(name, period, work)
    }

    pub fn remove_periodic(&self, id: TaskId) -> bool {
        self.periodic.remove(id)
    }

    /// See [`DebouncedScheduler::schedule_work`]
    pub fn schedule_work<F>(&self, name: &str, max_delay: Duration, work: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.debounced.schedule_work(name, max_delay, work)
    }

    pub fn cancel_work(&self, name: &str) -> bool {
        self.debounced.cancel_work(name)
    }

    pub fn periodic(&self) -> &PeriodicWorker {
        &self.periodic
    }

    pub fn debounced(&self) -> &DebouncedScheduler {
        &self.debounced
    }

    /// Stops both tickers; registered and pending work is dropped
    pub fn shutdown(&self) {
        debug!("Shutting down scheduler");
        self.periodic.shutdown();
        self.debounced.shutdown();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
