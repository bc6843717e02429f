#![forbid(unsafe_code)]

//! Named task queues: priority buckets, bounded synchronous passes,
//! throttling, debouncing, timeouts, and cooperative cancellation.
//!
//! # Design
//!
//! A queue holds pending tasks in priority buckets (lower number first,
//! FIFO within a bucket) and a set of running tasks. Synchronous task
//! bodies complete inline; asynchronous bodies return a
//! [`Deferred`](crate::deferred::Deferred) the queue counts as running
//! until it settles, which is what the parallelism limit and per-task
//! timeout apply to.
//!
//! One `run()` pass starts tasks up to the parallelism limit for up to the
//! configured sync budget, then reschedules itself — a single queue cannot
//! monopolize the cooperative scheduler.
//!
//! Cancellation is cooperative: `stop()` drops pending tasks and raises the
//! cancellation flag on running ones, but never aborts a body's control
//! flow. Task bodies are expected to poll [`TaskHandle::is_cancelled`] at
//! natural yield points.
//!
//! # Invariants
//!
//! 1. FIFO within a priority bucket; lower bucket numbers drain first.
//! 2. `stop()` is terminal; every outstanding waiter rejects with
//!    [`TaskFailure::QueueStopped`].
//! 3. Throttle and debounce each collapse to at most one pending function;
//!    the latest registration wins.
//! 4. A task failure never stalls the queue.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use web_time::{Duration, Instant};

use crate::deferred::Deferred;
use crate::scheduler::{
    sched_cancel_timer, sched_enqueue_run, sched_now, sched_register_timer, sched_report_error,
    SchedHandle, TaskFailure,
};

// ---------------------------------------------------------------------------
// Options and state
// ---------------------------------------------------------------------------

/// Configuration for a task queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueOptions {
    /// Maximum tasks counted as running at once.
    pub parallel: usize,
    /// Wall-clock budget for one synchronous `run()` pass.
    pub sync_budget: Duration,
    /// Collect task failures into the queue's `errors` list instead of
    /// routing them to the scheduler-wide handler.
    pub catch_errors: bool,
    /// Deadline applied to each task from the moment it starts.
    pub task_timeout: Option<Duration>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            parallel: 1,
            sync_budget: Duration::from_millis(30),
            catch_errors: false,
            task_timeout: None,
        }
    }
}

impl QueueOptions {
    /// Set the parallelism limit.
    #[must_use]
    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = parallel;
        self
    }

    /// Set the per-pass sync budget.
    #[must_use]
    pub fn with_sync_budget(mut self, budget: Duration) -> Self {
        self.sync_budget = budget;
        self
    }

    /// Collect failures locally instead of routing them to the handler.
    #[must_use]
    pub fn with_catch_errors(mut self, catch: bool) -> Self {
        self.catch_errors = catch;
        self
    }

    /// Set a per-task deadline.
    #[must_use]
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }
}

/// Lifecycle state of a queue: `Running ⇄ Paused`, `Stopped` terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Accepting and starting tasks.
    Running,
    /// Accepting tasks but starting none.
    Paused,
    /// Terminal; pending tasks dropped, waiters rejected.
    Stopped,
}

/// Handle passed to every task body for cooperative cancellation checks.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    cancelled: Rc<Cell<bool>>,
}

impl TaskHandle {
    /// Whether the task has been cancelled (queue stop or timeout). Bodies
    /// should poll this at natural yield points and bail out early.
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

type SyncWork = Box<dyn FnOnce(&TaskHandle) -> Result<(), TaskFailure>>;
type AsyncWork = Box<dyn FnOnce(&TaskHandle) -> Deferred<(), TaskFailure>>;

enum Work {
    Sync(SyncWork),
    Async(AsyncWork),
}

struct TaskEntry {
    id: u64,
    work: Work,
}

struct RunningTask {
    id: u64,
    cancelled: Rc<Cell<bool>>,
    timeout_timer: Option<u64>,
}

/// Collapsed-call slot shared by throttle and debounce.
struct SlotState {
    pending: Option<Box<dyn FnOnce()>>,
    armed: bool,
    /// Throttle: earliest next allowed release. Debounce: trailing deadline.
    at: Option<Instant>,
}

impl SlotState {
    fn new() -> Self {
        Self {
            pending: None,
            armed: false,
            at: None,
        }
    }
}

struct QueueInner {
    name: Rc<str>,
    options: QueueOptions,
    state: QueueState,
    buckets: BTreeMap<i32, VecDeque<TaskEntry>>,
    running: Vec<RunningTask>,
    errors: Vec<TaskFailure>,
    waiters: Vec<(usize, Deferred<(), TaskFailure>)>,
    scheduled: bool,
    next_task: u64,
    throttle: SlotState,
    debounce: SlotState,
    sched: SchedHandle,
}

impl QueueInner {
    fn pending(&self) -> usize {
        self.buckets.values().map(VecDeque::len).sum()
    }

    fn pop_next(&mut self) -> Option<TaskEntry> {
        let prio = *self.buckets.keys().next()?;
        let bucket = self.buckets.get_mut(&prio)?;
        let entry = bucket.pop_front();
        if bucket.is_empty() {
            self.buckets.remove(&prio);
        }
        entry
    }
}

// ---------------------------------------------------------------------------
// TaskQueue
// ---------------------------------------------------------------------------

/// A named queue of cooperative tasks.
///
/// Cheaply cloneable; all clones address the same queue.
pub struct TaskQueue {
    inner: Rc<RefCell<QueueInner>>,
}

impl Clone for TaskQueue {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let q = self.inner.borrow();
        f.debug_struct("TaskQueue")
            .field("name", &q.name)
            .field("state", &q.state)
            .field("pending", &q.pending())
            .field("running", &q.running.len())
            .finish()
    }
}

impl TaskQueue {
    pub(crate) fn new(name: &str, options: QueueOptions, sched: SchedHandle) -> Self {
        Self {
            inner: Rc::new(RefCell::new(QueueInner {
                name: Rc::from(name),
                options,
                state: QueueState::Running,
                buckets: BTreeMap::new(),
                running: Vec::new(),
                errors: Vec::new(),
                waiters: Vec::new(),
                scheduled: false,
                next_task: 1,
                throttle: SlotState::new(),
                debounce: SlotState::new(),
                sched,
            })),
        }
    }

    // ── Inspection ───────────────────────────────────────────────────

    /// The queue's registered name.
    #[must_use]
    pub fn name(&self) -> Rc<str> {
        Rc::clone(&self.inner.borrow().name)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> QueueState {
        self.inner.borrow().state
    }

    /// Number of tasks waiting to start.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.borrow().pending()
    }

    /// Number of tasks counted as running.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.inner.borrow().running.len()
    }

    /// Failures collected so far (only populated with `catch_errors`).
    #[must_use]
    pub fn errors(&self) -> Vec<TaskFailure> {
        self.inner.borrow().errors.clone()
    }

    /// Drain and return collected failures.
    pub fn take_errors(&self) -> Vec<TaskFailure> {
        std::mem::take(&mut self.inner.borrow_mut().errors)
    }

    // ── Adding work ──────────────────────────────────────────────────

    /// Add a synchronous task at default priority 0.
    ///
    /// # Errors
    ///
    /// [`TaskFailure::QueueStopped`] if the queue has stopped.
    pub fn add(
        &self,
        work: impl FnOnce(&TaskHandle) -> Result<(), TaskFailure> + 'static,
    ) -> Result<(), TaskFailure> {
        self.add_with_priority(work, 0)
    }

    /// Add a synchronous task. Lower priority numbers dequeue first; FIFO
    /// within a bucket.
    ///
    /// # Errors
    ///
    /// [`TaskFailure::QueueStopped`] if the queue has stopped.
    pub fn add_with_priority(
        &self,
        work: impl FnOnce(&TaskHandle) -> Result<(), TaskFailure> + 'static,
        priority: i32,
    ) -> Result<(), TaskFailure> {
        self.push_entry(Work::Sync(Box::new(work)), priority)
    }

    /// Add an asynchronous task at default priority 0. The body returns a
    /// deferred the queue counts as running until it settles.
    ///
    /// # Errors
    ///
    /// [`TaskFailure::QueueStopped`] if the queue has stopped.
    pub fn add_async(
        &self,
        work: impl FnOnce(&TaskHandle) -> Deferred<(), TaskFailure> + 'static,
    ) -> Result<(), TaskFailure> {
        self.add_async_with_priority(work, 0)
    }

    /// Add an asynchronous task with an explicit priority.
    ///
    /// # Errors
    ///
    /// [`TaskFailure::QueueStopped`] if the queue has stopped.
    pub fn add_async_with_priority(
        &self,
        work: impl FnOnce(&TaskHandle) -> Deferred<(), TaskFailure> + 'static,
        priority: i32,
    ) -> Result<(), TaskFailure> {
        self.push_entry(Work::Async(Box::new(work)), priority)
    }

    fn push_entry(&self, work: Work, priority: i32) -> Result<(), TaskFailure> {
        {
            let mut q = self.inner.borrow_mut();
            if q.state == QueueState::Stopped {
                return Err(TaskFailure::QueueStopped);
            }
            let id = q.next_task;
            q.next_task += 1;
            q.buckets
                .entry(priority)
                .or_default()
                .push_back(TaskEntry { id, work });
        }
        self.request_schedule();
        Ok(())
    }

    // ── Running ──────────────────────────────────────────────────────

    /// One bounded pass: start tasks up to the parallelism limit, for up
    /// to the sync budget, then reschedule for the remainder.
    pub fn run(&self) {
        {
            let mut q = self.inner.borrow_mut();
            q.scheduled = false;
            if q.state != QueueState::Running {
                return;
            }
        }
        let start = self.clock_now();
        loop {
            let next = {
                let mut q = self.inner.borrow_mut();
                if q.state != QueueState::Running
                    || q.running.len() >= q.options.parallel.max(1)
                {
                    None
                } else {
                    q.pop_next()
                }
            };
            let Some(entry) = next else { break };
            self.start_task(entry);

            let elapsed = self
                .clock_now()
                .checked_duration_since(start)
                .unwrap_or(Duration::ZERO);
            let (over_budget, has_more) = {
                let q = self.inner.borrow();
                (elapsed > q.options.sync_budget, q.pending() > 0)
            };
            if over_budget && has_more {
                self.request_schedule();
                break;
            }
        }
        self.notify_waiters();
    }

    fn start_task(&self, entry: TaskEntry) {
        let cancelled = Rc::new(Cell::new(false));
        let handle = TaskHandle {
            cancelled: Rc::clone(&cancelled),
        };
        {
            let mut q = self.inner.borrow_mut();
            let timeout_timer = q.options.task_timeout.and_then(|limit| {
                let me = self.clone();
                let id = entry.id;
                let at = sched_now(&q.sched)? + limit;
                sched_register_timer(&q.sched, at, Box::new(move || me.timeout_task(id)))
            });
            q.running.push(RunningTask {
                id: entry.id,
                cancelled,
                timeout_timer,
            });
        }
        match entry.work {
            Work::Sync(body) => {
                let result = body(&handle);
                self.complete_task(entry.id, result);
            }
            Work::Async(body) => {
                let pending = body(&handle);
                let me = self.clone();
                let id = entry.id;
                pending.on_settle(move |result| me.complete_task(id, result.clone()));
            }
        }
    }

    fn complete_task(&self, id: u64, result: Result<(), TaskFailure>) {
        let reaped = {
            let mut q = self.inner.borrow_mut();
            q.running
                .iter()
                .position(|r| r.id == id)
                .map(|pos| q.running.remove(pos))
        };
        let Some(task) = reaped else {
            // Already timed out (or torn down); the late settle is ignored.
            return;
        };
        if let Some(timer) = task.timeout_timer {
            let sched = self.inner.borrow().sched.clone();
            sched_cancel_timer(&sched, timer);
        }
        if let Err(failure) = result {
            self.record_failure(failure);
        }
        self.notify_waiters();
        self.maybe_reschedule();
    }

    fn timeout_task(&self, id: u64) {
        let reaped = {
            let mut q = self.inner.borrow_mut();
            q.running
                .iter()
                .position(|r| r.id == id)
                .map(|pos| q.running.remove(pos))
        };
        let Some(task) = reaped else { return };
        task.cancelled.set(true);
        tracing::warn!(queue = %self.name(), task = id, "task timed out");
        self.record_failure(TaskFailure::Timeout);
        self.notify_waiters();
        self.maybe_reschedule();
    }

    fn record_failure(&self, failure: TaskFailure) {
        let catch = self.inner.borrow().options.catch_errors;
        if catch {
            self.inner.borrow_mut().errors.push(failure);
        } else {
            let sched = self.inner.borrow().sched.clone();
            sched_report_error(&sched, &failure);
        }
    }

    fn maybe_reschedule(&self) {
        let should = {
            let q = self.inner.borrow();
            q.state == QueueState::Running
                && q.pending() > 0
                && q.running.len() < q.options.parallel.max(1)
        };
        if should {
            self.request_schedule();
        }
    }

    fn request_schedule(&self) {
        let sched = {
            let mut q = self.inner.borrow_mut();
            if q.state != QueueState::Running || q.scheduled {
                return;
            }
            q.scheduled = true;
            q.sched.clone()
        };
        sched_enqueue_run(&sched, self.clone());
    }

    fn clock_now(&self) -> Instant {
        let sched = self.inner.borrow().sched.clone();
        sched_now(&sched).unwrap_or_else(Instant::now)
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Stop starting new tasks. Tasks already running are unaffected.
    pub fn pause(&self) {
        let mut q = self.inner.borrow_mut();
        if q.state == QueueState::Running {
            q.state = QueueState::Paused;
        }
    }

    /// Resume a paused queue and reschedule if work is pending.
    pub fn resume(&self) {
        {
            let mut q = self.inner.borrow_mut();
            if q.state != QueueState::Paused {
                return;
            }
            q.state = QueueState::Running;
        }
        if self.inner.borrow().pending() > 0 {
            self.request_schedule();
        }
    }

    /// Stop the queue, terminally: drop pending tasks, raise the
    /// cancellation flag on running ones, and reject every outstanding
    /// waiter with [`TaskFailure::QueueStopped`]. Idempotent.
    pub fn stop(&self) {
        let (waiters, dropped, name) = {
            let mut q = self.inner.borrow_mut();
            if q.state == QueueState::Stopped {
                return;
            }
            q.state = QueueState::Stopped;
            let dropped = q.pending();
            q.buckets.clear();
            for task in &q.running {
                task.cancelled.set(true);
            }
            q.throttle.pending = None;
            q.throttle.armed = false;
            q.debounce.pending = None;
            q.debounce.armed = false;
            (
                std::mem::take(&mut q.waiters),
                dropped,
                Rc::clone(&q.name),
            )
        };
        tracing::warn!(queue = %name, dropped, "task queue stopped");
        for (_, waiter) in waiters {
            waiter.reject(TaskFailure::QueueStopped);
        }
    }

    /// A deferred resolving once pending + running is at most `threshold`
    /// (0 means "queue drained"), rejecting with
    /// [`TaskFailure::QueueStopped`] if the queue stops first.
    #[must_use]
    pub fn wait_async(&self, threshold: usize) -> Deferred<(), TaskFailure> {
        let mut q = self.inner.borrow_mut();
        if q.state == QueueState::Stopped {
            return Deferred::rejected(TaskFailure::QueueStopped);
        }
        if q.pending() + q.running.len() <= threshold {
            return Deferred::resolved(());
        }
        let deferred = Deferred::new();
        q.waiters.push((threshold, deferred.clone()));
        deferred
    }

    fn notify_waiters(&self) {
        let ready: Vec<Deferred<(), TaskFailure>> = {
            let mut q = self.inner.borrow_mut();
            let count = q.pending() + q.running.len();
            let mut ready = Vec::new();
            q.waiters.retain(|(threshold, deferred)| {
                if count <= *threshold {
                    ready.push(deferred.clone());
                    false
                } else {
                    true
                }
            });
            ready
        };
        for deferred in ready {
            deferred.resolve(());
        }
    }

    // ── Throttle / debounce ──────────────────────────────────────────

    /// Collapse repeated calls into one pending task, released at most
    /// once per `interval` (leading-edge-eligible). Only the latest
    /// function registered before the release runs.
    ///
    /// # Errors
    ///
    /// [`TaskFailure::QueueStopped`] if the queue has stopped.
    pub fn throttle(
        &self,
        interval: Duration,
        f: impl FnOnce() + 'static,
    ) -> Result<(), TaskFailure> {
        let mut q = self.inner.borrow_mut();
        if q.state == QueueState::Stopped {
            return Err(TaskFailure::QueueStopped);
        }
        q.throttle.pending = Some(Box::new(f));
        if q.throttle.armed {
            return Ok(());
        }
        let now = sched_now(&q.sched).unwrap_or_else(Instant::now);
        let fire_at = match q.throttle.at {
            Some(gate) if gate > now => gate,
            _ => now,
        };
        let me = self.clone();
        if sched_register_timer(
            &q.sched,
            fire_at,
            Box::new(move || me.release_throttle(interval)),
        )
        .is_some()
        {
            q.throttle.armed = true;
        }
        Ok(())
    }

    fn release_throttle(&self, interval: Duration) {
        let work = {
            let mut q = self.inner.borrow_mut();
            q.throttle.armed = false;
            if q.state == QueueState::Stopped {
                q.throttle.pending = None;
                return;
            }
            let now = sched_now(&q.sched).unwrap_or_else(Instant::now);
            q.throttle.at = Some(now + interval);
            q.throttle.pending.take()
        };
        if let Some(f) = work {
            let _ = self.add(move |_| {
                f();
                Ok(())
            });
        }
    }

    /// Collapse repeated calls into one pending task, released `interval`
    /// after the most recent call (trailing edge only; every call resets
    /// the interval). Only the latest function runs.
    ///
    /// # Errors
    ///
    /// [`TaskFailure::QueueStopped`] if the queue has stopped.
    pub fn debounce(
        &self,
        interval: Duration,
        f: impl FnOnce() + 'static,
    ) -> Result<(), TaskFailure> {
        let arm = {
            let mut q = self.inner.borrow_mut();
            if q.state == QueueState::Stopped {
                return Err(TaskFailure::QueueStopped);
            }
            let now = sched_now(&q.sched).unwrap_or_else(Instant::now);
            q.debounce.pending = Some(Box::new(f));
            q.debounce.at = Some(now + interval);
            if q.debounce.armed {
                false
            } else {
                q.debounce.armed = true;
                true
            }
        };
        if arm {
            self.arm_debounce_timer();
        }
        Ok(())
    }

    fn arm_debounce_timer(&self) {
        let (sched, at) = {
            let q = self.inner.borrow();
            (q.sched.clone(), q.debounce.at)
        };
        let Some(at) = at else { return };
        let me = self.clone();
        if sched_register_timer(&sched, at, Box::new(move || me.release_debounce())).is_none() {
            self.inner.borrow_mut().debounce.armed = false;
        }
    }

    fn release_debounce(&self) {
        enum Step {
            Run(Box<dyn FnOnce()>),
            Rearm,
            Done,
        }
        let step = {
            let mut q = self.inner.borrow_mut();
            if q.state == QueueState::Stopped {
                q.debounce.armed = false;
                q.debounce.pending = None;
                Step::Done
            } else {
                let now = sched_now(&q.sched).unwrap_or_else(Instant::now);
                match q.debounce.at {
                    // A later call pushed the deadline out; try again then.
                    Some(at) if at > now => Step::Rearm,
                    _ => {
                        q.debounce.armed = false;
                        q.debounce.at = None;
                        match q.debounce.pending.take() {
                            Some(f) => Step::Run(f),
                            None => Step::Done,
                        }
                    }
                }
            }
        };
        match step {
            Step::Run(f) => {
                let _ = self.add(move |_| {
                    f();
                    Ok(())
                });
            }
            Step::Rearm => self.arm_debounce_timer(),
            Step::Done => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{LabClock, Scheduler};

    fn lab() -> (LabClock, Scheduler) {
        let clock = LabClock::new();
        let sched = Scheduler::lab(&clock);
        (clock, sched)
    }

    #[test]
    fn tasks_run_on_tick_in_fifo_order() {
        let (_clock, sched) = lab();
        let q = sched.create_queue("work", QueueOptions::default());
        let order = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let o = Rc::clone(&order);
            q.add(move |_| {
                o.borrow_mut().push(i);
                Ok(())
            })
            .unwrap();
        }
        assert_eq!(q.pending_count(), 3);
        sched.tick();
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
        assert_eq!(q.pending_count(), 0);
    }

    #[test]
    fn priority_buckets_drain_lowest_first() {
        let (_clock, sched) = lab();
        let q = sched.create_queue("work", QueueOptions::default());
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = Rc::clone(&order);
        q.add_with_priority(
            move |_| {
                o.borrow_mut().push("low");
                Ok(())
            },
            10,
        )
        .unwrap();
        let o = Rc::clone(&order);
        q.add_with_priority(
            move |_| {
                o.borrow_mut().push("high-1");
                Ok(())
            },
            0,
        )
        .unwrap();
        let o = Rc::clone(&order);
        q.add_with_priority(
            move |_| {
                o.borrow_mut().push("high-2");
                Ok(())
            },
            0,
        )
        .unwrap();

        sched.tick();
        assert_eq!(*order.borrow(), vec!["high-1", "high-2", "low"]);
    }

    #[test]
    fn pause_blocks_starts_resume_restarts() {
        let (_clock, sched) = lab();
        let q = sched.create_queue("work", QueueOptions::default());
        let ran = Rc::new(Cell::new(false));

        q.pause();
        let r = Rc::clone(&ran);
        q.add(move |_| {
            r.set(true);
            Ok(())
        })
        .unwrap();

        sched.tick();
        assert!(!ran.get());
        assert_eq!(q.state(), QueueState::Paused);

        q.resume();
        sched.tick();
        assert!(ran.get());
    }

    #[test]
    fn stop_drops_pending_and_rejects_add() {
        let (_clock, sched) = lab();
        let q = sched.create_queue("work", QueueOptions::default());
        let ran = Rc::new(Cell::new(false));

        let r = Rc::clone(&ran);
        q.add(move |_| {
            r.set(true);
            Ok(())
        })
        .unwrap();
        q.stop();
        sched.tick();

        assert!(!ran.get());
        assert_eq!(q.state(), QueueState::Stopped);
        assert_eq!(q.add(|_| Ok(())), Err(TaskFailure::QueueStopped));
    }

    #[test]
    fn stop_rejects_outstanding_waiters() {
        let (_clock, sched) = lab();
        let q = sched.create_queue("work", QueueOptions::default());
        q.add(|_| Ok(())).unwrap();

        let waiter = q.wait_async(0);
        assert!(waiter.is_pending());
        q.stop();
        assert_eq!(waiter.peek(), Some(Err(TaskFailure::QueueStopped)));
    }

    #[test]
    fn stop_flags_running_tasks_cancelled() {
        let (_clock, sched) = lab();
        let q = sched.create_queue("work", QueueOptions::default());

        // Async task that stays running until we resolve it.
        let gate: Deferred<(), TaskFailure> = Deferred::new();
        let g = gate.clone();
        let observed = Rc::new(RefCell::new(None));
        let obs = Rc::clone(&observed);
        q.add_async(move |handle| {
            *obs.borrow_mut() = Some(handle.clone());
            g.clone()
        })
        .unwrap();
        sched.tick();
        assert_eq!(q.running_count(), 1);

        q.stop();
        let handle = observed.borrow().clone().unwrap();
        assert!(handle.is_cancelled());

        // The cooperative body eventually settles; the queue ignores it.
        gate.resolve(());
        assert_eq!(q.running_count(), 0);
    }

    #[test]
    fn wait_async_resolves_when_drained() {
        let (_clock, sched) = lab();
        let q = sched.create_queue("work", QueueOptions::default());

        q.add(|_| Ok(())).unwrap();
        q.add(|_| Ok(())).unwrap();
        let waiter = q.wait_async(0);
        assert!(waiter.is_pending());

        sched.tick();
        assert!(waiter.is_resolved());

        // Already-satisfied waits resolve immediately.
        assert!(q.wait_async(0).is_resolved());
    }

    #[test]
    fn wait_async_with_threshold() {
        let (_clock, sched) = lab();
        let q = sched.create_queue("work", QueueOptions::default());
        q.add(|_| Ok(())).unwrap();
        // One pending task is within a threshold of 1.
        assert!(q.wait_async(1).is_resolved());
        sched.tick();
        assert!(q.wait_async(0).is_resolved());
    }

    #[test]
    fn parallel_limit_counts_async_tasks() {
        let (_clock, sched) = lab();
        let q = sched.create_queue("work", QueueOptions::default().with_parallel(2));

        let gates: Vec<Deferred<(), TaskFailure>> =
            (0..3).map(|_| Deferred::new()).collect();
        for gate in &gates {
            let g = gate.clone();
            q.add_async(move |_| g.clone()).unwrap();
        }
        sched.tick();
        assert_eq!(q.running_count(), 2);
        assert_eq!(q.pending_count(), 1);

        // Completing one running task frees a slot for the third.
        gates[0].resolve(());
        sched.tick();
        assert_eq!(q.running_count(), 2);
        assert_eq!(q.pending_count(), 0);

        gates[1].resolve(());
        gates[2].resolve(());
        assert_eq!(q.running_count(), 0);
    }

    #[test]
    fn task_errors_are_collected_with_catch_errors() {
        let (_clock, sched) = lab();
        let q = sched.create_queue(
            "work",
            QueueOptions::default().with_catch_errors(true),
        );
        let after = Rc::new(Cell::new(false));

        q.add(|_| Err(TaskFailure::failed("boom"))).unwrap();
        let a = Rc::clone(&after);
        q.add(move |_| {
            a.set(true);
            Ok(())
        })
        .unwrap();

        sched.tick();
        // The failure never stalls the queue.
        assert!(after.get());
        assert_eq!(q.errors(), vec![TaskFailure::failed("boom")]);
        assert_eq!(q.take_errors().len(), 1);
        assert!(q.errors().is_empty());
    }

    #[test]
    fn uncaught_task_errors_reach_the_scheduler_handler() {
        let (_clock, sched) = lab();
        let q = sched.create_queue("work", QueueOptions::default());
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        sched.set_error_handler(move |failure| s.borrow_mut().push(failure.clone()));

        q.add(|_| Err(TaskFailure::failed("oops"))).unwrap();
        sched.tick();
        assert_eq!(*seen.borrow(), vec![TaskFailure::failed("oops")]);
    }

    #[test]
    fn task_timeout_cancels_and_records() {
        let (clock, sched) = lab();
        let q = sched.create_queue(
            "work",
            QueueOptions::default()
                .with_catch_errors(true)
                .with_task_timeout(Duration::from_millis(50)),
        );

        let gate: Deferred<(), TaskFailure> = Deferred::new();
        let g = gate.clone();
        let observed = Rc::new(RefCell::new(None));
        let obs = Rc::clone(&observed);
        q.add_async(move |handle| {
            *obs.borrow_mut() = Some(handle.clone());
            g.clone()
        })
        .unwrap();
        sched.tick();
        assert_eq!(q.running_count(), 1);

        clock.advance(Duration::from_millis(60));
        sched.tick();

        assert_eq!(q.running_count(), 0);
        assert_eq!(q.errors(), vec![TaskFailure::Timeout]);
        assert!(observed.borrow().as_ref().unwrap().is_cancelled());

        // Other tasks keep flowing.
        let ran = Rc::new(Cell::new(false));
        let r = Rc::clone(&ran);
        q.add(move |_| {
            r.set(true);
            Ok(())
        })
        .unwrap();
        sched.tick();
        assert!(ran.get());

        // The timed-out body's late settle is ignored.
        gate.resolve(());
        assert_eq!(q.errors(), vec![TaskFailure::Timeout]);
    }

    #[test]
    fn timely_completion_cancels_timeout_timer() {
        let (clock, sched) = lab();
        let q = sched.create_queue(
            "work",
            QueueOptions::default()
                .with_catch_errors(true)
                .with_task_timeout(Duration::from_millis(50)),
        );

        q.add(|_| Ok(())).unwrap();
        sched.tick();
        clock.advance(Duration::from_millis(100));
        sched.tick();
        assert!(q.errors().is_empty());
    }

    #[test]
    fn throttle_collapses_rapid_calls_to_last_fn() {
        let (clock, sched) = lab();
        let q = sched.create_queue("work", QueueOptions::default());
        let seen = Rc::new(RefCell::new(Vec::new()));

        // Five registrations within 10ms, 50ms interval: exactly one
        // invocation, of the last function.
        for i in 0..5 {
            let s = Rc::clone(&seen);
            q.throttle(Duration::from_millis(50), move || s.borrow_mut().push(i))
                .unwrap();
            clock.advance(Duration::from_millis(2));
        }
        sched.run_until_idle();
        assert_eq!(*seen.borrow(), vec![4]);
    }

    #[test]
    fn throttle_gates_the_next_interval() {
        let (clock, sched) = lab();
        let q = sched.create_queue("work", QueueOptions::default());
        let seen = Rc::new(RefCell::new(Vec::new()));

        let s = Rc::clone(&seen);
        q.throttle(Duration::from_millis(50), move || s.borrow_mut().push(1))
            .unwrap();
        sched.run_until_idle();
        assert_eq!(*seen.borrow(), vec![1]);

        // A call inside the gate interval waits for the gate to open.
        let s = Rc::clone(&seen);
        q.throttle(Duration::from_millis(50), move || s.borrow_mut().push(2))
            .unwrap();
        sched.run_until_idle();
        assert_eq!(*seen.borrow(), vec![1], "gated call must not run early");

        clock.advance(Duration::from_millis(60));
        sched.run_until_idle();
        assert_eq!(*seen.borrow(), vec![1, 2]);
    }

    #[test]
    fn debounce_runs_trailing_edge_only() {
        let (clock, sched) = lab();
        let q = sched.create_queue("work", QueueOptions::default());
        let seen = Rc::new(RefCell::new(Vec::new()));

        let s = Rc::clone(&seen);
        q.debounce(Duration::from_millis(30), move || s.borrow_mut().push(1))
            .unwrap();
        sched.run_until_idle();
        assert!(seen.borrow().is_empty(), "debounce has no leading edge");

        clock.advance(Duration::from_millis(35));
        sched.run_until_idle();
        assert_eq!(*seen.borrow(), vec![1]);
    }

    #[test]
    fn debounce_resets_interval_and_keeps_latest_fn() {
        let (clock, sched) = lab();
        let q = sched.create_queue("work", QueueOptions::default());
        let seen = Rc::new(RefCell::new(Vec::new()));

        let s = Rc::clone(&seen);
        q.debounce(Duration::from_millis(30), move || s.borrow_mut().push(1))
            .unwrap();
        clock.advance(Duration::from_millis(20));
        sched.run_until_idle();

        // Second call 20ms in: deadline moves to t=50ms.
        let s = Rc::clone(&seen);
        q.debounce(Duration::from_millis(30), move || s.borrow_mut().push(2))
            .unwrap();
        clock.advance(Duration::from_millis(20));
        sched.run_until_idle();
        assert!(seen.borrow().is_empty(), "t=40ms is before the new deadline");

        clock.advance(Duration::from_millis(15));
        sched.run_until_idle();
        assert_eq!(*seen.borrow(), vec![2]);
    }

    #[test]
    fn sync_budget_yields_between_passes() {
        let clock = LabClock::new();
        let sched = Scheduler::lab(&clock);
        let q = sched.create_queue(
            "work",
            QueueOptions::default().with_sync_budget(Duration::from_millis(5)),
        );
        let count = Rc::new(Cell::new(0u32));

        // Each task advances the lab clock past the budget, forcing the
        // pass to yield and reschedule.
        for _ in 0..3 {
            let c = Rc::clone(&count);
            let clk = clock.clone();
            q.add(move |_| {
                c.set(c.get() + 1);
                clk.advance(Duration::from_millis(10));
                Ok(())
            })
            .unwrap();
        }

        sched.tick();
        assert_eq!(count.get(), 1, "budget exhausted after the first task");
        assert_eq!(q.pending_count(), 2);

        sched.run_until_idle();
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn tasks_added_from_a_task_run_later() {
        let (_clock, sched) = lab();
        let q = sched.create_queue("work", QueueOptions::default());
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = Rc::clone(&order);
        let q2 = q.clone();
        q.add(move |_| {
            o.borrow_mut().push("outer");
            let o2 = Rc::clone(&o);
            q2.add(move |_| {
                o2.borrow_mut().push("inner");
                Ok(())
            })
        })
        .unwrap();

        sched.run_until_idle();
        assert_eq!(*order.borrow(), vec!["outer", "inner"]);
    }
}
