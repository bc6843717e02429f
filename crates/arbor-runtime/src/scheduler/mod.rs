#![forbid(unsafe_code)]

//! Cooperative task scheduling: an explicit scheduler context owning the
//! clock, the timer list, and the named queue registry.
//!
//! # Design
//!
//! There is no process-wide singleton: a [`Scheduler`] is created by (and
//! torn down with) the host application, and everything that needs queues
//! or timers holds a handle to it. One [`Scheduler::tick`] call is one
//! cooperative scheduling step: due timers fire, watched graphs flush
//! their batched traps, and queues with pending work run a bounded pass.
//!
//! Time flows through a [`LabClock`]-aware time source so tests advance
//! time manually and never sleep.
//!
//! # Invariants
//!
//! 1. Timers fire in deadline order, never before their deadline.
//! 2. A queue runs at most one pass per tick; remaining work reschedules.
//! 3. Batched trap flushing happens once per tick, between timers and
//!    queue passes.

pub mod queue;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use arbor_core::Graph;
use web_time::{Duration, Instant};

pub use queue::{QueueOptions, QueueState, TaskHandle, TaskQueue};

/// Upper bound on `run_until_idle` passes, far above anything a correct
/// workload reaches; a runaway reschedule loop stops here instead of
/// spinning forever.
const MAX_IDLE_PASSES: usize = 1024;

// ─── Failure kinds ───────────────────────────────────────────────────────────

/// Failure surfaced by queues, tasks, and waiters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFailure {
    /// The queue stopped before the task or waiter could complete.
    QueueStopped,
    /// The task exceeded its configured deadline.
    Timeout,
    /// The task body returned an error.
    Failed(Rc<str>),
}

impl TaskFailure {
    /// A `Failed` variant from any displayable message.
    #[must_use]
    pub fn failed(msg: impl AsRef<str>) -> Self {
        Self::Failed(Rc::from(msg.as_ref()))
    }
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QueueStopped => write!(f, "queue stopped"),
            Self::Timeout => write!(f, "task deadline exceeded"),
            Self::Failed(msg) => write!(f, "task failed: {msg}"),
        }
    }
}

impl std::error::Error for TaskFailure {}

// ─── Time source ─────────────────────────────────────────────────────────────

/// A manually-advanceable clock for deterministic tests.
///
/// All schedulers sharing the same `LabClock` see the same time.
#[derive(Debug, Clone)]
pub struct LabClock {
    epoch: Instant,
    offset_us: Rc<Cell<u64>>,
}

impl LabClock {
    /// Create a lab clock starting at `Instant::now()`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset_us: Rc::new(Cell::new(0)),
        }
    }

    /// Advance the lab clock by `delta`.
    pub fn advance(&self, delta: Duration) {
        let us = delta.as_micros().min(u64::MAX as u128) as u64;
        self.offset_us.set(self.offset_us.get().saturating_add(us));
    }

    /// Current lab time.
    #[must_use]
    pub fn now(&self) -> Instant {
        self.epoch + Duration::from_micros(self.offset_us.get())
    }
}

impl Default for LabClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
enum TimeSource {
    /// Real wall-clock time.
    Real,
    /// Deterministic lab clock for testing.
    Lab(LabClock),
}

impl TimeSource {
    fn now(&self) -> Instant {
        match self {
            Self::Real => Instant::now(),
            Self::Lab(clock) => clock.now(),
        }
    }
}

// ─── Scheduler internals ─────────────────────────────────────────────────────

pub(crate) struct Timer {
    id: u64,
    at: Instant,
    action: Option<Box<dyn FnOnce()>>,
}

pub(crate) type SchedHandle = Weak<RefCell<SchedulerInner>>;

pub(crate) struct SchedulerInner {
    time: TimeSource,
    timers: Vec<Timer>,
    next_timer: u64,
    queues: Vec<TaskQueue>,
    scheduled: VecDeque<TaskQueue>,
    graphs: Vec<Graph>,
    error_handler: Rc<dyn Fn(&TaskFailure)>,
}

/// Current time according to the scheduler, if it is still alive.
pub(crate) fn sched_now(sched: &SchedHandle) -> Option<Instant> {
    sched.upgrade().map(|inner| inner.borrow().time.now())
}

/// Register a one-shot timer. Returns the timer id, or `None` if the
/// scheduler is gone.
pub(crate) fn sched_register_timer(
    sched: &SchedHandle,
    at: Instant,
    action: Box<dyn FnOnce()>,
) -> Option<u64> {
    let inner = sched.upgrade()?;
    let mut s = inner.borrow_mut();
    let id = s.next_timer;
    s.next_timer += 1;
    s.timers.push(Timer {
        id,
        at,
        action: Some(action),
    });
    Some(id)
}

/// Drop a registered timer before it fires. Idempotent.
pub(crate) fn sched_cancel_timer(sched: &SchedHandle, id: u64) {
    if let Some(inner) = sched.upgrade() {
        inner.borrow_mut().timers.retain(|t| t.id != id);
    }
}

/// Put a queue on the run list for the next tick.
pub(crate) fn sched_enqueue_run(sched: &SchedHandle, queue: TaskQueue) {
    if let Some(inner) = sched.upgrade() {
        inner.borrow_mut().scheduled.push_back(queue);
    }
}

/// Route an uncaught task failure to the scheduler-wide handler.
pub(crate) fn sched_report_error(sched: &SchedHandle, failure: &TaskFailure) {
    let handler = sched
        .upgrade()
        .map(|inner| Rc::clone(&inner.borrow().error_handler));
    match handler {
        Some(handler) => handler(failure),
        None => tracing::warn!(error = %failure, "task failure with no scheduler"),
    }
}

// ─── Scheduler ───────────────────────────────────────────────────────────────

/// The cooperative scheduler context.
///
/// Cheaply cloneable; all clones drive the same timer list and queue
/// registry.
#[derive(Clone)]
pub struct Scheduler {
    inner: Rc<RefCell<SchedulerInner>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = self.inner.borrow();
        f.debug_struct("Scheduler")
            .field("queues", &s.queues.len())
            .field("timers", &s.timers.len())
            .field("scheduled", &s.scheduled.len())
            .finish()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    /// Create a scheduler on the real clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_time(TimeSource::Real)
    }

    /// Create a scheduler on a deterministic lab clock.
    #[must_use]
    pub fn lab(clock: &LabClock) -> Self {
        Self::with_time(TimeSource::Lab(clock.clone()))
    }

    fn with_time(time: TimeSource) -> Self {
        Self {
            inner: Rc::new(RefCell::new(SchedulerInner {
                time,
                timers: Vec::new(),
                next_timer: 1,
                queues: Vec::new(),
                scheduled: VecDeque::new(),
                graphs: Vec::new(),
                error_handler: Rc::new(|failure| {
                    tracing::warn!(error = %failure, "unhandled task failure");
                }),
            })),
        }
    }

    /// Current time according to this scheduler's clock.
    #[must_use]
    pub fn now(&self) -> Instant {
        self.inner.borrow().time.now()
    }

    /// Replace the scheduler-wide handler for uncaught task failures.
    ///
    /// The default handler logs at `warn` level.
    pub fn set_error_handler(&self, handler: impl Fn(&TaskFailure) + 'static) {
        self.inner.borrow_mut().error_handler = Rc::new(handler);
    }

    /// Create (or look up) a named queue. Queues are registered by name;
    /// re-creating an existing name returns the original queue and the
    /// original options win.
    pub fn create_queue(&self, name: &str, options: QueueOptions) -> TaskQueue {
        if let Some(existing) = self.queue(name) {
            return existing;
        }
        let queue = TaskQueue::new(name, options, Rc::downgrade(&self.inner));
        self.inner.borrow_mut().queues.push(queue.clone());
        queue
    }

    /// Look up a queue by name.
    #[must_use]
    pub fn queue(&self, name: &str) -> Option<TaskQueue> {
        self.inner
            .borrow()
            .queues
            .iter()
            .find(|q| &*q.name() == name)
            .cloned()
    }

    /// Register a graph whose batched traps flush once per tick.
    pub fn watch_graph(&self, graph: &Graph) {
        self.inner.borrow_mut().graphs.push(graph.clone());
    }

    /// One cooperative scheduling step: fire due timers (deadline order),
    /// flush watched graphs' batched traps, then run each scheduled queue
    /// for one bounded pass.
    pub fn tick(&self) {
        let now = self.now();
        let due: Vec<Box<dyn FnOnce()>> = {
            let mut s = self.inner.borrow_mut();
            let mut due: Vec<Timer> = Vec::new();
            let mut i = 0;
            while i < s.timers.len() {
                if s.timers[i].at <= now {
                    due.push(s.timers.remove(i));
                } else {
                    i += 1;
                }
            }
            due.sort_by_key(|t| (t.at, t.id));
            due.into_iter().filter_map(|mut t| t.action.take()).collect()
        };
        for action in due {
            action();
        }

        let graphs: Vec<Graph> = self.inner.borrow().graphs.clone();
        for graph in &graphs {
            graph.flush_batched();
        }

        let to_run: Vec<TaskQueue> = {
            let mut s = self.inner.borrow_mut();
            s.scheduled.drain(..).collect()
        };
        for queue in to_run {
            queue.run();
        }
    }

    /// Tick until no timer is due, no queue is scheduled, and no batched
    /// trap is pending. Returns the number of passes taken. Timers in the
    /// future do not count as due — advance the lab clock to reach them.
    pub fn run_until_idle(&self) -> usize {
        let mut passes = 0;
        while passes < MAX_IDLE_PASSES && self.has_due_work() {
            self.tick();
            passes += 1;
        }
        passes
    }

    fn has_due_work(&self) -> bool {
        let now = self.now();
        let s = self.inner.borrow();
        s.timers.iter().any(|t| t.at <= now)
            || !s.scheduled.is_empty()
            || s.graphs.iter().any(|g| g.pending_batched() > 0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
