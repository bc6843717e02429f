#![forbid(unsafe_code)]

//! The activation state machine: serialized async activate/deactivate
//! transitions for activities.
//!
//! # Design
//!
//! An [`Activity`] wraps a graph node plus a [`HookTable`] — an explicit
//! tagged dispatch table ([`HookKind`] → handler) built once per activity,
//! in place of locating handlers by string-concatenated event names. Hooks
//! return a [`Deferred`], so asynchronous transitions need no coroutine
//! support: the machine tracks a single in-flight transition slot and at
//! most one queued superseding request.
//!
//! Request semantics:
//!
//! - Same target as the in-flight transition: the caller shares the same
//!   pending deferred (no duplicate work), and any queued opposite request
//!   is cancelled with [`ActivationError::Cancelled`].
//! - Opposite target: queued in the single slot; it runs when the
//!   in-flight transition completes (or resolves as a no-op if the state
//!   already matches by then).
//! - A failing before hook rejects the transition and leaves the state
//!   unchanged. The `active` flag flips only after the before hook
//!   succeeds, immediately followed by an `activated`/`deactivated` event
//!   on the node and the after hook, whose failure still rejects the
//!   caller's deferred (the state stays flipped).
//!
//! The current `active` flag is mirrored into the node's `"active"`
//! property, so ordinary traps and bindings observe activity state.
//!
//! # Invariants
//!
//! 1. At most one transition is in flight per activity.
//! 2. A request is never silently dropped: it resolves, rejects, or is
//!    reported cancelled.
//! 3. Rapid opposite toggles collapse to at most one net transition.

use std::cell::RefCell;
use std::rc::Rc;

use arbor_core::{Event, Graph, NodeId, Value};

use crate::deferred::Deferred;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure surfaced by activation transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationError {
    /// The activity's node has been unlinked.
    ObjectUnlinked,
    /// The request was superseded by an opposite request before running.
    Cancelled,
    /// A before/after hook failed.
    Hook(Rc<str>),
}

impl ActivationError {
    /// A `Hook` variant from any displayable message.
    #[must_use]
    pub fn hook(msg: impl AsRef<str>) -> Self {
        Self::Hook(Rc::from(msg.as_ref()))
    }
}

impl std::fmt::Display for ActivationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ObjectUnlinked => write!(f, "activity has been unlinked"),
            Self::Cancelled => write!(f, "activation request superseded"),
            Self::Hook(msg) => write!(f, "activation hook failed: {msg}"),
        }
    }
}

impl std::error::Error for ActivationError {}

// ---------------------------------------------------------------------------
// Hook table
// ---------------------------------------------------------------------------

/// Lifecycle hook slots, dispatched by tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// Runs before the activity becomes active; failure aborts.
    BeforeActive,
    /// Runs after the activity became active.
    AfterActive,
    /// Runs before the activity becomes inactive; failure aborts.
    BeforeInactive,
    /// Runs after the activity became inactive.
    AfterInactive,
}

impl HookKind {
    const COUNT: usize = 4;

    const fn index(self) -> usize {
        match self {
            Self::BeforeActive => 0,
            Self::AfterActive => 1,
            Self::BeforeInactive => 2,
            Self::AfterInactive => 3,
        }
    }
}

type Hook = Rc<dyn Fn(&Activity) -> Deferred<(), ActivationError>>;

/// Dispatch table mapping [`HookKind`] to handlers, built once per
/// activity.
#[derive(Default)]
pub struct HookTable {
    slots: [Option<Hook>; HookKind::COUNT],
}

impl HookTable {
    /// An empty table; transitions complete immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an asynchronous hook. Replaces any previous handler for
    /// the same kind.
    #[must_use]
    pub fn on(
        mut self,
        kind: HookKind,
        hook: impl Fn(&Activity) -> Deferred<(), ActivationError> + 'static,
    ) -> Self {
        self.slots[kind.index()] = Some(Rc::new(hook));
        self
    }

    /// Register a synchronous hook.
    #[must_use]
    pub fn on_sync(
        self,
        kind: HookKind,
        hook: impl Fn(&Activity) -> Result<(), ActivationError> + 'static,
    ) -> Self {
        self.on(kind, move |activity| match hook(activity) {
            Ok(()) => Deferred::resolved(()),
            Err(err) => Deferred::rejected(err),
        })
    }

    fn get(&self, kind: HookKind) -> Option<Hook> {
        self.slots[kind.index()].clone()
    }
}

impl std::fmt::Debug for HookTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registered: Vec<&str> = [
            (HookKind::BeforeActive, "BeforeActive"),
            (HookKind::AfterActive, "AfterActive"),
            (HookKind::BeforeInactive, "BeforeInactive"),
            (HookKind::AfterInactive, "AfterInactive"),
        ]
        .iter()
        .filter(|(kind, _)| self.slots[kind.index()].is_some())
        .map(|(_, name)| *name)
        .collect();
        f.debug_struct("HookTable").field("registered", &registered).finish()
    }
}

// ---------------------------------------------------------------------------
// Activity
// ---------------------------------------------------------------------------

struct Transition {
    target: bool,
    result: Deferred<(), ActivationError>,
}

struct ActivationState {
    active: bool,
    inflight: Option<Transition>,
    /// Single superseding slot; its target is always opposite to the
    /// in-flight transition's.
    queued: Option<Transition>,
}

struct ActivityInner {
    graph: Graph,
    node: NodeId,
    hooks: HookTable,
    state: RefCell<ActivationState>,
}

/// An activity: a graph node with a serialized activation lifecycle.
///
/// Cheaply cloneable; all clones address the same activity.
#[derive(Clone)]
pub struct Activity {
    inner: Rc<ActivityInner>,
}

impl std::fmt::Debug for Activity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("Activity")
            .field("node", &self.inner.node)
            .field("active", &state.active)
            .field("in_flight", &state.inflight.as_ref().map(|t| t.target))
            .finish()
    }
}

impl Activity {
    /// Create an activity on a fresh node, initially inactive.
    ///
    /// The node carries an observable `"active"` property.
    #[must_use]
    pub fn new(graph: &Graph, hooks: HookTable) -> Self {
        let node = graph.create();
        // The node was just created; declaring its state cannot fail.
        let _ = graph.set(node, "active", Value::Bool(false));
        Self {
            inner: Rc::new(ActivityInner {
                graph: graph.clone(),
                node,
                hooks,
                state: RefCell::new(ActivationState {
                    active: false,
                    inflight: None,
                    queued: None,
                }),
            }),
        }
    }

    /// The activity's graph node (attach it, observe it, bind against it).
    #[must_use]
    pub fn node(&self) -> NodeId {
        self.inner.node
    }

    /// The graph this activity lives in.
    #[must_use]
    pub fn graph(&self) -> &Graph {
        &self.inner.graph
    }

    /// Whether the activity is currently active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.state.borrow().active
    }

    /// Whether an activating transition is in flight.
    #[must_use]
    pub fn is_activating(&self) -> bool {
        self.inner
            .state
            .borrow()
            .inflight
            .as_ref()
            .is_some_and(|t| t.target)
    }

    /// Whether a deactivating transition is in flight.
    #[must_use]
    pub fn is_deactivating(&self) -> bool {
        self.inner
            .state
            .borrow()
            .inflight
            .as_ref()
            .is_some_and(|t| !t.target)
    }

    /// Request activation. See the module docs for coalescing semantics.
    pub fn activate_async(&self) -> Deferred<(), ActivationError> {
        self.request(true)
    }

    /// Request deactivation. See the module docs for coalescing semantics.
    pub fn deactivate_async(&self) -> Deferred<(), ActivationError> {
        self.request(false)
    }

    fn request(&self, target: bool) -> Deferred<(), ActivationError> {
        if self.inner.graph.is_unlinked(self.inner.node) {
            return Deferred::rejected(ActivationError::ObjectUnlinked);
        }
        let (result, cancelled, start) = {
            let mut state = self.inner.state.borrow_mut();
            if let Some(inflight) = &state.inflight {
                if inflight.target == target {
                    // Satisfied by the transition already completing; a
                    // queued opposite request is superseded.
                    let shared = inflight.result.clone();
                    let cancelled = state.queued.take();
                    (shared, cancelled, false)
                } else {
                    // Opposite target: share or fill the single queued slot.
                    match &state.queued {
                        Some(queued) => (queued.result.clone(), None, false),
                        None => {
                            let deferred = Deferred::new();
                            state.queued = Some(Transition {
                                target,
                                result: deferred.clone(),
                            });
                            (deferred, None, false)
                        }
                    }
                }
            } else if state.active == target {
                (Deferred::resolved(()), None, false)
            } else {
                let deferred = Deferred::new();
                state.inflight = Some(Transition {
                    target,
                    result: deferred.clone(),
                });
                (deferred, None, true)
            }
        };
        if let Some(superseded) = cancelled {
            tracing::debug!(
                node = self.inner.node.raw(),
                target,
                "queued activation request superseded"
            );
            superseded.result.reject(ActivationError::Cancelled);
        }
        if start {
            self.run_transition(target, result.clone());
        }
        result
    }

    fn run_transition(&self, target: bool, result: Deferred<(), ActivationError>) {
        let before = self.inner.hooks.get(if target {
            HookKind::BeforeActive
        } else {
            HookKind::BeforeInactive
        });
        let pending = match before {
            Some(hook) => hook(self),
            None => Deferred::resolved(()),
        };
        let me = self.clone();
        pending.on_settle(move |outcome| match outcome {
            Err(err) => {
                // State unchanged; the caller sees the hook failure.
                result.reject(err.clone());
                me.finish_transition();
            }
            Ok(()) => me.commit_transition(target, result.clone()),
        });
    }

    /// Flip the state after a successful before hook, notify, then run the
    /// after hook.
    fn commit_transition(&self, target: bool, result: Deferred<(), ActivationError>) {
        self.inner.state.borrow_mut().active = target;
        if self
            .inner
            .graph
            .set(self.inner.node, "active", Value::Bool(target))
            .is_err()
        {
            // Unlinked mid-transition; nothing left to notify.
            result.reject(ActivationError::ObjectUnlinked);
            self.finish_transition();
            return;
        }
        let _ = self.inner.graph.emit(
            self.inner.node,
            Event::named(if target { "activated" } else { "deactivated" }),
        );

        let after = self.inner.hooks.get(if target {
            HookKind::AfterActive
        } else {
            HookKind::AfterInactive
        });
        let pending = match after {
            Some(hook) => hook(self),
            None => Deferred::resolved(()),
        };
        let me = self.clone();
        pending.on_settle(move |outcome| {
            match outcome {
                Ok(()) => result.resolve(()),
                Err(err) => result.reject(err.clone()),
            }
            me.finish_transition();
        });
    }

    /// Clear the in-flight slot and start the queued request, if any.
    fn finish_transition(&self) {
        let next = {
            let mut state = self.inner.state.borrow_mut();
            state.inflight = None;
            state.queued.take()
        };
        let Some(next) = next else { return };
        let start = {
            let mut state = self.inner.state.borrow_mut();
            if state.active == next.target {
                false
            } else {
                state.inflight = Some(Transition {
                    target: next.target,
                    result: next.result.clone(),
                });
                true
            }
        };
        if start {
            self.run_transition(next.target, next.result);
        } else {
            // The failed or collapsed transition left the state already
            // matching; the queued request is a no-op.
            next.result.resolve(());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
