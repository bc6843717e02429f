#![forbid(unsafe_code)]

//! Settle-once result slots for cooperative async control flow.
//!
//! [`Deferred<T, E>`] is the explicit "pending result handle" the scheduler
//! and activation state machine are built on, instead of language-level
//! coroutine suspension. A deferred is settled exactly once — `resolve` or
//! `reject` — and every `on_settle` callback observes that single outcome,
//! whether registered before or after settlement.
//!
//! Single-threaded by design: clones share state via `Rc`, callbacks run
//! synchronously on the settling call.
//!
//! # Invariants
//!
//! 1. A deferred settles at most once; later settle calls are ignored.
//! 2. Callbacks run in registration order, after the state is stored.
//! 3. A callback registered on an already-settled deferred runs immediately.

use std::cell::RefCell;
use std::rc::Rc;

enum State<T, E> {
    Pending,
    Settled(Result<T, E>),
}

struct DeferredInner<T, E> {
    state: State<T, E>,
    callbacks: Vec<Box<dyn FnOnce(&Result<T, E>)>>,
}

/// A single-threaded, settle-once result slot with completion callbacks.
///
/// Cloning shares the underlying slot.
pub struct Deferred<T, E> {
    inner: Rc<RefCell<DeferredInner<T, E>>>,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T, E> std::fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &self.inner.borrow().state {
            State::Pending => "pending",
            State::Settled(Ok(_)) => "resolved",
            State::Settled(Err(_)) => "rejected",
        };
        f.debug_struct("Deferred").field("state", &state).finish()
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Deferred<T, E> {
    /// Create a pending deferred.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(DeferredInner {
                state: State::Pending,
                callbacks: Vec::new(),
            })),
        }
    }

    /// Create an already-resolved deferred.
    #[must_use]
    pub fn resolved(value: T) -> Self {
        Self {
            inner: Rc::new(RefCell::new(DeferredInner {
                state: State::Settled(Ok(value)),
                callbacks: Vec::new(),
            })),
        }
    }

    /// Create an already-rejected deferred.
    #[must_use]
    pub fn rejected(err: E) -> Self {
        Self {
            inner: Rc::new(RefCell::new(DeferredInner {
                state: State::Settled(Err(err)),
                callbacks: Vec::new(),
            })),
        }
    }

    /// Resolve with `value`. Ignored if already settled.
    pub fn resolve(&self, value: T) {
        self.settle(Ok(value));
    }

    /// Reject with `err`. Ignored if already settled.
    pub fn reject(&self, err: E) {
        self.settle(Err(err));
    }

    fn settle(&self, result: Result<T, E>) {
        let callbacks = {
            let mut inner = self.inner.borrow_mut();
            if matches!(inner.state, State::Settled(_)) {
                return;
            }
            inner.state = State::Settled(result.clone());
            std::mem::take(&mut inner.callbacks)
        };
        for cb in callbacks {
            cb(&result);
        }
    }

    /// Run `callback` when this deferred settles; immediately if it already
    /// has. The callback may re-enter the deferred (e.g. register further
    /// callbacks).
    pub fn on_settle(&self, callback: impl FnOnce(&Result<T, E>) + 'static) {
        let mut inner = self.inner.borrow_mut();
        match &inner.state {
            State::Pending => {
                inner.callbacks.push(Box::new(callback));
            }
            State::Settled(result) => {
                let result = result.clone();
                drop(inner);
                callback(&result);
            }
        }
    }

    /// Whether the deferred has not settled yet.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self.inner.borrow().state, State::Pending)
    }

    /// Whether the deferred resolved successfully.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(self.inner.borrow().state, State::Settled(Ok(_)))
    }

    /// Whether the deferred was rejected.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self.inner.borrow().state, State::Settled(Err(_)))
    }

    /// A copy of the settled result, or `None` while pending.
    #[must_use]
    pub fn peek(&self) -> Option<Result<T, E>> {
        match &self.inner.borrow().state {
            State::Pending => None,
            State::Settled(result) => Some(result.clone()),
        }
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Default for Deferred<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn resolve_delivers_to_callbacks() {
        let d: Deferred<i32, &'static str> = Deferred::new();
        let seen = Rc::new(Cell::new(0));
        let s = Rc::clone(&seen);
        d.on_settle(move |r| s.set(*r.as_ref().unwrap()));

        assert!(d.is_pending());
        d.resolve(42);
        assert_eq!(seen.get(), 42);
        assert!(d.is_resolved());
    }

    #[test]
    fn callback_after_settle_runs_immediately() {
        let d: Deferred<i32, &'static str> = Deferred::resolved(7);
        let seen = Rc::new(Cell::new(0));
        let s = Rc::clone(&seen);
        d.on_settle(move |r| s.set(*r.as_ref().unwrap()));
        assert_eq!(seen.get(), 7);
    }

    #[test]
    fn second_settle_is_ignored() {
        let d: Deferred<i32, &'static str> = Deferred::new();
        d.resolve(1);
        d.resolve(2);
        d.reject("late");
        assert_eq!(d.peek(), Some(Ok(1)));
    }

    #[test]
    fn reject_path() {
        let d: Deferred<(), &'static str> = Deferred::new();
        let seen = Rc::new(Cell::new(""));
        let s = Rc::clone(&seen);
        d.on_settle(move |r| s.set(*r.as_ref().unwrap_err()));
        d.reject("boom");
        assert_eq!(seen.get(), "boom");
        assert!(d.is_rejected());
        assert!(!d.is_pending());
    }

    #[test]
    fn clones_share_state() {
        let d: Deferred<i32, &'static str> = Deferred::new();
        let d2 = d.clone();
        d2.resolve(5);
        assert_eq!(d.peek(), Some(Ok(5)));
    }

    #[test]
    fn callbacks_run_in_registration_order() {
        let d: Deferred<(), &'static str> = Deferred::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        for i in 0..3 {
            let o = Rc::clone(&order);
            d.on_settle(move |_| o.borrow_mut().push(i));
        }
        d.resolve(());
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn callback_may_register_further_callbacks() {
        let d: Deferred<i32, &'static str> = Deferred::new();
        let seen = Rc::new(Cell::new(0));
        let s = Rc::clone(&seen);
        let d2 = d.clone();
        d.on_settle(move |_| {
            // The deferred is already settled here, so this runs inline.
            let s2 = Rc::clone(&s);
            d2.on_settle(move |r| s2.set(*r.as_ref().unwrap()));
        });
        d.resolve(11);
        assert_eq!(seen.get(), 11);
    }

    #[test]
    fn rejected_constructor() {
        let d: Deferred<(), &'static str> = Deferred::rejected("no");
        assert_eq!(d.peek(), Some(Err("no")));
    }

    #[test]
    fn debug_format() {
        let d: Deferred<(), &'static str> = Deferred::new();
        assert!(format!("{d:?}").contains("pending"));
        d.resolve(());
        assert!(format!("{d:?}").contains("resolved"));
    }
}
