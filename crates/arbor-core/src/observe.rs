#![forbid(unsafe_code)]

//! Observation traps: live subscriptions to property reassignment and
//! node events.
//!
//! # Design
//!
//! A property trap binds (node, key) to a callback. It fires when the
//! property is reassigned to a different value (identity comparison), and —
//! when the current value is itself a node — whenever that node emits a
//! `Change` event. The forwarding subscription moves automatically when the
//! property is reassigned from node A to node B, which is what lets
//! observers follow nested mutable state without re-subscribing by hand.
//!
//! Two delivery modes exist:
//!
//! - **synchronous**: the callback runs as soon as the mutation completes;
//! - **batched**: the callback runs at most once per scheduling tick with
//!   only the latest value, in the order traps were first touched within
//!   the tick. [`Graph::flush_batched`] drains the queue; the scheduler in
//!   `arbor-runtime` calls it once per tick.
//!
//! Forwarded `Change` events honor the trap's own mode — a batched trap
//! batches forwarded changes too. Delivery mode is a property of the trap,
//! never of the event source.
//!
//! # Invariants
//!
//! 1. Callbacks observe a fully-mutated graph, never a partial one.
//! 2. Event listeners fire in registration order.
//! 3. A batched trap fires at most once per flush, with the latest value.
//! 4. Unsubscription is idempotent, explicit or via node unlink.
//!
//! # Failure Modes
//!
//! - Observing a fixed slot: [`GraphError::NotObservable`].
//! - Observing a key the node never declared: accepted, but the trap is
//!   inert and never fires (the key reads as always-undefined).

use std::rc::Rc;

use crate::error::GraphError;
use crate::event::Event;
use crate::graph::{
    Dispatch, EventHandle, Graph, ListenerKind, ListenerRecord, PendingNotice, PropCallback,
    TrapHandle, TrapId, TrapRecord, UnlinkHandle, UnlinkWatcher,
};
use crate::value::{NodeId, Value};

impl Graph {
    // ── Property traps ───────────────────────────────────────────────

    /// Observe reassignments of `key` on `node`, synchronously.
    ///
    /// # Errors
    ///
    /// [`GraphError::ObjectUnlinked`] if the node is dead;
    /// [`GraphError::NotObservable`] if `key` names a fixed slot.
    pub fn observe(
        &self,
        node: NodeId,
        key: &str,
        callback: impl Fn(&Graph, &Value) + 'static,
    ) -> Result<TrapHandle, GraphError> {
        self.observe_inner(node, key, Rc::new(callback), false, None)
    }

    /// Observe reassignments of `key` on `node`, batched per tick.
    ///
    /// # Errors
    ///
    /// Same as [`Graph::observe`].
    pub fn observe_batched(
        &self,
        node: NodeId,
        key: &str,
        callback: impl Fn(&Graph, &Value) + 'static,
    ) -> Result<TrapHandle, GraphError> {
        self.observe_inner(node, key, Rc::new(callback), true, None)
    }

    /// Observe with a removal hook, invoked exactly once when the trap is
    /// removed — explicitly or because the node unlinked.
    ///
    /// # Errors
    ///
    /// Same as [`Graph::observe`].
    pub fn observe_with_cleanup(
        &self,
        node: NodeId,
        key: &str,
        callback: impl Fn(&Graph, &Value) + 'static,
        cleanup: impl FnOnce() + 'static,
    ) -> Result<TrapHandle, GraphError> {
        self.observe_inner(node, key, Rc::new(callback), false, Some(Box::new(cleanup)))
    }

    fn observe_inner(
        &self,
        node: NodeId,
        key: &str,
        callback: PropCallback,
        batched: bool,
        on_remove: Option<Box<dyn FnOnce()>>,
    ) -> Result<TrapHandle, GraphError> {
        let mut g = self.inner.borrow_mut();
        let current = {
            let rec = g.nodes.get(&node).ok_or(GraphError::ObjectUnlinked)?;
            match rec.props.get(key) {
                Some(slot) if slot.fixed => return Err(GraphError::NotObservable),
                Some(slot) => Some(slot.value.clone()),
                None => None,
            }
        };
        let inert = current.is_none();
        let tid = TrapId(g.next_trap);
        g.next_trap += 1;
        if let Some(rec) = g.nodes.get_mut(&node) {
            rec.traps_by_key
                .entry(Rc::from(key))
                .or_default()
                .push(tid);
        }
        let forward_from = match current {
            Some(Value::Node(referenced)) if g.nodes.contains_key(&referenced) => {
                let lid = g.alloc_listener();
                if let Some(rec) = g.nodes.get_mut(&referenced) {
                    rec.listeners.push(ListenerRecord {
                        id: lid,
                        kind: ListenerKind::Forward(tid),
                    });
                }
                Some((referenced, lid))
            }
            _ => None,
        };
        g.traps.insert(
            tid,
            TrapRecord {
                target: node,
                key: Rc::from(key),
                callback,
                on_remove,
                batched,
                inert,
                forward_from,
            },
        );
        Ok(TrapHandle { id: tid })
    }

    /// Remove a property trap. Idempotent; runs the removal hook if one was
    /// registered.
    pub fn unsubscribe(&self, handle: TrapHandle) {
        let hook = {
            let mut g = self.inner.borrow_mut();
            let Some(mut trap) = g.traps.remove(&handle.id) else {
                return;
            };
            if let Some((src, lid)) = trap.forward_from.take() {
                if let Some(rec) = g.nodes.get_mut(&src) {
                    rec.listeners.retain(|l| l.id != lid);
                }
            }
            let key = Rc::clone(&trap.key);
            if let Some(rec) = g.nodes.get_mut(&trap.target) {
                if let Some(ids) = rec.traps_by_key.get_mut(&key) {
                    ids.retain(|t| *t != handle.id);
                }
            }
            g.drop_pending(handle.id);
            trap.on_remove.take()
        };
        if let Some(hook) = hook {
            hook();
        }
    }

    // ── Event listeners ──────────────────────────────────────────────

    /// Listen to every event emitted on `node`, in registration order.
    ///
    /// # Errors
    ///
    /// [`GraphError::ObjectUnlinked`] if the node is dead.
    pub fn observe_event(
        &self,
        node: NodeId,
        callback: impl Fn(&Graph, &Event) + 'static,
    ) -> Result<EventHandle, GraphError> {
        let mut g = self.inner.borrow_mut();
        if !g.nodes.contains_key(&node) {
            return Err(GraphError::ObjectUnlinked);
        }
        let lid = g.alloc_listener();
        if let Some(rec) = g.nodes.get_mut(&node) {
            rec.listeners.push(ListenerRecord {
                id: lid,
                kind: ListenerKind::User(Rc::new(callback)),
            });
        }
        Ok(EventHandle { node, id: lid })
    }

    /// Remove an event listener. Idempotent.
    pub fn unsubscribe_event(&self, handle: EventHandle) {
        let mut g = self.inner.borrow_mut();
        if let Some(rec) = g.nodes.get_mut(&handle.node) {
            rec.listeners.retain(|l| l.id != handle.id);
        }
    }

    /// Register a one-time notification for when `node` unlinks. The
    /// callback runs after the node (and its subtree) is fully torn down.
    ///
    /// # Errors
    ///
    /// [`GraphError::ObjectUnlinked`] if the node is already dead.
    pub fn observe_unlink(
        &self,
        node: NodeId,
        callback: impl Fn(&Graph, NodeId) + 'static,
    ) -> Result<UnlinkHandle, GraphError> {
        let mut g = self.inner.borrow_mut();
        if !g.nodes.contains_key(&node) {
            return Err(GraphError::ObjectUnlinked);
        }
        let id = g.next_watcher;
        g.next_watcher += 1;
        if let Some(rec) = g.nodes.get_mut(&node) {
            rec.unlink_watchers.push(UnlinkWatcher {
                id,
                callback: Rc::new(callback),
            });
        }
        Ok(UnlinkHandle { node, id })
    }

    /// Remove an unlink notification. Idempotent.
    pub fn unsubscribe_unlink(&self, handle: UnlinkHandle) {
        let mut g = self.inner.borrow_mut();
        if let Some(rec) = g.nodes.get_mut(&handle.node) {
            rec.unlink_watchers.retain(|w| w.id != handle.id);
        }
    }

    // ── Emission ─────────────────────────────────────────────────────

    /// Emit an event on `node`, delivering to listeners in registration
    /// order. `Change` events additionally fan out through forwarding
    /// listeners to the property traps whose value references `node`.
    ///
    /// # Errors
    ///
    /// [`GraphError::ObjectUnlinked`] if the node is dead.
    pub fn emit(&self, node: NodeId, event: Event) -> Result<(), GraphError> {
        let mut fired: Vec<Dispatch> = Vec::new();
        {
            let mut g = self.inner.borrow_mut();
            let listeners: Vec<ListenerRecord> = g
                .nodes
                .get(&node)
                .ok_or(GraphError::ObjectUnlinked)?
                .listeners
                .clone();
            for listener in listeners {
                match listener.kind {
                    ListenerKind::User(cb) => fired.push(Dispatch::Listener(cb, event.clone())),
                    ListenerKind::Forward(tid) => {
                        if !event.is_change() {
                            continue;
                        }
                        let (target, key, batched, callback, inert) = match g.traps.get(&tid) {
                            Some(t) => (
                                t.target,
                                Rc::clone(&t.key),
                                t.batched,
                                Rc::clone(&t.callback),
                                t.inert,
                            ),
                            None => continue,
                        };
                        if inert {
                            continue;
                        }
                        let value = g
                            .nodes
                            .get(&target)
                            .and_then(|r| r.props.get(&*key))
                            .map(|s| s.value.clone())
                            .unwrap_or(Value::Undefined);
                        if batched {
                            g.enqueue_batched(tid, value);
                        } else {
                            fired.push(Dispatch::Trap(callback, value));
                        }
                    }
                }
            }
        }
        self.run_dispatch(fired);
        Ok(())
    }

    /// Emit a `Change` event on `node`.
    ///
    /// # Errors
    ///
    /// [`GraphError::ObjectUnlinked`] if the node is dead.
    pub fn emit_change(&self, node: NodeId) -> Result<(), GraphError> {
        self.emit(node, Event::change())
    }

    // ── Batched delivery ─────────────────────────────────────────────

    /// Drain the batched trap queue: each queued trap fires once with its
    /// latest value, in first-touch order. Values queued by the callbacks
    /// themselves wait for the next flush.
    pub fn flush_batched(&self) {
        let batch: Vec<PendingNotice> = {
            let mut g = self.inner.borrow_mut();
            g.pending_index.clear();
            std::mem::take(&mut g.pending)
        };
        for notice in batch {
            let cb = {
                let g = self.inner.borrow();
                g.traps.get(&notice.trap).map(|t| Rc::clone(&t.callback))
            };
            if let Some(cb) = cb {
                cb(self, &notice.value);
            }
        }
    }

    /// Number of batched notifications awaiting the next flush.
    #[must_use]
    pub fn pending_batched(&self) -> usize {
        self.inner.borrow().pending.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
