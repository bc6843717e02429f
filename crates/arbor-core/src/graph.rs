#![forbid(unsafe_code)]

//! The object graph: an arena of managed nodes with single-owner attachment.
//!
//! # Design
//!
//! Nodes live in an arena keyed by [`NodeId`]; ids are monotonic and never
//! reused. Ownership is strictly tree-shaped: a node is *referenced* by any
//! number of values and association entries but *owned* by at most one
//! other node. Unlinking a node cascades to its attached children, removes
//! every trap and listener referencing it, and only then runs teardown
//! callbacks — so callbacks always observe a structurally consistent graph.
//!
//! All other cross-object relationships are non-owning: the association
//! side table is keyed by node identity, filtered against the arena on
//! every read, and cleared on unlink. It can never keep a node alive,
//! which is what keeps reference cycles from becoming leaks.
//!
//! # Invariants
//!
//! 1. A node has at most one owner; `attach` to a new owner detaches from
//!    the previous one first.
//! 2. A dead id never aliases a live node (ids are never reused).
//! 3. `unlink` is idempotent and infallible; every other mutating operation
//!    on a dead node fails fast with [`GraphError::ObjectUnlinked`].
//! 4. Callbacks run only after the triggering mutation has fully completed.
//!
//! # Failure Modes
//!
//! - Attaching a node under its own descendant: [`GraphError::WouldCycle`].
//! - Reassigning or redefining a fixed slot: [`GraphError::NotObservable`].

use std::cell::RefCell;
use std::rc::Rc;

use ahash::AHashMap;

use crate::error::GraphError;
use crate::event::Event;
use crate::value::{NodeId, Value};

// ---------------------------------------------------------------------------
// Identifiers and handles
// ---------------------------------------------------------------------------

/// Identity of a property trap subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrapId(pub(crate) u64);

/// Identity of an event listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// Handle to a property trap, returned by [`Graph::observe`].
///
/// Unsubscribing is explicit (via [`Graph::unsubscribe`]) and also happens
/// automatically when the trapped node unlinks; both paths are idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrapHandle {
    pub(crate) id: TrapId,
}

/// Handle to an event listener, returned by [`Graph::observe_event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle {
    pub(crate) node: NodeId,
    pub(crate) id: ListenerId,
}

/// Handle to a one-time unlink notification, returned by
/// [`Graph::observe_unlink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UnlinkHandle {
    pub(crate) node: NodeId,
    pub(crate) id: u64,
}

// ---------------------------------------------------------------------------
// Internal records
// ---------------------------------------------------------------------------

pub(crate) type PropCallback = Rc<dyn Fn(&Graph, &Value)>;
pub(crate) type EventCallback = Rc<dyn Fn(&Graph, &Event)>;
pub(crate) type UnlinkCallback = Rc<dyn Fn(&Graph, NodeId)>;

pub(crate) struct PropSlot {
    pub(crate) value: Value,
    /// Fixed slots are constants: not interceptable, not reassignable.
    pub(crate) fixed: bool,
}

#[derive(Clone)]
pub(crate) enum ListenerKind {
    /// Application listener registered via `observe_event`.
    User(EventCallback),
    /// Internal listener forwarding `Change` events to a property trap.
    Forward(TrapId),
}

#[derive(Clone)]
pub(crate) struct ListenerRecord {
    pub(crate) id: ListenerId,
    pub(crate) kind: ListenerKind,
}

pub(crate) struct UnlinkWatcher {
    pub(crate) id: u64,
    pub(crate) callback: UnlinkCallback,
}

pub(crate) struct NodeRecord {
    pub(crate) owner: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) label: Option<Rc<str>>,
    pub(crate) props: AHashMap<Rc<str>, PropSlot>,
    pub(crate) listeners: Vec<ListenerRecord>,
    pub(crate) traps_by_key: AHashMap<Rc<str>, Vec<TrapId>>,
    pub(crate) unlink_watchers: Vec<UnlinkWatcher>,
}

impl NodeRecord {
    fn new(label: Option<Rc<str>>) -> Self {
        Self {
            owner: None,
            children: Vec::new(),
            label,
            props: AHashMap::new(),
            listeners: Vec::new(),
            traps_by_key: AHashMap::new(),
            unlink_watchers: Vec::new(),
        }
    }
}

pub(crate) struct TrapRecord {
    pub(crate) target: NodeId,
    pub(crate) key: Rc<str>,
    pub(crate) callback: PropCallback,
    pub(crate) on_remove: Option<Box<dyn FnOnce()>>,
    pub(crate) batched: bool,
    /// Inert traps were registered against an absent key; they are accepted
    /// but never fire (the key reads as always-undefined).
    pub(crate) inert: bool,
    /// (node, listener) of the forwarding listener currently installed on
    /// the node this trap's value references, if any.
    pub(crate) forward_from: Option<(NodeId, ListenerId)>,
}

pub(crate) struct PendingNotice {
    pub(crate) trap: TrapId,
    pub(crate) value: Value,
}

/// A callback collected under the arena borrow, invoked after it ends.
pub(crate) enum Dispatch {
    Listener(EventCallback, Event),
    Trap(PropCallback, Value),
    RemovalHook(Box<dyn FnOnce()>),
    UnlinkNotice(UnlinkCallback, NodeId),
}

pub(crate) struct GraphInner {
    pub(crate) nodes: AHashMap<NodeId, NodeRecord>,
    pub(crate) traps: AHashMap<TrapId, TrapRecord>,
    pub(crate) assoc: AHashMap<NodeId, AHashMap<Rc<str>, Vec<NodeId>>>,
    /// Batched trap firings awaiting the next flush, in first-touch order.
    pub(crate) pending: Vec<PendingNotice>,
    pub(crate) pending_index: AHashMap<TrapId, usize>,
    next_node: u64,
    pub(crate) next_trap: u64,
    pub(crate) next_listener: u64,
    pub(crate) next_watcher: u64,
}

impl GraphInner {
    fn new() -> Self {
        Self {
            nodes: AHashMap::new(),
            traps: AHashMap::new(),
            assoc: AHashMap::new(),
            pending: Vec::new(),
            pending_index: AHashMap::new(),
            next_node: 1,
            next_trap: 1,
            next_listener: 1,
            next_watcher: 1,
        }
    }

    pub(crate) fn alloc_listener(&mut self) -> ListenerId {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        id
    }

    /// Queue a batched trap firing, coalescing to the latest value while
    /// preserving first-touch order.
    pub(crate) fn enqueue_batched(&mut self, trap: TrapId, value: Value) {
        if let Some(&pos) = self.pending_index.get(&trap) {
            self.pending[pos].value = value;
        } else {
            self.pending_index.insert(trap, self.pending.len());
            self.pending.push(PendingNotice { trap, value });
        }
    }

    pub(crate) fn drop_pending(&mut self, trap: TrapId) {
        self.pending_index.remove(&trap);
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// Handle to a shared object graph.
///
/// Cheaply cloneable; all clones address the same arena. The graph assumes
/// a single logical thread: mutations are synchronous and callbacks are
/// invoked only after the mutation completes, so callbacks may re-enter the
/// graph freely.
#[derive(Clone)]
pub struct Graph {
    pub(crate) inner: Rc<RefCell<GraphInner>>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let g = self.inner.borrow();
        f.debug_struct("Graph")
            .field("nodes", &g.nodes.len())
            .field("traps", &g.traps.len())
            .field("pending", &g.pending.len())
            .finish()
    }
}

impl Graph {
    /// Create an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(GraphInner::new())),
        }
    }

    /// Run collected callbacks after the arena borrow has been released.
    pub(crate) fn run_dispatch(&self, actions: Vec<Dispatch>) {
        for action in actions {
            match action {
                Dispatch::Listener(cb, event) => cb(self, &event),
                Dispatch::Trap(cb, value) => cb(self, &value),
                Dispatch::RemovalHook(hook) => hook(),
                Dispatch::UnlinkNotice(cb, node) => cb(self, node),
            }
        }
    }

    // ── Node lifecycle ───────────────────────────────────────────────

    /// Create a new unowned node.
    #[must_use]
    pub fn create(&self) -> NodeId {
        self.create_inner(None)
    }

    /// Create a new unowned node carrying an origin label.
    ///
    /// Labels mark resolution anchors for bindings (e.g. the nearest
    /// `"form"` context); they are not unique.
    #[must_use]
    pub fn create_labeled(&self, label: &str) -> NodeId {
        self.create_inner(Some(Rc::from(label)))
    }

    fn create_inner(&self, label: Option<Rc<str>>) -> NodeId {
        let mut g = self.inner.borrow_mut();
        let id = NodeId(g.next_node);
        g.next_node += 1;
        g.nodes.insert(id, NodeRecord::new(label));
        id
    }

    /// Attach `child` under `owner`.
    ///
    /// If `child` already has an owner it is silently detached first; if it
    /// is already attached to `owner` the call is a no-op. Every owner
    /// change emits a structural [`Event::moved`] on the child.
    ///
    /// # Errors
    ///
    /// [`GraphError::ObjectUnlinked`] if either id is dead;
    /// [`GraphError::WouldCycle`] if `owner` is `child` or a (transitive)
    /// descendant of `child`.
    pub fn attach(&self, owner: NodeId, child: NodeId) -> Result<(), GraphError> {
        {
            let mut g = self.inner.borrow_mut();
            if !g.nodes.contains_key(&owner) || !g.nodes.contains_key(&child) {
                return Err(GraphError::ObjectUnlinked);
            }
            if owner == child {
                return Err(GraphError::WouldCycle);
            }
            let mut cursor = g.nodes.get(&owner).and_then(|r| r.owner);
            while let Some(ancestor) = cursor {
                if ancestor == child {
                    return Err(GraphError::WouldCycle);
                }
                cursor = g.nodes.get(&ancestor).and_then(|r| r.owner);
            }
            let prev = g.nodes.get(&child).and_then(|r| r.owner);
            if prev == Some(owner) {
                return Ok(());
            }
            if let Some(prev_owner) = prev {
                if let Some(rec) = g.nodes.get_mut(&prev_owner) {
                    rec.children.retain(|c| *c != child);
                }
            }
            if let Some(rec) = g.nodes.get_mut(&child) {
                rec.owner = Some(owner);
            }
            if let Some(rec) = g.nodes.get_mut(&owner) {
                rec.children.push(child);
            }
        }
        self.emit(child, Event::moved())
    }

    /// Unlink `node`: cascade to attached children (insertion order,
    /// depth-first), remove every trap and listener referencing the torn
    /// down nodes, then run their teardown callbacks.
    ///
    /// Idempotent and infallible; unlinking a dead id is a no-op.
    pub fn unlink(&self, node: NodeId) {
        let mut fired: Vec<Dispatch> = Vec::new();
        let removed = {
            let mut g = self.inner.borrow_mut();
            if !g.nodes.contains_key(&node) {
                return;
            }
            if let Some(owner) = g.nodes.get(&node).and_then(|r| r.owner) {
                if let Some(rec) = g.nodes.get_mut(&owner) {
                    rec.children.retain(|c| *c != node);
                }
            }
            let before = g.nodes.len();
            unlink_subtree(&mut g, node, &mut fired);
            before - g.nodes.len()
        };
        tracing::debug!(node = node.raw(), removed, "node unlinked");
        self.run_dispatch(fired);
    }

    /// Whether `node` has been unlinked (or never existed in this graph).
    #[must_use]
    pub fn is_unlinked(&self, node: NodeId) -> bool {
        !self.inner.borrow().nodes.contains_key(&node)
    }

    /// The node's current owner, if it is alive and attached.
    #[must_use]
    pub fn whence(&self, node: NodeId) -> Option<NodeId> {
        self.inner.borrow().nodes.get(&node).and_then(|r| r.owner)
    }

    /// The node's attached children in insertion order (empty if dead).
    #[must_use]
    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.inner
            .borrow()
            .nodes
            .get(&node)
            .map(|r| r.children.clone())
            .unwrap_or_default()
    }

    /// The node's origin label, if any.
    #[must_use]
    pub fn label(&self, node: NodeId) -> Option<Rc<str>> {
        self.inner.borrow().nodes.get(&node).and_then(|r| r.label.clone())
    }

    /// Set or replace the node's origin label.
    ///
    /// # Errors
    ///
    /// [`GraphError::ObjectUnlinked`] if the node is dead.
    pub fn set_label(&self, node: NodeId, label: &str) -> Result<(), GraphError> {
        let mut g = self.inner.borrow_mut();
        let rec = g.nodes.get_mut(&node).ok_or(GraphError::ObjectUnlinked)?;
        rec.label = Some(Rc::from(label));
        Ok(())
    }

    /// Number of live nodes (for diagnostics and tests).
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.inner.borrow().nodes.len()
    }

    // ── Properties ───────────────────────────────────────────────────

    /// Assign a property, firing traps if the value actually changed
    /// (identity comparison). Setting an absent key declares it.
    ///
    /// # Errors
    ///
    /// [`GraphError::ObjectUnlinked`] if the node is dead;
    /// [`GraphError::NotObservable`] if the slot is fixed.
    pub fn set(&self, node: NodeId, key: &str, value: Value) -> Result<(), GraphError> {
        let mut fired: Vec<Dispatch> = Vec::new();
        {
            let mut g = self.inner.borrow_mut();
            let rec = g.nodes.get_mut(&node).ok_or(GraphError::ObjectUnlinked)?;
            match rec.props.get_mut(key) {
                Some(slot) if slot.fixed => return Err(GraphError::NotObservable),
                Some(slot) => {
                    if slot.value == value {
                        return Ok(());
                    }
                    slot.value = value.clone();
                }
                None => {
                    rec.props.insert(
                        Rc::from(key),
                        PropSlot {
                            value,
                            fixed: false,
                        },
                    );
                    // Traps registered while the key was absent stay inert.
                    return Ok(());
                }
            }
            let trap_ids: Vec<TrapId> = rec
                .traps_by_key
                .get(key)
                .cloned()
                .unwrap_or_default();
            for tid in trap_ids {
                let (batched, callback, old_forward) = match g.traps.get_mut(&tid) {
                    Some(t) if !t.inert => {
                        (t.batched, Rc::clone(&t.callback), t.forward_from.take())
                    }
                    _ => continue,
                };
                if let Some((src, lid)) = old_forward {
                    if let Some(src_rec) = g.nodes.get_mut(&src) {
                        src_rec.listeners.retain(|l| l.id != lid);
                    }
                }
                let new_forward = match &value {
                    Value::Node(referenced) if g.nodes.contains_key(referenced) => {
                        let referenced = *referenced;
                        let lid = g.alloc_listener();
                        if let Some(ref_rec) = g.nodes.get_mut(&referenced) {
                            ref_rec.listeners.push(ListenerRecord {
                                id: lid,
                                kind: ListenerKind::Forward(tid),
                            });
                        }
                        Some((referenced, lid))
                    }
                    _ => None,
                };
                if let Some(t) = g.traps.get_mut(&tid) {
                    t.forward_from = new_forward;
                }
                if batched {
                    g.enqueue_batched(tid, value.clone());
                } else {
                    fired.push(Dispatch::Trap(callback, value.clone()));
                }
            }
        }
        self.run_dispatch(fired);
        Ok(())
    }

    /// Define a fixed (constant) slot. Fixed slots cannot be intercepted,
    /// reassigned, or redefined.
    ///
    /// # Errors
    ///
    /// [`GraphError::ObjectUnlinked`] if the node is dead;
    /// [`GraphError::NotObservable`] if the key already exists.
    pub fn set_fixed(&self, node: NodeId, key: &str, value: Value) -> Result<(), GraphError> {
        let mut g = self.inner.borrow_mut();
        let rec = g.nodes.get_mut(&node).ok_or(GraphError::ObjectUnlinked)?;
        if rec.props.contains_key(key) {
            return Err(GraphError::NotObservable);
        }
        rec.props.insert(Rc::from(key), PropSlot { value, fixed: true });
        Ok(())
    }

    /// Ensure `key` exists as an observable slot, initially `Undefined`.
    ///
    /// Traps only arm against keys that exist when they are registered, so
    /// nodes declare their observable surface up front.
    ///
    /// # Errors
    ///
    /// [`GraphError::ObjectUnlinked`] if the node is dead;
    /// [`GraphError::NotObservable`] if the key names a fixed slot.
    pub fn declare(&self, node: NodeId, key: &str) -> Result<(), GraphError> {
        let mut g = self.inner.borrow_mut();
        let rec = g.nodes.get_mut(&node).ok_or(GraphError::ObjectUnlinked)?;
        match rec.props.get(key) {
            Some(slot) if slot.fixed => Err(GraphError::NotObservable),
            Some(_) => Ok(()),
            None => {
                rec.props.insert(
                    Rc::from(key),
                    PropSlot {
                        value: Value::Undefined,
                        fixed: false,
                    },
                );
                Ok(())
            }
        }
    }

    /// Read a property; absent keys read as `Undefined`.
    ///
    /// # Errors
    ///
    /// [`GraphError::ObjectUnlinked`] if the node is dead.
    pub fn get(&self, node: NodeId, key: &str) -> Result<Value, GraphError> {
        let g = self.inner.borrow();
        let rec = g.nodes.get(&node).ok_or(GraphError::ObjectUnlinked)?;
        Ok(rec
            .props
            .get(key)
            .map(|s| s.value.clone())
            .unwrap_or(Value::Undefined))
    }

    /// Whether the node is alive and has declared `key`.
    #[must_use]
    pub fn has(&self, node: NodeId, key: &str) -> bool {
        self.inner
            .borrow()
            .nodes
            .get(&node)
            .is_some_and(|r| r.props.contains_key(key))
    }

    /// Whether the node is alive and `key` names an interceptable slot.
    #[must_use]
    pub fn is_observable(&self, node: NodeId, key: &str) -> bool {
        self.inner
            .borrow()
            .nodes
            .get(&node)
            .and_then(|r| r.props.get(key))
            .is_some_and(|s| !s.fixed)
    }

    // ── Non-owning associations ──────────────────────────────────────

    /// Record a non-owning association: `referrer` relates to `target`
    /// under `tag` (e.g. "which activities observe this service").
    ///
    /// The table never keeps either node alive; entries vanish with the
    /// target and dead referrers are pruned on read.
    ///
    /// # Errors
    ///
    /// [`GraphError::ObjectUnlinked`] if either node is dead.
    pub fn add_reference(
        &self,
        target: NodeId,
        tag: &str,
        referrer: NodeId,
    ) -> Result<(), GraphError> {
        let mut g = self.inner.borrow_mut();
        if !g.nodes.contains_key(&target) || !g.nodes.contains_key(&referrer) {
            return Err(GraphError::ObjectUnlinked);
        }
        let list = g
            .assoc
            .entry(target)
            .or_default()
            .entry(Rc::from(tag))
            .or_default();
        if !list.contains(&referrer) {
            list.push(referrer);
        }
        Ok(())
    }

    /// Live referrers associated with `target` under `tag`, pruning any
    /// that have since unlinked. Empty if the target is dead.
    #[must_use]
    pub fn references(&self, target: NodeId, tag: &str) -> Vec<NodeId> {
        let mut g = self.inner.borrow_mut();
        let GraphInner { nodes, assoc, .. } = &mut *g;
        if let Some(tags) = assoc.get_mut(&target) {
            if let Some(list) = tags.get_mut(tag) {
                list.retain(|r| nodes.contains_key(r));
                return list.clone();
            }
        }
        Vec::new()
    }

    /// Drop one association entry. Always safe to call redundantly.
    pub fn remove_reference(&self, target: NodeId, tag: &str, referrer: NodeId) {
        let mut g = self.inner.borrow_mut();
        if let Some(tags) = g.assoc.get_mut(&target) {
            if let Some(list) = tags.get_mut(tag) {
                list.retain(|r| *r != referrer);
            }
        }
    }
}

/// Tear down `node` and its subtree, collecting teardown callbacks in the
/// order they must run: each child's full teardown before the parent's own
/// trap removal hooks and unlink notices.
fn unlink_subtree(g: &mut GraphInner, node: NodeId, fired: &mut Vec<Dispatch>) {
    let Some(mut rec) = g.nodes.remove(&node) else {
        return;
    };
    for child in std::mem::take(&mut rec.children) {
        unlink_subtree(g, child, fired);
    }
    // Traps targeting this node.
    for (_, ids) in rec.traps_by_key.drain() {
        for tid in ids {
            if let Some(mut trap) = g.traps.remove(&tid) {
                if let Some((src, lid)) = trap.forward_from.take() {
                    if let Some(src_rec) = g.nodes.get_mut(&src) {
                        src_rec.listeners.retain(|l| l.id != lid);
                    }
                }
                g.drop_pending(tid);
                if let Some(hook) = trap.on_remove.take() {
                    fired.push(Dispatch::RemovalHook(hook));
                }
            }
        }
    }
    // Forwarding listeners that other nodes' traps installed here.
    for listener in rec.listeners.drain(..) {
        if let ListenerKind::Forward(tid) = listener.kind {
            if let Some(trap) = g.traps.get_mut(&tid) {
                trap.forward_from = None;
            }
        }
    }
    g.assoc.remove(&node);
    for watcher in rec.unlink_watchers.drain(..) {
        fired.push(Dispatch::UnlinkNotice(watcher.callback, node));
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
    fn create_and_inspect() {
        let graph = Graph::new();
        let n = graph.create();
        assert!(!graph.is_unlinked(n));
        assert_eq!(graph.whence(n), None);
        assert!(graph.children(n).is_empty());
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn attach_sets_owner_and_children() {
        let graph = Graph::new();
        let a = graph.create();
        let n = graph.create();
        graph.attach(a, n).unwrap();
        assert_eq!(graph.whence(n), Some(a));
        assert_eq!(graph.children(a), vec![n]);
    }

    #[test]
    fn reattach_moves_ownership() {
        let graph = Graph::new();
        let a = graph.create();
        let b = graph.create();
        let n = graph.create();
        graph.attach(a, n).unwrap();
        graph.attach(b, n).unwrap();
        assert_eq!(graph.whence(n), Some(b));
        assert!(graph.children(a).is_empty());
        assert_eq!(graph.children(b), vec![n]);
    }

    #[test]
    fn attach_same_owner_is_noop() {
        let graph = Graph::new();
        let a = graph.create();
        let n = graph.create();
        graph.attach(a, n).unwrap();
        graph.attach(a, n).unwrap();
        assert_eq!(graph.children(a), vec![n]);
    }

    #[test]
    fn attach_rejects_cycles() {
        let graph = Graph::new();
        let a = graph.create();
        let b = graph.create();
        let c = graph.create();
        graph.attach(a, b).unwrap();
        graph.attach(b, c).unwrap();
        assert_eq!(graph.attach(c, a), Err(GraphError::WouldCycle));
        assert_eq!(graph.attach(a, a), Err(GraphError::WouldCycle));
    }

    #[test]
    fn attach_dead_node_fails_fast() {
        let graph = Graph::new();
        let a = graph.create();
        let n = graph.create();
        graph.unlink(n);
        assert_eq!(graph.attach(a, n), Err(GraphError::ObjectUnlinked));
        assert_eq!(graph.attach(n, a), Err(GraphError::ObjectUnlinked));
    }

    #[test]
    fn unlink_cascades_to_children() {
        let graph = Graph::new();
        let root = graph.create();
        let mid = graph.create();
        let leaf = graph.create();
        graph.attach(root, mid).unwrap();
        graph.attach(mid, leaf).unwrap();

        graph.unlink(root);
        assert!(graph.is_unlinked(root));
        assert!(graph.is_unlinked(mid));
        assert!(graph.is_unlinked(leaf));
        assert_eq!(graph.node_count(), 0);
    }

    #[test]
    fn unlink_detaches_from_owner() {
        let graph = Graph::new();
        let root = graph.create();
        let child = graph.create();
        graph.attach(root, child).unwrap();

        graph.unlink(child);
        assert!(graph.children(root).is_empty());
        assert!(!graph.is_unlinked(root));
    }

    #[test]
    fn unlink_is_idempotent() {
        let graph = Graph::new();
        let n = graph.create();
        graph.unlink(n);
        graph.unlink(n);
        assert!(graph.is_unlinked(n));
    }

    #[test]
    fn unlink_notices_fire_children_first() {
        let graph = Graph::new();
        let root = graph.create();
        let child = graph.create();
        graph.attach(root, child).unwrap();

        let order = Rc::new(RefCell::new(Vec::new()));
        let o1 = Rc::clone(&order);
        graph
            .observe_unlink(root, move |_, _| o1.borrow_mut().push("root"))
            .unwrap();
        let o2 = Rc::clone(&order);
        graph
            .observe_unlink(child, move |_, _| o2.borrow_mut().push("child"))
            .unwrap();

        graph.unlink(root);
        assert_eq!(*order.borrow(), vec!["child", "root"]);
    }

    #[test]
    fn set_get_roundtrip() {
        let graph = Graph::new();
        let n = graph.create();
        graph.set(n, "title", Value::from("hello")).unwrap();
        assert_eq!(graph.get(n, "title").unwrap(), Value::from("hello"));
        assert_eq!(graph.get(n, "missing").unwrap(), Value::Undefined);
    }

    #[test]
    fn set_on_dead_node_fails() {
        let graph = Graph::new();
        let n = graph.create();
        graph.unlink(n);
        assert_eq!(
            graph.set(n, "x", Value::Int(1)),
            Err(GraphError::ObjectUnlinked)
        );
        assert_eq!(graph.get(n, "x"), Err(GraphError::ObjectUnlinked));
    }

    #[test]
    fn fixed_slots_reject_reassignment_and_redefinition() {
        let graph = Graph::new();
        let n = graph.create();
        graph.set_fixed(n, "kind", Value::from("service")).unwrap();
        assert_eq!(graph.get(n, "kind").unwrap(), Value::from("service"));
        assert_eq!(
            graph.set(n, "kind", Value::from("other")),
            Err(GraphError::NotObservable)
        );
        assert_eq!(
            graph.set_fixed(n, "kind", Value::from("other")),
            Err(GraphError::NotObservable)
        );
        assert!(!graph.is_observable(n, "kind"));
        assert!(graph.has(n, "kind"));
    }

    #[test]
    fn declare_creates_undefined_slot() {
        let graph = Graph::new();
        let n = graph.create();
        graph.declare(n, "name").unwrap();
        assert!(graph.has(n, "name"));
        assert!(graph.is_observable(n, "name"));
        assert_eq!(graph.get(n, "name").unwrap(), Value::Undefined);
        // Re-declaring is a no-op.
        graph.set(n, "name", Value::from("x")).unwrap();
        graph.declare(n, "name").unwrap();
        assert_eq!(graph.get(n, "name").unwrap(), Value::from("x"));
    }

    #[test]
    fn labels() {
        let graph = Graph::new();
        let form = graph.create_labeled("form");
        assert_eq!(graph.label(form).as_deref(), Some("form"));
        let n = graph.create();
        assert_eq!(graph.label(n), None);
        graph.set_label(n, "dialog").unwrap();
        assert_eq!(graph.label(n).as_deref(), Some("dialog"));
    }

    #[test]
    fn associations_prune_dead_referrers() {
        let graph = Graph::new();
        let service = graph.create();
        let a1 = graph.create();
        let a2 = graph.create();
        graph.add_reference(service, "observers", a1).unwrap();
        graph.add_reference(service, "observers", a2).unwrap();
        assert_eq!(graph.references(service, "observers"), vec![a1, a2]);

        graph.unlink(a1);
        assert_eq!(graph.references(service, "observers"), vec![a2]);
    }

    #[test]
    fn associations_cleared_on_target_unlink() {
        let graph = Graph::new();
        let service = graph.create();
        let watcher = graph.create();
        graph.add_reference(service, "observers", watcher).unwrap();
        graph.unlink(service);
        assert!(graph.references(service, "observers").is_empty());
    }

    #[test]
    fn association_add_is_deduplicated() {
        let graph = Graph::new();
        let t = graph.create();
        let r = graph.create();
        graph.add_reference(t, "tag", r).unwrap();
        graph.add_reference(t, "tag", r).unwrap();
        assert_eq!(graph.references(t, "tag"), vec![r]);
        graph.remove_reference(t, "tag", r);
        assert!(graph.references(t, "tag").is_empty());
        // Redundant removal is safe.
        graph.remove_reference(t, "tag", r);
    }

    #[test]
    fn attach_emits_moved_on_child() {
        let graph = Graph::new();
        let a = graph.create();
        let b = graph.create();
        let n = graph.create();
        let moves = Rc::new(Cell::new(0u32));
        let m = Rc::clone(&moves);
        graph
            .observe_event(n, move |_, ev| {
                if ev.kind == crate::event::EventKind::Moved {
                    m.set(m.get() + 1);
                }
            })
            .unwrap();

        graph.attach(a, n).unwrap();
        assert_eq!(moves.get(), 1);
        graph.attach(b, n).unwrap();
        assert_eq!(moves.get(), 2);
        // No-op re-attach emits nothing.
        graph.attach(b, n).unwrap();
        assert_eq!(moves.get(), 2);
    }
}
