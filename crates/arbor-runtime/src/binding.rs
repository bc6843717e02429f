#![forbid(unsafe_code)]

//! Path bindings: declarative, self-re-resolving expressions evaluated
//! relative to a node's ownership chain.
//!
//! # Design
//!
//! A [`BindingSpec`] is created once (often shared across instances of a
//! view type) and applied per node. Resolution walks *up* the ownership
//! chain from the bound node looking for the first ancestor that exposes
//! the path head as an observable property — or, for origin bindings, the
//! nearest ancestor carrying the origin label. Remaining segments resolve
//! by repeated property lookup through node values.
//!
//! A live binding keeps the whole chain trapped: one structural listener
//! per node on the walked ownership prefix (re-attachment or unlink
//! anywhere re-walks from scratch, discarding stale traps) plus one
//! property trap per resolved segment. A segment resolving to `Undefined`
//! writes the fallback to the target; an unresolvable path is not an error
//! — it silently retries on every ownership change.
//!
//! # Invariants
//!
//! 1. After any re-attachment along the walked chain, the binding observes
//!    only the new chain; no stale trap fires.
//! 2. The bound target always holds the latest resolved (or fallback)
//!    value, transformed if a format function is set.
//! 3. Applications are independent: one spec applied twice maintains two
//!    live trap chains.
//! 4. A binding releases itself when its bound node unlinks.

use std::cell::RefCell;
use std::rc::Rc;

use arbor_core::{
    EventHandle, EventKind, Graph, GraphError, NodeId, TrapHandle, UnlinkHandle, Value,
};

// ---------------------------------------------------------------------------
// BindingSpec
// ---------------------------------------------------------------------------

struct SpecInner {
    origin: Option<Rc<str>>,
    segments: Vec<Rc<str>>,
    fallback: Value,
    transform: Option<Rc<dyn Fn(&Value) -> Value>>,
}

/// A shared, declarative path binding specification.
///
/// Cloning shares the spec; each [`BindingSpec::apply_to`] call creates an
/// independent live application.
pub struct BindingSpec {
    inner: Rc<SpecInner>,
}

impl Clone for BindingSpec {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for BindingSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingSpec")
            .field("origin", &self.inner.origin)
            .field("path", &self.path())
            .finish()
    }
}

/// Create a binding for a dotted path, e.g. `bind("customer.name")`.
#[must_use]
pub fn bind(path: &str) -> BindingSpec {
    BindingSpec::new(None, path)
}

/// Create a binding anchored at the nearest ancestor carrying `origin` as
/// its label, e.g. `bind_from("form", "customer.name")`. An empty path
/// resolves to the labeled node itself.
#[must_use]
pub fn bind_from(origin: &str, path: &str) -> BindingSpec {
    BindingSpec::new(Some(Rc::from(origin)), path)
}

impl BindingSpec {
    fn new(origin: Option<Rc<str>>, path: &str) -> Self {
        let segments = path
            .split('.')
            .filter(|s| !s.is_empty())
            .map(Rc::from)
            .collect();
        Self {
            inner: Rc::new(SpecInner {
                origin,
                segments,
                fallback: Value::Undefined,
                transform: None,
            }),
        }
    }

    fn rebuild(&self, fallback: Value, transform: Option<Rc<dyn Fn(&Value) -> Value>>) -> Self {
        Self {
            inner: Rc::new(SpecInner {
                origin: self.inner.origin.clone(),
                segments: self.inner.segments.clone(),
                fallback,
                transform,
            }),
        }
    }

    /// Value written to the target when the path does not resolve.
    #[must_use]
    pub fn with_fallback(&self, fallback: Value) -> Self {
        self.rebuild(fallback, self.inner.transform.clone())
    }

    /// Transform applied to every resolved (or fallback) value before it
    /// is written to the target.
    #[must_use]
    pub fn format(&self, transform: impl Fn(&Value) -> Value + 'static) -> Self {
        self.rebuild(self.inner.fallback.clone(), Some(Rc::new(transform)))
    }

    /// The dotted path, for diagnostics.
    #[must_use]
    pub fn path(&self) -> String {
        self.inner
            .segments
            .iter()
            .map(|s| s.as_ref())
            .collect::<Vec<_>>()
            .join(".")
    }

    fn origin(&self) -> Option<&str> {
        self.inner.origin.as_deref()
    }

    fn segments(&self) -> &[Rc<str>] {
        &self.inner.segments
    }

    fn head(&self) -> &str {
        self.inner.segments.first().map(|s| s.as_ref()).unwrap_or("")
    }

    fn fallback(&self) -> &Value {
        &self.inner.fallback
    }

    fn transform(&self) -> Option<&Rc<dyn Fn(&Value) -> Value>> {
        self.inner.transform.as_ref()
    }

    /// Apply the binding: keep `property` on `target` continuously equal to
    /// the resolved path value (or the fallback).
    ///
    /// # Errors
    ///
    /// [`GraphError::ObjectUnlinked`] if `target` is dead.
    pub fn apply_to(
        &self,
        graph: &Graph,
        target: NodeId,
        property: &str,
    ) -> Result<BoundValue, GraphError> {
        if graph.is_unlinked(target) {
            return Err(GraphError::ObjectUnlinked);
        }
        let prop: Rc<str> = Rc::from(property);
        let emit: Emit = Rc::new(move |g: &Graph, value: Value| {
            let _ = g.set(target, &prop, value);
        });
        let watch = Watch::start(graph, self.clone(), target, emit)?;
        let target_unlink = install_auto_release(graph, target, &watch);
        Ok(BoundValue {
            graph: graph.clone(),
            watch,
            target_unlink,
        })
    }
}

fn install_auto_release(graph: &Graph, target: NodeId, watch: &Watch) -> Option<UnlinkHandle> {
    let weak = Rc::downgrade(&watch.inner);
    graph
        .observe_unlink(target, move |_, _| {
            if let Some(inner) = weak.upgrade() {
                Watch { inner }.release();
            }
        })
        .ok()
}

// ---------------------------------------------------------------------------
// Watch: the resolution engine
// ---------------------------------------------------------------------------

type Emit = Rc<dyn Fn(&Graph, Value)>;

struct WatchInner {
    graph: Graph,
    spec: BindingSpec,
    anchor: NodeId,
    /// Structural listeners (Moved) along the walked ownership prefix.
    walk_events: Vec<EventHandle>,
    /// Unlink watchers along the walked ownership prefix.
    walk_unlinks: Vec<UnlinkHandle>,
    /// Property traps along the resolved segment path.
    seg_traps: Vec<TrapHandle>,
    /// Unlink watchers on intermediate path-value nodes.
    seg_unlinks: Vec<UnlinkHandle>,
    emit: Emit,
    released: bool,
}

struct Watch {
    inner: Rc<RefCell<WatchInner>>,
}

impl Watch {
    fn start(graph: &Graph, spec: BindingSpec, anchor: NodeId, emit: Emit) -> Result<Self, GraphError> {
        if graph.is_unlinked(anchor) {
            return Err(GraphError::ObjectUnlinked);
        }
        let watch = Self {
            inner: Rc::new(RefCell::new(WatchInner {
                graph: graph.clone(),
                spec,
                anchor,
                walk_events: Vec::new(),
                walk_unlinks: Vec::new(),
                seg_traps: Vec::new(),
                seg_unlinks: Vec::new(),
                emit,
                released: false,
            })),
        };
        watch.rewalk();
        Ok(watch)
    }

    /// Re-resolve from scratch: discard every subscription, walk the
    /// ownership chain for a source, re-subscribe, and re-emit.
    fn rewalk(&self) {
        let (graph, spec, anchor) = {
            let w = self.inner.borrow();
            if w.released {
                return;
            }
            (w.graph.clone(), w.spec.clone(), w.anchor)
        };
        self.clear_walk();
        self.clear_segments();
        if graph.is_unlinked(anchor) {
            return;
        }

        let mut chain: Vec<NodeId> = Vec::new();
        let mut source: Option<NodeId> = None;
        let mut cursor = Some(anchor);
        while let Some(node) = cursor {
            if graph.is_unlinked(node) {
                break;
            }
            chain.push(node);
            let matched = match spec.origin() {
                Some(origin) => graph.label(node).as_deref() == Some(origin),
                None => graph.is_observable(node, spec.head()),
            };
            if matched {
                source = Some(node);
                break;
            }
            cursor = graph.whence(node);
        }

        let mut walk_events = Vec::new();
        let mut walk_unlinks = Vec::new();
        for &node in &chain {
            let weak = Rc::downgrade(&self.inner);
            if let Ok(handle) = graph.observe_event(node, move |_, event| {
                if event.kind == EventKind::Moved {
                    if let Some(inner) = weak.upgrade() {
                        Watch { inner }.rewalk();
                    }
                }
            }) {
                walk_events.push(handle);
            }
            let weak = Rc::downgrade(&self.inner);
            if let Ok(handle) = graph.observe_unlink(node, move |_, _| {
                if let Some(inner) = weak.upgrade() {
                    Watch { inner }.rewalk();
                }
            }) {
                walk_unlinks.push(handle);
            }
        }
        {
            let mut w = self.inner.borrow_mut();
            w.walk_events = walk_events;
            w.walk_unlinks = walk_unlinks;
        }
        self.rewire_segments(source);
    }

    /// Re-resolve the segment path from a fixed source, re-subscribing the
    /// per-segment traps, then write the result to the target.
    fn rewire_segments(&self, source: Option<NodeId>) {
        self.clear_segments();
        let (graph, spec) = {
            let w = self.inner.borrow();
            if w.released {
                return;
            }
            (w.graph.clone(), w.spec.clone())
        };

        let mut traps: Vec<TrapHandle> = Vec::new();
        let mut unlinks: Vec<UnlinkHandle> = Vec::new();
        let mut value = Value::Undefined;
        if let Some(source) = source {
            let segments = spec.segments();
            if segments.is_empty() {
                value = Value::Node(source);
            }
            let mut current = source;
            for (index, segment) in segments.iter().enumerate() {
                if graph.is_unlinked(current) {
                    value = Value::Undefined;
                    break;
                }
                let weak = Rc::downgrade(&self.inner);
                match graph.observe(current, segment, move |_, _| {
                    if let Some(inner) = weak.upgrade() {
                        Watch { inner }.rewire_segments(Some(source));
                    }
                }) {
                    Ok(handle) => traps.push(handle),
                    // Fixed slots are readable but not interceptable.
                    Err(_) => {}
                }
                if index > 0 {
                    // Intermediate path nodes are not on the ownership walk,
                    // so watch their teardown separately.
                    let weak = Rc::downgrade(&self.inner);
                    if let Ok(handle) = graph.observe_unlink(current, move |_, _| {
                        if let Some(inner) = weak.upgrade() {
                            Watch { inner }.rewire_segments(Some(source));
                        }
                    }) {
                        unlinks.push(handle);
                    }
                }
                let v = graph.get(current, segment).unwrap_or(Value::Undefined);
                if index + 1 == segments.len() {
                    value = v;
                } else {
                    match v.as_node() {
                        Some(next) if !graph.is_unlinked(next) => current = next,
                        _ => {
                            value = Value::Undefined;
                            break;
                        }
                    }
                }
            }
        }

        let out = if value.is_undefined() {
            spec.fallback().clone()
        } else {
            value
        };
        let out = match spec.transform() {
            Some(transform) => transform(&out),
            None => out,
        };

        let emit = {
            let mut w = self.inner.borrow_mut();
            if w.released {
                drop(w);
                for handle in traps {
                    graph.unsubscribe(handle);
                }
                for handle in unlinks {
                    graph.unsubscribe_unlink(handle);
                }
                return;
            }
            w.seg_traps = traps;
            w.seg_unlinks = unlinks;
            Rc::clone(&w.emit)
        };
        emit(&graph, out);
    }

    fn clear_walk(&self) {
        let (graph, events, unlinks) = {
            let mut w = self.inner.borrow_mut();
            (
                w.graph.clone(),
                std::mem::take(&mut w.walk_events),
                std::mem::take(&mut w.walk_unlinks),
            )
        };
        for handle in events {
            graph.unsubscribe_event(handle);
        }
        for handle in unlinks {
            graph.unsubscribe_unlink(handle);
        }
    }

    fn clear_segments(&self) {
        let (graph, traps, unlinks) = {
            let mut w = self.inner.borrow_mut();
            (
                w.graph.clone(),
                std::mem::take(&mut w.seg_traps),
                std::mem::take(&mut w.seg_unlinks),
            )
        };
        for handle in traps {
            graph.unsubscribe(handle);
        }
        for handle in unlinks {
            graph.unsubscribe_unlink(handle);
        }
    }

    fn release(&self) {
        {
            let mut w = self.inner.borrow_mut();
            if w.released {
                return;
            }
            w.released = true;
        }
        self.clear_walk();
        self.clear_segments();
    }
}

// ---------------------------------------------------------------------------
// BoundValue
// ---------------------------------------------------------------------------

/// A live binding application keeping one (target, property) pair up to
/// date. Releases automatically when the target unlinks or when this
/// handle is dropped.
pub struct BoundValue {
    graph: Graph,
    watch: Watch,
    target_unlink: Option<UnlinkHandle>,
}

impl BoundValue {
    /// Tear down all subscriptions. Idempotent; also happens automatically
    /// on target unlink.
    pub fn release(&self) {
        self.watch.release();
        if let Some(handle) = self.target_unlink {
            self.graph.unsubscribe_unlink(handle);
        }
    }
}

impl Drop for BoundValue {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for BoundValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let w = self.watch.inner.borrow();
        f.debug_struct("BoundValue")
            .field("path", &w.spec.path())
            .field("released", &w.released)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// CompositeBinding
// ---------------------------------------------------------------------------

/// Several bindings combined through one format function (e.g. string
/// interpolation). The format re-evaluates whenever any constituent
/// binding's resolved value changes.
pub struct CompositeBinding {
    specs: Vec<BindingSpec>,
    format: Rc<dyn Fn(&[Value]) -> Value>,
}

impl CompositeBinding {
    /// Combine `specs`; the default format concatenates the display form
    /// of every resolved value.
    #[must_use]
    pub fn new(specs: Vec<BindingSpec>) -> Self {
        Self {
            specs,
            format: Rc::new(|values| {
                let mut out = String::new();
                for value in values {
                    if !value.is_undefined() {
                        out.push_str(&value.to_string());
                    }
                }
                Value::from(out)
            }),
        }
    }

    /// Replace the format function.
    #[must_use]
    pub fn format(mut self, format: impl Fn(&[Value]) -> Value + 'static) -> Self {
        self.format = Rc::new(format);
        self
    }

    /// Apply the composite: keep `property` on `target` equal to the
    /// formatted combination of all constituent values.
    ///
    /// # Errors
    ///
    /// [`GraphError::ObjectUnlinked`] if `target` is dead.
    pub fn apply_to(
        &self,
        graph: &Graph,
        target: NodeId,
        property: &str,
    ) -> Result<CompositeBound, GraphError> {
        if graph.is_unlinked(target) {
            return Err(GraphError::ObjectUnlinked);
        }
        let values = Rc::new(RefCell::new(vec![Value::Undefined; self.specs.len()]));
        let prop: Rc<str> = Rc::from(property);
        let mut watches: Vec<Watch> = Vec::new();
        for (index, spec) in self.specs.iter().enumerate() {
            let values = Rc::clone(&values);
            let format = Rc::clone(&self.format);
            let prop = Rc::clone(&prop);
            let emit: Emit = Rc::new(move |g: &Graph, value: Value| {
                values.borrow_mut()[index] = value;
                let formatted = {
                    let current = values.borrow();
                    format(&current)
                };
                let _ = g.set(target, &prop, formatted);
            });
            match Watch::start(graph, spec.clone(), target, emit) {
                Ok(watch) => watches.push(watch),
                Err(err) => {
                    for watch in &watches {
                        watch.release();
                    }
                    return Err(err);
                }
            }
        }
        let target_unlinks: Vec<UnlinkHandle> = watches
            .iter()
            .filter_map(|watch| install_auto_release(graph, target, watch))
            .collect();
        Ok(CompositeBound {
            graph: graph.clone(),
            watches,
            target_unlinks,
        })
    }
}

impl std::fmt::Debug for CompositeBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeBinding")
            .field("specs", &self.specs.len())
            .finish()
    }
}

/// A live composite binding application.
pub struct CompositeBound {
    graph: Graph,
    watches: Vec<Watch>,
    target_unlinks: Vec<UnlinkHandle>,
}

impl CompositeBound {
    /// Tear down all subscriptions. Idempotent.
    pub fn release(&self) {
        for watch in &self.watches {
            watch.release();
        }
        for handle in &self.target_unlinks {
            self.graph.unsubscribe_unlink(*handle);
        }
    }
}

impl Drop for CompositeBound {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for CompositeBound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeBound")
            .field("watches", &self.watches.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
