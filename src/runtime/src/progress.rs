//! Weighted progress aggregation for nested lifecycle steps.
//!
//! A top-level operation calls [`ProgressTracker::begin`] with a fixed `max`
//! and receives the root [`ProgressScope`]. Each [`ProgressScope::action`]
//! reserves part of its scope's budget; nested actions subdivide that part.
//! A step's children are weighed against the step's own weight, so their
//! weights add up to at most that weight.
//!
//! ```text
//! root (max = 100)
//!  ├── "checks"   weight 10      → 10 units
//!  └── "boot"     weight 90      → 90 units
//!       ├── "vm"      weight 60  → 60 units
//!       └── "daemon"  weight 30  → 30 units
//! ```
//!
//! Every counter lives behind one mutex, so sibling actions may run
//! concurrently while updates stay serialized.

use chrono::Utc;
use nodevm_core::event::{BackendEvents, ProgressState};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;

/// Float slack when converting accumulated fractional units to `current`.
const EPSILON: f64 = 1e-6;

/// Aggregates nested weighted steps into one `(current, max)` signal.
#[derive(Clone)]
pub struct ProgressTracker {
    shared: Arc<Shared>,
}

struct Shared {
    inner: Mutex<Inner>,
    events: BackendEvents,
}

struct Inner {
    state: ProgressState,
    /// Completed units, fractional
    done: f64,
    /// Incremented by every `begin`; scopes from older trees become inert
    generation: u64,
    nodes: Vec<Node>,
}

struct Node {
    parent: Option<usize>,
    description: Option<String>,
    /// Units of `max` allotted to this node
    span: f64,
    /// Internal weight children are measured against
    budget: f64,
    /// Internal weight already reserved by children
    claimed: f64,
    /// Units already folded into `done` from inside this node
    credited: f64,
    open: bool,
}

impl ProgressTracker {
    pub fn new(events: BackendEvents) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: ProgressState::default(),
                    done: 0.0,
                    generation: 0,
                    nodes: Vec::new(),
                }),
                events,
            }),
        }
    }

    /// Start a new top-level tree with a fixed `max`.
    pub fn begin(&self, max: u64) -> ProgressScope {
        let mut inner = self.shared.inner.lock();
        inner.generation += 1;
        inner.done = 0.0;
        inner.nodes = vec![Node {
            parent: None,
            description: None,
            span: max as f64,
            budget: max as f64,
            claimed: 0.0,
            credited: 0.0,
            open: true,
        }];
        inner.state = ProgressState {
            current: 0,
            max,
            description: None,
            transition_time: Utc::now(),
        };
        self.shared.events.emit_progress(inner.state.clone());

        ProgressScope {
            shared: Arc::clone(&self.shared),
            generation: inner.generation,
            node: Some(0),
        }
    }

    /// Current progress snapshot.
    pub fn snapshot(&self) -> ProgressState {
        self.shared.inner.lock().state.clone()
    }
}

/// Handle to one level of the progress tree.
#[derive(Clone)]
pub struct ProgressScope {
    shared: Arc<Shared>,
    generation: u64,
    /// `None` for scopes detached from the active tree
    node: Option<usize>,
}

impl ProgressScope {
    /// Run `operation`, attributing `weight` units of this scope's budget to it.
    ///
    /// The operation receives a child scope for nested steps. When it
    /// finishes, successfully or not, whatever part of the step's weight its
    /// children did not report is folded into `current`. Errors are
    /// returned unchanged.
    pub async fn action<T, E, F, Fut>(
        &self,
        description: impl Into<String>,
        weight: u64,
        operation: F,
    ) -> Result<T, E>
    where
        F: FnOnce(ProgressScope) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let description = description.into();
        tracing::debug!(step = %description, weight, "Progress step started");

        let child = self.shared.open(self, description, weight);
        let _close = CloseOnDrop(child.clone());
        operation(child).await
    }
}

/// Folds the step's remaining weight on every exit path, including a
/// dropped future.
struct CloseOnDrop(ProgressScope);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.shared.close(&self.0);
    }
}

impl Shared {
    fn open(&self, parent: &ProgressScope, description: String, weight: u64) -> ProgressScope {
        let mut inner = self.inner.lock();

        let detached = ProgressScope {
            shared: Arc::clone(&parent.shared),
            generation: parent.generation,
            node: None,
        };
        let Some(parent_id) = parent.node else {
            return detached;
        };
        if parent.generation != inner.generation {
            return detached;
        }

        let (span, budget) = {
            let p = &mut inner.nodes[parent_id];
            let remaining = (p.budget - p.claimed).max(0.0);
            let granted = (weight as f64).min(remaining);
            p.claimed += granted;
            let span = if p.budget > 0.0 {
                granted / p.budget * p.span
            } else {
                0.0
            };
            (span, weight as f64)
        };

        inner.nodes.push(Node {
            parent: Some(parent_id),
            description: Some(description.clone()),
            span,
            budget,
            claimed: 0.0,
            credited: 0.0,
            open: true,
        });
        let id = inner.nodes.len() - 1;

        inner.state.description = Some(description);
        inner.state.transition_time = Utc::now();
        self.events.emit_progress(inner.state.clone());

        ProgressScope {
            shared: Arc::clone(&parent.shared),
            generation: parent.generation,
            node: Some(id),
        }
    }

    fn close(&self, scope: &ProgressScope) {
        let mut inner = self.inner.lock();
        let Some(id) = scope.node else {
            return;
        };
        if scope.generation != inner.generation || !inner.nodes[id].open {
            return;
        }

        let remainder = (inner.nodes[id].span - inner.nodes[id].credited).max(0.0);
        inner.nodes[id].open = false;

        let mut cursor = Some(id);
        while let Some(node_id) = cursor {
            inner.nodes[node_id].credited += remainder;
            cursor = inner.nodes[node_id].parent;
        }
        inner.done += remainder;

        let max = inner.state.max;
        let current = ((inner.done + EPSILON).floor() as u64).min(max);
        inner.state.current = inner.state.current.max(current);

        // Fall back to the most recently opened step that is still running.
        let description = inner
            .nodes
            .iter()
            .rev()
            .find(|n| n.open && n.description.is_some())
            .and_then(|n| n.description.clone());
        if description != inner.state.description {
            inner.state.description = description;
            inner.state.transition_time = Utc::now();
        }

        self.events.emit_progress(inner.state.clone());
    }
}
