//! The Variable Store: the single shared mutable resource of the runtime.
//!
//! Every write goes through [`VariableStore::set`] (or
//! [`VariableStore::set_state`] for computed results), so that subscribers are
//! notified and dependents are invalidated consistently.

mod cell;

pub use cell::*;

use crate::{
    graph::{DependencyGraph, ReactiveNodeState},
    variable::{AnyVariable, DerivedVariable, PathSegment, Uid},
};
use or_poisoned::OrPoisoned;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::{Arc, RwLock};

/// A process-wide registry of reactive cells and the dependency edges between
/// them.
#[derive(Debug, Default)]
pub struct VariableStore {
    cells: RwLock<FxHashMap<CellKey, Arc<Cell>>>,
    graph: RwLock<DependencyGraph>,
}

impl VariableStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// The cell for `key`, if it has been registered.
    pub fn cell(&self, key: &CellKey) -> Option<Arc<Cell>> {
        self.cells.read().or_poisoned().get(key).cloned()
    }

    /// The current value for `key`, if registered and resolved.
    pub fn get(&self, key: &CellKey) -> Option<Value> {
        self.cell(key).and_then(|cell| cell.value())
    }

    /// Returns the cell for `key`, seeding it with `init()` if this is the
    /// first time the key has been seen. Later calls never reseed.
    pub fn register(
        &self,
        key: &CellKey,
        init: impl FnOnce() -> Value,
    ) -> Arc<Cell> {
        if let Some(cell) = self.cell(key) {
            return cell;
        }
        let mut cells = self.cells.write().or_poisoned();
        // another caller may have registered it between the two locks
        Arc::clone(cells.entry(key.clone()).or_insert_with(|| {
            tracing::trace!(uid = %key.uid, "registering cell");
            Arc::new(Cell::new(
                key.clone(),
                CellState::Resolved(init()),
                ReactiveNodeState::Clean,
            ))
        }))
    }

    /// Returns the cell for a computed variable, creating it as pending (and
    /// dirty, so that the first read computes it) if necessary.
    pub fn register_pending(&self, key: &CellKey) -> Arc<Cell> {
        if let Some(cell) = self.cell(key) {
            return cell;
        }
        let mut cells = self.cells.write().or_poisoned();
        Arc::clone(cells.entry(key.clone()).or_insert_with(|| {
            Arc::new(Cell::new(
                key.clone(),
                CellState::Pending,
                ReactiveNodeState::Dirty,
            ))
        }))
    }

    /// Writes a value to `key` and invalidates everything that depends on it.
    ///
    /// Returns the `uid`s that were invalidated, in topological order.
    #[tracing::instrument(
        level = "trace",
        skip(self, value),
        fields(uid = %key.uid)
    )]
    pub fn set(&self, key: &CellKey, value: Value) -> Vec<Uid> {
        let cell = self.register(key, || Value::Null);
        cell.set_state(CellState::Resolved(value));
        self.invalidate_dependents(&key.uid, false)
    }

    /// Replaces the state of `key` without invalidating dependents. Used to
    /// store the result of a computation whose dependents were already
    /// invalidated by the write that triggered it.
    pub fn set_state(&self, key: &CellKey, state: CellState) {
        let cell = self.register_pending(key);
        cell.set_state(state);
    }

    /// Marks every transitive dependent of `uid` dirty. With `force`, each of
    /// them also bypasses caches on its next computation.
    pub fn invalidate_dependents(&self, uid: &Uid, force: bool) -> Vec<Uid> {
        let order = self.graph.read().or_poisoned().propagation_order(uid);
        for dependent in &order {
            self.mark_dirty(dependent, force);
        }
        if !order.is_empty() {
            tracing::trace!(
                %uid,
                dependents = order.len(),
                "invalidated dependents"
            );
        }
        order
    }

    /// Marks every cell of `uid` (across all extras) dirty.
    pub fn mark_dirty(&self, uid: &Uid, force: bool) {
        for cell in self.cells_for(uid) {
            cell.mark_dirty(force);
        }
    }

    /// Every cell registered for `uid`, across all extras.
    pub fn cells_for(&self, uid: &Uid) -> Vec<Arc<Cell>> {
        self.cells
            .read()
            .or_poisoned()
            .iter()
            .filter(|(key, _)| &key.uid == uid)
            .map(|(_, cell)| Arc::clone(cell))
            .collect()
    }

    /// Records the edges from a derived variable's trigger inputs to the
    /// variable itself.
    pub fn register_derived(&self, variable: &DerivedVariable) {
        let any = AnyVariable::Derived(variable.clone());
        self.register_dependencies(&any);
    }

    /// Records the edges into `variable` from everything that invalidates it.
    ///
    /// Nested inputs (including variables used as dynamic path segments) are
    /// registered recursively, so registering the outermost variable of a graph
    /// is enough.
    pub fn register_dependencies(&self, variable: &AnyVariable) {
        let triggers = variable.trigger_uids();
        if matches!(variable, AnyVariable::Derived(_) | AnyVariable::State(_)) {
            self.graph
                .write()
                .or_poisoned()
                .set_sources(variable.uid(), triggers);
        }
        for segment in variable.nested() {
            if let PathSegment::Variable(inner) = segment {
                self.register_dependencies(inner);
            }
        }
        match variable {
            AnyVariable::Derived(derived) => {
                for input in &derived.variables {
                    self.register_dependencies(input);
                }
            }
            AnyVariable::State(state) => {
                self.register_dependencies(&state.parent)
            }
            _ => {}
        }
    }

    /// Adds a single edge, for dependencies discovered while resolving.
    pub fn add_dependency(&self, source: Uid, dependent: Uid) {
        self.graph.write().or_poisoned().add_edge(source, dependent);
    }

    /// Runs `fun` with read access to the dependency graph.
    pub fn with_graph<T>(&self, fun: impl FnOnce(&DependencyGraph) -> T) -> T {
        fun(&self.graph.read().or_poisoned())
    }

    /// Drops every cell and edge. Subscriptions to dropped cells become inert.
    pub fn clear(&self) {
        self.cells.write().or_poisoned().clear();
        self.graph.write().or_poisoned().clear();
    }
}
