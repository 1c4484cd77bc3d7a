use crate::{error::CellError, graph::ReactiveNodeState, variable::Uid};
use or_poisoned::OrPoisoned;
use serde_json::Value;
use slotmap::{DefaultKey, SlotMap};
use std::{
    fmt::{Debug, Formatter},
    sync::{Arc, RwLock, Weak},
};

/// The identity of a cell: a variable `uid` plus the key of the request extras
/// it was read under.
///
/// Variables bound to a backend store use [`CellKey::shared`], so that every
/// binding to the same `uid` observes the same cell regardless of extras.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellKey {
    /// The variable's `uid`.
    pub uid: Uid,
    /// The stable key of the request extras, if any.
    pub extras: Option<Arc<str>>,
}

impl CellKey {
    /// The cell for `uid` under the given extras.
    pub fn new(uid: Uid, extras: &crate::extras::RequestExtras) -> Self {
        Self {
            uid,
            extras: extras.key(),
        }
    }

    /// The cell for `uid`, shared across all extras.
    pub fn shared(uid: Uid) -> Self {
        Self { uid, extras: None }
    }
}

/// The status and value of a cell.
#[derive(Debug, Clone, PartialEq)]
pub enum CellState {
    /// No value has settled yet.
    Pending,
    /// The current value.
    Resolved(Value),
    /// The last resolution failed.
    Error(CellError),
}

impl CellState {
    /// The value, if resolved.
    pub fn value(&self) -> Option<&Value> {
        match self {
            CellState::Resolved(value) => Some(value),
            _ => None,
        }
    }
}

/// What a subscriber is told about.
#[derive(Debug, Clone, PartialEq)]
pub enum CellEvent {
    /// The cell's state was replaced.
    Updated(CellState),
    /// An input changed; the cell should be read again.
    Invalidated,
}

type Callback = Arc<dyn Fn(&CellEvent) + Send + Sync>;

struct CellInner {
    state: CellState,
    node: ReactiveNodeState,
    // bypass caches on the next computation, set by a forced
    // `VariableStore::invalidate_dependents`
    force_next: bool,
    version: u64,
    subscribers: SlotMap<DefaultKey, Callback>,
}

/// A reactive cell holding one variable's value under one set of request
/// extras.
pub struct Cell {
    key: CellKey,
    inner: RwLock<CellInner>,
}

impl Debug for Cell {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().or_poisoned();
        f.debug_struct("Cell")
            .field("key", &self.key)
            .field("state", &inner.state)
            .field("node", &inner.node)
            .field("version", &inner.version)
            .finish()
    }
}

impl Cell {
    pub(crate) fn new(
        key: CellKey,
        state: CellState,
        node: ReactiveNodeState,
    ) -> Self {
        Self {
            key,
            inner: RwLock::new(CellInner {
                state,
                node,
                force_next: false,
                version: 0,
                subscribers: SlotMap::new(),
            }),
        }
    }

    /// The cell's identity.
    pub fn key(&self) -> &CellKey {
        &self.key
    }

    /// A snapshot of the current state.
    pub fn state(&self) -> CellState {
        self.inner.read().or_poisoned().state.clone()
    }

    /// The current value, if resolved.
    pub fn value(&self) -> Option<Value> {
        self.inner.read().or_poisoned().state.value().cloned()
    }

    /// Incremented on every state change.
    pub fn version(&self) -> u64 {
        self.inner.read().or_poisoned().version
    }

    /// Whether an input has changed since the value was produced.
    pub fn is_dirty(&self) -> bool {
        self.inner.read().or_poisoned().node == ReactiveNodeState::Dirty
    }

    /// Whether the next computation of this cell must bypass caches.
    pub fn force_pending(&self) -> bool {
        self.inner.read().or_poisoned().force_next
    }

    /// Clears and returns the one-shot cache bypass flag.
    pub fn take_force(&self) -> bool {
        std::mem::take(&mut self.inner.write().or_poisoned().force_next)
    }

    /// The number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.read().or_poisoned().subscribers.len()
    }

    /// Calls `callback` on every future change to this cell, until the returned
    /// [`Subscription`] is dropped.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&CellEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let key = self
            .inner
            .write()
            .or_poisoned()
            .subscribers
            .insert(Arc::new(callback));
        Subscription {
            cell: Arc::downgrade(self),
            key,
        }
    }

    pub(crate) fn set_state(&self, state: CellState) {
        let subscribers = {
            let mut inner = self.inner.write().or_poisoned();
            inner.state = state.clone();
            inner.node = ReactiveNodeState::Clean;
            inner.version += 1;
            inner.subscribers.values().cloned().collect::<Vec<_>>()
        };
        // callbacks run outside the lock, so they may read or write the store
        let event = CellEvent::Updated(state);
        for subscriber in subscribers {
            subscriber(&event);
        }
    }

    pub(crate) fn mark_dirty(&self, force: bool) {
        let subscribers = {
            let mut inner = self.inner.write().or_poisoned();
            inner.force_next |= force;
            if inner.node == ReactiveNodeState::Dirty {
                return;
            }
            inner.node = ReactiveNodeState::Dirty;
            inner.subscribers.values().cloned().collect::<Vec<_>>()
        };
        for subscriber in subscribers {
            subscriber(&CellEvent::Invalidated);
        }
    }
}

/// Removes its callback from the cell when dropped.
#[derive(Debug)]
#[must_use = "the subscription ends as soon as this is dropped"]
pub struct Subscription {
    cell: Weak<Cell>,
    key: DefaultKey,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.upgrade() {
            cell.inner.write().or_poisoned().subscribers.remove(self.key);
        }
    }
}
