use crate::variable::Uid;
use indexmap::IndexSet;
use rustc_hash::{FxBuildHasher, FxHashMap, FxHashSet};

/// Edges between variables, keyed by `uid`.
///
/// Both directions are kept: `dependents` drives invalidation and `sources`
/// lets a node replace its inputs when they are rediscovered (for example, when
/// a dynamic path segment changes).
#[derive(Debug, Default, Clone)]
pub struct DependencyGraph {
    dependents: FxHashMap<Uid, IndexSet<Uid, FxBuildHasher>>,
    sources: FxHashMap<Uid, IndexSet<Uid, FxBuildHasher>>,
}

impl DependencyGraph {
    /// Creates an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the inputs of `dependent` with `sources`.
    pub fn set_sources(
        &mut self,
        dependent: &Uid,
        sources: impl IntoIterator<Item = Uid>,
    ) {
        if let Some(previous) = self.sources.remove(dependent) {
            for source in previous {
                if let Some(set) = self.dependents.get_mut(&source) {
                    set.shift_remove(dependent);
                }
            }
        }
        let mut new_sources = IndexSet::default();
        for source in sources {
            if &source == dependent {
                continue;
            }
            self.dependents
                .entry(source.clone())
                .or_default()
                .insert(dependent.clone());
            new_sources.insert(source);
        }
        self.sources.insert(dependent.clone(), new_sources);
    }

    /// Adds a single edge from `source` to `dependent`.
    pub fn add_edge(&mut self, source: Uid, dependent: Uid) {
        if source == dependent {
            return;
        }
        self.dependents
            .entry(source.clone())
            .or_default()
            .insert(dependent.clone());
        self.sources.entry(dependent).or_default().insert(source);
    }

    /// The variables that read `uid` directly.
    pub fn dependents(&self, uid: &Uid) -> impl Iterator<Item = &Uid> {
        self.dependents.get(uid).into_iter().flatten()
    }

    /// The variables `uid` reads directly.
    pub fn sources(&self, uid: &Uid) -> impl Iterator<Item = &Uid> {
        self.sources.get(uid).into_iter().flatten()
    }

    /// Every transitive dependent of `uid`, ordered so that each variable
    /// appears after all of the variables it depends on. `uid` itself is not
    /// included.
    ///
    /// Cycles are tolerated: a node already on the current path is skipped.
    pub fn propagation_order(&self, uid: &Uid) -> Vec<Uid> {
        let mut visited = FxHashSet::default();
        let mut post_order = Vec::new();
        visited.insert(uid.clone());
        for dependent in self.dependents(uid) {
            self.visit(dependent, &mut visited, &mut post_order);
        }
        post_order.reverse();
        post_order
    }

    fn visit(
        &self,
        uid: &Uid,
        visited: &mut FxHashSet<Uid>,
        post_order: &mut Vec<Uid>,
    ) {
        if !visited.insert(uid.clone()) {
            return;
        }
        for dependent in self.dependents(uid) {
            self.visit(dependent, visited, post_order);
        }
        post_order.push(uid.clone());
    }

    /// Removes every edge.
    pub fn clear(&mut self) {
        self.dependents.clear();
        self.sources.clear();
    }
}
