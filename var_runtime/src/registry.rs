//! Process-scoped registries of everything the server declared at startup.

use crate::{action::ActionDef, error::Result};
use or_poisoned::OrPoisoned;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::RwLock;
use var_graph::{
    variable::{AnyVariable, Uid},
    VarError,
};

/// A component the server declared, kept opaque: rendering is not the runtime's
/// concern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentDef {
    /// The component's `uid`.
    pub uid: String,
    /// Everything else the server sent.
    #[serde(flatten)]
    pub props: Map<String, Value>,
}

/// What the server declares when the app starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Every variable the app may read.
    #[serde(default)]
    pub variables: Vec<AnyVariable>,
    /// Server-annotated action instances.
    #[serde(default)]
    pub actions: Vec<ActionDef>,
    /// Component definitions.
    #[serde(default)]
    pub components: Vec<ComponentDef>,
}

/// The entry a `uid` was found under.
#[derive(Debug, Clone, PartialEq)]
pub enum Registered {
    /// A variable.
    Variable(AnyVariable),
    /// An action instance.
    Action(ActionDef),
    /// A component.
    Component(ComponentDef),
}

/// Lookup tables for variables, actions, and components, by `uid`.
///
/// Populated from a [`Manifest`] at startup. Entries are only removed by
/// [`Registry::clear`].
#[derive(Debug, Default)]
pub struct Registry {
    variables: RwLock<FxHashMap<Uid, AnyVariable>>,
    actions: RwLock<FxHashMap<String, ActionDef>>,
    components: RwLock<FxHashMap<String, ComponentDef>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding everything in the manifest.
    pub fn from_manifest(manifest: Manifest) -> Self {
        let this = Self::new();
        this.load(manifest);
        this
    }

    /// Adds everything in the manifest, replacing entries with the same `uid`.
    pub fn load(&self, manifest: Manifest) {
        tracing::debug!(
            variables = manifest.variables.len(),
            actions = manifest.actions.len(),
            components = manifest.components.len(),
            "loading manifest"
        );
        for variable in manifest.variables {
            self.register_variable(variable);
        }
        let mut actions = self.actions.write().or_poisoned();
        for action in manifest.actions {
            if let Some(uid) = action.uid.clone() {
                actions.insert(uid, action);
            }
        }
        let mut components = self.components.write().or_poisoned();
        for component in manifest.components {
            components.insert(component.uid.clone(), component);
        }
    }

    /// Adds a variable. Variables nested inside it are registered too, so that
    /// they can be looked up by `uid` later.
    pub fn register_variable(&self, variable: AnyVariable) {
        let mut variables = self.variables.write().or_poisoned();
        register_nested(&mut variables, variable);
    }

    /// The variable registered under `uid`.
    pub fn variable(&self, uid: &str) -> Option<AnyVariable> {
        self.variables.read().or_poisoned().get(uid).cloned()
    }

    /// Every registered variable.
    pub fn variables(&self) -> Vec<AnyVariable> {
        self.variables.read().or_poisoned().values().cloned().collect()
    }

    /// The action instance registered under `uid`.
    pub fn action(&self, uid: &str) -> Option<ActionDef> {
        self.actions.read().or_poisoned().get(uid).cloned()
    }

    /// Looks `uid` up in every registry.
    pub fn resolve_uid(&self, uid: &str) -> Result<Registered> {
        if let Some(variable) = self.variable(uid) {
            return Ok(Registered::Variable(variable));
        }
        if let Some(action) = self.action(uid) {
            return Ok(Registered::Action(action));
        }
        if let Some(component) =
            self.components.read().or_poisoned().get(uid).cloned()
        {
            return Ok(Registered::Component(component));
        }
        Err(VarError::UnresolvableVariable { uid: uid.into() }.into())
    }

    /// Empties every registry.
    pub fn clear(&self) {
        self.variables.write().or_poisoned().clear();
        self.actions.write().or_poisoned().clear();
        self.components.write().or_poisoned().clear();
    }
}

fn register_nested(
    variables: &mut FxHashMap<Uid, AnyVariable>,
    variable: AnyVariable,
) {
    match &variable {
        AnyVariable::Derived(derived) => {
            for input in &derived.variables {
                register_nested(variables, input.clone());
            }
        }
        AnyVariable::State(state) => {
            register_nested(variables, (*state.parent).clone())
        }
        _ => {}
    }
    // a nested `.get()` reference is registered under its parent's uid, without
    // the path
    let uid = variable.uid().clone();
    variables.entry(uid).or_insert_with(|| strip_nested(variable));
}

fn strip_nested(mut variable: AnyVariable) -> AnyVariable {
    match &mut variable {
        AnyVariable::Plain(v) => v.nested.clear(),
        AnyVariable::Derived(v) => v.nested.clear(),
        _ => {}
    }
    variable
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use var_graph::variable::{DerivedVariable, PlainVariable};

    #[test]
    fn nested_inputs_are_registered_without_paths() {
        let x = PlainVariable::new("x", json!({ "a": 1 }));
        let derived = DerivedVariable::new("d", [x.get("a").into()]);
        let registry = Registry::from_manifest(Manifest {
            variables: vec![derived.into()],
            ..Default::default()
        });

        let Some(AnyVariable::Plain(x)) = registry.variable("x") else {
            panic!("x should be registered");
        };
        assert!(x.nested.is_empty());
        assert!(registry.variable("d").is_some());
    }

    #[test]
    fn unknown_uids_are_unresolvable() {
        let registry = Registry::new();
        assert_eq!(
            registry.resolve_uid("missing"),
            Err(VarError::UnresolvableVariable {
                uid: "missing".into()
            }
            .into())
        );
    }

    #[test]
    fn components_are_found_by_uid() {
        let manifest: Manifest = serde_json::from_value(json!({
            "components": [{ "uid": "c1", "name": "Heading" }]
        }))
        .unwrap();
        let registry = Registry::from_manifest(manifest);
        let Ok(Registered::Component(component)) = registry.resolve_uid("c1")
        else {
            panic!("expected a component");
        };
        assert_eq!(component.props["name"], "Heading");

        registry.clear();
        assert!(registry.resolve_uid("c1").is_err());
    }
}
