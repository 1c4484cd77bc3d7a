//! The variable model: every kind of reactive value the server can declare.
//!
//! Variables are plain data. They describe *how* to obtain a value (a default,
//! a server-side computation, a query parameter...) but never hold the value
//! themselves; current values live in the
//! [`VariableStore`](crate::store::VariableStore).
//!
//! The serialized form matches the manifest the server sends at startup: a JSON
//! object tagged by `__typename`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// A globally stable variable identifier.
pub type Uid = Arc<str>;

/// Controls where a derived value may be reused from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum CachePolicy {
    /// Never cached: every computation goes to the server.
    None,
    /// Cached for the lifetime of the current browser-tab session.
    Session,
    /// Cached for the whole app instance.
    #[default]
    Global,
    /// Cached per user, i.e. per set of request extras.
    User,
}

/// One step of a nested `.get()` extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    /// A fixed key (or array index, written as a string).
    Key(String),
    /// A key that is itself the value of another variable.
    Variable(Box<AnyVariable>),
}

impl From<&str> for PathSegment {
    fn from(value: &str) -> Self {
        PathSegment::Key(value.to_string())
    }
}

impl From<String> for PathSegment {
    fn from(value: String) -> Self {
        PathSegment::Key(value)
    }
}

impl From<AnyVariable> for PathSegment {
    fn from(value: AnyVariable) -> Self {
        PathSegment::Variable(Box::new(value))
    }
}

/// A reference to server-held state that one or more plain variables expose.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendStoreRef {
    /// The store's `store_uid`.
    pub uid: Uid,
    /// Readonly stores never send local writes to the server.
    #[serde(default)]
    pub readonly: bool,
}

/// A plain, client-writable variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlainVariable {
    /// The variable's stable identifier.
    pub uid: Uid,
    /// The value used before anything has been written, and after a reset.
    #[serde(default)]
    pub default: Value,
    /// Whether writes are persisted to browser storage.
    #[serde(default)]
    pub persist_value: bool,
    /// The backend store this variable is bound to, if any.
    #[serde(default)]
    pub store: Option<BackendStoreRef>,
    /// Nested extraction applied when the variable is read.
    #[serde(default)]
    pub nested: Vec<PathSegment>,
}

impl PlainVariable {
    /// Creates a new plain variable with the given default.
    pub fn new(uid: impl Into<Uid>, default: Value) -> Self {
        Self {
            uid: uid.into(),
            default,
            persist_value: false,
            store: None,
            nested: Vec::new(),
        }
    }

    /// Persists writes to browser storage.
    pub fn persisted(mut self) -> Self {
        self.persist_value = true;
        self
    }

    /// Binds the variable to a backend store.
    pub fn with_store(
        mut self,
        store_uid: impl Into<Uid>,
        readonly: bool,
    ) -> Self {
        self.store = Some(BackendStoreRef {
            uid: store_uid.into(),
            readonly,
        });
        self
    }

    /// Returns a reference to a nested value of this variable.
    pub fn get(&self, segment: impl Into<PathSegment>) -> Self {
        let mut this = self.clone();
        this.nested.push(segment.into());
        this
    }
}

/// A variable whose value is computed by the server from other variables'
/// values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedVariable {
    /// The stable identifier of the server-side definition.
    pub uid: Uid,
    /// Ordered inputs; the server receives their resolved values positionally.
    #[serde(default)]
    pub variables: Vec<AnyVariable>,
    /// Where computed values may be reused from.
    #[serde(default)]
    pub cache: CachePolicy,
    /// The subset of inputs whose changes trigger a recompute. `None` means all
    /// of them.
    #[serde(default)]
    pub deps: Option<Vec<AnyVariable>>,
    /// Nested extraction applied to the computed value.
    #[serde(default)]
    pub nested: Vec<PathSegment>,
}

impl DerivedVariable {
    /// Creates a new derived variable over the given inputs, cached globally.
    pub fn new(
        uid: impl Into<Uid>,
        variables: impl IntoIterator<Item = AnyVariable>,
    ) -> Self {
        Self {
            uid: uid.into(),
            variables: variables.into_iter().collect(),
            cache: CachePolicy::default(),
            deps: None,
            nested: Vec::new(),
        }
    }

    /// Sets the cache policy.
    pub fn cache(mut self, cache: CachePolicy) -> Self {
        self.cache = cache;
        self
    }

    /// Restricts recompute triggers to the given inputs.
    pub fn deps(mut self, deps: impl IntoIterator<Item = AnyVariable>) -> Self {
        self.deps = Some(deps.into_iter().collect());
        self
    }

    /// Returns a reference to a nested value of the computed result.
    pub fn get(&self, segment: impl Into<PathSegment>) -> Self {
        let mut this = self.clone();
        this.nested.push(segment.into());
        this
    }

    /// The inputs whose changes trigger a recompute.
    pub fn triggers(&self) -> &[AnyVariable] {
        self.deps.as_deref().unwrap_or(&self.variables)
    }
}

/// A variable bound to a query parameter of the current URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlVariable {
    /// The variable's stable identifier.
    pub uid: Uid,
    /// The name of the query parameter.
    pub query: String,
    /// The value used when the parameter is absent.
    #[serde(default)]
    pub default: Value,
}

impl UrlVariable {
    /// Creates a new URL-bound variable.
    pub fn new(
        uid: impl Into<Uid>,
        query: impl Into<String>,
        default: Value,
    ) -> Self {
        Self {
            uid: uid.into(),
            query: query.into(),
            default,
        }
    }
}

/// A tabular variable. Local data is served from the store; server-side data is
/// filtered and paginated by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataVariable {
    /// The variable's stable identifier.
    pub uid: Uid,
    /// Locally declared rows, if any.
    #[serde(default)]
    pub data: Option<Value>,
    /// Where server-side pages may be reused from.
    #[serde(default)]
    pub cache: CachePolicy,
    /// Filters applied on the server.
    #[serde(default)]
    pub filters: Option<Value>,
}

impl DataVariable {
    /// Creates a data variable holding local rows.
    pub fn new(uid: impl Into<Uid>, data: Value) -> Self {
        Self {
            uid: uid.into(),
            data: Some(data),
            cache: CachePolicy::default(),
            filters: None,
        }
    }
}

/// Which aspect of another variable's status a [`StateVariable`] exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StateProperty {
    /// `true` while the parent has no settled value.
    Loading,
    /// `true` if the parent's last resolution failed.
    Error,
    /// `true` once the parent has a value.
    HasValue,
}

/// A boolean variable derived from the status of another variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateVariable {
    /// The variable's stable identifier.
    pub uid: Uid,
    /// The variable whose status is observed.
    pub parent: Box<AnyVariable>,
    /// The aspect of the status that is exposed.
    pub property: StateProperty,
}

/// Any variable the server can declare.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "__typename")]
pub enum AnyVariable {
    /// A plain variable.
    #[serde(rename = "Variable")]
    Plain(PlainVariable),
    /// A server-derived variable.
    #[serde(rename = "DerivedVariable")]
    Derived(DerivedVariable),
    /// A query-parameter variable.
    #[serde(rename = "UrlVariable")]
    Url(UrlVariable),
    /// A tabular variable.
    #[serde(rename = "DataVariable")]
    Data(DataVariable),
    /// A status variable.
    #[serde(rename = "StateVariable")]
    State(StateVariable),
}

impl AnyVariable {
    /// The variable's stable identifier.
    pub fn uid(&self) -> &Uid {
        match self {
            AnyVariable::Plain(v) => &v.uid,
            AnyVariable::Derived(v) => &v.uid,
            AnyVariable::Url(v) => &v.uid,
            AnyVariable::Data(v) => &v.uid,
            AnyVariable::State(v) => &v.uid,
        }
    }

    /// The nested extraction applied when this variable is read.
    pub fn nested(&self) -> &[PathSegment] {
        match self {
            AnyVariable::Plain(v) => &v.nested,
            AnyVariable::Derived(v) => &v.nested,
            _ => &[],
        }
    }

    /// A short name for the variable's kind, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AnyVariable::Plain(_) => "Variable",
            AnyVariable::Derived(_) => "DerivedVariable",
            AnyVariable::Url(_) => "UrlVariable",
            AnyVariable::Data(_) => "DataVariable",
            AnyVariable::State(_) => "StateVariable",
        }
    }

    /// The `uid`s of the variables whose changes invalidate this one.
    ///
    /// For a derived variable these are its trigger inputs, plus the variables
    /// used as dynamic path segments by those inputs (a different key yields a
    /// different input value).
    pub fn trigger_uids(&self) -> Vec<Uid> {
        let mut uids = Vec::new();
        match self {
            AnyVariable::Derived(v) => {
                for input in v.triggers() {
                    uids.push(input.uid().clone());
                    uids.extend(input.dynamic_segment_uids());
                }
            }
            AnyVariable::State(v) => uids.push(v.parent.uid().clone()),
            _ => {}
        }
        uids
    }

    /// The `uid`s of the variables used as dynamic segments of this variable's
    /// nested path.
    pub fn dynamic_segment_uids(&self) -> impl Iterator<Item = Uid> + '_ {
        self.nested().iter().filter_map(|segment| match segment {
            PathSegment::Variable(inner) => Some(inner.uid().clone()),
            PathSegment::Key(_) => None,
        })
    }
}

impl From<PlainVariable> for AnyVariable {
    fn from(value: PlainVariable) -> Self {
        AnyVariable::Plain(value)
    }
}

impl From<DerivedVariable> for AnyVariable {
    fn from(value: DerivedVariable) -> Self {
        AnyVariable::Derived(value)
    }
}

impl From<UrlVariable> for AnyVariable {
    fn from(value: UrlVariable) -> Self {
        AnyVariable::Url(value)
    }
}

impl From<DataVariable> for AnyVariable {
    fn from(value: DataVariable) -> Self {
        AnyVariable::Data(value)
    }
}

impl From<StateVariable> for AnyVariable {
    fn from(value: StateVariable) -> Self {
        AnyVariable::State(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn manifest_shape_round_trips() {
        let raw = json!({
            "__typename": "DerivedVariable",
            "uid": "total",
            "cache": "session",
            "variables": [
                { "__typename": "Variable", "uid": "x", "default": 2 },
                {
                    "__typename": "Variable",
                    "uid": "obj",
                    "default": {},
                    "nested": [
                        "a",
                        {
                            "__typename": "Variable",
                            "uid": "key",
                            "default": "b"
                        }
                    ]
                }
            ]
        });
        let parsed: AnyVariable = serde_json::from_value(raw).unwrap();
        let AnyVariable::Derived(derived) = &parsed else {
            panic!("expected a derived variable");
        };
        assert_eq!(derived.cache, CachePolicy::Session);
        assert_eq!(derived.variables.len(), 2);
        assert_eq!(derived.variables[1].nested().len(), 2);
        assert!(matches!(
            derived.variables[1].nested()[1],
            PathSegment::Variable(_)
        ));
    }

    #[test]
    fn deps_restrict_triggers() {
        let a = PlainVariable::new("a", json!(1));
        let b = PlainVariable::new("b", json!(2));
        let derived = DerivedVariable::new("sum", [a.clone().into(), b.into()])
            .deps([a.into()]);
        let uids = AnyVariable::from(derived).trigger_uids();
        assert_eq!(uids, vec![Uid::from("a")]);
    }

    #[test]
    fn dynamic_segments_are_triggers() {
        let key = PlainVariable::new("key", json!("a"));
        let obj = PlainVariable::new("obj", json!({ "a": 1, "b": 2 }));
        let picked = obj.get(AnyVariable::from(key));
        let derived = DerivedVariable::new("pick", [picked.into()]);
        let uids = AnyVariable::from(derived).trigger_uids();
        assert_eq!(uids, vec![Uid::from("obj"), Uid::from("key")]);
    }
}
