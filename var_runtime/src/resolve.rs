//! The Dependency Resolver: turns a variable reference into a value.
//!
//! Values that are already known locally (plain, URL, local data, status flags,
//! and clean derived cells) are read straight from the store. Everything else
//! goes through the [`DerivedEngine`](crate::engine::DerivedEngine). Inputs are
//! resolved recursively and in parallel, so a derived variable only computes
//! once every nested input, task waits included, has settled.

use crate::{
    engine::ComputeOptions,
    error::{Result, RuntimeError},
    runtime::Runtime,
};
use futures::{
    future::{try_join_all, BoxFuture},
    FutureExt,
};
use or_poisoned::OrPoisoned;
use serde_json::Value;
use var_graph::{
    extras::RequestExtras,
    path::{extract, value_as_key},
    store::{CellKey, CellState},
    variable::{
        AnyVariable, DataVariable, DerivedVariable, PathSegment,
        PlainVariable, StateProperty,
    },
    CellError, VarError,
};

impl Runtime {
    /// Resolves `variable` under `extras`, computing it on the server if
    /// needed.
    ///
    /// The first read of a variable seeds its cell: with the persisted value or
    /// default for a plain variable, or from the query string for a URL
    /// variable. A nested `.get()` path is applied last; a miss anywhere along
    /// it yields `null`.
    pub fn resolve<'a>(
        &'a self,
        variable: &'a AnyVariable,
        extras: &'a RequestExtras,
    ) -> BoxFuture<'a, Result<Value>> {
        async move {
            let value = match self.resolve_root_local(variable, extras) {
                Some(result) => result?,
                None => self.resolve_root_remote(variable, extras).await?,
            };
            if variable.nested().is_empty() {
                return Ok(value);
            }

            let mut keys = Vec::with_capacity(variable.nested().len());
            for segment in variable.nested() {
                match segment {
                    PathSegment::Key(key) => keys.push(key.clone()),
                    PathSegment::Variable(inner) => {
                        let resolved = self.resolve(inner, extras).await?;
                        match segment_key(variable, &resolved)? {
                            Some(key) => keys.push(key),
                            None => return Ok(Value::Null),
                        }
                    }
                }
            }
            Ok(extract(&value, keys.iter().map(String::as_str)))
        }
        .boxed()
    }

    /// Resolves `variable` without waiting, if its value is known locally.
    ///
    /// Returns `None` if resolving it would need a server round trip.
    pub fn try_resolve_sync(
        &self,
        variable: &AnyVariable,
        extras: &RequestExtras,
    ) -> Option<Result<Value>> {
        let value = match self.resolve_root_local(variable, extras)? {
            Ok(value) => value,
            Err(e) => return Some(Err(e)),
        };
        let mut keys = Vec::with_capacity(variable.nested().len());
        for segment in variable.nested() {
            match segment {
                PathSegment::Key(key) => keys.push(key.clone()),
                PathSegment::Variable(inner) => {
                    let resolved = match self.try_resolve_sync(inner, extras)? {
                        Ok(value) => value,
                        Err(e) => return Some(Err(e)),
                    };
                    match segment_key(variable, &resolved) {
                        Ok(Some(key)) => keys.push(key),
                        Ok(None) => return Some(Ok(Value::Null)),
                        Err(e) => return Some(Err(e)),
                    }
                }
            }
        }
        Some(Ok(extract(&value, keys.iter().map(String::as_str))))
    }

    /// The keys of `variable`'s nested path, which must all be known locally.
    pub(crate) fn nested_keys_sync(
        &self,
        variable: &AnyVariable,
        extras: &RequestExtras,
    ) -> Result<Vec<String>> {
        variable
            .nested()
            .iter()
            .map(|segment| match segment {
                PathSegment::Key(key) => Ok(key.clone()),
                PathSegment::Variable(inner) => {
                    let resolved = self
                        .try_resolve_sync(inner, extras)
                        .transpose()?
                        .unwrap_or(Value::Null);
                    segment_key(variable, &resolved)?.ok_or_else(|| {
                        VarError::InvalidPath {
                            uid: variable.uid().clone(),
                            found: resolved.to_string(),
                        }
                        .into()
                    })
                }
            })
            .collect()
    }

    // the value of the variable itself, ignoring any nested path
    pub(crate) fn resolve_root_local(
        &self,
        variable: &AnyVariable,
        extras: &RequestExtras,
    ) -> Option<Result<Value>> {
        let store = &self.inner.store;
        let key = self.cell_key(variable, extras);
        match variable {
            AnyVariable::Plain(plain) => {
                if let Some(bound) = &plain.store {
                    self.inner.backend.mount(&plain.uid, bound, extras);
                }
                let cell = store.register(&key, || self.initial_value(plain));
                Some(settled(cell.state(), &plain.default))
            }
            AnyVariable::Url(url) => {
                // navigation reseeds URL variables it finds in the registry
                self.inner.registry.register_variable(variable.clone());
                let cell = store.register(&key, || {
                    self.inner
                        .location
                        .read()
                        .or_poisoned()
                        .query(&url.query)
                        .map(Value::String)
                        .unwrap_or_else(|| url.default.clone())
                });
                Some(settled(cell.state(), &url.default))
            }
            AnyVariable::Data(DataVariable {
                data: Some(rows), ..
            }) => {
                let cell = store.register(&key, || rows.clone());
                Some(settled(cell.state(), &Value::Null))
            }
            AnyVariable::Data(_) | AnyVariable::Derived(_) => {
                let cell = store.cell(&key)?;
                if cell.is_dirty() {
                    return None;
                }
                match cell.state() {
                    CellState::Resolved(value) => Some(Ok(value)),
                    CellState::Error(e) => Some(Err(from_cell_error(e))),
                    CellState::Pending => None,
                }
            }
            AnyVariable::State(state) => {
                store.register_dependencies(variable);
                let parent = store.cell(&self.cell_key(&state.parent, extras))?;
                let status = parent.state();
                let flag = match state.property {
                    StateProperty::Loading => {
                        matches!(status, CellState::Pending)
                            || parent.is_dirty()
                    }
                    StateProperty::Error => {
                        matches!(status, CellState::Error(_))
                    }
                    StateProperty::HasValue => {
                        matches!(status, CellState::Resolved(_))
                    }
                };
                Some(Ok(Value::Bool(flag)))
            }
        }
    }

    async fn resolve_root_remote(
        &self,
        variable: &AnyVariable,
        extras: &RequestExtras,
    ) -> Result<Value> {
        match variable {
            AnyVariable::Derived(derived) => {
                self.compute_derived(derived, extras).await
            }
            AnyVariable::Data(data) => {
                let key = self.cell_key(variable, extras);
                let force =
                    self.inner.store.register_pending(&key).take_force();
                let result = self
                    .inner
                    .engine
                    .fetch_data(
                        data,
                        None,
                        ComputeOptions {
                            force,
                            extras: extras.clone(),
                        },
                    )
                    .await;
                self.settle(&key, &result);
                result
            }
            AnyVariable::State(state) => {
                // only the parent's status matters, not whether it resolved
                if let Err(e) = self.resolve(&state.parent, extras).await {
                    tracing::trace!(
                        error = %e,
                        "parent of state variable failed"
                    );
                }
                self.resolve_root_local(variable, extras)
                    .unwrap_or(Ok(Value::Bool(false)))
            }
            // always known locally
            AnyVariable::Plain(_) | AnyVariable::Url(_) => {
                self.resolve_root_local(variable, extras)
                    .unwrap_or(Ok(Value::Null))
            }
        }
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(uid = %derived.uid)
    )]
    async fn compute_derived(
        &self,
        derived: &DerivedVariable,
        extras: &RequestExtras,
    ) -> Result<Value> {
        let store = &self.inner.store;
        store.register_derived(derived);
        let key = CellKey::new(derived.uid.clone(), extras);
        let force = store.register_pending(&key).take_force();

        let result = async {
            let values = try_join_all(
                derived
                    .variables
                    .iter()
                    .map(|input| self.resolve(input, extras)),
            )
            .await?;
            self.inner
                .engine
                .compute(
                    derived,
                    values,
                    ComputeOptions {
                        force,
                        extras: extras.clone(),
                    },
                )
                .await
        }
        .await;
        self.settle(&key, &result);
        result
    }

    fn settle(&self, key: &CellKey, result: &Result<Value>) {
        let state = match result {
            Ok(value) => CellState::Resolved(value.clone()),
            Err(e) => CellState::Error(e.clone().into()),
        };
        self.inner.store.set_state(key, state);
    }

    fn initial_value(&self, plain: &PlainVariable) -> Value {
        plain
            .persist_value
            .then(|| self.inner.persistence.load(&plain.uid))
            .flatten()
            .unwrap_or_else(|| plain.default.clone())
    }
}

fn settled(state: CellState, fallback: &Value) -> Result<Value> {
    match state {
        CellState::Resolved(value) => Ok(value),
        CellState::Error(e) => Err(from_cell_error(e)),
        CellState::Pending => Ok(fallback.clone()),
    }
}

fn from_cell_error(error: CellError) -> RuntimeError {
    error
        .downcast_ref::<RuntimeError>()
        .cloned()
        .unwrap_or_else(|| RuntimeError::Handler(error.to_string()))
}

// `None` means the segment is null, so the whole extraction is null
fn segment_key(
    variable: &AnyVariable,
    segment: &Value,
) -> Result<Option<String>> {
    if segment.is_null() {
        return Ok(None);
    }
    value_as_key(segment).map(Some).ok_or_else(|| {
        VarError::InvalidPath {
            uid: variable.uid().clone(),
            found: segment.to_string(),
        }
        .into()
    })
}
