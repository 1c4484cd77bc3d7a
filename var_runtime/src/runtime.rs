use crate::{
    action::{register_builtins, ActionContext, ActionDef, ActionHandler},
    engine::{DerivedEngine, EngineStats},
    error::{Result, RuntimeError},
    location::{query_value, Location},
    notification::Notifications,
    persistence::{
        BackendStoreOptions, BackendStores, MemoryStorage, Persistence,
        StorageArea, StorageEvent,
    },
    registry::{Manifest, Registered, Registry},
};
use any_spawner::Executor;
use futures::{Stream, StreamExt};
use live_channel::{message::Inbound, LiveChannel};
use or_poisoned::OrPoisoned;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::{
    fmt::{Debug, Formatter},
    future::Future,
    sync::{Arc, RwLock, Weak},
};
use typed_builder::TypedBuilder;
use var_client::ServerApi;
use var_config::RuntimeOptions;
use var_graph::{
    extras::RequestExtras,
    store::{CellEvent, CellKey, CellState, Subscription, VariableStore},
    variable::{AnyVariable, PlainVariable, Uid},
};

/// The session id used when no auth session is supplied.
pub const ANONYMOUS_SESSION: &str = "anonymous";

/// Everything a [`Runtime`] is built from.
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use var_client::reqwest::ReqwestClient;
/// use var_runtime::{Runtime, RuntimeConfig};
///
/// # fn build(api: ReqwestClient) -> Runtime {
/// let runtime: Runtime = RuntimeConfig::builder()
///     .api(Arc::new(api))
///     .session_id("session-token")
///     .build();
/// # runtime
/// # }
/// ```
#[derive(TypedBuilder)]
#[builder(build_method(into = Runtime))]
pub struct RuntimeConfig {
    /// The server endpoints.
    api: Arc<dyn ServerApi>,
    /// The live channel. Without one, tasks and server-side actions fail with
    /// [`ChannelError::Closed`](live_channel::ChannelError::Closed).
    #[builder(default, setter(strip_option))]
    channel: Option<LiveChannel>,
    /// Runtime options.
    #[builder(default)]
    options: RuntimeOptions,
    /// The auth session persisted values and session-scoped caches belong to.
    /// Tabs of the same session share persisted values; keys left by any other
    /// session are purged by [`Runtime::clean_session_cache`]. Defaults to
    /// [`ANONYMOUS_SESSION`].
    #[builder(default = ANONYMOUS_SESSION.to_string(), setter(into))]
    session_id: String,
    /// The storage tier shared between tabs.
    #[builder(default = Arc::new(MemoryStorage::new()))]
    local_storage: Arc<dyn StorageArea>,
    /// The storage tier private to this tab.
    #[builder(default = Arc::new(MemoryStorage::new()))]
    session_storage: Arc<dyn StorageArea>,
    /// The initial page URL.
    #[builder(default)]
    location: Location,
    /// What the server declared at startup.
    #[builder(default)]
    manifest: Manifest,
    /// Refetch a backend store after dropping an out-of-sequence patch.
    #[builder(default)]
    resync_on_mismatch: bool,
}

pub(crate) struct RuntimeInner {
    options: RuntimeOptions,
    session_id: Arc<str>,
    pub(crate) store: Arc<VariableStore>,
    pub(crate) registry: Registry,
    pub(crate) engine: DerivedEngine,
    api: Arc<dyn ServerApi>,
    channel: Option<LiveChannel>,
    pub(crate) persistence: Persistence,
    pub(crate) backend: BackendStores,
    pub(crate) location: RwLock<Location>,
    notifications: Notifications,
    handlers: RwLock<FxHashMap<String, ActionHandler>>,
    catch_all: RwLock<Option<ActionHandler>>,
}

/// The client-side variable runtime: resolves variables, keeps them in sync
/// with storage and the server, and runs actions.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Arc<RuntimeInner>,
}

impl Debug for Runtime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("session_id", &self.inner.session_id)
            .field("location", &self.inner.location.read().or_poisoned().href())
            .field("engine", &self.inner.engine)
            .finish_non_exhaustive()
    }
}

impl From<RuntimeConfig> for Runtime {
    fn from(config: RuntimeConfig) -> Self {
        let session_id: Arc<str> = config.session_id.into();
        let store = Arc::new(VariableStore::new());
        let engine = DerivedEngine::new(
            Arc::clone(&config.api),
            config.channel.clone(),
            Arc::clone(&session_id),
        );
        let backend = BackendStores::new(
            Arc::clone(&store),
            Arc::clone(&config.api),
            config.channel.clone(),
            BackendStoreOptions {
                debounce: config.options.persist_debounce(),
                resync_on_mismatch: config.resync_on_mismatch,
            },
        );
        let persistence = Persistence::new(
            Arc::clone(&session_id),
            config.local_storage,
            config.session_storage,
        );
        let runtime = Runtime {
            inner: Arc::new(RuntimeInner {
                options: config.options,
                session_id,
                store,
                registry: Registry::from_manifest(config.manifest),
                engine,
                api: config.api,
                channel: config.channel,
                persistence,
                backend,
                location: RwLock::new(config.location),
                notifications: Notifications::default(),
                handlers: Default::default(),
                catch_all: Default::default(),
            }),
        };
        register_builtins(&runtime);
        if let Some(channel) = &runtime.inner.channel {
            runtime.listen_channel(channel.subscribe());
        }
        runtime
    }
}

impl Runtime {
    /// The options the runtime was built with.
    pub fn options(&self) -> &RuntimeOptions {
        &self.inner.options
    }

    /// The id of this browser-tab session.
    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// The Variable Store.
    pub fn store(&self) -> &Arc<VariableStore> {
        &self.inner.store
    }

    /// The registries populated from the manifest.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// The live channel, if there is one.
    pub fn channel(&self) -> Option<&LiveChannel> {
        self.inner.channel.as_ref()
    }

    /// The server endpoints.
    pub fn api(&self) -> &Arc<dyn ServerApi> {
        &self.inner.api
    }

    /// The backend store synchronizer.
    pub fn backend_stores(&self) -> &BackendStores {
        &self.inner.backend
    }

    /// Notifications waiting to be shown.
    pub fn notifications(&self) -> &Notifications {
        &self.inner.notifications
    }

    /// The current page URL.
    pub fn location(&self) -> Location {
        self.inner.location.read().or_poisoned().clone()
    }

    /// Derived engine counters.
    pub fn stats(&self) -> EngineStats {
        self.inner.engine.stats()
    }

    /// Looks `uid` up among the variables, actions, and components the server
    /// declared.
    pub fn lookup(&self, uid: &str) -> Result<Registered> {
        self.inner.registry.resolve_uid(uid)
    }

    /// Resolves the variable registered under `uid`.
    pub async fn resolve_uid(
        &self,
        uid: &str,
        extras: &RequestExtras,
    ) -> Result<Value> {
        match self.lookup(uid)? {
            Registered::Variable(variable) => {
                self.resolve(&variable, extras).await
            }
            _ => Err(var_graph::VarError::UnresolvableVariable {
                uid: uid.into(),
            }
            .into()),
        }
    }

    /// Registers a handler for actions named `name`, replacing any previous
    /// one.
    pub fn register_handler<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(ActionContext, ActionDef) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: ActionHandler =
            Arc::new(move |ctx, action| Box::pin(handler(ctx, action)));
        self.inner
            .handlers
            .write()
            .or_poisoned()
            .insert(name.into(), handler);
    }

    /// Sets the handler used for actions that no other handler is registered
    /// for.
    pub fn set_catch_all<F, Fut>(&self, handler: F)
    where
        F: Fn(ActionContext, ActionDef) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let handler: ActionHandler =
            Arc::new(move |ctx, action| Box::pin(handler(ctx, action)));
        *self.inner.catch_all.write().or_poisoned() = Some(handler);
    }

    pub(crate) fn handler(&self, name: &str) -> Option<ActionHandler> {
        self.inner
            .handlers
            .read()
            .or_poisoned()
            .get(name)
            .cloned()
            .or_else(|| self.inner.catch_all.read().or_poisoned().clone())
    }

    /// The cell `variable` is stored in under `extras`.
    pub fn cell_key(
        &self,
        variable: &AnyVariable,
        extras: &RequestExtras,
    ) -> CellKey {
        match variable {
            AnyVariable::Plain(PlainVariable { store: Some(_), .. }) => {
                CellKey::shared(variable.uid().clone())
            }
            _ => CellKey::new(variable.uid().clone(), extras),
        }
    }

    /// Calls `callback` whenever the cell of `variable` changes, until the
    /// subscription is dropped. The cell is created if it does not exist yet.
    pub fn subscribe(
        &self,
        variable: &AnyVariable,
        extras: &RequestExtras,
        callback: impl Fn(&CellEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let key = self.cell_key(variable, extras);
        let cell = match variable {
            AnyVariable::Derived(_) => self.inner.store.register_pending(&key),
            _ => {
                // seeds the cell the way a read would
                _ = self.try_resolve_sync(variable, extras);
                self.inner.store.register_pending(&key)
            }
        };
        cell.subscribe(callback)
    }

    /// Writes a value to a client-writable variable.
    ///
    /// A persisted variable is saved to storage, a variable bound to a backend
    /// store is sent to the server, and a URL variable updates the query
    /// string. In every case, the local cell is updated at once and its
    /// dependents are invalidated.
    #[tracing::instrument(
        level = "debug",
        skip(self, value, extras),
        fields(uid = %variable.uid())
    )]
    pub fn set(
        &self,
        variable: &AnyVariable,
        value: Value,
        extras: &RequestExtras,
    ) -> Result<()> {
        match variable {
            AnyVariable::Plain(plain) => {
                let value = if plain.nested.is_empty() {
                    value
                } else {
                    self.set_nested(variable, value, extras)?
                };
                if let Some(store) = &plain.store {
                    self.inner.backend.write(&plain.uid, store, value, extras);
                    return Ok(());
                }
                if plain.persist_value {
                    self.inner.persistence.save(&plain.uid, &value)?;
                }
                self.inner
                    .store
                    .set(&self.cell_key(variable, extras), value);
                Ok(())
            }
            AnyVariable::Url(url) => {
                self.inner
                    .location
                    .write()
                    .or_poisoned()
                    .set_query(&url.query, query_value(&value).as_deref());
                let key = self.cell_key(variable, extras);
                self.inner.store.register(&key, || Value::Null);
                for cell in self.inner.store.cells_for(&url.uid) {
                    self.inner.store.set(cell.key(), value.clone());
                }
                Ok(())
            }
            _ => Err(RuntimeError::NotWritable {
                uid: variable.uid().to_string(),
                kind: variable.kind(),
            }),
        }
    }

    // the full value of a plain variable after writing `value` at its nested
    // path
    fn set_nested(
        &self,
        variable: &AnyVariable,
        value: Value,
        extras: &RequestExtras,
    ) -> Result<Value> {
        let keys = self.nested_keys_sync(variable, extras)?;
        let mut root = self
            .resolve_root_local(variable, extras)
            .transpose()?
            .unwrap_or(Value::Null);
        let mut target = &mut root;
        for key in &keys {
            let invalid = || var_graph::VarError::InvalidPath {
                uid: variable.uid().clone(),
                found: key.clone(),
            };
            target = match target {
                Value::Array(items) => key
                    .parse::<usize>()
                    .ok()
                    .and_then(|idx| items.get_mut(idx))
                    .ok_or_else(invalid)?,
                other => {
                    if !other.is_object() {
                        *other = Value::Object(Default::default());
                    }
                    other
                        .as_object_mut()
                        .map(|map| {
                            map.entry(key.clone()).or_insert(Value::Null)
                        })
                        .ok_or_else(invalid)?
                }
            };
        }
        *target = value;
        Ok(root)
    }

    /// Restores a variable to its initial state.
    ///
    /// A plain or URL variable gets its default back and every derived variable
    /// that depends on it recomputes, bypassing the cache once. A derived
    /// variable recomputes bypassing the cache; its own dependents recompute
    /// normally.
    pub fn reset(&self, variable: &AnyVariable) -> Result<()> {
        let store = &self.inner.store;
        let uid = variable.uid();
        match variable {
            AnyVariable::Plain(plain) => {
                if plain.persist_value {
                    self.inner.persistence.save(uid, &plain.default)?;
                }
                for cell in store.cells_for(uid) {
                    store.set_state(
                        cell.key(),
                        CellState::Resolved(plain.default.clone()),
                    );
                }
                store.invalidate_dependents(uid, true);
            }
            AnyVariable::Url(url) => {
                self.inner
                    .location
                    .write()
                    .or_poisoned()
                    .set_query(
                        &url.query,
                        query_value(&url.default).as_deref(),
                    );
                for cell in store.cells_for(uid) {
                    store.set_state(
                        cell.key(),
                        CellState::Resolved(url.default.clone()),
                    );
                }
                store.invalidate_dependents(uid, true);
            }
            AnyVariable::Derived(_) | AnyVariable::Data(_) => {
                store.mark_dirty(uid, true);
                store.invalidate_dependents(uid, false);
            }
            AnyVariable::State(_) => {}
        }
        tracing::debug!(%uid, kind = variable.kind(), "variable reset");
        Ok(())
    }

    /// Recomputes a derived variable and returns its new value.
    pub async fn trigger(
        &self,
        variable: &AnyVariable,
        force: bool,
        extras: &RequestExtras,
    ) -> Result<Value> {
        let uid = variable.uid();
        self.inner.store.mark_dirty(uid, force);
        self.inner.store.invalidate_dependents(uid, false);
        self.resolve(variable, extras).await
    }

    /// Moves to `target` and reseeds every URL variable from the new query
    /// string.
    pub fn navigate(&self, target: &str) -> Result<()> {
        let location = {
            let mut location = self.inner.location.write().or_poisoned();
            location.navigate(target)?;
            location.clone()
        };
        tracing::debug!(href = %location.href(), "navigated");
        for variable in self.inner.registry.variables() {
            let AnyVariable::Url(url) = variable else {
                continue;
            };
            let value = location
                .query(&url.query)
                .map(Value::String)
                .unwrap_or_else(|| url.default.clone());
            for cell in self.inner.store.cells_for(&url.uid) {
                if cell.value().as_ref() != Some(&value) {
                    self.inner.store.set(cell.key(), value.clone());
                }
            }
        }
        Ok(())
    }

    /// Applies a change another tab made to a persisted variable.
    pub fn handle_storage_event(&self, event: &StorageEvent) {
        let Some((uid, value)) = self.inner.persistence.read_event(event)
        else {
            return;
        };
        tracing::trace!(%uid, "value changed in another tab");
        self.apply_external(&uid, value);
    }

    /// Applies every storage event from `events`, for as long as the runtime is
    /// alive.
    pub fn listen_storage(
        &self,
        mut events: impl Stream<Item = StorageEvent> + Send + Unpin + 'static,
    ) {
        let runtime = Arc::downgrade(&self.inner);
        Executor::spawn(async move {
            while let Some(event) = events.next().await {
                let Some(inner) = runtime.upgrade() else {
                    break;
                };
                Runtime { inner }.handle_storage_event(&event);
            }
        });
    }

    fn listen_channel(
        &self,
        mut messages: impl Stream<Item = Inbound> + Send + Unpin + 'static,
    ) {
        let runtime: Weak<RuntimeInner> = Arc::downgrade(&self.inner);
        Executor::spawn(async move {
            while let Some(inbound) = messages.next().await {
                let Some(inner) = runtime.upgrade() else {
                    break;
                };
                if let Inbound::Message(message) = inbound {
                    inner.backend.handle_message(&message);
                }
            }
        });
    }

    fn apply_external(&self, uid: &Uid, value: Value) {
        for cell in self.inner.store.cells_for(uid) {
            self.inner.store.set(cell.key(), value.clone());
        }
    }

    /// Removes persisted values that belong to other sessions. Returns how many
    /// were removed.
    pub fn clean_session_cache(&self) -> usize {
        self.inner
            .persistence
            .clean_session_cache(&self.inner.session_id)
    }

    /// Drops every cell, cached value, and registry entry.
    pub fn clear(&self) {
        self.inner.store.clear();
        self.inner.engine.clear();
        self.inner.registry.clear();
    }
}
