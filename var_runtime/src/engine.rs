//! The Derived Variable Engine: computes derived values on the server, caches
//! them, and makes sure that concurrent requests for the same inputs share a
//! single round trip.

use crate::error::{Result, RuntimeError};
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use live_channel::{ChannelError, LiveChannel};
use or_poisoned::OrPoisoned;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::{
    fmt::{Debug, Formatter},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
};
use var_client::{
    wire::{
        DataVariableRequest, DerivedVariableRequest, DerivedVariableResponse,
        Pagination,
    },
    ServerApi,
};
use var_graph::{
    extras::RequestExtras,
    variable::{CachePolicy, DataVariable, DerivedVariable, Uid},
};
use xxhash_rust::xxh3::Xxh3;

/// The identity of a cached computation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// The definition's `uid`.
    pub uid: Uid,
    /// The hash of the ordered, resolved inputs.
    pub fingerprint: u64,
    /// Where the value may be reused: `global`, `session:{id}`, `user:{extras}`
    /// or `none`.
    pub scope: Arc<str>,
}

/// Per-call options for [`DerivedEngine::compute`].
#[derive(Debug, Clone, Default)]
pub struct ComputeOptions {
    /// Skip the cache, both locally and on the server.
    pub force: bool,
    /// The request extras of the caller.
    pub extras: RequestExtras,
}

/// Counters for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Requests sent to the server.
    pub requests_issued: u64,
    /// Computations answered from the cache.
    pub cache_hits: u64,
    /// Computations that joined a request already in flight.
    pub coalesced: u64,
}

type Computation = Shared<BoxFuture<'static, Result<Value>>>;

#[derive(Default)]
struct Counters {
    requests_issued: AtomicU64,
    cache_hits: AtomicU64,
    coalesced: AtomicU64,
}

struct EngineInner {
    api: Arc<dyn ServerApi>,
    channel: Option<LiveChannel>,
    session_id: Arc<str>,
    cache: RwLock<FxHashMap<CacheKey, Value>>,
    // each entry carries an id so that a finished request never removes its
    // successor
    in_flight: Mutex<FxHashMap<CacheKey, (u64, Computation)>>,
    next_id: AtomicU64,
    counters: Counters,
}

/// Computes derived values. Cheap to clone.
#[derive(Clone)]
pub struct DerivedEngine {
    inner: Arc<EngineInner>,
}

impl Debug for DerivedEngine {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedEngine")
            .field("session_id", &self.inner.session_id)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Hashes a definition `uid` and its ordered input values.
pub fn fingerprint(uid: &str, values: &[Value]) -> Result<u64> {
    let mut hasher = Xxh3::new();
    hasher.update(uid.as_bytes());
    hasher.update(&[0]);
    hasher.update(&serde_json::to_vec(values)?);
    Ok(hasher.digest())
}

impl DerivedEngine {
    /// Creates an engine. Task results are awaited over `channel`, if there is
    /// one.
    pub fn new(
        api: Arc<dyn ServerApi>,
        channel: Option<LiveChannel>,
        session_id: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                api,
                channel,
                session_id: session_id.into(),
                cache: Default::default(),
                in_flight: Default::default(),
                next_id: AtomicU64::new(0),
                counters: Default::default(),
            }),
        }
    }

    /// The cache scope for a policy.
    pub fn scope(
        &self,
        policy: CachePolicy,
        extras: &RequestExtras,
    ) -> Arc<str> {
        match policy {
            CachePolicy::None => "none".into(),
            CachePolicy::Global => "global".into(),
            CachePolicy::Session => {
                format!("session:{}", self.inner.session_id).into()
            }
            CachePolicy::User => {
                format!("user:{}", extras.key().unwrap_or_default()).into()
            }
        }
    }

    /// Computes `definition` over its resolved input `values`.
    ///
    /// Unless `force` is set, a cached value for the same inputs in the same
    /// scope is returned without a request. Callers that ask for the same key
    /// while a request is in flight all receive that request's result.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(uid = %definition.uid)
    )]
    pub async fn compute(
        &self,
        definition: &DerivedVariable,
        values: Vec<Value>,
        options: ComputeOptions,
    ) -> Result<Value> {
        let fingerprint = fingerprint(&definition.uid, &values)?;
        let key = CacheKey {
            uid: definition.uid.clone(),
            fingerprint,
            scope: self.scope(definition.cache, &options.extras),
        };
        let request = {
            let inner = Arc::clone(&self.inner);
            let uid = definition.uid.clone();
            let force = options.force;
            let extras = options.extras.clone();
            move || {
                async move {
                    let body = DerivedVariableRequest {
                        values,
                        cache_key: format!("{fingerprint:016x}"),
                        force,
                        ws_channel: inner.channel_id(),
                    };
                    let res =
                        inner.api.derived_variable(&uid, body, &extras).await?;
                    inner.settle(res, &extras).await
                }
                .boxed()
            }
        };
        self.run(key, definition.cache, options.force, request).await
    }

    /// Fetches one page of a server-side data variable.
    pub async fn fetch_data(
        &self,
        definition: &DataVariable,
        pagination: Option<Pagination>,
        options: ComputeOptions,
    ) -> Result<Value> {
        let inputs = [
            definition.filters.clone().unwrap_or_default(),
            serde_json::to_value(pagination)?,
        ];
        let fingerprint = fingerprint(&definition.uid, &inputs)?;
        let key = CacheKey {
            uid: definition.uid.clone(),
            fingerprint,
            scope: self.scope(definition.cache, &options.extras),
        };
        let request = {
            let inner = Arc::clone(&self.inner);
            let uid = definition.uid.clone();
            let filters = definition.filters.clone();
            let extras = options.extras.clone();
            move || {
                async move {
                    let body = DataVariableRequest {
                        filters,
                        pagination,
                        cache_key: format!("{fingerprint:016x}"),
                        ws_channel: inner.channel_id(),
                    };
                    let res =
                        inner.api.data_variable(&uid, body, &extras).await?;
                    inner.settle(res, &extras).await
                }
                .boxed()
            }
        };
        self.run(key, definition.cache, options.force, request).await
    }

    // an outstanding request is joined before the cache is read: it may be a
    // forced refresh of the cached entry
    async fn run(
        &self,
        key: CacheKey,
        policy: CachePolicy,
        force: bool,
        request: impl FnOnce() -> BoxFuture<'static, Result<Value>>,
    ) -> Result<Value> {
        let cacheable = policy != CachePolicy::None;
        let computation = {
            let mut in_flight = self.inner.in_flight.lock().or_poisoned();
            if let Some((_, computation)) = in_flight.get(&key) {
                self.inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    fingerprint = key.fingerprint,
                    "joining request in flight"
                );
                computation.clone()
            } else {
                if cacheable && !force {
                    let cached = self
                        .inner
                        .cache
                        .read()
                        .or_poisoned()
                        .get(&key)
                        .cloned();
                    if let Some(value) = cached {
                        self.inner
                            .counters
                            .cache_hits
                            .fetch_add(1, Ordering::Relaxed);
                        tracing::trace!(
                            fingerprint = key.fingerprint,
                            "cache hit"
                        );
                        return Ok(value);
                    }
                }
                let computation = self.start(key.clone(), cacheable, request());
                in_flight.insert(key, computation.clone());
                computation.1
            }
        };
        computation.await
    }

    fn start(
        &self,
        key: CacheKey,
        cacheable: bool,
        fut: BoxFuture<'static, Result<Value>>,
    ) -> (u64, Computation) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        let computation = async move {
            inner.counters.requests_issued.fetch_add(1, Ordering::Relaxed);
            let result = fut.await;
            if let (true, Ok(value)) = (cacheable, &result) {
                inner
                    .cache
                    .write()
                    .or_poisoned()
                    .insert(key.clone(), value.clone());
            }
            let mut in_flight = inner.in_flight.lock().or_poisoned();
            if in_flight
                .get(&key)
                .is_some_and(|(current, _)| *current == id)
            {
                in_flight.remove(&key);
            }
            result
        }
        .boxed()
        .shared();
        (id, computation)
    }

    /// Drops every cached value in the scope of the given session.
    pub fn clear_session(&self, session_id: &str) {
        let scope = format!("session:{session_id}");
        self.inner
            .cache
            .write()
            .or_poisoned()
            .retain(|key, _| *key.scope != *scope);
    }

    /// Drops every cached value.
    pub fn clear(&self) {
        self.inner.cache.write().or_poisoned().clear();
    }

    /// A snapshot of the engine's counters.
    pub fn stats(&self) -> EngineStats {
        let counters = &self.inner.counters;
        EngineStats {
            requests_issued: counters.requests_issued.load(Ordering::Relaxed),
            cache_hits: counters.cache_hits.load(Ordering::Relaxed),
            coalesced: counters.coalesced.load(Ordering::Relaxed),
        }
    }
}

impl EngineInner {
    fn channel_id(&self) -> Option<String> {
        self.channel.as_ref().and_then(LiveChannel::channel_id)
    }

    // a task response is only final once the task completes and its result is
    // fetched
    async fn settle(
        &self,
        res: DerivedVariableResponse,
        extras: &RequestExtras,
    ) -> Result<Value> {
        match res {
            DerivedVariableResponse::Value { value } => Ok(value),
            DerivedVariableResponse::Task { task_id } => {
                let channel = self
                    .channel
                    .as_ref()
                    .ok_or(RuntimeError::Channel(ChannelError::Closed))?;
                tracing::debug!(%task_id, "waiting for task");
                channel
                    .wait_for_task(&task_id)
                    .await
                    .map_err(RuntimeError::from_task)?;
                Ok(self.api.task_result(&task_id, extras).await?)
            }
        }
    }
}
