use crate::error::{Result, RuntimeError};
use any_spawner::Executor;
use live_channel::{message::ServerMessage, LiveChannel};
use or_poisoned::OrPoisoned;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::{
    collections::BTreeMap,
    fmt::{Debug, Formatter},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use var_client::{wire::StoreWriteRequest, ServerApi};
use var_graph::{
    extras::RequestExtras,
    store::{CellKey, VariableStore},
    variable::{BackendStoreRef, Uid},
};

/// How backend stores are kept in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendStoreOptions {
    /// How long local writes are held back, so that a burst of writes sends
    /// only the last value.
    pub debounce: Duration,
    /// Fetch the full value again after dropping a patch whose sequence number
    /// did not follow on. Off by default: the store keeps its last good value
    /// until the next full push.
    pub resync_on_mismatch: bool,
}

impl Default for BackendStoreOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            resync_on_mismatch: false,
        }
    }
}

#[derive(Debug, Default)]
struct StoreSync {
    // the last applied sequence number; `None` until the first full value
    sequence: Option<u64>,
    variables: Vec<Uid>,
    mounted: bool,
    extras: RequestExtras,
}

type WriteKey = (Uid, Option<Arc<str>>);

struct BackendInner {
    store: Arc<VariableStore>,
    api: Arc<dyn ServerApi>,
    channel: Option<LiveChannel>,
    options: BackendStoreOptions,
    stores: Mutex<FxHashMap<Uid, StoreSync>>,
    // the generation of the newest write waiting out its debounce, per key;
    // generations come from `next_write` and are never reused
    writes: Mutex<FxHashMap<WriteKey, u64>>,
    next_write: AtomicU64,
}

/// Synchronizes variables bound to server-held stores.
///
/// Every binding of a variable shares one cell (keyed by `uid` alone), so
/// bindings see each other's writes immediately. Server traffic is scoped by
/// the request extras of the write.
#[derive(Clone)]
pub struct BackendStores {
    inner: Arc<BackendInner>,
}

impl Debug for BackendStores {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendStores")
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl BackendStores {
    /// Creates the synchronizer.
    pub fn new(
        store: Arc<VariableStore>,
        api: Arc<dyn ServerApi>,
        channel: Option<LiveChannel>,
        options: BackendStoreOptions,
    ) -> Self {
        Self {
            inner: Arc::new(BackendInner {
                store,
                api,
                channel,
                options,
                stores: Default::default(),
                writes: Default::default(),
                next_write: AtomicU64::new(0),
            }),
        }
    }

    /// Binds `variable` to a store. The first binding of a store fetches its
    /// current value in the background.
    pub fn mount(
        &self,
        variable: &Uid,
        store: &BackendStoreRef,
        extras: &RequestExtras,
    ) {
        let first = {
            let mut stores = self.inner.stores.lock().or_poisoned();
            let sync = stores.entry(store.uid.clone()).or_default();
            if !sync.variables.contains(variable) {
                sync.variables.push(variable.clone());
            }
            let first = !sync.mounted;
            if first {
                sync.mounted = true;
                sync.extras = extras.clone();
            }
            first
        };
        if first {
            let this = self.clone();
            let store_uid = store.uid.clone();
            let extras = extras.clone();
            Executor::spawn(async move {
                if let Err(e) = this.fetch(&store_uid, &extras).await {
                    tracing::error!(
                        %store_uid,
                        error = %e,
                        "could not fetch backend store"
                    );
                }
            });
        }
    }

    /// Fetches the full value of a store and applies it.
    pub async fn fetch(
        &self,
        store_uid: &Uid,
        extras: &RequestExtras,
    ) -> Result<()> {
        let current = self.inner.api.get_store(store_uid, extras).await?;
        self.apply_value(store_uid, current.value, current.sequence_number);
        Ok(())
    }

    /// The last sequence number applied to a store.
    pub fn sequence(&self, store_uid: &str) -> Option<u64> {
        self.inner
            .stores
            .lock()
            .or_poisoned()
            .get(store_uid)
            .and_then(|sync| sync.sequence)
    }

    /// Replaces the value of a store. The sequence restarts from
    /// `sequence_number`.
    pub fn apply_value(
        &self,
        store_uid: &str,
        value: Value,
        sequence_number: u64,
    ) {
        let variables = {
            let mut stores = self.inner.stores.lock().or_poisoned();
            let sync = stores.entry(Uid::from(store_uid)).or_default();
            sync.sequence = Some(sequence_number);
            sync.variables.clone()
        };
        tracing::trace!(%store_uid, sequence_number, "backend store replaced");
        self.set_cells(&variables, value);
    }

    /// Applies a list of JSON Patch operations to a store.
    ///
    /// The patch is only applied if `sequence_number` directly follows the last
    /// applied one. Otherwise it is dropped, the store keeps its value, and
    /// [`RuntimeError::SequenceMismatch`] is returned.
    pub fn apply_patch(
        &self,
        store_uid: &str,
        patches: &Value,
        sequence_number: u64,
    ) -> Result<()> {
        let (variables, value) = {
            let mut stores = self.inner.stores.lock().or_poisoned();
            let sync = stores.entry(Uid::from(store_uid)).or_default();
            let expected = sync.sequence.map(|seq| seq + 1);
            if expected != Some(sequence_number) {
                let extras = sync.extras.clone();
                drop(stores);
                if self.inner.options.resync_on_mismatch {
                    self.resync(store_uid, extras);
                }
                return Err(RuntimeError::SequenceMismatch {
                    store_uid: store_uid.to_string(),
                    expected,
                    received: sequence_number,
                });
            }

            let invalid = |message: String| RuntimeError::InvalidPatch {
                store_uid: store_uid.to_string(),
                message,
            };
            let ops: json_patch::Patch = serde_json::from_value(patches.clone())
                .map_err(|e| invalid(e.to_string()))?;
            let mut value = sync
                .variables
                .first()
                .and_then(|uid| {
                    self.inner.store.get(&CellKey::shared(uid.clone()))
                })
                .unwrap_or(Value::Null);
            json_patch::patch(&mut value, &ops.0)
                .map_err(|e| invalid(e.to_string()))?;

            sync.sequence = Some(sequence_number);
            (sync.variables.clone(), value)
        };
        tracing::trace!(%store_uid, sequence_number, "backend store patched");
        self.set_cells(&variables, value);
        Ok(())
    }

    /// Applies a store update pushed over the live channel. Other messages are
    /// ignored.
    pub fn handle_message(&self, message: &ServerMessage) {
        match message {
            ServerMessage::StoreValue(push) => self.apply_value(
                &push.store_uid,
                push.value.clone(),
                push.sequence_number,
            ),
            ServerMessage::StorePatch(push) => {
                if let Err(e) = self.apply_patch(
                    &push.store_uid,
                    &push.patches,
                    push.sequence_number,
                ) {
                    tracing::warn!(error = %e, "dropping backend store patch");
                }
            }
            _ => {}
        }
    }

    /// Writes a value through a variable bound to a store.
    ///
    /// Every binding of the store sees the value at once. Unless the store is
    /// readonly, the value is then sent to the server after the debounce delay,
    /// unless another write under the same extras supersedes it first.
    pub fn write(
        &self,
        variable: &Uid,
        store: &BackendStoreRef,
        value: Value,
        extras: &RequestExtras,
    ) {
        let variables = {
            let mut stores = self.inner.stores.lock().or_poisoned();
            let sync = stores.entry(store.uid.clone()).or_default();
            if !sync.variables.contains(variable) {
                sync.variables.push(variable.clone());
            }
            sync.variables.clone()
        };
        self.set_cells(&variables, value.clone());
        if store.readonly {
            return;
        }

        let key = (store.uid.clone(), extras.key());
        let generation =
            self.inner.next_write.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner
            .writes
            .lock()
            .or_poisoned()
            .insert(key.clone(), generation);
        let this = self.clone();
        let extras = extras.clone();
        Executor::spawn(async move {
            tokio::time::sleep(this.inner.options.debounce).await;
            {
                let mut writes = this.inner.writes.lock().or_poisoned();
                if writes.get(&key) != Some(&generation) {
                    return;
                }
                writes.remove(&key);
            }
            let (store_uid, _) = key;
            let request = StoreWriteRequest {
                values: BTreeMap::from([(store_uid.to_string(), value)]),
                ws_channel: this
                    .inner
                    .channel
                    .as_ref()
                    .and_then(LiveChannel::channel_id),
            };
            if let Err(e) = this.inner.api.write_store(request, &extras).await
            {
                tracing::error!(
                    %store_uid,
                    error = %e,
                    "could not write backend store"
                );
            }
        });
    }

    /// The number of writes still waiting out their debounce.
    pub fn pending_writes(&self) -> usize {
        self.inner.writes.lock().or_poisoned().len()
    }

    fn resync(&self, store_uid: &str, extras: RequestExtras) {
        tracing::debug!(
            %store_uid,
            "refetching backend store after a sequence gap"
        );
        let this = self.clone();
        let store_uid = Uid::from(store_uid);
        Executor::spawn(async move {
            if let Err(e) = this.fetch(&store_uid, &extras).await {
                tracing::error!(
                    %store_uid,
                    error = %e,
                    "could not refetch backend store"
                );
            }
        });
    }

    fn set_cells(&self, variables: &[Uid], value: Value) {
        for uid in variables {
            self.inner
                .store
                .set(&CellKey::shared(uid.clone()), value.clone());
        }
    }
}
