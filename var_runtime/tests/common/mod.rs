#![allow(dead_code)]

use futures::{channel::mpsc, future};
use live_channel::{
    connector::{Connector, FrameSink, FrameStream, PinnedFuture},
    ChannelError, ChannelOptions, LiveChannel,
};
use serde_json::{json, Value};
use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};
use var_client::{
    wire::{
        ActionRequest, ActionResponse, DataVariableRequest,
        DerivedVariableRequest, DerivedVariableResponse, StoreValue,
        StoreWriteRequest,
    },
    ClientError, ServerApi,
};
use var_graph::extras::RequestExtras;
use var_runtime::{Runtime, RuntimeConfig};

type DerivedResult = Result<DerivedVariableResponse, ClientError>;
type DerivedFn =
    Arc<dyn Fn(&str, &DerivedVariableRequest) -> DerivedResult + Send + Sync>;
type ActionFn = Arc<dyn Fn(&ActionRequest) -> ActionResponse + Send + Sync>;

/// A programmable server. Derived variables sum their numeric inputs unless
/// told otherwise.
#[derive(Clone)]
pub struct MockApi {
    inner: Arc<MockState>,
}

struct MockState {
    derived: Mutex<DerivedFn>,
    delay: Mutex<Duration>,
    derived_calls: Mutex<Vec<(String, DerivedVariableRequest)>>,
    stores: Mutex<HashMap<String, StoreValue>>,
    store_reads: Mutex<Vec<String>>,
    store_writes: Mutex<Vec<(StoreWriteRequest, RequestExtras)>>,
    actions: Mutex<Vec<ActionRequest>>,
    on_action: Mutex<ActionFn>,
    task_results: Mutex<HashMap<String, Value>>,
}

impl Default for MockApi {
    fn default() -> Self {
        Self {
            inner: Arc::new(MockState {
                derived: Mutex::new(Arc::new(|_, req| {
                    let sum: f64 =
                        req.values.iter().filter_map(Value::as_f64).sum();
                    Ok(DerivedVariableResponse::Value { value: json!(sum) })
                })),
                delay: Mutex::new(Duration::ZERO),
                derived_calls: Default::default(),
                stores: Default::default(),
                store_reads: Default::default(),
                store_writes: Default::default(),
                actions: Default::default(),
                on_action: Mutex::new(Arc::new(|_| ActionResponse::default())),
                task_results: Default::default(),
            }),
        }
    }
}

impl MockApi {
    pub fn on_derived(
        &self,
        f: impl Fn(&str, &DerivedVariableRequest) -> DerivedResult
            + Send
            + Sync
            + 'static,
    ) {
        *self.inner.derived.lock().unwrap() = Arc::new(f);
    }

    pub fn on_action(
        &self,
        f: impl Fn(&ActionRequest) -> ActionResponse + Send + Sync + 'static,
    ) {
        *self.inner.on_action.lock().unwrap() = Arc::new(f);
    }

    /// Every derived request waits this long before it is answered.
    pub fn set_delay(&self, delay: Duration) {
        *self.inner.delay.lock().unwrap() = delay;
    }

    pub fn set_store(
        &self,
        store_uid: &str,
        value: Value,
        sequence_number: u64,
    ) {
        self.inner.stores.lock().unwrap().insert(
            store_uid.to_string(),
            StoreValue {
                value,
                sequence_number,
            },
        );
    }

    pub fn set_task_result(&self, task_id: &str, value: Value) {
        self.inner
            .task_results
            .lock()
            .unwrap()
            .insert(task_id.to_string(), value);
    }

    pub fn derived_calls(&self) -> Vec<(String, DerivedVariableRequest)> {
        self.inner.derived_calls.lock().unwrap().clone()
    }

    pub fn store_reads(&self) -> Vec<String> {
        self.inner.store_reads.lock().unwrap().clone()
    }

    pub fn store_writes(&self) -> Vec<(StoreWriteRequest, RequestExtras)> {
        self.inner.store_writes.lock().unwrap().clone()
    }

    pub fn actions(&self) -> Vec<ActionRequest> {
        self.inner.actions.lock().unwrap().clone()
    }
}

impl ServerApi for MockApi {
    fn derived_variable(
        &self,
        uid: &str,
        request: DerivedVariableRequest,
        _extras: &RequestExtras,
    ) -> var_client::PinnedFuture<Result<DerivedVariableResponse, ClientError>>
    {
        self.inner
            .derived_calls
            .lock()
            .unwrap()
            .push((uid.to_string(), request.clone()));
        let f = self.inner.derived.lock().unwrap().clone();
        let delay = *self.inner.delay.lock().unwrap();
        let uid = uid.to_string();
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            f(&uid, &request)
        })
    }

    fn data_variable(
        &self,
        _uid: &str,
        request: DataVariableRequest,
        _extras: &RequestExtras,
    ) -> var_client::PinnedFuture<Result<DerivedVariableResponse, ClientError>>
    {
        let value = json!({ "filters": request.filters, "rows": [] });
        Box::pin(future::ready(Ok(DerivedVariableResponse::Value { value })))
    }

    fn action(
        &self,
        _uid: &str,
        request: ActionRequest,
        _extras: &RequestExtras,
    ) -> var_client::PinnedFuture<Result<ActionResponse, ClientError>> {
        self.inner.actions.lock().unwrap().push(request.clone());
        let f = self.inner.on_action.lock().unwrap().clone();
        let response = f(&request);
        Box::pin(future::ready(Ok(response)))
    }

    fn task_result(
        &self,
        task_id: &str,
        _extras: &RequestExtras,
    ) -> var_client::PinnedFuture<Result<Value, ClientError>> {
        let result = self
            .inner
            .task_results
            .lock()
            .unwrap()
            .get(task_id)
            .cloned()
            .ok_or_else(|| ClientError::Status {
                status: 404,
                body: format!("no result for {task_id}"),
            });
        Box::pin(future::ready(result))
    }

    fn get_store(
        &self,
        store_uid: &str,
        _extras: &RequestExtras,
    ) -> var_client::PinnedFuture<Result<StoreValue, ClientError>> {
        self.inner
            .store_reads
            .lock()
            .unwrap()
            .push(store_uid.to_string());
        let result = self
            .inner
            .stores
            .lock()
            .unwrap()
            .get(store_uid)
            .cloned()
            .ok_or_else(|| ClientError::Status {
                status: 404,
                body: format!("no store {store_uid}"),
            });
        Box::pin(future::ready(result))
    }

    fn write_store(
        &self,
        request: StoreWriteRequest,
        extras: &RequestExtras,
    ) -> var_client::PinnedFuture<Result<(), ClientError>> {
        self.inner
            .store_writes
            .lock()
            .unwrap()
            .push((request, extras.clone()));
        Box::pin(future::ready(Ok(())))
    }
}

/// An in-memory live channel server. Every connect sends the handshake with
/// channel id `chan-{n}`.
#[derive(Clone, Default)]
pub struct FakeServer {
    inner: Arc<Mutex<FakeState>>,
}

#[derive(Default)]
struct FakeState {
    connects: usize,
    to_client: Option<mpsc::UnboundedSender<Result<String, ChannelError>>>,
}

impl Connector for FakeServer {
    fn connect(
        &self,
        _url: &str,
    ) -> PinnedFuture<Result<(FrameStream, FrameSink), ChannelError>> {
        let mut state = self.inner.lock().unwrap();
        state.connects += 1;
        let (tx, rx) = mpsc::unbounded();
        let init = json!({
            "type": "init",
            "message": { "channel_id": format!("chan-{}", state.connects) }
        });
        tx.unbounded_send(Ok(init.to_string())).unwrap();
        state.to_client = Some(tx);

        let sink = futures::sink::unfold((), |(), _frame: String| {
            future::ready(Ok::<_, ChannelError>(()))
        });
        Box::pin(future::ready(Ok((
            Box::pin(rx) as FrameStream,
            Box::pin(sink) as FrameSink,
        ))))
    }
}

impl FakeServer {
    /// Sends a `message` frame.
    pub fn push(&self, message: Value) {
        let frame = json!({ "type": "message", "message": message });
        self.inner
            .lock()
            .unwrap()
            .to_client
            .as_ref()
            .expect("no open connection")
            .unbounded_send(Ok(frame.to_string()))
            .unwrap();
    }

    pub fn channel(&self) -> LiveChannel {
        LiveChannel::connect(
            ChannelOptions::new("ws://localhost/api/core/ws"),
            self.clone(),
        )
    }
}

pub fn runtime(api: &MockApi) -> Runtime {
    RuntimeConfig::builder()
        .api(Arc::new(api.clone()))
        .session_id("session-1")
        .build()
}

pub async fn runtime_with_channel(
    api: &MockApi,
    server: &FakeServer,
) -> Runtime {
    let channel = server.channel();
    channel.ready().await.unwrap();
    RuntimeConfig::builder()
        .api(Arc::new(api.clone()))
        .channel(channel)
        .session_id("session-1")
        .build()
}

/// Polls `condition` until it holds, failing the test after two seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}

/// Runs `fut` with a two second timeout.
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), fut)
        .await
        .expect("timed out")
}
