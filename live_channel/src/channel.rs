use crate::{
    connector::{Connector, FrameSink, FrameStream},
    error::{ChannelError, Result},
    message::{
        ClientEnvelope, CustomMessage, Inbound, ServerEnvelope, ServerMessage,
        TaskNotification, TaskStatus,
    },
};
use any_spawner::Executor;
use futures::{
    channel::{mpsc, oneshot},
    FutureExt, Stream, StreamExt,
};
use or_poisoned::OrPoisoned;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::{
    fmt::{Debug, Formatter},
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::{Duration, Instant},
};
use tokio::sync::{watch, Notify};
use url::Url;
use uuid::Uuid;
use var_config::RuntimeOptions;

/// Where the connection is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// The first connection is being opened.
    Connecting,
    /// The handshake completed.
    Open {
        /// The identifier the server assigned to this connection.
        channel_id: String,
    },
    /// The connection dropped, or a connect attempt failed, and another attempt
    /// is running.
    Reconnecting {
        /// The 1-based attempt number since the connection was last open.
        attempt: u32,
    },
    /// The retry budget was used up. The channel stays dormant until it becomes
    /// visible again.
    Failed {
        /// The number of failed attempts.
        attempts: u32,
    },
    /// [`LiveChannel::close`] was called.
    Closed,
}

/// How a [`LiveChannel`] connects and reconnects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    /// The websocket URL, e.g. `ws://127.0.0.1:8000/api/core/ws`.
    pub url: String,
    /// The number of consecutive failed attempts before going dormant. `None`
    /// retries forever.
    pub max_attempts: Option<u32>,
    /// The delay before the first retry; doubled on every further failure.
    pub retry_delay: Duration,
    /// The upper bound of the retry delay.
    pub max_retry_delay: Duration,
    /// Whether a successful reconnect calls the reload hook.
    pub live_reload: bool,
    /// How long a task result that arrived before anyone waited for it is kept.
    pub unclaimed_task_ttl: Duration,
}

impl ChannelOptions {
    /// Options for `url`, retrying forever.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_attempts: None,
            retry_delay: Duration::from_millis(500),
            max_retry_delay: Duration::from_secs(10),
            live_reload: false,
            unclaimed_task_ttl: UNCLAIMED_TASK_TTL,
        }
    }

    /// Options taken from the runtime configuration.
    pub fn from_runtime(options: &RuntimeOptions) -> Self {
        Self {
            url: options.ws_url(),
            max_attempts: options.max_attempts,
            retry_delay: options.retry_delay(),
            max_retry_delay: options.max_retry_delay(),
            live_reload: options.live_reload(),
            unclaimed_task_ttl: UNCLAIMED_TASK_TTL,
        }
    }

    /// The delay before the given 1-based retry.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.retry_delay
            .saturating_mul(factor)
            .min(self.max_retry_delay)
    }
}

const UNCLAIMED_TASK_TTL: Duration = Duration::from_secs(300);

enum TaskEntry {
    Waiting(Vec<oneshot::Sender<Result<()>>>),
    // the notification arrived before anyone waited
    Done(Result<()>, Instant),
}

type ReloadHook = Arc<dyn Fn() + Send + Sync>;

struct ChannelInner {
    options: ChannelOptions,
    connector: Arc<dyn Connector>,
    state: watch::Sender<ChannelState>,
    token: RwLock<Option<String>>,
    outbound: RwLock<Option<mpsc::UnboundedSender<String>>>,
    subscribers: RwLock<Vec<mpsc::UnboundedSender<Inbound>>>,
    replies: Mutex<FxHashMap<String, oneshot::Sender<Value>>>,
    tasks: Mutex<FxHashMap<String, TaskEntry>>,
    on_reload: RwLock<Option<ReloadHook>>,
    visible: Notify,
    shutdown: Notify,
    generation: AtomicU64,
    closed: AtomicBool,
}

struct Connection {
    stream: FrameStream,
    sink: FrameSink,
    channel_id: String,
}

/// A persistent, reconnecting connection to the server's live channel.
///
/// Cloning a `LiveChannel` gives another handle to the same connection.
#[derive(Clone)]
pub struct LiveChannel {
    inner: Arc<ChannelInner>,
}

impl Debug for LiveChannel {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveChannel")
            .field("options", &self.inner.options)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl LiveChannel {
    /// Starts connecting in the background, using the given connector.
    ///
    /// The connection is supervised by a task spawned on the [`Executor`].
    pub fn connect(
        options: ChannelOptions,
        connector: impl Connector,
    ) -> Self {
        Self::connect_with_token(options, connector, None)
    }

    /// Like [`LiveChannel::connect`], authenticating with `token` from the
    /// first connect.
    pub fn connect_with_token(
        options: ChannelOptions,
        connector: impl Connector,
        token: Option<String>,
    ) -> Self {
        let (state, _) = watch::channel(ChannelState::Connecting);
        let inner = Arc::new(ChannelInner {
            options,
            connector: Arc::new(connector),
            state,
            token: RwLock::new(token),
            outbound: Default::default(),
            subscribers: Default::default(),
            replies: Default::default(),
            tasks: Default::default(),
            on_reload: Default::default(),
            visible: Notify::new(),
            shutdown: Notify::new(),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        Executor::spawn(supervise(Arc::clone(&inner)));
        Self { inner }
    }

    /// Connects over a websocket, as configured by the runtime options.
    #[cfg(feature = "tungstenite")]
    pub fn from_options(options: &RuntimeOptions) -> Self {
        Self::connect(
            ChannelOptions::from_runtime(options),
            crate::tungstenite::TungsteniteConnector,
        )
    }

    /// The current state.
    pub fn state(&self) -> ChannelState {
        self.inner.state.borrow().clone()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// The identifier of the open connection, if any.
    pub fn channel_id(&self) -> Option<String> {
        match &*self.inner.state.borrow() {
            ChannelState::Open { channel_id } => Some(channel_id.clone()),
            _ => None,
        }
    }

    /// Waits until the handshake has completed, and returns the channel
    /// identifier.
    pub async fn ready(&self) -> Result<String> {
        let mut rx = self.inner.state.subscribe();
        let state = {
            let state = rx
                .wait_for(|state| {
                    matches!(
                        state,
                        ChannelState::Open { .. }
                            | ChannelState::Failed { .. }
                            | ChannelState::Closed
                    )
                })
                .await
                .map_err(|_| ChannelError::Closed)?;
            state.clone()
        };
        match state {
            ChannelState::Open { channel_id } => Ok(channel_id),
            ChannelState::Failed { attempts } => {
                Err(ChannelError::ReconnectExhausted { attempts })
            }
            _ => Err(ChannelError::Closed),
        }
    }

    /// Every message received from now on, across reconnects.
    ///
    /// Replies to [`LiveChannel::send_custom`] are not included.
    pub fn subscribe(&self) -> impl Stream<Item = Inbound> + Send + Unpin {
        let (tx, rx) = mpsc::unbounded();
        self.inner.subscribers.write().or_poisoned().push(tx);
        rx
    }

    /// Sends a custom message and waits for the server's reply to it.
    pub async fn send_custom(
        &self,
        kind: impl Into<String>,
        data: Value,
    ) -> Result<Value> {
        self.ready().await?;
        let rchan = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner
            .replies
            .lock()
            .or_poisoned()
            .insert(rchan.clone(), tx);

        let mut message = CustomMessage::new(kind, data);
        message.rchan = Some(rchan.clone());
        if let Err(e) = self.send_frame(ClientEnvelope::Custom(message)) {
            self.inner.replies.lock().or_poisoned().remove(&rchan);
            return Err(e);
        }
        rx.await.map_err(|_| ChannelError::Closed)
    }

    /// Answers a custom message the server sent with a `__rchan`.
    pub fn reply(&self, to: &CustomMessage, data: Value) -> Result<()> {
        let Some(rchan) = &to.rchan else {
            return Err(ChannelError::Protocol(format!(
                "message {:?} does not expect a reply",
                to.kind
            )));
        };
        let mut message = CustomMessage::new(to.kind.clone(), data);
        message.response_for = Some(rchan.clone());
        self.send_frame(ClientEnvelope::Reply(message))
    }

    /// The number of settled tasks nobody has waited for yet.
    pub fn unclaimed_tasks(&self) -> usize {
        self.inner
            .tasks
            .lock()
            .or_poisoned()
            .values()
            .filter(|entry| matches!(entry, TaskEntry::Done(..)))
            .count()
    }

    /// Resolves once the server reports that the task finished.
    ///
    /// The wait is registered when this is called, not when the future is first
    /// polled, so a completion that arrives in between is not missed.
    pub fn wait_for_task(
        &self,
        task_id: &str,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        {
            let mut tasks = self.inner.tasks.lock().or_poisoned();
            match tasks.remove(task_id) {
                Some(TaskEntry::Done(result, _)) => {
                    _ = tx.send(result);
                }
                Some(TaskEntry::Waiting(mut waiters)) => {
                    waiters.push(tx);
                    tasks.insert(
                        task_id.to_string(),
                        TaskEntry::Waiting(waiters),
                    );
                }
                None => {
                    tasks.insert(
                        task_id.to_string(),
                        TaskEntry::Waiting(vec![tx]),
                    );
                }
            }
        }
        rx.map(|res| res.unwrap_or(Err(ChannelError::Closed)))
    }

    /// Reauthenticates the open connection. The token is also used for later
    /// reconnects.
    pub async fn update_token(&self, token: String) -> Result<()> {
        *self.inner.token.write().or_poisoned() = Some(token.clone());
        self.ready().await?;
        self.send_frame(ClientEnvelope::TokenUpdate(token))
    }

    /// Sets the hook called when the connection is re-established in
    /// live-reload mode.
    pub fn on_reload(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.inner.on_reload.write().or_poisoned() = Some(Arc::new(hook));
    }

    /// Tells the channel whether the page is visible. Becoming visible wakes a
    /// dormant channel.
    pub fn set_visible(&self, visible: bool) {
        if visible
            && matches!(
                *self.inner.state.borrow(),
                ChannelState::Failed { .. }
            )
        {
            tracing::debug!("visible again, resuming reconnects");
            self.inner.visible.notify_one();
        }
    }

    /// Closes the connection for good.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.outbound.write().or_poisoned().take();
        self.inner.state.send_replace(ChannelState::Closed);
        self.inner.shutdown.notify_waiters();
        self.inner.visible.notify_one();
    }

    fn send_frame(&self, envelope: ClientEnvelope) -> Result<()> {
        let text = serde_json::to_string(&envelope)?;
        let outbound = self.inner.outbound.read().or_poisoned().clone();
        outbound
            .ok_or(ChannelError::Closed)?
            .unbounded_send(text)
            .map_err(|_| ChannelError::Closed)
    }
}

async fn supervise(inner: Arc<ChannelInner>) {
    let mut failures = 0u32;
    let mut opened_before = false;

    loop {
        let shutdown = inner.shutdown.notified();
        if inner.is_closed() {
            break;
        }
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        inner.state.send_replace(if opened_before || failures > 0 {
            ChannelState::Reconnecting {
                attempt: failures + 1,
            }
        } else {
            ChannelState::Connecting
        });

        match inner.open(generation).await {
            Ok(Some(conn)) => {
                let reconnected = opened_before;
                opened_before = true;
                failures = 0;
                inner.run(conn, shutdown, reconnected).await;
                if inner.is_closed() {
                    break;
                }
                tracing::debug!("live channel dropped");
                continue;
            }
            Ok(None) => {
                tracing::debug!(generation, "discarding superseded connection");
                continue;
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(
                    error = %e,
                    attempt = failures,
                    "live channel connect failed"
                );
            }
        }

        if inner.options.max_attempts.is_some_and(|max| failures >= max) {
            tracing::warn!(
                attempts = failures,
                "giving up on the live channel until visible"
            );
            inner
                .state
                .send_replace(ChannelState::Failed { attempts: failures });
            inner.fail_tasks(ChannelError::ReconnectExhausted {
                attempts: failures,
            });
            inner.visible.notified().await;
            failures = 0;
            continue;
        }

        tokio::time::sleep(inner.options.backoff(failures)).await;
    }
    inner.state.send_replace(ChannelState::Closed);
    tracing::debug!("live channel closed");
}

impl ChannelInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn url(&self) -> Result<String> {
        let mut url = Url::parse(&self.options.url)
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        if let Some(token) = self.token.read().or_poisoned().as_deref() {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url.into())
    }

    async fn open(&self, generation: u64) -> Result<Option<Connection>> {
        let (mut stream, sink) = self.connector.connect(&self.url()?).await?;

        let channel_id = loop {
            let frame = stream.next().await.ok_or(ChannelError::Closed)??;
            match serde_json::from_str::<ServerEnvelope>(&frame)? {
                ServerEnvelope::Init(init) => break init.channel_id,
                other => {
                    tracing::debug!(?other, "frame before handshake, ignoring")
                }
            }
        };

        if self.generation.load(Ordering::SeqCst) != generation
            || self.is_closed()
        {
            return Ok(None);
        }
        Ok(Some(Connection {
            stream,
            sink,
            channel_id,
        }))
    }

    async fn run(
        &self,
        conn: Connection,
        shutdown: impl Future<Output = ()> + Send,
        reconnected: bool,
    ) {
        let Connection {
            stream,
            sink,
            channel_id,
        } = conn;

        let (tx, rx) = mpsc::unbounded();
        *self.outbound.write().or_poisoned() = Some(tx);
        Executor::spawn(rx.map(Ok::<_, ChannelError>).forward(sink).map(|res| {
            if let Err(e) = res {
                tracing::warn!(error = %e, "live channel write failed");
            }
        }));

        tracing::debug!(%channel_id, reconnected, "live channel open");
        self.state.send_replace(ChannelState::Open { channel_id });
        if reconnected && self.options.live_reload {
            let hook = self.on_reload.read().or_poisoned().clone();
            if let Some(hook) = hook {
                hook();
            }
        }

        let mut frames = std::pin::pin!(stream.take_until(shutdown));
        while let Some(frame) = frames.next().await {
            match frame {
                Ok(text) => self.handle_frame(&text),
                Err(e) => {
                    tracing::warn!(error = %e, "live channel read failed");
                    break;
                }
            }
        }

        // dropping the sender ends the writer; dropping reply senders fails
        // their waiters
        self.outbound.write().or_poisoned().take();
        self.replies.lock().or_poisoned().clear();
    }

    fn handle_frame(&self, text: &str) {
        let envelope = match serde_json::from_str::<ServerEnvelope>(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "unrecognized live channel frame");
                return;
            }
        };
        match envelope {
            ServerEnvelope::Init(_) => {
                tracing::debug!("repeated handshake ignored")
            }
            ServerEnvelope::Message(message) => {
                if let ServerMessage::Task(notification) = &message {
                    self.task_update(notification);
                }
                self.broadcast(Inbound::Message(message));
            }
            ServerEnvelope::Custom(message) => match &message.response_for {
                Some(id) => {
                    let waiter = self.replies.lock().or_poisoned().remove(id);
                    match waiter {
                        Some(tx) => _ = tx.send(message.data),
                        None => {
                            tracing::debug!(%id, "reply for unknown request")
                        }
                    }
                }
                None => self.broadcast(Inbound::Custom(message)),
            },
        }
    }

    fn broadcast(&self, message: Inbound) {
        self.subscribers
            .write()
            .or_poisoned()
            .retain(|tx| tx.unbounded_send(message.clone()).is_ok());
    }

    fn task_update(&self, notification: &TaskNotification) {
        let task_id = &notification.task_id;
        let result = match notification.status {
            TaskStatus::Complete => Ok(()),
            TaskStatus::Error => Err(ChannelError::TaskFailed {
                task_id: task_id.clone(),
                message: notification.message.clone().unwrap_or_default(),
            }),
            TaskStatus::Canceled => Err(ChannelError::TaskCancelled {
                task_id: task_id.clone(),
            }),
            TaskStatus::Progress => return,
        };
        tracing::debug!(%task_id, ok = result.is_ok(), "task settled");

        let mut tasks = self.tasks.lock().or_poisoned();
        match tasks.remove(task_id) {
            Some(TaskEntry::Waiting(waiters)) => {
                for waiter in waiters {
                    _ = waiter.send(result.clone());
                }
            }
            _ => {
                tasks.insert(
                    task_id.clone(),
                    TaskEntry::Done(result, Instant::now()),
                );
            }
        }

        // results nobody claimed in time, and waits nobody is polling any more
        let ttl = self.options.unclaimed_task_ttl;
        tasks.retain(|_, entry| match entry {
            TaskEntry::Waiting(waiters) => {
                waiters.retain(|waiter| !waiter.is_canceled());
                !waiters.is_empty()
            }
            TaskEntry::Done(_, settled) => settled.elapsed() < ttl,
        });
    }

    fn fail_tasks(&self, error: ChannelError) {
        self.tasks.lock().or_poisoned().retain(|_, entry| match entry {
            TaskEntry::Waiting(waiters) => {
                for waiter in waiters.drain(..) {
                    _ = waiter.send(Err(error.clone()));
                }
                false
            }
            TaskEntry::Done(..) => true,
        });
    }
}
