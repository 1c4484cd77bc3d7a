//! The Action Executor.
//!
//! An action is a named, side-effecting operation triggered by the UI. Plain
//! actions run a client-side handler looked up by name. *Annotated* actions
//! (those carrying a `definition_uid`) run on the server, which streams further
//! actions back over the live channel for the client to execute in order.
//!
//! Every execution moves through an explicit phase machine:
//!
//! ```text
//! Idle -> Invoking -> (Streaming ->) Completing -> Done | Failed
//! ```
//!
//! Failures never escape as panics or unhandled errors: they are logged,
//! reported as a single deduplicated
//! [`Notification`](crate::notification::Notification), and returned in the
//! [`ActionExecution`].

mod builtin;

pub use builtin::{INPUT, TOGGLE};
pub(crate) use builtin::register_builtins;

use crate::{
    error::{Result, RuntimeError},
    notification::Notification,
    runtime::Runtime,
};
use futures::{
    future::{try_join, try_join_all},
    FutureExt, Stream, StreamExt, TryFutureExt,
};
use live_channel::{
    message::{Inbound, ServerMessage},
    LiveChannel,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{future::Future, pin::Pin, sync::Arc};
use uuid::Uuid;
use var_client::wire::ActionRequest;
use var_graph::{
    extras::RequestExtras,
    variable::{AnyVariable, PlainVariable},
    VarError,
};

/// A boxed, thread-safe future.
pub type PinnedFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Runs one action.
pub type ActionHandler = Arc<
    dyn Fn(ActionContext, ActionDef) -> PinnedFuture<Result<()>> + Send + Sync,
>;

/// An action instance, as declared by the server or streamed back during an
/// execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDef {
    /// The handler to run, e.g. `UpdateVariable`.
    pub name: String,
    /// The instance's `uid`. Annotated actions are invoked on the server under
    /// it.
    #[serde(default)]
    pub uid: Option<String>,
    /// Set on server-side actions.
    #[serde(default)]
    pub definition_uid: Option<String>,
    /// Variables whose resolved values are sent with a server-side invocation.
    #[serde(default)]
    pub variables: Vec<AnyVariable>,
    /// A boolean variable that is `true` while the action runs.
    #[serde(default)]
    pub loading: Option<PlainVariable>,
    /// Handler-specific arguments.
    #[serde(flatten)]
    pub args: Map<String, Value>,
}

impl ActionDef {
    /// A client-side action with no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: None,
            definition_uid: None,
            variables: Vec::new(),
            loading: None,
            args: Map::new(),
        }
    }

    /// A server-side action, invoked under `uid`.
    pub fn annotated(
        uid: impl Into<String>,
        definition_uid: impl Into<String>,
    ) -> Self {
        let uid = uid.into();
        Self {
            uid: Some(uid.clone()),
            definition_uid: Some(definition_uid.into()),
            ..Self::new(uid)
        }
    }

    /// Adds an argument.
    pub fn arg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.args.insert(name.into(), value);
        self
    }

    /// Sets the variables sent with a server-side invocation.
    pub fn variables(
        mut self,
        variables: impl IntoIterator<Item = AnyVariable>,
    ) -> Self {
        self.variables = variables.into_iter().collect();
        self
    }

    /// Sets the loading flag.
    pub fn loading(mut self, variable: PlainVariable) -> Self {
        self.loading = Some(variable);
        self
    }

    /// Whether this action runs on the server.
    pub fn is_annotated(&self) -> bool {
        self.definition_uid.is_some()
    }

    /// Deserializes the handler-specific arguments.
    pub fn parse_args<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.args.clone()))?)
    }
}

/// Where an execution is in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ActionPhase {
    /// Not started.
    #[default]
    Idle,
    /// Running a client-side handler, or sending a server-side invocation.
    Invoking,
    /// Running the actions the server streams back.
    Streaming,
    /// Waiting for outstanding work and clearing the loading flag.
    Completing,
    /// Settled successfully.
    Done,
    /// Settled with an error.
    Failed,
}

/// The record of one settled execution.
#[derive(Debug, Clone)]
pub struct ActionExecution {
    execution_id: String,
    name: String,
    history: Vec<ActionPhase>,
    result: Result<()>,
}

impl ActionExecution {
    fn new(name: &str) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            history: vec![ActionPhase::Idle],
            result: Ok(()),
        }
    }

    fn enter(&mut self, phase: ActionPhase) {
        tracing::trace!(
            execution_id = %self.execution_id,
            action = %self.name,
            ?phase,
            "action phase"
        );
        self.history.push(phase);
    }

    /// The identifier sent to the server and echoed by the action stream.
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// The current phase.
    pub fn phase(&self) -> ActionPhase {
        self.history.last().copied().unwrap_or_default()
    }

    /// Every phase the execution went through, in order.
    pub fn history(&self) -> &[ActionPhase] {
        &self.history
    }

    /// How the execution ended.
    pub fn result(&self) -> &Result<()> {
        &self.result
    }
}

/// What a handler can reach while it runs.
#[derive(Debug, Clone)]
pub struct ActionContext {
    /// The runtime the action runs in.
    pub runtime: Runtime,
    /// The value the action was triggered with.
    pub input: Value,
    /// The request extras of the caller.
    pub extras: RequestExtras,
    /// The execution this action belongs to.
    pub execution_id: String,
}

impl ActionContext {
    /// The live channel, if the runtime has one.
    pub fn channel(&self) -> Option<&LiveChannel> {
        self.runtime.channel()
    }

    /// Resolves a variable under the caller's extras.
    pub async fn resolve(&self, variable: &AnyVariable) -> Result<Value> {
        self.runtime.resolve(variable, &self.extras).await
    }

    /// Shows a notification.
    pub fn notify(&self, notification: Notification) {
        self.runtime.notifications().push(notification);
    }
}

impl Runtime {
    /// Runs an action to completion.
    ///
    /// The returned execution is always settled. A failure has already been
    /// logged and reported as a notification.
    pub async fn execute_action(
        &self,
        action: &ActionDef,
        input: Value,
        extras: &RequestExtras,
    ) -> ActionExecution {
        let mut execution = ActionExecution::new(&action.name);
        if let Some(loading) = &action.loading {
            self.set_flag(loading, true, extras);
        }

        let result = if action.is_annotated() {
            self.invoke_annotated(action, input, extras, &mut execution)
                .await
        } else {
            execution.enter(ActionPhase::Invoking);
            let ctx = ActionContext {
                runtime: self.clone(),
                input,
                extras: extras.clone(),
                execution_id: execution.execution_id.clone(),
            };
            self.run_handler(ctx, action.clone()).await
        };

        execution.enter(ActionPhase::Completing);
        if let Some(loading) = &action.loading {
            self.set_flag(loading, false, extras);
        }
        match &result {
            Ok(()) => execution.enter(ActionPhase::Done),
            Err(e) => {
                tracing::error!(
                    action = %action.name,
                    error = %e,
                    "action failed"
                );
                self.notifications()
                    .push(Notification::action_error(e.to_string()));
                execution.enter(ActionPhase::Failed);
            }
        }
        execution.result = result;
        execution
    }

    /// Runs actions one after another. Each one settles, loading flag included,
    /// before the next starts; a failure does not stop the ones after it.
    pub async fn execute_actions(
        &self,
        actions: &[ActionDef],
        input: Value,
        extras: &RequestExtras,
    ) -> Vec<ActionExecution> {
        let mut executions = Vec::with_capacity(actions.len());
        for action in actions {
            executions.push(
                self.execute_action(action, input.clone(), extras).await,
            );
        }
        executions
    }

    /// Looks the handler for `action` up by name and runs it.
    fn run_handler(
        &self,
        ctx: ActionContext,
        action: ActionDef,
    ) -> PinnedFuture<Result<()>> {
        match self.handler(&action.name) {
            Some(handler) => handler(ctx, action),
            None => {
                let name = action.name.clone();
                Box::pin(async move {
                    Err(RuntimeError::UnhandledAction { name })
                })
            }
        }
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(action = %action.name)
    )]
    async fn invoke_annotated(
        &self,
        action: &ActionDef,
        input: Value,
        extras: &RequestExtras,
        execution: &mut ActionExecution,
    ) -> Result<()> {
        execution.enter(ActionPhase::Invoking);
        let uid = action
            .uid
            .clone()
            .or_else(|| action.definition_uid.clone())
            .ok_or_else(|| VarError::UnresolvableVariable {
                uid: action.name.as_str().into(),
            })?;
        let channel = self
            .channel()
            .cloned()
            .ok_or(RuntimeError::Channel(live_channel::ChannelError::Closed))?;
        let ws_channel = channel.ready().await?;
        // subscribe before the request, so no streamed action is missed
        let mut messages = channel.subscribe();

        let values = try_join_all(
            action
                .variables
                .iter()
                .map(|variable| self.resolve(variable, extras)),
        )
        .await?;
        let response = self
            .api()
            .action(
                &uid,
                ActionRequest {
                    execution_id: execution.execution_id.clone(),
                    input: input.clone(),
                    uid: uid.clone(),
                    values,
                    ws_channel: Some(ws_channel),
                },
                extras,
            )
            .await?;
        let task = response.task_id.as_deref().map(|task_id| {
            (task_id.to_string(), channel.wait_for_task(task_id))
        });

        execution.enter(ActionPhase::Streaming);
        let streamed = self.follow_stream(
            &mut messages,
            &execution.execution_id,
            &uid,
            &input,
            extras,
        );
        match task {
            // a failed task settles the execution before the stream ends
            Some((task_id, wait)) => {
                tracing::debug!(%task_id, "waiting for action task");
                try_join(streamed, wait.map_err(RuntimeError::from_task))
                    .await?;
            }
            None => streamed.await?,
        }
        Ok(())
    }

    // runs streamed actions in order until the server ends the stream
    async fn follow_stream(
        &self,
        messages: &mut (impl Stream<Item = Inbound> + Unpin),
        execution_id: &str,
        uid: &str,
        input: &Value,
        extras: &RequestExtras,
    ) -> Result<()> {
        loop {
            let Some(inbound) = messages.next().await else {
                return Err(live_channel::ChannelError::Closed.into());
            };
            let Inbound::Message(message) = inbound else {
                continue;
            };
            match message {
                ServerMessage::Action(step) if step.uid == execution_id => {
                    let Some(next) = step.action else {
                        return Ok(());
                    };
                    let next: ActionDef = serde_json::from_value(next)?;
                    tracing::debug!(
                        action = %next.name,
                        "running streamed action"
                    );
                    let ctx = ActionContext {
                        runtime: self.clone(),
                        input: input.clone(),
                        extras: extras.clone(),
                        execution_id: execution_id.to_string(),
                    };
                    self.run_streamed(ctx, next).await?;
                }
                ServerMessage::Error(error)
                    if error.uid.as_deref() == Some(execution_id)
                        || error.uid.as_deref() == Some(uid) =>
                {
                    return Err(RuntimeError::Handler(error.error));
                }
                _ => {}
            }
        }
    }

    // a streamed action may itself be annotated; only its loading flag and
    // errors are handled by the outer execution
    fn run_streamed(
        &self,
        ctx: ActionContext,
        action: ActionDef,
    ) -> PinnedFuture<Result<()>> {
        if !action.is_annotated() {
            return self.run_handler(ctx, action);
        }
        let this = self.clone();
        async move {
            let execution = this
                .execute_action(&action, ctx.input, &ctx.extras)
                .await;
            execution.result.clone()
        }
        .boxed()
    }

    fn set_flag(
        &self,
        variable: &PlainVariable,
        on: bool,
        extras: &RequestExtras,
    ) {
        let variable = AnyVariable::Plain(variable.clone());
        if let Err(e) = self.set(&variable, Value::Bool(on), extras) {
            tracing::error!(
                uid = %variable.uid(),
                error = %e,
                "could not set loading flag"
            );
        }
    }
}
