//! Errors raised by the runtime.

use live_channel::ChannelError;
use thiserror::Error;
use var_client::ClientError;
use var_graph::VarError;

/// A specialized [`Result`](std::result::Result) for the runtime.
pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;

/// Errors raised while resolving variables and running actions.
///
/// This is `Clone` because concurrent computations of the same derived value
/// share a single result, error included.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Reading a variable failed.
    #[error(transparent)]
    Variable(#[from] VarError),
    /// A request to the server failed.
    #[error(transparent)]
    Client(#[from] ClientError),
    /// The live channel is unavailable.
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// No handler is registered for an action, and no catch-all is configured.
    #[error("no handler is registered for action `{name}`")]
    UnhandledAction {
        /// The name of the action.
        name: String,
    },
    /// A long-running task failed on the server.
    #[error("task {task_id} failed: {message}")]
    TaskExecution {
        /// The task's identifier.
        task_id: String,
        /// The error reported by the server.
        message: String,
    },
    /// A backend store patch did not follow the last applied sequence number.
    /// The patch is dropped and the store keeps its last good value.
    #[error(
        "store `{store_uid}` expected sequence {expected:?}, got {received}"
    )]
    SequenceMismatch {
        /// The store being patched.
        store_uid: String,
        /// The next sequence number that would have been accepted, if one is
        /// known.
        expected: Option<u64>,
        /// The sequence number of the patch.
        received: u64,
    },
    /// A patch could not be applied.
    #[error("invalid patch for store `{store_uid}`: {message}")]
    InvalidPatch {
        /// The store being patched.
        store_uid: String,
        /// What went wrong.
        message: String,
    },
    /// Only plain and URL variables can be written to.
    #[error("`{uid}` is a {kind} and cannot be written to")]
    NotWritable {
        /// The variable's `uid`.
        uid: String,
        /// The variable's kind.
        kind: &'static str,
    },
    /// Browser storage could not be read or written.
    #[error("storage error: {0}")]
    Storage(String),
    /// An action handler failed.
    #[error("{0}")]
    Handler(String),
}

impl RuntimeError {
    /// Converts a failed task wait into the error every waiter observes.
    pub fn from_task(error: ChannelError) -> Self {
        match error {
            ChannelError::TaskFailed { task_id, message } => {
                RuntimeError::TaskExecution { task_id, message }
            }
            ChannelError::TaskCancelled { task_id } => {
                RuntimeError::TaskExecution {
                    task_id,
                    message: "the task was cancelled".into(),
                }
            }
            other => RuntimeError::Channel(other),
        }
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(value: serde_json::Error) -> Self {
        RuntimeError::Variable(value.into())
    }
}
