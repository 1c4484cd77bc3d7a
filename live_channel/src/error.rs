use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A specialized [`Result`](std::result::Result) for the live channel.
pub type Result<T, E = ChannelError> = std::result::Result<T, E>;

/// Errors raised by the live channel.
///
/// This is `Clone` so that a single task failure can be handed to every caller
/// waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelError {
    /// The transport failed to connect, read or write.
    #[error("transport error: {0}")]
    Transport(String),
    /// The channel was closed, or the connection dropped before an answer
    /// arrived.
    #[error("the live channel is closed")]
    Closed,
    /// The retry budget was used up; the channel stays dormant until it becomes
    /// visible again.
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted {
        /// The number of failed attempts.
        attempts: u32,
    },
    /// A long-running task failed on the server.
    #[error("task {task_id} failed: {message}")]
    TaskFailed {
        /// The task's identifier.
        task_id: String,
        /// The error reported by the server.
        message: String,
    },
    /// A long-running task was cancelled on the server.
    #[error("task {task_id} was cancelled")]
    TaskCancelled {
        /// The task's identifier.
        task_id: String,
    },
    /// The server sent something that is not part of the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<serde_json::Error> for ChannelError {
    fn from(value: serde_json::Error) -> Self {
        ChannelError::Protocol(value.to_string())
    }
}
