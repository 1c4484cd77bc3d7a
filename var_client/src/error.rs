//! Errors that occur while talking to the server.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Type for errors that can occur when calling the server.
///
/// This is `Clone` so that a single failed request can be handed to every
/// caller that was waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientError {
    /// Occurs if there is a network error while trying to reach the server.
    #[error("error reaching server: {0}")]
    Request(String),
    /// The server answered with a non-success status.
    #[error("server responded with status {status}: {body}")]
    Status {
        /// The HTTP status code.
        status: u16,
        /// The response body, for diagnostics.
        body: String,
    },
    /// Occurs if the response body could not be deserialized.
    #[error("error deserializing server response: {0}")]
    Deserialization(String),
    /// Occurs if the request body could not be serialized.
    #[error("error serializing request: {0}")]
    Serialization(String),
    /// The configured base URL, combined with a path, is not a valid URL.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl From<serde_json::Error> for ClientError {
    fn from(value: serde_json::Error) -> Self {
        ClientError::Deserialization(value.to_string())
    }
}
