//! Errors produced while looking up and reading variables.

use crate::variable::Uid;
use std::{error, fmt, ops, sync::Arc};
use thiserror::Error;

/// Type for errors that can occur when reading variables out of the graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VarError {
    /// The `uid` could not be found in any registry (actions, components, or
    /// variables).
    #[error("variable `{uid}` could not be resolved: it is not registered")]
    UnresolvableVariable {
        /// The `uid` that was requested.
        uid: Uid,
    },
    /// A dynamic path segment resolved to something that cannot be used as a
    /// key.
    #[error("path segment for `{uid}` resolved to a non-key value: {found}")]
    InvalidPath {
        /// The variable whose nested path was being walked.
        uid: Uid,
        /// The offending value, serialized.
        found: String,
    },
    /// A value could not be serialized or deserialized.
    #[error("error (de)serializing variable value: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for VarError {
    fn from(value: serde_json::Error) -> Self {
        VarError::Serialization(value.to_string())
    }
}

/// A reference-counted wrapper for any error stored in a
/// [`Cell`](crate::store::Cell).
///
/// Cells are shared across every caller that reads them, so the error they hold
/// has to be cheap to clone.
#[derive(Debug, Clone)]
#[repr(transparent)]
pub struct CellError(Arc<dyn error::Error + Send + Sync>);

impl CellError {
    /// Converts the wrapper into the inner reference-counted error.
    pub fn into_inner(self) -> Arc<dyn error::Error + Send + Sync> {
        Arc::clone(&self.0)
    }
}

impl ops::Deref for CellError {
    type Target = Arc<dyn error::Error + Send + Sync>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for CellError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialEq for CellError {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
            || self.0.to_string() == other.0.to_string()
    }
}

impl<T> From<T> for CellError
where
    T: error::Error + Send + Sync + 'static,
{
    fn from(value: T) -> Self {
        CellError(Arc::new(value))
    }
}
