//! Request and response bodies, as they appear on the wire.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Body of `POST /derived-variable/{uid}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedVariableRequest {
    /// The resolved input values, in declaration order.
    pub values: Vec<Value>,
    /// The fingerprint the client computed for these inputs.
    pub cache_key: String,
    /// Whether the server must skip its own cache.
    pub force: bool,
    /// The live channel the server should report task progress on.
    pub ws_channel: Option<String>,
}

/// Response of `POST /derived-variable/{uid}` and `POST /data-variable/{uid}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DerivedVariableResponse {
    /// The computation runs as a long-running task; the result must be fetched
    /// once the task completes.
    Task {
        /// The task to wait for.
        task_id: String,
    },
    /// The computed value.
    Value {
        /// The value itself.
        value: Value,
    },
}

/// Body of `POST /action/{uid}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    /// Correlates the messages the server streams back over the live channel.
    pub execution_id: String,
    /// The input the action was triggered with (e.g. the clicked value).
    pub input: Value,
    /// The action instance's `uid`.
    pub uid: String,
    /// The resolved values of the action's declared variables.
    pub values: Vec<Value>,
    /// The live channel the server should stream actions on.
    pub ws_channel: Option<String>,
}

/// Response of `POST /action/{uid}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResponse {
    /// Set when the action runs as a long-running task.
    #[serde(default)]
    pub task_id: Option<String>,
}

/// Response of `GET /store/{store_uid}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreValue {
    /// The store's current value.
    pub value: Value,
    /// The sequence number of that value.
    pub sequence_number: u64,
}

/// Body of `POST /store`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreWriteRequest {
    /// New values, by `store_uid`.
    pub values: BTreeMap<String, Value>,
    /// The live channel of the writer, so the server can skip echoing the write
    /// back.
    pub ws_channel: Option<String>,
}

/// A page of server-side data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Index of the first row.
    pub offset: u64,
    /// Maximum number of rows.
    pub limit: u64,
}

/// Body of `POST /data-variable/{uid}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataVariableRequest {
    /// Filters applied on the server.
    pub filters: Option<Value>,
    /// The page to return.
    pub pagination: Option<Pagination>,
    /// The fingerprint the client computed for this request.
    pub cache_key: String,
    /// The live channel the server should report task progress on.
    pub ws_channel: Option<String>,
}
