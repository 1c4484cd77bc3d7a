//! The messages exchanged over the live channel.
//!
//! Every frame is a JSON envelope `{ "type": ..., "message": ... }`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A frame sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message", rename_all = "snake_case")]
pub enum ServerEnvelope {
    /// The handshake: the first frame of every connection.
    Init(InitMessage),
    /// A notification about a task, an action stream or a backend store.
    Message(ServerMessage),
    /// An application-defined message, possibly a reply to one of ours.
    Custom(CustomMessage),
}

/// Body of the `init` handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitMessage {
    /// The identifier of this connection, sent back as `ws_channel` in HTTP
    /// requests.
    pub channel_id: String,
}

/// A frame sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message", rename_all = "snake_case")]
pub enum ClientEnvelope {
    /// An application-defined message, optionally expecting a reply.
    Custom(CustomMessage),
    /// A reply to a custom message the server sent.
    Reply(CustomMessage),
    /// Reauthenticates the open connection.
    TokenUpdate(String),
}

/// An application-defined message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomMessage {
    /// What the message is about.
    pub kind: String,
    /// Its payload.
    #[serde(default)]
    pub data: Value,
    /// Set when the sender expects a reply; the reply echoes it as
    /// `__response_for`.
    #[serde(
        rename = "__rchan",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub rchan: Option<String>,
    /// Set on replies.
    #[serde(
        rename = "__response_for",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub response_for: Option<String>,
}

impl CustomMessage {
    /// A message that expects no reply.
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
            rchan: None,
            response_for: None,
        }
    }
}

/// The body of a `message` frame.
///
/// The variants are told apart by their fields; they are tried in declaration
/// order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    /// A long-running task changed status.
    Task(TaskNotification),
    /// An incremental update of a backend store.
    StorePatch(StorePatchMessage),
    /// The full value of a backend store.
    StoreValue(StoreValueMessage),
    /// An error the server could not attribute to a request.
    Error(ServerErrorMessage),
    /// One step of an action stream.
    Action(ActionMessage),
}

/// The status of a long-running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// The result can be fetched.
    Complete,
    /// The task failed.
    Error,
    /// The task was cancelled.
    Canceled,
    /// The task is still running.
    Progress,
}

/// A change in a long-running task's status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskNotification {
    /// The task's identifier.
    pub task_id: String,
    /// Its new status.
    pub status: TaskStatus,
    /// A progress or error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A list of JSON Patch operations for a backend store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorePatchMessage {
    /// The store being patched.
    pub store_uid: String,
    /// RFC 6902 operations, applied in order.
    pub patches: Value,
    /// Must be exactly one more than the last sequence number applied.
    pub sequence_number: u64,
}

/// The full value of a backend store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreValueMessage {
    /// The store being replaced.
    pub store_uid: String,
    /// Its new value.
    pub value: Value,
    /// The sequence number the store now starts from.
    pub sequence_number: u64,
}

/// An error reported by the server outside of any request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerErrorMessage {
    /// The error message.
    pub error: String,
    /// The variable or action the error relates to, if known.
    #[serde(default)]
    pub uid: Option<String>,
}

/// One step of the action stream of an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionMessage {
    /// The `execution_id` the action was invoked with.
    pub uid: String,
    /// The action to run on the client, or `None` when the stream is over.
    #[serde(default)]
    pub action: Option<Value>,
}

/// Anything received on the channel after the handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A `message` frame.
    Message(ServerMessage),
    /// A `custom` frame that is not a reply to one of ours.
    Custom(CustomMessage),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(raw: Value) -> ServerEnvelope {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn init_carries_the_channel_id() {
        let env = parse(json!({
            "type": "init",
            "message": { "channel_id": "abc" }
        }));
        assert_eq!(
            env,
            ServerEnvelope::Init(InitMessage {
                channel_id: "abc".into()
            })
        );
    }

    #[test]
    fn messages_are_told_apart_by_fields() {
        let task = parse(json!({
            "type": "message",
            "message": { "task_id": "t", "status": "ERROR", "message": "boom" }
        }));
        assert!(matches!(
            task,
            ServerEnvelope::Message(ServerMessage::Task(TaskNotification {
                status: TaskStatus::Error,
                ..
            }))
        ));

        let patch = parse(json!({
            "type": "message",
            "message": { "store_uid": "s", "patches": [], "sequence_number": 2 }
        }));
        assert!(matches!(
            patch,
            ServerEnvelope::Message(ServerMessage::StorePatch(_))
        ));

        let value = parse(json!({
            "type": "message",
            "message": { "store_uid": "s", "value": 1, "sequence_number": 2 }
        }));
        assert!(matches!(
            value,
            ServerEnvelope::Message(ServerMessage::StoreValue(_))
        ));

        let error = parse(json!({
            "type": "message",
            "message": { "error": "bad", "uid": "x" }
        }));
        assert!(matches!(
            error,
            ServerEnvelope::Message(ServerMessage::Error(_))
        ));
    }

    #[test]
    fn null_action_closes_the_stream() {
        let env = parse(json!({
            "type": "message",
            "message": { "uid": "exec", "action": null }
        }));
        assert_eq!(
            env,
            ServerEnvelope::Message(ServerMessage::Action(ActionMessage {
                uid: "exec".into(),
                action: None
            }))
        );
    }

    #[test]
    fn custom_correlation_fields_use_dunder_names() {
        let mut msg = CustomMessage::new("ping", json!(1));
        msg.rchan = Some("r1".into());
        let raw = serde_json::to_value(ClientEnvelope::Custom(msg)).unwrap();
        assert_eq!(
            raw,
            json!({
                "type": "custom",
                "message": { "kind": "ping", "data": 1, "__rchan": "r1" }
            })
        );

        let reply = parse(json!({
            "type": "custom",
            "message": { "kind": "ping", "data": 2, "__response_for": "r1" }
        }));
        let ServerEnvelope::Custom(reply) = reply else {
            panic!("expected a custom message");
        };
        assert_eq!(reply.response_for.as_deref(), Some("r1"));
    }

    #[test]
    fn token_update_is_a_bare_string() {
        let raw =
            serde_json::to_value(ClientEnvelope::TokenUpdate("tok".into()))
                .unwrap();
        assert_eq!(raw, json!({ "type": "token_update", "message": "tok" }));
    }
}
