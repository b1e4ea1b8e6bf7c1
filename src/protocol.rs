//! Hub protocol message shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_repr::{Deserialize_repr, Serialize_repr};

/// A single parsed hub frame, as produced and consumed by a
/// [`HubProtocol`](crate::codec::HubProtocol).
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation(Invocation),
    StreamInvocation(StreamInvocation),
    StreamItem(StreamItem),
    Completion(Completion),
    CancelInvocation(CancelInvocation),
    Ping,
}

#[derive(Debug, Serialize_repr, Deserialize_repr, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Invocation = 1,
    StreamItem = 2,
    Completion = 3,
    StreamInvocation = 4,
    CancelInvocation = 5,
    Ping = 6,
}

/// Request to invoke a method (the target) with the provided arguments on the
/// remote endpoint. Carries an invocation id only when the caller expects a
/// completion; fire-and-forget invocations go out without one.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    r#type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    pub target: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<Value>,
    /// Set during parsing when the arguments do not match the parameter types
    /// declared by the registered handler. Never serialized.
    #[serde(skip)]
    pub binding_error: Option<String>,
}

impl Invocation {
    pub fn new(invocation_id: Option<String>, target: String, arguments: Vec<Value>) -> Self {
        Invocation {
            r#type: MessageType::Invocation,
            invocation_id,
            target,
            arguments,
            binding_error: None,
        }
    }
}

/// Request to invoke a streaming method on the remote endpoint. The response
/// is a sequence of [`StreamItem`]s terminated by a [`Completion`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamInvocation {
    r#type: MessageType,
    pub invocation_id: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<Value>,
    #[serde(skip)]
    pub binding_error: Option<String>,
}

impl StreamInvocation {
    pub fn new(invocation_id: String, target: String, arguments: Vec<Value>) -> Self {
        StreamInvocation {
            r#type: MessageType::StreamInvocation,
            invocation_id,
            target,
            arguments,
            binding_error: None,
        }
    }
}

/// A single item of streamed response data from a previous [`StreamInvocation`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamItem {
    r#type: MessageType,
    pub invocation_id: String,
    pub item: Value,
}

impl StreamItem {
    pub fn new(invocation_id: String, item: Value) -> Self {
        StreamItem {
            r#type: MessageType::StreamItem,
            invocation_id,
            item,
        }
    }
}

/// Indicates a previous invocation has completed. Carries the result of a
/// unary invocation, or an error if the invocation concluded with one; both
/// are absent for void methods. After a completion no further stream items
/// will be received for that id.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    r#type: MessageType,
    pub invocation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Completion {
    pub fn new(invocation_id: String, result: Option<Value>, error: Option<String>) -> Self {
        Completion {
            r#type: MessageType::Completion,
            invocation_id,
            result,
            error,
        }
    }

    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub(crate) fn discard_result(&mut self) {
        self.result = None;
    }
}

/// Sent by the client to cancel a streaming invocation on the server.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CancelInvocation {
    r#type: MessageType,
    pub invocation_id: String,
}

impl CancelInvocation {
    pub fn new(invocation_id: String) -> Self {
        CancelInvocation {
            r#type: MessageType::CancelInvocation,
            invocation_id,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub(crate) struct Ping {
    r#type: MessageType,
}

impl Ping {
    pub fn new() -> Self {
        Ping {
            r#type: MessageType::Ping,
        }
    }
}
