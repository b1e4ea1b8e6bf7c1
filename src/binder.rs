//! Type binding between the connection core and the wire codec.

use serde_json::Value;

/// How the result payload of a completion should be bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultBinding {
    /// A unary invocation is awaiting a single result.
    Value,
    /// A stream invocation is awaiting items; its completion carries no payload.
    Stream,
    /// No invocation with that id is pending; the payload can be discarded.
    Discard,
}

/// Declared shape of a single handler parameter.
///
/// JSON is self-describing, so binding is a structural check rather than a
/// deserialization target. `Any` matches every value, and `null` matches
/// every declared shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl ParameterType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParameterType::Any => true,
            _ if value.is_null() => true,
            ParameterType::String => value.is_string(),
            ParameterType::Number => value.is_number(),
            ParameterType::Boolean => value.is_boolean(),
            ParameterType::Object => value.is_object(),
            ParameterType::Array => value.is_array(),
        }
    }
}

/// Callback interface a [`HubProtocol`](crate::codec::HubProtocol) uses to
/// discover expected types while parsing an inbound batch.
pub trait InvocationBinder: Send + Sync {
    /// Result binding for a completion with the given invocation id.
    fn result_binding(&self, invocation_id: &str) -> ResultBinding;

    /// Parameter types declared by the first handler registered for `target`,
    /// or empty when none is registered. The codec decides whether empty is
    /// acceptable for the frame at hand.
    fn parameter_types(&self, target: &str) -> Vec<ParameterType>;
}
