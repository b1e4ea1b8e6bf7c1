//! Codec seam and the bundled JSON hub protocol.

use crate::{
    binder::{InvocationBinder, ParameterType, ResultBinding},
    protocol::{Completion, HubMessage, Invocation, Ping, StreamInvocation},
    transport::TransferFormat,
};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

/// Terminates every frame in the text transfer format.
pub const RECORD_SEPARATOR: &str = "\u{001E}";

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

/// Errors raised while parsing an inbound batch.
///
/// Everything except [`UnknownMessage`](ProtocolError::UnknownMessage) is a
/// soft fault: the batch is dropped and the session continues. An unknown
/// message kind tears the session down.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid UTF-8: {source}")]
    Encoding {
        #[from]
        source: std::str::Utf8Error,
    },
    #[error("malformed frame: {source}")]
    Malformed {
        #[from]
        source: serde_json::Error,
    },
    #[error("completion for invocation {invocation_id} carries both a result and an error")]
    ConflictingCompletion { invocation_id: String },
    #[error("unknown message type {kind}")]
    UnknownMessage { kind: u8 },
}

/// Wire codec consumed by the connection core.
///
/// A codec turns one outbound [`HubMessage`] into a whole frame and parses an
/// inbound byte batch into zero or more messages, consulting the binder for
/// the expected types.
pub trait HubProtocol: Send + Sync {
    /// Protocol name announced in the negotiation frame.
    fn name(&self) -> &str;

    fn transfer_format(&self) -> TransferFormat;

    fn write_message(&self, message: &HubMessage) -> Result<Vec<u8>, SerializationError>;

    fn parse_messages(
        &self,
        data: &[u8],
        binder: &dyn InvocationBinder,
    ) -> Result<Vec<HubMessage>, ProtocolError>;
}

/// The JSON hub protocol: camelCase bodies with a numeric `type` tag, one
/// record-separator-terminated frame per message.
pub struct JsonHubProtocol;

#[derive(Deserialize)]
struct RoutingData {
    #[serde(rename = "type")]
    message_type: u8,
}

impl HubProtocol for JsonHubProtocol {
    fn name(&self) -> &str {
        "json"
    }

    fn transfer_format(&self) -> TransferFormat {
        TransferFormat::Text
    }

    fn write_message(&self, message: &HubMessage) -> Result<Vec<u8>, SerializationError> {
        let json = match message {
            HubMessage::Invocation(message) => serde_json::to_string(message)?,
            HubMessage::StreamInvocation(message) => serde_json::to_string(message)?,
            HubMessage::StreamItem(message) => serde_json::to_string(message)?,
            HubMessage::Completion(message) => serde_json::to_string(message)?,
            HubMessage::CancelInvocation(message) => serde_json::to_string(message)?,
            HubMessage::Ping => serde_json::to_string(&Ping::new())?,
        };
        Ok(to_frame(json))
    }

    fn parse_messages(
        &self,
        data: &[u8],
        binder: &dyn InvocationBinder,
    ) -> Result<Vec<HubMessage>, ProtocolError> {
        let text = std::str::from_utf8(data)?;
        let mut messages = Vec::new();
        for record in text
            .split(RECORD_SEPARATOR)
            .filter(|record| !record.trim().is_empty())
        {
            messages.push(parse_record(record, binder)?);
        }
        Ok(messages)
    }
}

pub(crate) fn to_frame(json: String) -> Vec<u8> {
    let mut frame = json;
    frame.push_str(RECORD_SEPARATOR);
    frame.into_bytes()
}

fn parse_record(record: &str, binder: &dyn InvocationBinder) -> Result<HubMessage, ProtocolError> {
    let routing: RoutingData = serde_json::from_str(record)?;
    match routing.message_type {
        1 => {
            let mut invocation: Invocation = serde_json::from_str(record)?;
            invocation.binding_error = bind_arguments(
                &binder.parameter_types(&invocation.target),
                &invocation.arguments,
            );
            Ok(HubMessage::Invocation(invocation))
        }
        2 => Ok(HubMessage::StreamItem(serde_json::from_str(record)?)),
        3 => {
            let mut completion: Completion = serde_json::from_str(record)?;
            if completion.has_result() && completion.is_error() {
                return Err(ProtocolError::ConflictingCompletion {
                    invocation_id: completion.invocation_id,
                });
            }
            match binder.result_binding(&completion.invocation_id) {
                ResultBinding::Value => {}
                ResultBinding::Stream | ResultBinding::Discard => {
                    if completion.has_result() {
                        trace!(
                            invocation_id = %completion.invocation_id,
                            "discarding completion payload with no awaiting result"
                        );
                        completion.discard_result();
                    }
                }
            }
            Ok(HubMessage::Completion(completion))
        }
        4 => {
            let mut invocation: StreamInvocation = serde_json::from_str(record)?;
            invocation.binding_error = bind_arguments(
                &binder.parameter_types(&invocation.target),
                &invocation.arguments,
            );
            Ok(HubMessage::StreamInvocation(invocation))
        }
        5 => Ok(HubMessage::CancelInvocation(serde_json::from_str(record)?)),
        6 => Ok(HubMessage::Ping),
        kind => Err(ProtocolError::UnknownMessage { kind }),
    }
}

fn bind_arguments(declared: &[ParameterType], arguments: &[Value]) -> Option<String> {
    if declared.is_empty() {
        return None;
    }
    if declared.len() != arguments.len() {
        return Some(format!(
            "expected {} arguments, got {}",
            declared.len(),
            arguments.len()
        ));
    }
    for (index, (declared, value)) in declared.iter().zip(arguments).enumerate() {
        if !declared.matches(value) {
            return Some(format!("argument {index} does not match declared {declared:?}"));
        }
    }
    None
}
