use thiserror::Error;

/// Errors surfaced to callers of the hub connection.
///
/// Foreign failures (transport, serialization) are flattened to messages so
/// the terminating error of a session can be delivered to every pending
/// awaiter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The connection has not been started.
    #[error("the hub connection has not been started")]
    NotStarted,

    #[error("the hub connection is already started")]
    AlreadyStarted,

    /// A lifecycle operation needs a live transport and there is none.
    #[error("the hub connection is not connected")]
    NotConnected,

    #[error("the hub connection has been disposed")]
    Disposed,

    /// The session has ended; no further invocations can be registered.
    #[error("the connection has been terminated")]
    ConnectionTerminated,

    #[error("an invocation with id {id} is already pending")]
    DuplicateInvocationId { id: String },

    /// The server stayed silent past the configured timeout.
    #[error("server timeout elapsed without a message from the server")]
    ServerTimeout,

    /// The remote endpoint violated the hub protocol.
    #[error("protocol violation: {message}")]
    ProtocolViolation { message: String },

    /// The caller's cancellation token fired before a completion arrived.
    #[error("the invocation was canceled")]
    Canceled,

    /// The server completed the invocation with an error.
    #[error("the server returned an error: {message}")]
    Server { message: String },

    #[error("transport error: {message}")]
    Transport { message: String },

    #[error("malformed {direction}: {message}")]
    Malformed {
        direction: &'static str,
        message: String,
    },
}

impl ClientError {
    pub fn protocol_violation(message: impl ToString) -> Self {
        ClientError::ProtocolViolation {
            message: message.to_string(),
        }
    }

    pub fn server(message: impl ToString) -> Self {
        ClientError::Server {
            message: message.to_string(),
        }
    }

    pub fn transport(source: impl ToString) -> Self {
        ClientError::Transport {
            message: source.to_string(),
        }
    }

    pub fn malformed_request(source: impl ToString) -> Self {
        ClientError::Malformed {
            direction: "request",
            message: source.to_string(),
        }
    }

    pub fn malformed_response(source: impl ToString) -> Self {
        ClientError::Malformed {
            direction: "response",
            message: source.to_string(),
        }
    }
}

impl From<crate::transport::TransportError> for ClientError {
    fn from(source: crate::transport::TransportError) -> Self {
        ClientError::transport(source)
    }
}
