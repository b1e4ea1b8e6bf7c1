//! # hubwire
//!
//! Client core of a bidirectional RPC-over-messaging protocol, commonly known
//! as a "hub connection": one long-lived session over which a client can call
//! named server methods and await single results, consume lazy streams of
//! items, fire notifications without waiting, and expose local handlers the
//! server may invoke at any time.
//!
//! The crate deliberately owns only the hard part — the connection core. The
//! byte transport (WebSockets, long polling, a pipe) and the wire codec are
//! external collaborators plugged in through the [`Transport`] and
//! [`HubProtocol`] traits; a JSON codec is bundled. There is no reconnection
//! and no server-initiated streaming into the client.
//!
//! # Example
//!
//! ```rust, no_run
//! use hubwire::{HubConnection, JsonHubProtocol, TransportFactory};
//! use serde_json::json;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(factory: TransportFactory) -> Result<(), hubwire::ClientError> {
//! let connection = HubConnection::new(factory, Box::new(JsonHubProtocol));
//! connection.start().await?;
//!
//! let sum = connection
//!     .invoke::<i32>("Add", vec![json!(2), json!(3)], CancellationToken::new())
//!     .await?;
//! assert_eq!(sum, Some(5));
//! # Ok(())
//! # }
//! ```
//!
//! # Guarantees
//!
//! - every pending invocation is resolved exactly once, even across shutdown;
//! - outbound bytes are whole frames in one total order;
//! - a silent server trips the watchdog, which tears the session down and
//!   fails every awaiter with a server-timeout error.

#![deny(unsafe_code)]

pub mod binder;
pub mod codec;
pub mod connection;
pub mod handlers;
pub mod protocol;
pub mod transport;

mod invocation;
mod negotiate;
mod pending;
mod watchdog;

pub use binder::{InvocationBinder, ParameterType, ResultBinding};
pub use codec::{HubProtocol, JsonHubProtocol, ProtocolError, SerializationError};
pub use connection::{error::ClientError, HubConnection, HubStream, DEFAULT_SERVER_TIMEOUT};
pub use handlers::{HandlerError, HandlerState, Subscription};
pub use transport::{
    TransferFormat, Transport, TransportError, TransportEvents, TransportFactory,
};
