//! Transport seam.
//!
//! The connection core does not move bytes itself; it drives an externally
//! supplied [`Transport`] that delivers ordered, reliable, full-duplex byte
//! frames. WebSockets, long polling or a local pipe all fit behind this trait.

use crate::connection::error::ClientError;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Byte-level framing the codec expects from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFormat {
    Text,
    Binary,
}

#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("transport failed: {message}")]
    Failed { message: String },
    #[error("transport is closed")]
    Closed,
}

impl TransportError {
    pub fn failed(message: impl ToString) -> Self {
        TransportError::Failed {
            message: message.to_string(),
        }
    }
}

/// Callbacks the connection hands to a transport before starting it.
#[async_trait]
pub trait TransportEvents: Send + Sync {
    /// An inbound byte batch arrived. Batches must be delivered in order.
    async fn on_received(&self, data: Vec<u8>);

    /// The transport has closed, cleanly (`None`) or with the error that took
    /// it down. Must fire at most once per started transport, and from the
    /// transport's own task rather than inside a call into the transport.
    async fn on_closed(&self, error: Option<ClientError>);
}

/// Ordered, reliable, full-duplex byte transport consumed by the connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Registers the event sink. Called on a freshly created transport before
    /// [`start`](Transport::start) so no inbound batch is lost.
    fn bind(&self, events: Arc<dyn TransportEvents>);

    async fn start(&self, format: TransferFormat) -> Result<(), TransportError>;

    /// Transmits one whole frame. The connection serializes callers, so
    /// frames never interleave on the wire.
    async fn send(&self, data: Vec<u8>, ct: CancellationToken) -> Result<(), TransportError>;

    /// Tears the transport down; the reason is reported through
    /// [`TransportEvents::on_closed`].
    fn abort(&self, error: ClientError);

    /// Graceful close, reported as a clean `on_closed`.
    async fn dispose(&self);

    /// Whether the transport keeps the connection alive on its own. When it
    /// does, the server-idle watchdog stays idle.
    fn has_inherent_keep_alive(&self) -> bool;
}

/// Creates a fresh transport for every `start`.
pub type TransportFactory =
    Box<dyn Fn() -> Result<Arc<dyn Transport>, TransportError> + Send + Sync>;
