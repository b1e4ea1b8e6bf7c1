//! In-memory transport double.

use async_trait::async_trait;
use hubwire::{ClientError, TransferFormat, Transport, TransportError, TransportEvents, TransportFactory};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use tokio_util::sync::CancellationToken;

/// Records outbound frames, lets tests inject inbound ones, and reports
/// `closed` from its own task the way a real transport does.
pub struct MemoryTransport {
    events: Mutex<Option<Arc<dyn TransportEvents>>>,
    frames: flume::Sender<Vec<u8>>,
    outbound: flume::Receiver<Vec<u8>>,
    keep_alive: bool,
    closed: AtomicBool,
    broken: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Arc<Self> {
        Self::with_keep_alive(true)
    }

    pub fn with_keep_alive(keep_alive: bool) -> Arc<Self> {
        let (frames, outbound) = flume::unbounded();
        Arc::new(MemoryTransport {
            events: Mutex::new(None),
            frames,
            outbound,
            keep_alive,
            closed: AtomicBool::new(false),
            broken: AtomicBool::new(false),
        })
    }

    pub fn factory(self: Arc<Self>) -> TransportFactory {
        Box::new(move || Ok(self.clone() as Arc<dyn Transport>))
    }

    /// Next outbound frame as text, negotiation frame included.
    pub async fn next_frame(&self) -> String {
        let bytes = self
            .outbound
            .recv_async()
            .await
            .expect("transport produced no frame");
        String::from_utf8(bytes).expect("frame is not text")
    }

    pub fn sent_nothing(&self) -> bool {
        self.outbound.is_empty()
    }

    /// Drives the receive callback with one record-separator-terminated frame.
    pub async fn inject(&self, json: &str) {
        let events = self
            .events
            .lock()
            .unwrap()
            .clone()
            .expect("transport not bound");
        events.on_received(format!("{json}\u{001E}").into_bytes()).await;
    }

    /// Drives the receive callback with raw bytes, e.g. a multi-frame batch.
    pub async fn inject_raw(&self, data: Vec<u8>) {
        let events = self
            .events
            .lock()
            .unwrap()
            .clone()
            .expect("transport not bound");
        events.on_received(data).await;
    }

    /// Simulates the transport dying, reporting `closed` with the error.
    pub async fn close(&self, error: Option<ClientError>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let events = self.events.lock().unwrap().clone();
        if let Some(events) = events {
            events.on_closed(error).await;
        }
    }

    /// Makes every further `send` fail without closing the transport.
    pub fn break_pipe(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn bind(&self, events: Arc<dyn TransportEvents>) {
        *self.events.lock().unwrap() = Some(events);
    }

    async fn start(&self, _format: TransferFormat) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send(&self, data: Vec<u8>, _ct: CancellationToken) -> Result<(), TransportError> {
        if self.broken.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.frames.send(data).map_err(|_| TransportError::Closed)
    }

    fn abort(&self, error: ClientError) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let events = self.events.lock().unwrap().clone();
        if let Some(events) = events {
            tokio::spawn(async move {
                events.on_closed(Some(error)).await;
            });
        }
    }

    async fn dispose(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let events = self.events.lock().unwrap().clone();
        if let Some(events) = events {
            tokio::spawn(async move {
                events.on_closed(None).await;
            });
        }
    }

    fn has_inherent_keep_alive(&self) -> bool {
        self.keep_alive
    }
}
