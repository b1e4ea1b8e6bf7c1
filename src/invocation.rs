//! Per-invocation state.

use crate::connection::error::ClientError;
use serde_json::Value;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Mutex,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Monotonic, session-local invocation id source. Ids are rendered as decimal
/// strings starting at "1" and are strictly increasing.
#[derive(Debug, Default)]
pub(crate) struct InvocationIds {
    next: AtomicU64,
}

impl InvocationIds {
    pub fn next_id(&self) -> String {
        (self.next.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InvocationShape {
    Unary,
    Stream,
}

pub(crate) type UnaryOutcome = Result<Option<Value>, ClientError>;
pub(crate) type StreamOutcome = Result<Value, ClientError>;

pub(crate) const STREAM_QUEUE_CAPACITY: usize = 100;

/// State of one in-flight invocation, shared between the caller and the
/// receive path through the pending-call table.
///
/// A unary request owns a single-shot completion sink, a stream request a
/// bounded item queue. The `completed` flag guarantees at most one terminal
/// delivery no matter how resolution and shutdown interleave.
pub(crate) struct InvocationRequest {
    invocation_id: String,
    sink: ResponseSink,
    cancellation: CancellationToken,
    completed: AtomicBool,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

enum ResponseSink {
    Unary(flume::Sender<UnaryOutcome>),
    Stream(flume::Sender<StreamOutcome>),
}

impl InvocationRequest {
    pub fn unary(
        invocation_id: String,
        cancellation: CancellationToken,
    ) -> (Self, flume::Receiver<UnaryOutcome>) {
        let (sender, receiver) = flume::bounded(1);
        let request = InvocationRequest {
            invocation_id,
            sink: ResponseSink::Unary(sender),
            cancellation,
            completed: AtomicBool::new(false),
            watcher: Mutex::new(None),
        };
        (request, receiver)
    }

    pub fn stream(
        invocation_id: String,
        cancellation: CancellationToken,
    ) -> (Self, flume::Receiver<StreamOutcome>) {
        let (sender, receiver) = flume::bounded(STREAM_QUEUE_CAPACITY);
        let request = InvocationRequest {
            invocation_id,
            sink: ResponseSink::Stream(sender),
            cancellation,
            completed: AtomicBool::new(false),
            watcher: Mutex::new(None),
        };
        (request, receiver)
    }

    pub fn invocation_id(&self) -> &str {
        &self.invocation_id
    }

    pub fn shape(&self) -> InvocationShape {
        match self.sink {
            ResponseSink::Unary(_) => InvocationShape::Unary,
            ResponseSink::Stream(_) => InvocationShape::Stream,
        }
    }

    /// Whether the caller's cancellation observer has fired; once it has,
    /// every further delivery to this request is dropped.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Keeps the task watching the caller's cancellation token so disposal
    /// can abort it.
    pub fn set_watcher(&self, handle: JoinHandle<()>) {
        *self.watcher.lock().unwrap() = Some(handle);
    }

    /// Resolves with a successful completion: a unary request receives the
    /// payload, a stream request just closes its queue.
    pub fn succeed(&self, result: Option<Value>) {
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.sink {
            ResponseSink::Unary(sender) => {
                if sender.try_send(Ok(result)).is_err() {
                    debug!(invocation_id = %self.invocation_id, "completion arrived after the caller left");
                }
            }
            ResponseSink::Stream(_) => {
                if result.is_some() {
                    warn!(invocation_id = %self.invocation_id, "stream completion carried a result, ignoring");
                }
            }
        }
    }

    /// Resolves with an error; a stream request receives it as its last item.
    pub fn fail(&self, error: ClientError) {
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        match &self.sink {
            ResponseSink::Unary(sender) => {
                if sender.try_send(Err(error)).is_err() {
                    debug!(invocation_id = %self.invocation_id, "failure arrived after the caller left");
                }
            }
            ResponseSink::Stream(sender) => {
                if sender.try_send(Err(error)).is_err() {
                    warn!(invocation_id = %self.invocation_id, "stream error dropped, queue unavailable");
                }
            }
        }
    }

    /// Item queue of a stream request, used by the receive path to enqueue
    /// outside any lock.
    pub fn stream_sender(&self) -> Option<flume::Sender<StreamOutcome>> {
        match &self.sink {
            ResponseSink::Unary(_) => None,
            ResponseSink::Stream(sender) => Some(sender.clone()),
        }
    }

    /// Releases held resources. Double-dispose is a no-op.
    pub fn dispose(&self) {
        if let Some(watcher) = self.watcher.lock().unwrap().take() {
            watcher.abort();
        }
    }
}
