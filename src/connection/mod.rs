//! The hub connection core.
//!
//! [`HubConnection`] multiplexes unary invocations, stream invocations,
//! fire-and-forget sends and server-initiated handler calls over a single
//! [`Transport`]. Outbound frames are serialized and transmitted under one
//! connection lock; inbound batches are parsed against the binder and
//! demultiplexed to pending invocations or registered handlers; a watchdog
//! aborts the transport when the server goes silent.

pub mod error;

use self::error::ClientError;
use crate::{
    binder::{InvocationBinder, ParameterType, ResultBinding},
    codec::{HubProtocol, ProtocolError},
    handlers::{HandlerCallback, HandlerError, HandlerRegistry, HandlerState, Subscription},
    invocation::{InvocationIds, InvocationRequest, InvocationShape, StreamOutcome},
    negotiate,
    pending::PendingCalls,
    protocol::{CancelInvocation, Completion, HubMessage, Invocation, StreamInvocation, StreamItem},
    transport::{Transport, TransportEvents, TransportFactory},
    watchdog::Watchdog,
};
use async_trait::async_trait;
use futures::{future::BoxFuture, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::{
    marker::PhantomData,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    task::{Context, Poll},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::*;

pub const DEFAULT_SERVER_TIMEOUT: Duration = Duration::from_secs(30);

type ClosedSubscriber = Arc<dyn Fn(Option<ClientError>) + Send + Sync>;

/// A long-lived client session speaking a hub protocol over an externally
/// supplied transport.
///
/// Cheap to clone; every clone drives the same session. Lifecycle runs
/// *unstarted → started → terminated/disposed*; a terminated connection can
/// be started again with a fresh transport from the factory.
#[derive(Clone)]
pub struct HubConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    transport_factory: TransportFactory,
    protocol: Box<dyn HubProtocol>,
    handlers: HandlerRegistry,
    pending: PendingCalls,
    watchdog: Watchdog,
    ids: InvocationIds,
    server_timeout: std::sync::Mutex<Duration>,
    started: AtomicBool,
    closed_fired: AtomicBool,
    closed_subscribers: std::sync::Mutex<Vec<ClosedSubscriber>>,
    // Connection critical section: serializes lifecycle transitions and all
    // outbound transmission. Lock order is connection lock, then the
    // pending-calls lock; never the reverse.
    state: tokio::sync::Mutex<ConnectionState>,
}

#[derive(Default)]
struct ConnectionState {
    disposed: bool,
    transport: Option<Arc<dyn Transport>>,
}

impl HubConnection {
    pub fn new(transport_factory: TransportFactory, protocol: Box<dyn HubProtocol>) -> Self {
        HubConnection {
            inner: Arc::new(ConnectionInner {
                transport_factory,
                protocol,
                handlers: HandlerRegistry::default(),
                pending: PendingCalls::new(),
                watchdog: Watchdog::new(),
                ids: InvocationIds::default(),
                server_timeout: std::sync::Mutex::new(DEFAULT_SERVER_TIMEOUT),
                started: AtomicBool::new(false),
                closed_fired: AtomicBool::new(false),
                closed_subscribers: std::sync::Mutex::new(Vec::new()),
                state: tokio::sync::Mutex::new(ConnectionState::default()),
            }),
        }
    }

    pub fn server_timeout(&self) -> Duration {
        *self.inner.server_timeout.lock().unwrap()
    }

    /// Takes effect at the next watchdog rearm.
    pub fn set_server_timeout(&self, timeout: Duration) {
        *self.inner.server_timeout.lock().unwrap() = timeout;
    }

    /// Registers a handler the server can invoke under `target`.
    ///
    /// The returned [`Subscription`] removes exactly this registration when
    /// dropped. The first handler registered for a target declares the
    /// parameter types the codec binds against.
    pub fn on<F>(
        &self,
        target: &str,
        parameter_types: &[ParameterType],
        callback: F,
        state: HandlerState,
    ) -> Subscription
    where
        F: Fn(Vec<Value>, HandlerState) -> BoxFuture<'static, Result<(), HandlerError>>
            + Send
            + Sync
            + 'static,
    {
        self.inner
            .handlers
            .register(target, parameter_types, Arc::new(callback) as HandlerCallback, state)
    }

    /// Subscribes to the closed event, fired exactly once per session with
    /// the terminating error (`None` on clean shutdown).
    pub fn on_closed<F>(&self, subscriber: F)
    where
        F: Fn(Option<ClientError>) + Send + Sync + 'static,
    {
        self.inner
            .closed_subscribers
            .lock()
            .unwrap()
            .push(Arc::new(subscriber));
    }

    /// Connects the transport and emits the negotiation frame.
    pub async fn start(&self) -> Result<(), ClientError> {
        let mut state = self.inner.state.lock().await;
        if state.disposed {
            return Err(ClientError::Disposed);
        }
        if state.transport.is_some() {
            return Err(ClientError::AlreadyStarted);
        }

        let transport = (self.inner.transport_factory)()?;
        // Callbacks go onto the freshly created transport before it starts so
        // no inbound batch is lost.
        transport.bind(Arc::new(ConnectionEvents {
            inner: Arc::downgrade(&self.inner),
        }));
        transport.start(self.inner.protocol.transfer_format()).await?;

        self.inner
            .watchdog
            .reset(!transport.has_inherent_keep_alive());
        self.inner.closed_fired.store(false, Ordering::SeqCst);
        self.inner.pending.activate();

        let handshake = negotiate::write_negotiation(self.inner.protocol.name())
            .map_err(ClientError::malformed_request)?;
        if let Err(error) = transport.send(handshake, CancellationToken::new()).await {
            transport.dispose().await;
            return Err(error.into());
        }

        ConnectionInner::rearm_watchdog(&self.inner);
        state.transport = Some(transport);
        self.inner.started.store(true, Ordering::SeqCst);
        debug!("hub connection started");
        Ok(())
    }

    /// Disconnects. The transport's closed event drives the shutdown fan-out.
    pub async fn stop(&self) -> Result<(), ClientError> {
        let state = self.inner.state.lock().await;
        if state.disposed {
            return Err(ClientError::Disposed);
        }
        let transport = state.transport.clone().ok_or(ClientError::NotConnected)?;
        transport.dispose().await;
        Ok(())
    }

    /// Idempotent teardown; after the first call every operation fails with
    /// [`ClientError::Disposed`].
    pub async fn dispose(&self) {
        let transport = {
            let mut state = self.inner.state.lock().await;
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.transport.clone()
        };
        if let Some(transport) = transport {
            transport.dispose().await;
        }
    }

    /// Fire-and-forget invocation: no id, no entry in the pending-call table,
    /// returns once the transport accepted the frame.
    pub async fn send(
        &self,
        target: &str,
        arguments: Vec<Value>,
        ct: CancellationToken,
    ) -> Result<(), ClientError> {
        self.ensure_started()?;
        let message = HubMessage::Invocation(Invocation::new(None, target.to_owned(), arguments));
        self.transmit(&message, &ct).await
    }

    /// Invokes `target` and awaits its completion. `Ok(None)` is an empty
    /// completion from a void method.
    ///
    /// Cancelling `ct` fails the call locally without a wire message; a
    /// completion the server sends afterwards is dropped at receive.
    pub async fn invoke<T>(
        &self,
        target: &str,
        arguments: Vec<Value>,
        ct: CancellationToken,
    ) -> Result<Option<T>, ClientError>
    where
        T: DeserializeOwned,
    {
        self.ensure_started()?;
        let invocation_id = self.inner.ids.next_id();
        let (request, receiver) = InvocationRequest::unary(invocation_id.clone(), ct.clone());
        let message = HubMessage::Invocation(Invocation::new(
            Some(invocation_id.clone()),
            target.to_owned(),
            arguments,
        ));
        self.register_and_transmit(Arc::new(request), &message, &ct)
            .await?;

        let outcome = tokio::select! {
            _ = ct.cancelled() => {
                if let Some(request) = self.inner.pending.remove(&invocation_id) {
                    request.dispose();
                }
                return Err(ClientError::Canceled);
            }
            outcome = receiver.recv_async() => outcome,
        };

        match outcome {
            Ok(Ok(Some(value))) => serde_json::from_value(value)
                .map(Some)
                .map_err(ClientError::malformed_response),
            Ok(Ok(None)) => Ok(None),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(ClientError::ConnectionTerminated),
        }
    }

    /// Invokes a streaming `target` and returns the channel of its items.
    ///
    /// Cancelling `ct` sends a best-effort cancel-invocation frame and
    /// completes the channel normally; the server's eventual completion is
    /// dropped at receive.
    pub async fn stream<T>(
        &self,
        target: &str,
        arguments: Vec<Value>,
        ct: CancellationToken,
    ) -> Result<HubStream<T>, ClientError>
    where
        T: DeserializeOwned,
    {
        self.ensure_started()?;
        let invocation_id = self.inner.ids.next_id();
        let (request, receiver) = InvocationRequest::stream(invocation_id.clone(), ct.clone());
        let request = Arc::new(request);
        let message = HubMessage::StreamInvocation(StreamInvocation::new(
            invocation_id.clone(),
            target.to_owned(),
            arguments,
        ));
        self.register_and_transmit(request.clone(), &message, &ct)
            .await?;

        let watcher = tokio::spawn({
            let inner = Arc::downgrade(&self.inner);
            let invocation_id = invocation_id.clone();
            let ct = ct.clone();
            async move {
                ct.cancelled().await;
                if let Some(inner) = inner.upgrade() {
                    inner.cancel_stream(&invocation_id).await;
                }
            }
        });
        request.set_watcher(watcher);

        Ok(HubStream {
            items: receiver.into_stream(),
            invocation_id,
            inner: Arc::downgrade(&self.inner),
            _item: PhantomData,
        })
    }

    fn ensure_started(&self) -> Result<(), ClientError> {
        if self.inner.started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ClientError::NotStarted)
        }
    }

    /// Registers the request and transmits its invocation frame under the
    /// connection lock, so either the entry is in the table with the active
    /// signal live, or neither. A transmission failure removes the entry.
    async fn register_and_transmit(
        &self,
        request: Arc<InvocationRequest>,
        message: &HubMessage,
        ct: &CancellationToken,
    ) -> Result<(), ClientError> {
        let state = self.inner.state.lock().await;
        if state.disposed {
            return Err(ClientError::Disposed);
        }
        if self.inner.pending.is_terminated() {
            return Err(ClientError::ConnectionTerminated);
        }
        let transport = state.transport.as_ref().ok_or(ClientError::NotConnected)?;

        let invocation_id = request.invocation_id().to_owned();
        self.inner.pending.insert(request)?;

        let frame = match self.inner.protocol.write_message(message) {
            Ok(frame) => frame,
            Err(error) => {
                self.remove_pending(&invocation_id);
                return Err(ClientError::malformed_request(error));
            }
        };
        if let Err(error) = transport.send(frame, ct.clone()).await {
            self.remove_pending(&invocation_id);
            return Err(error.into());
        }
        Ok(())
    }

    async fn transmit(
        &self,
        message: &HubMessage,
        ct: &CancellationToken,
    ) -> Result<(), ClientError> {
        let state = self.inner.state.lock().await;
        if state.disposed {
            return Err(ClientError::Disposed);
        }
        if self.inner.pending.is_terminated() {
            return Err(ClientError::ConnectionTerminated);
        }
        let transport = state.transport.as_ref().ok_or(ClientError::NotConnected)?;
        let frame = self
            .inner
            .protocol
            .write_message(message)
            .map_err(ClientError::malformed_request)?;
        transport.send(frame, ct.clone()).await?;
        Ok(())
    }

    fn remove_pending(&self, invocation_id: &str) {
        if let Some(request) = self.inner.pending.remove(invocation_id) {
            request.dispose();
        }
    }
}

impl ConnectionInner {
    fn rearm_watchdog(inner: &Arc<ConnectionInner>) {
        let timeout = *inner.server_timeout.lock().unwrap();
        let weak = Arc::downgrade(inner);
        inner.watchdog.rearm(timeout, async move {
            if let Some(inner) = weak.upgrade() {
                warn!("server timeout elapsed, aborting transport");
                let transport = inner.state.lock().await.transport.clone();
                if let Some(transport) = transport {
                    transport.abort(ClientError::ServerTimeout);
                }
            }
        });
    }

    async fn on_received(self: Arc<Self>, data: Vec<u8>) {
        // Rearm before any other work on the batch.
        ConnectionInner::rearm_watchdog(&self);

        let messages = match self.protocol.parse_messages(&data, &*self) {
            Ok(messages) => messages,
            Err(error @ ProtocolError::UnknownMessage { .. }) => {
                error!(%error, "protocol violation, tearing the session down");
                self.fatal(ClientError::protocol_violation(error)).await;
                return;
            }
            Err(error) => {
                warn!(%error, "dropping unparseable inbound batch");
                return;
            }
        };

        for message in messages {
            self.dispatch(message).await;
        }
    }

    async fn dispatch(&self, message: HubMessage) {
        match message {
            HubMessage::Invocation(invocation) => self.dispatch_invocation(invocation).await,
            HubMessage::Completion(completion) => self.dispatch_completion(completion),
            HubMessage::StreamItem(item) => self.dispatch_stream_item(item).await,
            HubMessage::Ping => trace!("ping received"),
            HubMessage::StreamInvocation(invocation) => {
                self.fatal(ClientError::protocol_violation(format!(
                    "server-initiated stream invocation of {} is not supported",
                    invocation.target
                )))
                .await;
            }
            HubMessage::CancelInvocation(cancel) => {
                self.fatal(ClientError::protocol_violation(format!(
                    "received cancel invocation for {}",
                    cancel.invocation_id
                )))
                .await;
            }
        }
    }

    async fn dispatch_invocation(&self, invocation: Invocation) {
        if let Some(error) = &invocation.binding_error {
            warn!(target = %invocation.target, %error, "dropping invocation with binding error");
            return;
        }
        let handlers = self.handlers.snapshot(&invocation.target);
        if handlers.is_empty() {
            warn!(target = %invocation.target, "no handlers registered for target");
            return;
        }
        for handler in handlers {
            // One handler's failure must not keep the rest from running.
            if let Err(error) =
                (handler.callback)(invocation.arguments.clone(), handler.state.clone()).await
            {
                warn!(target = %invocation.target, %error, "handler failed");
            }
        }
    }

    fn dispatch_completion(&self, completion: Completion) {
        let Some(request) = self.pending.remove(&completion.invocation_id) else {
            debug!(
                invocation_id = %completion.invocation_id,
                "dropping completion with no pending invocation"
            );
            return;
        };
        if request.is_cancelled() {
            trace!(
                invocation_id = %completion.invocation_id,
                "dropping completion for a canceled invocation"
            );
        } else if let Some(error) = completion.error {
            request.fail(ClientError::server(error));
        } else {
            request.succeed(completion.result);
        }
        request.dispose();
    }

    async fn dispatch_stream_item(&self, item: StreamItem) {
        let Some(request) = self.pending.lookup(&item.invocation_id) else {
            debug!(invocation_id = %item.invocation_id, "dropping stream item with no pending invocation");
            return;
        };
        if request.is_cancelled() || request.is_complete() {
            trace!(invocation_id = %item.invocation_id, "dropping stream item for a resolved invocation");
            return;
        }
        match request.stream_sender() {
            Some(sender) => {
                if sender.send_async(Ok(item.item)).await.is_err() {
                    debug!(invocation_id = %item.invocation_id, "stream channel closed, item dropped");
                }
            }
            None => {
                warn!(invocation_id = %item.invocation_id, "stream item for a unary invocation");
            }
        }
    }

    /// Hard fault: tear the session down through the transport so the closed
    /// event runs the regular shutdown.
    async fn fatal(&self, error: ClientError) {
        let transport = self.state.lock().await.transport.clone();
        match transport {
            Some(transport) => transport.abort(error),
            None => self.handle_close(Some(error)).await,
        }
    }

    /// Runs once per session when the transport reports closed: releases the
    /// transport, fans the terminating error out to every pending invocation
    /// and fires the closed event exactly once.
    async fn handle_close(&self, error: Option<ClientError>) {
        let had_transport = { self.state.lock().await.transport.take().is_some() };
        self.watchdog.dispose();
        if !had_transport {
            return;
        }

        match &error {
            Some(error) => warn!(%error, "connection closed with error"),
            None => debug!("connection closed"),
        }
        self.pending.shutdown(error.clone());

        if !self.closed_fired.swap(true, Ordering::SeqCst) {
            let subscribers = self.closed_subscribers.lock().unwrap().clone();
            for subscriber in subscribers {
                if panic::catch_unwind(AssertUnwindSafe(|| subscriber(error.clone()))).is_err() {
                    warn!("closed subscriber panicked");
                }
            }
        }
    }

    /// Stream cancellation: best-effort cancel frame while the session is
    /// still active, then local resolution. A completion the server sends
    /// later finds no entry and is dropped.
    async fn cancel_stream(&self, invocation_id: &str) {
        if !self.pending.is_terminated() {
            let state = self.state.lock().await;
            if let Some(transport) = state.transport.as_ref() {
                let message =
                    HubMessage::CancelInvocation(CancelInvocation::new(invocation_id.to_owned()));
                match self.protocol.write_message(&message) {
                    Ok(frame) => {
                        if let Err(error) = transport.send(frame, CancellationToken::new()).await {
                            debug!(%error, invocation_id, "cancel invocation frame dropped");
                        }
                    }
                    Err(error) => {
                        debug!(%error, invocation_id, "cancel invocation frame not serialized");
                    }
                }
            }
        }
        // No awaits after dispose: it aborts the watcher task running this.
        if let Some(request) = self.pending.remove(invocation_id) {
            request.dispose();
        }
    }
}

impl InvocationBinder for ConnectionInner {
    fn result_binding(&self, invocation_id: &str) -> ResultBinding {
        match self.pending.lookup(invocation_id).map(|request| request.shape()) {
            Some(InvocationShape::Unary) => ResultBinding::Value,
            Some(InvocationShape::Stream) => ResultBinding::Stream,
            None => ResultBinding::Discard,
        }
    }

    fn parameter_types(&self, target: &str) -> Vec<ParameterType> {
        self.handlers.parameter_types(target)
    }
}

/// Transport-facing side of the connection. Holds the core weakly so a
/// transport never extends the session's lifetime.
struct ConnectionEvents {
    inner: Weak<ConnectionInner>,
}

#[async_trait]
impl TransportEvents for ConnectionEvents {
    async fn on_received(&self, data: Vec<u8>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_received(data).await;
        }
    }

    async fn on_closed(&self, error: Option<ClientError>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_close(error).await;
        }
    }
}

/// Lazy stream of invocation results.
///
/// Completes when the server completes the invocation, when the session
/// shuts down, or when the caller cancels. Dropping it removes the pending
/// entry, so later items are dropped at receive.
pub struct HubStream<T> {
    items: flume::r#async::RecvStream<'static, StreamOutcome>,
    invocation_id: String,
    inner: Weak<ConnectionInner>,
    _item: PhantomData<T>,
}

impl<T> Unpin for HubStream<T> {}

impl<T> Stream for HubStream<T>
where
    T: DeserializeOwned,
{
    type Item = Result<T, ClientError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.items.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(value))) => Poll::Ready(Some(
                serde_json::from_value(value).map_err(ClientError::malformed_response),
            )),
            Poll::Ready(Some(Err(error))) => Poll::Ready(Some(Err(error))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for HubStream<T> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            if let Some(request) = inner.pending.remove(&self.invocation_id) {
                request.dispose();
            }
        }
    }
}
