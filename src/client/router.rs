//! Request router and call tracker.
//!
//! The router sits above a [`FrameSink`] (normally a [`Transport`]). It
//! allocates request ids, matches responses to in-flight calls, queues calls
//! made while disconnected and replays them in order on reconnect, and keeps
//! the single tracked slot for hardware tag writes.
//!
//! Every call settles exactly once: with the matching response, with its
//! timeout, or with its cancellation handle. Whichever comes first removes
//! the pending entry; the others find nothing left to resolve. Each pending
//! entry owns a small watcher task for its deadline and token, so a call
//! settles whether or not anyone awaits it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::core::{
    CallError, CodecError, ConfigError, DEFAULT_REQUEST_TIMEOUT, METHOD_WRITE,
    METHOD_WRITE_CANCEL, NOTIFICATION_CHANNEL_CAPACITY, TransportError,
};
use crate::transport::{
    Inbound, Notification, Transport, TransportEvent, TransportState, decode_frame,
    encode_request,
};

/// Where the router hands encoded frames.
pub trait FrameSink: Send + Sync {
    /// Whether frames can be sent right now.
    fn is_connected(&self) -> bool;

    /// Send one encoded frame.
    fn send_frame(&self, frame: String) -> Result<(), TransportError>;
}

impl FrameSink for Transport {
    fn is_connected(&self) -> bool {
        Transport::is_connected(self)
    }

    fn send_frame(&self, frame: String) -> Result<(), TransportError> {
        self.send(frame)
    }
}

/// Router configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    /// Deadline for every call, measured from when it is issued.
    pub request_timeout: Duration,
    /// Queue calls made while disconnected instead of failing them.
    pub queue_while_disconnected: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            queue_while_disconnected: true,
        }
    }
}

impl RouterConfig {
    /// Set the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Enable or disable queuing while disconnected.
    pub fn with_queueing(mut self, enabled: bool) -> Self {
        self.queue_while_disconnected = enabled;
        self
    }

    /// Check the configuration invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("request_timeout"));
        }
        Ok(())
    }
}

/// How a call settled when it did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// The device answered.
    Completed(Value),
    /// The caller cancelled.
    Cancelled,
    /// A newer write took over the write slot.
    Superseded,
}

impl CallOutcome {
    /// The result payload, if the call completed.
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Completed(value) => Some(value),
            _ => None,
        }
    }

    /// Whether the call was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Parameters for a tag write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteRequest {
    /// Text to write to the tag.
    pub text: String,
}

impl WriteRequest {
    /// Write `text` to the next tag presented.
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

type Reply = Result<CallOutcome, CallError>;

struct PendingCall {
    method: String,
    reply: oneshot::Sender<Reply>,
    watcher: JoinHandle<()>,
}

impl PendingCall {
    fn settle(self, reply: Reply) {
        self.watcher.abort();
        let _ = self.reply.send(reply);
    }
}

struct QueuedFrame {
    id: String,
    frame: String,
}

struct RouterInner {
    sink: Option<Arc<dyn FrameSink>>,
    pending: HashMap<String, PendingCall>,
    queue: VecDeque<QueuedFrame>,
    write_slot: Option<String>,
    session: u32,
    next_id: u64,
    pump: Option<JoinHandle<()>>,
}

impl RouterInner {
    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        format!("{:08x}-{}", self.session, self.next_id)
    }

    fn is_connected(&self) -> bool {
        self.sink.as_ref().is_some_and(|sink| sink.is_connected())
    }

    fn is_queued(&self, id: &str) -> bool {
        self.queue.iter().any(|queued| queued.id == id)
    }

    /// Remove every trace of `id`. The caller settles the returned call.
    fn take(&mut self, id: &str) -> Option<PendingCall> {
        if self.write_slot.as_deref() == Some(id) {
            self.write_slot = None;
        }
        self.queue.retain(|queued| queued.id != id);
        self.pending.remove(id)
    }

    fn flush(&mut self) {
        let Some(sink) = self.sink.clone() else {
            return;
        };
        if !sink.is_connected() || self.queue.is_empty() {
            return;
        }
        debug!(queued = self.queue.len(), "flushing queued requests");
        while let Some(QueuedFrame { id, frame }) = self.queue.pop_front() {
            if let Err(e) = sink.send_frame(frame) {
                warn!(id = %id, error = %e, "queued request failed to send");
                if let Some(call) = self.take(&id) {
                    call.settle(Err(CallError::FlushFailed(e.to_string())));
                }
            }
        }
    }
}

/// JSON-RPC call tracker over a [`FrameSink`].
///
/// Cheap to clone; clones share the same pending calls.
#[derive(Clone)]
pub struct Router {
    inner: Arc<Mutex<RouterInner>>,
    config: RouterConfig,
    notifications: broadcast::Sender<Notification>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Router")
            .field("pending", &inner.pending.len())
            .field("queued", &inner.queue.len())
            .field("write_slot", &inner.write_slot)
            .finish()
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

impl Router {
    /// Create a router with no sink attached.
    pub fn new(config: RouterConfig) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(RouterInner {
                sink: None,
                pending: HashMap::new(),
                queue: VecDeque::new(),
                write_slot: None,
                session: rand::random(),
                next_id: 0,
                pump: None,
            })),
            config,
            notifications,
        }
    }

    /// Router configuration.
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, RouterInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn downgrade(&self) -> WeakRouter {
        WeakRouter {
            inner: Arc::downgrade(&self.inner),
            config: self.config.clone(),
            notifications: self.notifications.clone(),
        }
    }

    /// Issue a call and wait for it to settle.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: Option<CancellationToken>,
    ) -> Result<CallOutcome, CallError> {
        self.call_with_tracking(method, params, cancel).response().await
    }

    /// Issue a call and return its id along with a handle to await it.
    ///
    /// The timeout and the cancellation listener are armed right away, so
    /// a call that is never awaited still settles. Must be called from
    /// within a tokio runtime.
    pub fn call_with_tracking(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: Option<CancellationToken>,
    ) -> TrackedCall {
        self.issue(method, params, cancel, false)
    }

    /// Write a tag and wait for the outcome.
    pub async fn write(
        &self,
        request: WriteRequest,
        cancel: Option<CancellationToken>,
    ) -> Result<CallOutcome, CallError> {
        self.start_write(request, cancel).response().await
    }

    /// Start a tag write, taking over the write slot.
    ///
    /// A write still tracked in the slot settles with
    /// [`CallOutcome::Superseded`].
    pub fn start_write(&self, request: WriteRequest, cancel: Option<CancellationToken>) -> TrackedCall {
        let params = match serde_json::to_value(&request) {
            Ok(params) => params,
            Err(e) => {
                let error = CallError::Codec(CodecError::Encode(e.to_string()));
                return self.ready(String::new(), METHOD_WRITE, Err(error));
            }
        };
        self.issue(METHOD_WRITE, Some(params), cancel, true)
    }

    fn issue(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: Option<CancellationToken>,
        is_write: bool,
    ) -> TrackedCall {
        let mut inner = self.lock();
        let id = inner.allocate_id();

        if cancel.as_ref().is_some_and(|token| token.is_cancelled()) {
            debug!(id = %id, method, "call cancelled before send");
            return self.ready(id, method, Ok(CallOutcome::Cancelled));
        }

        let frame = match encode_request(method, params.as_ref(), &id) {
            Ok(frame) => frame,
            Err(e) => return self.ready(id, method, Err(e.into())),
        };

        let connected = inner.is_connected();
        if !connected && !self.config.queue_while_disconnected {
            return self.ready(id, method, Err(TransportError::NotOpen.into()));
        }

        if is_write {
            if let Some(previous) = inner.write_slot.take() {
                if let Some(call) = inner.take(&previous) {
                    debug!(id = %previous, "write superseded");
                    call.settle(Ok(CallOutcome::Superseded));
                }
            }
            inner.write_slot = Some(id.clone());
        }

        let (reply, rx) = oneshot::channel();
        let watcher = tokio::spawn(watch_call(
            self.downgrade(),
            id.clone(),
            Instant::now() + self.config.request_timeout,
            cancel,
        ));
        inner.pending.insert(
            id.clone(),
            PendingCall {
                method: method.to_string(),
                reply,
                watcher,
            },
        );

        if connected && inner.queue.is_empty() {
            if let Some(sink) = inner.sink.clone() {
                if let Err(e) = sink.send_frame(frame) {
                    warn!(id = %id, method, error = %e, "request failed to send");
                    if let Some(call) = inner.take(&id) {
                        call.watcher.abort();
                    }
                    return self.ready(id, method, Err(e.into()));
                }
            }
            trace!(id = %id, method, "request sent");
        } else {
            trace!(id = %id, method, queued = inner.queue.len() + 1, "request queued");
            inner.queue.push_back(QueuedFrame {
                id: id.clone(),
                frame,
            });
            inner.flush();
        }

        TrackedCall {
            id,
            method: method.to_string(),
            router: self.clone(),
            state: Some(CallState::Waiting(rx)),
        }
    }

    fn ready(&self, id: String, method: &str, reply: Reply) -> TrackedCall {
        TrackedCall {
            id,
            method: method.to_string(),
            router: self.clone(),
            state: Some(CallState::Ready(reply)),
        }
    }

    /// Cancel the call with `id`. Returns whether anything was pending.
    pub fn cancel(&self, id: &str) -> bool {
        let call = self.lock().take(id);
        match call {
            Some(call) => {
                debug!(id, method = %call.method, "call cancelled");
                call.settle(Ok(CallOutcome::Cancelled));
                true
            }
            None => {
                debug!(id, "cancel for unknown call ignored");
                false
            }
        }
    }

    /// Cancel the tracked write and tell the device to stop writing.
    ///
    /// The write settles with [`CallOutcome::Cancelled`]. The cancel frame
    /// is sent directly; a failure is logged. No-op when no write is
    /// tracked.
    pub fn cancel_write(&self) {
        let mut inner = self.lock();
        let Some(id) = inner.write_slot.take() else {
            debug!("cancel_write with no pending write");
            return;
        };
        if let Some(call) = inner.take(&id) {
            call.settle(Ok(CallOutcome::Cancelled));
        }

        drop(inner);

        debug!(id = %id, "write cancelled");
        self.send_write_cancel(&id);
    }

    fn send_write_cancel(&self, write_id: &str) {
        let (cancel_id, sink) = {
            let mut inner = self.lock();
            (inner.allocate_id(), inner.sink.clone())
        };
        let result = encode_request(METHOD_WRITE_CANCEL, None, &cancel_id)
            .map_err(|e| e.to_string())
            .and_then(|frame| match sink {
                Some(sink) => sink.send_frame(frame).map_err(|e| e.to_string()),
                None => Err(TransportError::NotOpen.to_string()),
            });
        if let Err(e) = result {
            warn!(id = write_id, error = %e, "failed to send write cancel");
        }
    }

    /// Send every queued frame in order if the sink is connected.
    pub fn flush(&self) {
        self.lock().flush();
    }

    /// Feed one inbound text frame.
    ///
    /// Malformed frames and responses for unknown ids are logged and
    /// dropped.
    pub fn handle_message(&self, raw: &str) {
        let inbound = match decode_frame(raw) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(error = %e, "dropping inbound frame");
                return;
            }
        };
        match inbound {
            Inbound::Heartbeat(_) => {}
            Inbound::Response { id, result } => self.resolve(&id, Ok(CallOutcome::Completed(result))),
            Inbound::Failure { id, error } => self.resolve(
                &id,
                Err(CallError::Remote {
                    code: error.code,
                    message: error.message,
                }),
            ),
            Inbound::Notification(notification) => {
                trace!(method = %notification.method, "notification");
                let _ = self.notifications.send(notification);
            }
        }
    }

    fn resolve(&self, id: &str, reply: Reply) {
        let call = self.lock().take(id);
        match call {
            Some(call) => {
                trace!(id, method = %call.method, "response matched");
                call.settle(reply);
            }
            None => debug!(id, "response for unknown or settled call dropped"),
        }
    }

    /// Use `transport` as the sink and follow its events.
    ///
    /// Inbound messages are routed through
    /// [`handle_message`](Self::handle_message) and the queue is flushed
    /// whenever the transport reaches `Connected`. A destroyed transport is
    /// logged and ignored.
    pub fn attach(&self, transport: &Transport) {
        if transport.is_destroyed() {
            error!(address = %transport.target(), "refusing to attach a destroyed transport");
            return;
        }
        let events = transport.subscribe();
        let pump = tokio::spawn(pump(self.downgrade(), events));

        let mut inner = self.lock();
        if let Some(previous) = inner.pump.replace(pump) {
            previous.abort();
        }
        inner.sink = Some(Arc::new(transport.clone()));
        inner.flush();
    }

    /// Use `sink` for outbound frames. Flushes if it is connected.
    pub fn set_sink(&self, sink: Arc<dyn FrameSink>) {
        let mut inner = self.lock();
        inner.sink = Some(sink);
        inner.flush();
    }

    /// Whether the current sink is connected.
    pub fn is_connected(&self) -> bool {
        self.lock().is_connected()
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.lock().pending.len()
    }

    /// Number of frames waiting for a connection.
    pub fn queued_frames(&self) -> usize {
        self.lock().queue.len()
    }

    /// Unsolicited server notifications.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<Notification> {
        self.notifications.subscribe()
    }

    /// Drop the sink and every pending call.
    ///
    /// Pending calls fail with [`CallError::Reset`].
    pub fn reset(&self) {
        let mut inner = self.lock();
        if let Some(pump) = inner.pump.take() {
            pump.abort();
        }
        inner.sink = None;
        inner.queue.clear();
        inner.write_slot = None;
        let pending: Vec<_> = inner.pending.drain().map(|(_, call)| call).collect();
        drop(inner);

        if !pending.is_empty() {
            debug!(count = pending.len(), "rejecting pending calls on reset");
        }
        for call in pending {
            call.settle(Err(CallError::Reset));
        }
    }

    /// Settle `id` as cancelled if it is still pending.
    ///
    /// A write that already reached the device is also cancelled remotely.
    fn cancel_in_flight(&self, id: &str) {
        let (call, sent) = {
            let mut inner = self.lock();
            let sent = !inner.is_queued(id);
            (inner.take(id), sent)
        };
        let Some(call) = call else {
            return;
        };
        debug!(id, method = %call.method, sent, "call cancelled");
        let is_write = call.method == METHOD_WRITE;
        call.settle(Ok(CallOutcome::Cancelled));
        if is_write && sent {
            self.send_write_cancel(id);
        }
    }

    /// Settle `id` with a timeout if it is still pending.
    fn expire(&self, id: &str) {
        let call = self.lock().take(id);
        if let Some(call) = call {
            warn!(id, method = %call.method, "request timed out");
            let method = call.method.clone();
            call.settle(Err(CallError::Timeout {
                method,
                after: self.config.request_timeout,
            }));
        }
    }

    fn forget(&self, id: &str) -> bool {
        let call = self.lock().take(id);
        match call {
            Some(call) => {
                call.watcher.abort();
                true
            }
            None => false,
        }
    }
}

struct WeakRouter {
    inner: Weak<Mutex<RouterInner>>,
    config: RouterConfig,
    notifications: broadcast::Sender<Notification>,
}

impl WeakRouter {
    fn upgrade(&self) -> Option<Router> {
        Some(Router {
            inner: self.inner.upgrade()?,
            config: self.config.clone(),
            notifications: self.notifications.clone(),
        })
    }
}

async fn pump(router: WeakRouter, mut events: broadcast::Receiver<TransportEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "router fell behind transport events");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        let Some(router) = router.upgrade() else {
            break;
        };
        match event {
            TransportEvent::Message(text) => router.handle_message(&text),
            TransportEvent::StateChanged(TransportState::Connected) => router.flush(),
            TransportEvent::StateChanged(TransportState::Destroyed) => break,
            _ => {}
        }
    }
}

/// Settles one call on its deadline or its cancellation token.
async fn watch_call(
    router: WeakRouter,
    id: String,
    deadline: Instant,
    cancel: Option<CancellationToken>,
) {
    let cancelled = async {
        match &cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };
    let expired = tokio::select! {
        _ = cancelled => false,
        _ = tokio::time::sleep_until(deadline) => true,
    };
    let Some(router) = router.upgrade() else {
        return;
    };
    if expired {
        router.expire(&id);
    } else {
        router.cancel_in_flight(&id);
    }
}

enum CallState {
    Ready(Reply),
    Waiting(oneshot::Receiver<Reply>),
}

/// An issued call.
///
/// Dropping it before it settles forgets the call.
pub struct TrackedCall {
    id: String,
    method: String,
    router: Router,
    state: Option<CallState>,
}

impl std::fmt::Debug for TrackedCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedCall")
            .field("id", &self.id)
            .field("method", &self.method)
            .finish()
    }
}

impl TrackedCall {
    /// Request id, usable with [`Router::cancel`].
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the call to settle.
    pub async fn response(mut self) -> Result<CallOutcome, CallError> {
        match self.state.take() {
            Some(CallState::Ready(reply)) => reply,
            Some(CallState::Waiting(rx)) => rx.await.unwrap_or(Err(CallError::Reset)),
            None => Err(CallError::Reset),
        }
    }
}

impl Drop for TrackedCall {
    fn drop(&mut self) {
        if let Some(CallState::Waiting(_)) = self.state {
            if self.router.forget(&self.id) {
                trace!(id = %self.id, "dropped call forgotten");
            }
        }
    }
}
