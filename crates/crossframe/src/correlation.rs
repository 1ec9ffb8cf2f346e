//! Correlation engine - turns a duplex message channel into request/response.
//!
//! Owns:
//! - The pending-request table (id → reply continuation + expiration)
//! - The listener registry (message type → listeners)
//! - One shared timeout sweep task per engine, instead of a timer per request
//! - One event dispatch task per engine, so events reach listeners in arrival
//!   order
//!
//! Request flow:
//! 1. `generate_id()` and `create_pending_request()` before delivery
//! 2. Counterpart answers with a response carrying the same id
//! 3. `handle_response()` removes the entry and settles the caller's future
//!
//! An entry leaves the table exactly once: on response, on sweep expiry, or on
//! `cleanup()`. Lookups of ids that are already gone are no-ops.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::protocol::{EventMessage, RequestMessage, ResponseMessage, now_millis};

/// Process-wide sequence so ids never repeat, even across engines.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Async handler bound to a message type.
///
/// For requests the returned value becomes the response `data`; an error
/// becomes a failure response carrying the error text. For events the value
/// is discarded and errors are logged.
pub type Listener = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Wrap an async closure as a [`Listener`].
pub fn listener<F, Fut>(f: F) -> Listener
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |payload| f(payload).boxed())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct ListenerRegistry {
    by_type: DashMap<String, Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl ListenerRegistry {
    fn add(&self, message_type: &str, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.by_type
            .entry(message_type.to_string())
            .or_default()
            .push((id, listener));
        id
    }

    fn remove(&self, message_type: &str, id: Option<ListenerId>) {
        match id {
            Some(id) => {
                let now_empty = match self.by_type.get_mut(message_type) {
                    Some(mut listeners) => {
                        listeners.retain(|(existing, _)| *existing != id);
                        listeners.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    self.by_type
                        .remove_if(message_type, |_, listeners| listeners.is_empty());
                }
            }
            None => {
                self.by_type.remove(message_type);
            }
        }
    }

    /// Clone the listeners out so no map guard is held across an await.
    fn snapshot(&self, message_type: &str) -> Vec<Listener> {
        self.by_type
            .get(message_type)
            .map(|listeners| listeners.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default()
    }
}

/// Capability to remove exactly one registered listener.
///
/// Dropping it does not unsubscribe.
#[must_use = "dropping a Subscription keeps the listener registered; call unsubscribe() to remove it"]
pub struct Subscription {
    message_type: String,
    id: ListenerId,
    registry: Weak<ListenerRegistry>,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.message_type, Some(self.id));
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("message_type", &self.message_type)
            .field("id", &self.id)
            .finish()
    }
}

struct PendingRequest {
    reply: oneshot::Sender<Result<Value, BridgeError>>,
    expires_at: Option<Instant>,
}

/// Awaitable side of a pending request.
///
/// Resolves with the response data, or with the error that settled the entry.
/// If the engine is dropped without settling it, resolves with
/// [`BridgeError::Destroyed`].
#[derive(Debug)]
pub struct PendingReply {
    id: String,
    rx: oneshot::Receiver<Result<Value, BridgeError>>,
}

impl PendingReply {
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Future for PendingReply {
    type Output = Result<Value, BridgeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(BridgeError::Destroyed)))
    }
}

/// One inbound event with the listeners registered when it arrived.
struct EventJob {
    message_type: String,
    payload: Value,
    listeners: Vec<Listener>,
}

impl EventJob {
    async fn run(self) {
        let EventJob {
            message_type,
            payload,
            listeners,
        } = self;
        let calls = listeners
            .into_iter()
            .map(|listener| call_guarded(listener, payload.clone()));
        for result in futures::future::join_all(calls).await {
            if let Err(error) = result {
                tracing::warn!(
                    message_type = %message_type,
                    error = %error,
                    "Event listener failed"
                );
            }
        }
    }
}

pub struct CorrelationEngine {
    pending: DashMap<String, PendingRequest>,
    listeners: Arc<ListenerRegistry>,
    events: mpsc::UnboundedSender<EventJob>,
    default_timeout: Option<Duration>,
    debug: bool,
    destroyed: AtomicBool,
    shutdown: CancellationToken,
}

impl CorrelationEngine {
    /// Create an engine and start its timeout sweep and event dispatch tasks.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(default_timeout: Option<Duration>, sweep_interval: Duration, debug: bool) -> Arc<Self> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            pending: DashMap::new(),
            listeners: Arc::new(ListenerRegistry::default()),
            events,
            default_timeout,
            debug,
            destroyed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });
        engine.start_sweep(sweep_interval);
        engine.start_event_dispatch(events_rx);
        engine
    }

    pub fn from_config(config: &BridgeConfig) -> Arc<Self> {
        Self::new(config.timeout, config.sweep_interval, config.debug)
    }

    fn start_sweep(self: &Arc<Self>, interval: Duration) {
        let engine = Arc::downgrade(self);
        let cancel = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(engine) = engine.upgrade() else { break };
                        engine.sweep_expired(Instant::now());
                    }
                }
            }
            tracing::trace!("Timeout sweep exiting");
        });
    }

    /// Events run one at a time: every listener of an event settles before
    /// the next event starts.
    fn start_event_dispatch(&self, mut jobs: mpsc::UnboundedReceiver<EventJob>) {
        let cancel = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let job = tokio::select! {
                    _ = cancel.cancelled() => break,
                    job = jobs.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };
                job.run().await;
            }
            tracing::trace!("Event dispatch exiting");
        });
    }

    /// Reject every pending request whose expiration is at or before `now`.
    fn sweep_expired(&self, now: Instant) -> usize {
        if self.pending.is_empty() {
            return 0;
        }

        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.expires_at.is_some_and(|at| now >= at))
            .map(|entry| entry.key().clone())
            .collect();

        let mut rejected = 0;
        for id in expired {
            if let Some((id, pending)) = self.pending.remove(&id) {
                if self.debug {
                    tracing::debug!(request_id = %id, "Request timed out");
                }
                let _ = pending.reply.send(Err(BridgeError::Timeout { id }));
                rejected += 1;
            }
        }
        rejected
    }

    /// Fresh correlation id: `msg_<unix-ms>_<sequence>`.
    pub fn generate_id(&self) -> String {
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1;
        format!("msg_{}_{}", now_millis(), seq)
    }

    /// Register a continuation for `id`.
    ///
    /// Effective timeout is `timeout`, else the engine default, else none.
    pub fn create_pending_request(
        &self,
        id: impl Into<String>,
        timeout: Option<Duration>,
    ) -> PendingReply {
        let id = id.into();
        let (tx, rx) = oneshot::channel();

        if self.is_destroyed() {
            let _ = tx.send(Err(BridgeError::Destroyed));
            return PendingReply { id, rx };
        }

        let expires_at = timeout
            .or(self.default_timeout)
            .map(|timeout| Instant::now() + timeout);

        let pending = PendingRequest {
            reply: tx,
            expires_at,
        };
        if self.pending.insert(id.clone(), pending).is_some() {
            tracing::warn!(request_id = %id, "Replaced pending request with duplicate id");
        }

        // cleanup() may have drained the table between the check and the insert.
        if self.is_destroyed()
            && let Some((_, pending)) = self.pending.remove(&id)
        {
            let _ = pending.reply.send(Err(BridgeError::Destroyed));
        }

        PendingReply { id, rx }
    }

    /// Settle the pending request matching `response.id`.
    ///
    /// Returns false for unknown ids (late, duplicate or never issued).
    pub fn handle_response(&self, response: ResponseMessage) -> bool {
        let Some((id, pending)) = self.pending.remove(&response.id) else {
            if self.debug {
                tracing::debug!(request_id = %response.id, "Dropping response for unknown request");
            }
            return false;
        };

        let outcome = if response.success {
            Ok(response.data.unwrap_or(Value::Null))
        } else {
            Err(BridgeError::Remote(
                response.error.unwrap_or_else(|| "Unknown error".to_string()),
            ))
        };

        if pending.reply.send(outcome).is_err() && self.debug {
            tracing::debug!(request_id = %id, "Requester went away before the response arrived");
        }
        true
    }

    /// Forget a pending request without settling it.
    ///
    /// Used when delivery fails after registration; the caller reports the
    /// delivery error itself.
    pub fn discard_pending(&self, id: &str) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Run every listener for `request.type` and build the response.
    ///
    /// Listeners run concurrently; the first failure fails the whole request.
    /// On success the first registered listener's value is the response data.
    pub async fn handle_request(&self, request: RequestMessage) -> ResponseMessage {
        if self.debug {
            tracing::debug!(
                request_id = %request.id,
                message_type = %request.message_type,
                "Handling request"
            );
        }

        let listeners = self.listeners.snapshot(&request.message_type);
        if listeners.is_empty() {
            return ResponseMessage::failure(
                request.id,
                format!("No handler for message type: {}", request.message_type),
            );
        }

        let calls = listeners
            .into_iter()
            .map(|listener| call_guarded(listener, request.payload.clone()));

        match futures::future::try_join_all(calls).await {
            Ok(results) => {
                let data = results.into_iter().next().unwrap_or(Value::Null);
                ResponseMessage::success(request.id, data)
            }
            Err(error) => {
                tracing::warn!(
                    request_id = %request.id,
                    message_type = %request.message_type,
                    error = %error,
                    "Request handler failed"
                );
                ResponseMessage::failure(request.id, error.to_string())
            }
        }
    }

    /// Queue an event for the dispatch task.
    ///
    /// Returns the number of listeners it will reach. Failures and panics are
    /// logged per listener and never stop the others.
    pub fn dispatch_event(&self, event: EventMessage) -> usize {
        let listeners = self.listeners.snapshot(&event.message_type);
        let count = listeners.len();
        if count == 0 {
            if self.debug {
                tracing::debug!(message_type = %event.message_type, "No listener for event");
            }
            return 0;
        }

        let job = EventJob {
            message_type: event.message_type,
            payload: event.payload,
            listeners,
        };
        if self.events.send(job).is_err() {
            tracing::debug!("Event dispatch stopped, dropping event");
            return 0;
        }
        count
    }

    pub fn add_listener(&self, message_type: &str, listener: Listener) -> Subscription {
        let id = self.listeners.add(message_type, listener);
        Subscription {
            message_type: message_type.to_string(),
            id,
            registry: Arc::downgrade(&self.listeners),
        }
    }

    /// Remove one listener, or every listener for `message_type` when `id` is None.
    pub fn remove_listener(&self, message_type: &str, id: Option<ListenerId>) {
        self.listeners.remove(message_type, id);
    }

    /// Stop the sweep, reject everything pending and clear all listeners.
    pub fn cleanup(&self) {
        let first = !self.destroyed.swap(true, Ordering::SeqCst);
        self.shutdown.cancel();

        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let mut rejected = 0;
        for id in ids {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.reply.send(Err(BridgeError::Destroyed));
                rejected += 1;
            }
        }
        self.listeners.by_type.clear();

        if first && self.debug {
            tracing::debug!(rejected, "Correlation engine cleaned up");
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of message types with at least one listener.
    pub fn listener_type_count(&self) -> usize {
        self.listeners.by_type.len()
    }

    pub fn listener_count(&self, message_type: &str) -> usize {
        self.listeners
            .by_type
            .get(message_type)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

impl Drop for CorrelationEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Run one listener, turning a panic into an error.
async fn call_guarded(listener: Listener, payload: Value) -> anyhow::Result<Value> {
    match AssertUnwindSafe(async move { listener(payload).await })
        .catch_unwind()
        .await
    {
        Ok(result) => result,
        Err(panic) => Err(anyhow::anyhow!(
            "handler panicked: {}",
            panic_message(panic.as_ref())
        )),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
