//! Bridge core - one end of a host/child message channel.
//!
//! Combines a [`Transport`] with a [`CorrelationEngine`]:
//! - Outbound: `send` (event), `request` (correlated, awaitable)
//! - Inbound: every raw payload the adapter receives is classified once and
//!   routed to the engine as a response, request or event
//!
//! With isolation enabled every outbound message is stamped with this
//! bridge's window id, and inbound messages not stamped with that same id are
//! dropped.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::config::BridgeConfig;
use crate::correlation::{CorrelationEngine, Listener, ListenerId, Subscription, listener};
use crate::error::BridgeError;
use crate::protocol::{EventMessage, Message, RequestMessage};
use crate::transport::{Inbound, InboundHandler, Transport};

/// Handle to a bridge. Cheap to clone; all clones share one engine and transport.
pub struct Bridge<T: Transport> {
    inner: Arc<BridgeInner<T>>,
}

impl<T: Transport> Clone for Bridge<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct BridgeInner<T: Transport> {
    transport: T,
    config: BridgeConfig,
    window_id: Option<String>,
    engine: Arc<CorrelationEngine>,
    destroyed: AtomicBool,
}

/// Snapshot of bridge state for diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugInfo {
    pub config: BridgeConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_id: Option<String>,
    pub pending_requests: usize,
    pub listener_types: usize,
    pub destroyed: bool,
}

impl<T: Transport> Bridge<T> {
    /// Build a bridge and attach it to `transport`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(transport: T, config: BridgeConfig) -> Self {
        let window_id = config.resolve_window_id();
        let engine = CorrelationEngine::from_config(&config);

        let inner = Arc::new(BridgeInner {
            transport,
            config,
            window_id,
            engine,
            destroyed: AtomicBool::new(false),
        });

        let handler: Weak<dyn InboundHandler> = Arc::downgrade(&inner) as Weak<dyn InboundHandler>;
        inner.transport.attach(Inbound::new(handler));

        if inner.config.debug {
            tracing::debug!(
                window_id = inner.window_id.as_deref().unwrap_or("-"),
                target_origin = %inner.config.target_origin,
                "Bridge attached"
            );
        }

        Self { inner }
    }

    /// Fire-and-forget event. Never fails; delivery problems are logged.
    pub fn send(&self, message_type: &str, payload: Value) {
        if self.is_destroyed() {
            tracing::warn!(message_type, "Send on destroyed bridge ignored");
            return;
        }
        let event = EventMessage::new(message_type, payload);
        if let Err(e) = self.inner.post(Message::Event(event)) {
            tracing::warn!(message_type, error = %e, "Event not delivered");
        }
    }

    /// Correlated request. Resolves with the counterpart's reply data.
    ///
    /// `timeout` overrides the configured default for this request only.
    pub async fn request(
        &self,
        message_type: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        self.inner.request(message_type, payload, timeout).await
    }

    /// Register an async handler for `message_type`.
    pub fn on<F, Fut>(&self, message_type: &str, handler: F) -> Subscription
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.on_listener(message_type, listener(handler))
    }

    pub fn on_listener(&self, message_type: &str, listener: Listener) -> Subscription {
        self.inner.engine.add_listener(message_type, listener)
    }

    /// Remove one listener, or all listeners of `message_type` when `id` is None.
    pub fn off(&self, message_type: &str, id: Option<ListenerId>) {
        self.inner.engine.remove_listener(message_type, id);
    }

    /// Reject outstanding requests, drop listeners and detach from the transport.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.engine.cleanup();
        self.inner.transport.detach();
        if self.inner.config.debug {
            tracing::debug!(
                window_id = self.inner.window_id.as_deref().unwrap_or("-"),
                "Bridge destroyed"
            );
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    pub fn window_id(&self) -> Option<&str> {
        self.inner.window_id.as_deref()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn debug_info(&self) -> DebugInfo {
        DebugInfo {
            config: self.inner.config.clone(),
            window_id: self.inner.window_id.clone(),
            pending_requests: self.inner.engine.pending_count(),
            listener_types: self.inner.engine.listener_type_count(),
            destroyed: self.is_destroyed(),
        }
    }
}

impl<T: Transport> BridgeInner<T> {
    fn stamp(&self, mut message: Message) -> Message {
        if self.window_id.is_some() {
            message.set_window_id(self.window_id.clone());
        }
        message
    }

    fn post(&self, message: Message) -> Result<(), BridgeError> {
        let endpoint = self
            .transport
            .resolve_counterpart()
            .ok_or(BridgeError::Unavailable)?;
        let message = self.stamp(message);
        if self.config.debug {
            tracing::debug!(kind = message.kind(), "Posting message");
        }
        self.transport
            .deliver(&endpoint, &message, &self.config.target_origin)?;
        Ok(())
    }

    async fn request(
        &self,
        message_type: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(BridgeError::Destroyed);
        }

        let reply = {
            let endpoint = self
                .transport
                .resolve_counterpart()
                .ok_or(BridgeError::Unavailable)?;

            let id = self.engine.generate_id();
            let reply = self.engine.create_pending_request(id.clone(), timeout);
            let message = self.stamp(Message::Request(RequestMessage::new(
                id.clone(),
                message_type,
                payload,
            )));

            if self.config.debug {
                tracing::debug!(request_id = %id, message_type, "Sending request");
            }

            if let Err(e) = self
                .transport
                .deliver(&endpoint, &message, &self.config.target_origin)
            {
                self.engine.discard_pending(&id);
                tracing::warn!(request_id = %id, message_type, error = %e, "Request not delivered");
                return Err(e.into());
            }
            reply
        };

        reply.await
    }

    fn accepts(&self, message: &Message) -> bool {
        match &self.window_id {
            Some(own) => message.window_id() == Some(own.as_str()),
            None => true,
        }
    }
}

impl<T: Transport> InboundHandler for BridgeInner<T> {
    fn handle_inbound(self: Arc<Self>, raw: Value) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }

        let message = match Message::classify(raw) {
            Ok(message) => message,
            Err(e) => {
                if self.config.debug {
                    tracing::debug!(error = %e, "Ignoring malformed message");
                }
                return;
            }
        };

        if !self.accepts(&message) {
            if self.config.debug {
                tracing::debug!(
                    kind = message.kind(),
                    window_id = message.window_id().unwrap_or("-"),
                    "Dropping message for another window"
                );
            }
            return;
        }

        match message {
            Message::Response(response) => {
                self.engine.handle_response(response);
            }
            Message::Request(request) => {
                let bridge = Arc::clone(&self);
                tokio::spawn(async move {
                    let request_id = request.id.clone();
                    let response = bridge.engine.handle_request(request).await;
                    if let Err(e) = bridge.post(Message::Response(response)) {
                        tracing::warn!(request_id = %request_id, error = %e, "Response not delivered");
                    }
                });
            }
            Message::Event(event) => {
                self.engine.dispatch_event(event);
            }
        }
    }
}
