//! Transport adapter contract.
//!
//! An adapter knows how to find "the other side" and how to hand it a message.
//! It also feeds every raw payload it receives into the bridge through an
//! [`Inbound`] handle. Two reference adapters are provided:
//! - **channel**: in-memory duplex pair (same process, tests, embedding)
//! - **stream**: length-delimited JSON over any AsyncRead/AsyncWrite

use std::sync::Weak;

use serde_json::Value;

use crate::protocol::Message;

pub mod channel;
pub mod stream;

pub use channel::ChannelTransport;
pub use stream::StreamTransport;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("target origin {target} does not match counterpart origin {actual}")]
    OriginMismatch { target: String, actual: String },
    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// Environment-specific glue between a bridge and its counterpart.
pub trait Transport: Send + Sync + 'static {
    /// Handle to the counterpart, valid for one delivery.
    type Endpoint: Send;

    /// The other side, or None if it cannot currently be reached.
    fn resolve_counterpart(&self) -> Option<Self::Endpoint>;

    /// Hand `message` to the counterpart. Must not block.
    ///
    /// `target_origin` is `*` or the origin the counterpart must have.
    fn deliver(
        &self,
        endpoint: &Self::Endpoint,
        message: &Message,
        target_origin: &str,
    ) -> Result<(), TransportError>;

    /// Start feeding received payloads to `inbound`.
    fn attach(&self, inbound: Inbound);

    /// Stop feeding payloads. Idempotent.
    fn detach(&self);
}

/// Receiver side of a bridge, as seen by an adapter.
pub trait InboundHandler: Send + Sync {
    fn handle_inbound(self: std::sync::Arc<Self>, raw: Value);
}

/// Cloneable entry point adapters call for every received payload.
///
/// Holds the bridge weakly: once the bridge is gone, dispatch returns false
/// and the adapter should stop reading.
#[derive(Clone)]
pub struct Inbound {
    handler: Weak<dyn InboundHandler>,
}

impl Inbound {
    pub fn new(handler: Weak<dyn InboundHandler>) -> Self {
        Self { handler }
    }

    pub fn dispatch(&self, raw: Value) -> bool {
        match self.handler.upgrade() {
            Some(handler) => {
                handler.handle_inbound(raw);
                true
            }
            None => false,
        }
    }

    /// Parse and dispatch a JSON document. Unparseable input is ignored.
    pub fn dispatch_slice(&self, bytes: &[u8]) -> bool {
        match serde_json::from_slice::<Value>(bytes) {
            Ok(raw) => self.dispatch(raw),
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring non-JSON inbound payload");
                self.handler.strong_count() > 0
            }
        }
    }
}

impl std::fmt::Debug for Inbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbound")
            .field("alive", &(self.handler.strong_count() > 0))
            .finish()
    }
}
