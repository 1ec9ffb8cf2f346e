//! In-memory duplex transport.
//!
//! `ChannelTransport::pair()` returns two connected ends. Messages are
//! converted to plain JSON values on delivery, so each side only ever sees
//! what would have crossed a real boundary. Each end has an origin; delivery
//! honours `target_origin` the way a browser `postMessage` does, except that
//! a mismatch is reported to the caller instead of silently vanishing.

use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Inbound, Transport, TransportError};
use crate::protocol::Message;

/// The reachable other end of a channel pair.
#[derive(Debug, Clone)]
pub struct ChannelPeer {
    origin: String,
    tx: mpsc::UnboundedSender<Value>,
}

impl ChannelPeer {
    pub fn origin(&self) -> &str {
        &self.origin
    }
}

pub struct ChannelTransport {
    origin: String,
    peer: Mutex<Option<ChannelPeer>>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Value>>>,
    reader_cancel: CancellationToken,
}

impl ChannelTransport {
    /// Two connected ends: `(host, child)`.
    pub fn pair(host_origin: impl Into<String>, child_origin: impl Into<String>) -> (Self, Self) {
        let host_origin = host_origin.into();
        let child_origin = child_origin.into();
        let (to_host, host_rx) = mpsc::unbounded_channel();
        let (to_child, child_rx) = mpsc::unbounded_channel();

        let host = Self {
            origin: host_origin.clone(),
            peer: Mutex::new(Some(ChannelPeer {
                origin: child_origin.clone(),
                tx: to_child,
            })),
            inbound_rx: Mutex::new(Some(host_rx)),
            reader_cancel: CancellationToken::new(),
        };
        let child = Self {
            origin: child_origin,
            peer: Mutex::new(Some(ChannelPeer {
                origin: host_origin,
                tx: to_host,
            })),
            inbound_rx: Mutex::new(Some(child_rx)),
            reader_cancel: CancellationToken::new(),
        };
        (host, child)
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Forget the counterpart, as when an embedded frame is removed.
    pub fn disconnect(&self) {
        if let Ok(mut peer) = self.peer.lock() {
            peer.take();
        }
    }

    /// Push an arbitrary JSON value to the counterpart, bypassing the protocol.
    ///
    /// Lets callers exercise the receiving bridge with foreign or malformed payloads.
    pub fn post_raw(&self, raw: Value) -> Result<(), TransportError> {
        let peer = self.resolve_counterpart().ok_or(TransportError::Closed)?;
        peer.tx.send(raw).map_err(|_| TransportError::Closed)
    }
}

impl Transport for ChannelTransport {
    type Endpoint = ChannelPeer;

    fn resolve_counterpart(&self) -> Option<ChannelPeer> {
        self.peer
            .lock()
            .ok()
            .and_then(|peer| peer.clone())
            .filter(|peer| !peer.tx.is_closed())
    }

    fn deliver(
        &self,
        endpoint: &ChannelPeer,
        message: &Message,
        target_origin: &str,
    ) -> Result<(), TransportError> {
        if target_origin != "*" && target_origin != endpoint.origin {
            return Err(TransportError::OriginMismatch {
                target: target_origin.to_string(),
                actual: endpoint.origin.clone(),
            });
        }

        let raw = serde_json::to_value(message).map_err(|e| TransportError::Encode(e.to_string()))?;
        endpoint.tx.send(raw).map_err(|_| TransportError::Closed)
    }

    fn attach(&self, inbound: Inbound) {
        let Some(mut rx) = self.inbound_rx.lock().ok().and_then(|mut rx| rx.take()) else {
            tracing::warn!(origin = %self.origin, "Channel transport already attached");
            return;
        };
        let cancel = self.reader_cancel.clone();
        let origin = self.origin.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    raw = rx.recv() => match raw {
                        Some(raw) => {
                            if !inbound.dispatch(raw) {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            tracing::trace!(%origin, "Channel reader exiting");
        });
    }

    fn detach(&self) {
        self.reader_cancel.cancel();
    }
}

impl Drop for ChannelTransport {
    fn drop(&mut self) {
        self.reader_cancel.cancel();
    }
}
