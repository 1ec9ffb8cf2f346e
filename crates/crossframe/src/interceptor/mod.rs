//! Interceptor chain.
//!
//! [`Messenger`] is the `send`/`request` capability. The bridge core
//! implements it, and so does every plugin: each plugin owns the messenger
//! it wraps, captured at construction. Wrapping is explicit and LIFO - the
//! last plugin applied is the outermost and sees calls first.
//!
//! ```text
//! caller → queue → retry → logger → bridge core → transport
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::bridge::Bridge;
use crate::error::BridgeError;
use crate::transport::Transport;

pub mod logger;
pub mod queue;
pub mod retry;

pub use logger::{LogLevel, Logger, LoggerOptions};
pub use queue::{QueueManager, QueueOptions, QueueStatus};
pub use retry::{Backoff, RetryCondition, RetryManager, RetryOptions, RetryOverrides};

#[async_trait]
pub trait Messenger: Send + Sync + 'static {
    /// Fire-and-forget. Never fails.
    fn send(&self, message_type: &str, payload: Value);

    /// Correlated request with an optional per-request timeout.
    async fn request(
        &self,
        message_type: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError>;
}

#[async_trait]
impl<T: Transport> Messenger for Bridge<T> {
    fn send(&self, message_type: &str, payload: Value) {
        Bridge::send(self, message_type, payload);
    }

    async fn request(
        &self,
        message_type: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        Bridge::request(self, message_type, payload, timeout).await
    }
}
