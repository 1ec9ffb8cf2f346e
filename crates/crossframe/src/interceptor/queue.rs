//! Queueing interceptor - batching and flow control.
//!
//! Every `send` and `request` is enqueued instead of delivered. The queue is
//! drained in batches of `batch_size`:
//! - as soon as it holds `batch_size` entries
//! - on every tick of the flush timer (`flush_interval`)
//! - on `flush_now()`
//!
//! A batch is delivered sequentially through the messenger this queue wraps,
//! captured at construction, so flushed entries never re-enter the queue.
//! Only one flush runs at a time. After `destroy()` queued requests fail
//! with `Destroyed` and sends are dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::Messenger;
use crate::error::BridgeError;
use crate::protocol::now_millis;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueOptions {
    pub max_size: usize,
    #[serde(with = "crate::config::millis")]
    pub flush_interval: Duration,
    pub batch_size: usize,
    /// Keep the queue ordered by descending priority.
    pub priority: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_size: 100,
            flush_interval: Duration::from_millis(1000),
            batch_size: 10,
            priority: false,
        }
    }
}

impl QueueOptions {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub size: usize,
    pub max_size: usize,
    pub processing: bool,
    /// Fill level in percent of `max_size`.
    pub usage: f64,
}

type Reply = oneshot::Sender<Result<Value, BridgeError>>;

struct QueuedMessage {
    message_type: String,
    payload: Value,
    timestamp: u64,
    priority: i32,
    /// Present for requests, absent for sends.
    reply: Option<Reply>,
    request_timeout: Option<Duration>,
}

impl QueuedMessage {
    fn send(message_type: &str, payload: Value, priority: i32) -> Self {
        Self {
            message_type: message_type.to_string(),
            payload,
            timestamp: now_millis(),
            priority,
            reply: None,
            request_timeout: None,
        }
    }
}

pub struct QueueManager {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    delivery: Arc<dyn Messenger>,
    options: QueueOptions,
    queue: Mutex<VecDeque<QueuedMessage>>,
    processing: AtomicBool,
    destroyed: AtomicBool,
    timer_cancel: CancellationToken,
}

/// Resets the processing flag when a flush ends, however it ends.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl QueueManager {
    /// Wrap `delivery` and start the flush timer.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(delivery: Arc<dyn Messenger>, options: QueueOptions) -> Self {
        let inner = Arc::new(QueueInner {
            delivery,
            queue: Mutex::new(VecDeque::with_capacity(options.max_size.min(1024))),
            options,
            processing: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            timer_cancel: CancellationToken::new(),
        });
        QueueInner::start_flush_timer(&inner);
        Self { inner }
    }

    pub fn options(&self) -> &QueueOptions {
        &self.inner.options
    }

    /// Deliver the next batch now. No-op while another flush is running.
    pub async fn flush_now(&self) {
        Arc::clone(&self.inner).flush().await;
    }

    /// Enqueue a send with an explicit priority.
    pub fn set_priority(&self, message_type: &str, payload: Value, priority: i32) {
        self.inner
            .enqueue(QueuedMessage::send(message_type, payload, priority));
    }

    pub fn status(&self) -> QueueStatus {
        let size = self.inner.lock_queue().len();
        let max_size = self.inner.options.max_size;
        QueueStatus {
            size,
            max_size,
            processing: self.inner.processing.load(Ordering::Acquire),
            usage: if max_size == 0 {
                100.0
            } else {
                size as f64 / max_size as f64 * 100.0
            },
        }
    }

    /// Drop every queued entry. Queued requests fail with `QueueCleared`.
    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Stop the flush timer, clear the queue and refuse further entries.
    pub fn destroy(&self) {
        self.inner.destroyed.store(true, Ordering::SeqCst);
        self.inner.timer_cancel.cancel();
        self.inner.clear();
    }
}

impl Drop for QueueManager {
    fn drop(&mut self) {
        self.inner.timer_cancel.cancel();
    }
}

impl QueueInner {
    fn start_flush_timer(this: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(this);
        let cancel = this.timer_cancel.clone();
        let period = this.options.flush_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(queue) = weak.upgrade() else { break };
                        let has_entries = !queue.lock_queue().is_empty();
                        if has_entries {
                            queue.flush().await;
                        }
                    }
                }
            }
            tracing::trace!("Queue flush timer exiting");
        });
    }

    fn lock_queue(&self) -> MutexGuard<'_, VecDeque<QueuedMessage>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enqueue(self: &Arc<Self>, message: QueuedMessage) {
        let len = {
            let mut queue = self.lock_queue();
            // Checked under the lock so destroy() cannot miss an entry.
            if self.destroyed.load(Ordering::SeqCst) {
                drop(queue);
                match message.reply {
                    Some(reply) => {
                        let _ = reply.send(Err(BridgeError::Destroyed));
                    }
                    None => tracing::warn!(
                        message_type = %message.message_type,
                        "Message queue destroyed, dropping message"
                    ),
                }
                return;
            }
            if queue.len() >= self.options.max_size {
                drop(queue);
                match message.reply {
                    Some(reply) => {
                        let _ = reply.send(Err(BridgeError::QueueFull));
                    }
                    None => tracing::warn!(
                        message_type = %message.message_type,
                        max_size = self.options.max_size,
                        "Message queue full, dropping message"
                    ),
                }
                return;
            }

            if self.options.priority {
                let at = queue
                    .iter()
                    .position(|queued| queued.priority < message.priority)
                    .unwrap_or(queue.len());
                queue.insert(at, message);
            } else {
                queue.push_back(message);
            }
            queue.len()
        };

        if len >= self.options.batch_size {
            tokio::spawn(Arc::clone(self).flush());
        }
    }

    async fn flush(self: Arc<Self>) {
        if self.processing.swap(true, Ordering::AcqRel) {
            return;
        }
        let _guard = ProcessingGuard(&self.processing);

        let batch: Vec<QueuedMessage> = {
            let mut queue = self.lock_queue();
            let n = self.options.batch_size.max(1).min(queue.len());
            queue.drain(..n).collect()
        };
        if batch.is_empty() {
            return;
        }
        tracing::trace!(batch = batch.len(), "Flushing message queue");

        for message in batch {
            let QueuedMessage {
                message_type,
                payload,
                timestamp,
                reply,
                request_timeout,
                ..
            } = message;

            match reply {
                Some(reply) => {
                    let result = self
                        .delivery
                        .request(&message_type, payload, request_timeout)
                        .await;
                    if let Err(e) = &result {
                        tracing::debug!(
                            message_type = %message_type,
                            queued_at = timestamp,
                            error = %e,
                            "Queued request failed"
                        );
                    }
                    let _ = reply.send(result);
                }
                None => self.delivery.send(&message_type, payload),
            }
        }
    }

    fn clear(&self) {
        let drained: Vec<QueuedMessage> = self.lock_queue().drain(..).collect();
        let mut rejected = 0;
        for message in drained {
            if let Some(reply) = message.reply {
                let _ = reply.send(Err(BridgeError::QueueCleared));
                rejected += 1;
            }
        }
        tracing::info!(rejected, "Message queue cleared");
    }
}

#[async_trait]
impl Messenger for QueueManager {
    fn send(&self, message_type: &str, payload: Value) {
        self.inner
            .enqueue(QueuedMessage::send(message_type, payload, 0));
    }

    async fn request(
        &self,
        message_type: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.inner.enqueue(QueuedMessage {
            message_type: message_type.to_string(),
            payload,
            timestamp: now_millis(),
            priority: 0,
            reply: Some(tx),
            request_timeout: timeout,
        });
        rx.await.unwrap_or(Err(BridgeError::QueueCleared))
    }
}
