//! Logging interceptor.
//!
//! Observes `send` and `request` on the wrapped messenger and emits a
//! `tracing` event for each: outgoing send, outgoing request, request success
//! (all `info`) and request failure (`error`). Entries below the configured
//! threshold are skipped. Never changes results.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Messenger;
use crate::error::BridgeError;

pub const DEFAULT_PREFIX: &str = "[CrossFrame]";

/// Severity threshold, ordered `Debug < Info < Warn < Error`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggerOptions {
    pub prefix: String,
    pub level: LogLevel,
    /// Attach the wall-clock time (RFC 3339) as a `timestamp` field.
    pub timestamp: bool,
}

impl Default for LoggerOptions {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            level: LogLevel::Debug,
            timestamp: true,
        }
    }
}

impl LoggerOptions {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_timestamp(mut self, timestamp: bool) -> Self {
        self.timestamp = timestamp;
        self
    }
}

macro_rules! emit_at {
    ($level:expr, $($fields:tt)+) => {
        match $level {
            LogLevel::Debug => tracing::debug!($($fields)+),
            LogLevel::Info => tracing::info!($($fields)+),
            LogLevel::Warn => tracing::warn!($($fields)+),
            LogLevel::Error => tracing::error!($($fields)+),
        }
    };
}

pub struct Logger {
    inner: Arc<dyn Messenger>,
    options: LoggerOptions,
}

impl Logger {
    pub fn new(inner: Arc<dyn Messenger>, options: LoggerOptions) -> Self {
        Self { inner, options }
    }

    pub fn options(&self) -> &LoggerOptions {
        &self.options
    }

    fn should_log(&self, level: LogLevel) -> bool {
        level >= self.options.level
    }

    fn log(&self, level: LogLevel, message: &str, message_type: &str, detail: &Value) {
        if !self.should_log(level) {
            return;
        }
        let timestamp = self
            .options
            .timestamp
            .then(|| chrono::Utc::now().to_rfc3339());
        emit_at!(
            level,
            prefix = %self.options.prefix,
            message_type,
            detail = %detail,
            timestamp = timestamp.as_deref(),
            "{}",
            message
        );
    }
}

#[async_trait]
impl Messenger for Logger {
    fn send(&self, message_type: &str, payload: Value) {
        self.log(LogLevel::Info, "Sending message", message_type, &payload);
        self.inner.send(message_type, payload);
    }

    async fn request(
        &self,
        message_type: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        self.log(LogLevel::Info, "Sending request", message_type, &payload);
        match self.inner.request(message_type, payload, timeout).await {
            Ok(result) => {
                self.log(LogLevel::Info, "Request succeeded", message_type, &result);
                Ok(result)
            }
            Err(e) => {
                self.log(
                    LogLevel::Error,
                    "Request failed",
                    message_type,
                    &Value::String(e.to_string()),
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::testing::{Call, Recorder};
    use serde_json::json;
    use std::sync::Mutex;
    use tracing::Subscriber;
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    #[derive(Debug, Clone, PartialEq)]
    struct Captured {
        level: tracing::Level,
        message: String,
        prefix: Option<String>,
        has_timestamp: bool,
    }

    #[derive(Clone, Default)]
    struct CaptureLayer {
        events: Arc<Mutex<Vec<Captured>>>,
    }

    impl<S: Subscriber> Layer<S> for CaptureLayer {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            let mut visitor = FieldVisitor::default();
            event.record(&mut visitor);
            self.events.lock().unwrap().push(Captured {
                level: *event.metadata().level(),
                message: visitor.message,
                prefix: visitor.prefix,
                has_timestamp: visitor.has_timestamp,
            });
        }
    }

    #[derive(Default)]
    struct FieldVisitor {
        message: String,
        prefix: Option<String>,
        has_timestamp: bool,
    }

    impl tracing::field::Visit for FieldVisitor {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
            let text = format!("{value:?}");
            match field.name() {
                "message" => self.message = text,
                "prefix" => self.prefix = Some(text),
                "timestamp" => self.has_timestamp = true,
                _ => {}
            }
        }

        fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
            match field.name() {
                "message" => self.message = value.to_string(),
                "prefix" => self.prefix = Some(value.to_string()),
                "timestamp" => self.has_timestamp = true,
                _ => {}
            }
        }
    }

    fn capture() -> (CaptureLayer, tracing::subscriber::DefaultGuard) {
        let layer = CaptureLayer::default();
        let subscriber = tracing_subscriber::registry().with(layer.clone());
        let guard = tracing::subscriber::set_default(subscriber);
        (layer, guard)
    }

    #[test]
    fn levels_are_ordered() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
    }

    #[test]
    fn options_parse_from_json() {
        let opts: LoggerOptions = serde_json::from_str(r#"{"level":"warn"}"#).unwrap();
        assert_eq!(opts.level, LogLevel::Warn);
        assert_eq!(opts.prefix, "[CrossFrame]");
        assert!(opts.timestamp);
    }

    #[tokio::test]
    async fn logs_send_and_request_lifecycle() {
        let (layer, _guard) = capture();
        let recorder = Recorder::new();
        let logger = Logger::new(
            recorder.clone(),
            LoggerOptions::default().with_prefix("[test]").with_timestamp(false),
        );

        logger.send("ui:click", json!(1));
        logger.request("x:y", json!(2), None).await.unwrap();

        let events = layer.events.lock().unwrap().clone();
        let messages: Vec<_> = events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, ["Sending message", "Sending request", "Request succeeded"]);
        assert!(events.iter().all(|e| e.level == tracing::Level::INFO));
        assert!(events.iter().all(|e| e.prefix.as_deref() == Some("[test]")));
        assert!(events.iter().all(|e| !e.has_timestamp));
        assert_eq!(recorder.calls().len(), 2);
    }

    #[tokio::test]
    async fn threshold_filters_lower_levels() {
        let (layer, _guard) = capture();
        let recorder = Recorder::new().script(vec![Err(BridgeError::remote("nope"))]);
        let logger = Logger::new(
            recorder.clone(),
            LoggerOptions::default().with_level(LogLevel::Error),
        );

        logger.send("ui:click", json!(1));
        let err = logger.request("x:y", json!(2), None).await.unwrap_err();
        assert_eq!(err, BridgeError::remote("nope"));

        let events = layer.events.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "Request failed");
        assert_eq!(events[0].level, tracing::Level::ERROR);
        assert!(events[0].has_timestamp);
    }

    #[tokio::test]
    async fn forwards_request_timeout() {
        let recorder = Recorder::new();
        let logger = Logger::new(recorder.clone(), LoggerOptions::default());
        logger
            .request("x:y", json!(null), Some(Duration::from_millis(750)))
            .await
            .unwrap();
        assert_eq!(
            recorder.calls(),
            vec![Call::Request(
                "x:y".to_string(),
                json!(null),
                Some(Duration::from_millis(750))
            )]
        );
    }
}
