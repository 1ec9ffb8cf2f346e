//! Retry interceptor.
//!
//! Re-issues failed requests with linear or exponential backoff. Each attempt
//! is a fresh request on the wrapped messenger (new correlation id, same
//! per-request timeout). `send` passes through untouched.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Messenger;
use crate::error::BridgeError;

pub type RetryCondition = Arc<dyn Fn(&BridgeError) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    Linear,
    #[default]
    Exponential,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryOptions {
    /// Retries after the first attempt.
    pub max_retries: u32,
    #[serde(with = "crate::config::millis")]
    pub base_delay: Duration,
    #[serde(with = "crate::config::millis")]
    pub max_delay: Duration,
    pub backoff: Backoff,
    /// Errors this returns false for are propagated without retrying.
    #[serde(skip, default = "default_condition")]
    pub retry_condition: RetryCondition,
}

fn default_condition() -> RetryCondition {
    Arc::new(|e: &BridgeError| e.to_string().contains("timeout"))
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            backoff: Backoff::Exponential,
            retry_condition: default_condition(),
        }
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl RetryOptions {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_retry_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&BridgeError) -> bool + Send + Sync + 'static,
    {
        self.retry_condition = Arc::new(condition);
        self
    }

    /// Delay before retry number `attempt + 1` (`attempt` is zero-based).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay = match self.backoff {
            Backoff::Linear => self.base_delay.saturating_mul(attempt.saturating_add(1)),
            Backoff::Exponential => self
                .base_delay
                .saturating_mul(2u32.saturating_pow(attempt)),
        };
        delay.min(self.max_delay)
    }
}

/// Per-call overrides for [`RetryManager::retry_request`]. Unset fields keep
/// the manager's options.
#[derive(Clone, Default)]
pub struct RetryOverrides {
    pub max_retries: Option<u32>,
    pub base_delay: Option<Duration>,
    pub max_delay: Option<Duration>,
    pub backoff: Option<Backoff>,
    pub retry_condition: Option<RetryCondition>,
    pub timeout: Option<Duration>,
}

pub struct RetryManager {
    inner: Arc<dyn Messenger>,
    options: RetryOptions,
}

impl RetryManager {
    pub fn new(inner: Arc<dyn Messenger>, options: RetryOptions) -> Self {
        Self { inner, options }
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    /// One-off retry loop with `overrides` applied on top of this manager's options.
    pub async fn retry_request(
        &self,
        message_type: &str,
        payload: Value,
        overrides: RetryOverrides,
    ) -> Result<Value, BridgeError> {
        let defaults = &self.options;
        let options = RetryOptions {
            max_retries: overrides.max_retries.unwrap_or(defaults.max_retries),
            base_delay: overrides.base_delay.unwrap_or(defaults.base_delay),
            max_delay: overrides.max_delay.unwrap_or(defaults.max_delay),
            backoff: overrides.backoff.unwrap_or(defaults.backoff),
            retry_condition: overrides
                .retry_condition
                .unwrap_or_else(|| Arc::clone(&defaults.retry_condition)),
        };
        run_with_retry(
            self.inner.as_ref(),
            &options,
            message_type,
            payload,
            overrides.timeout,
        )
        .await
    }
}

async fn run_with_retry(
    inner: &dyn Messenger,
    options: &RetryOptions,
    message_type: &str,
    payload: Value,
    timeout: Option<Duration>,
) -> Result<Value, BridgeError> {
    let mut attempt = 0;
    loop {
        let error = match inner.request(message_type, payload.clone(), timeout).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !(options.retry_condition)(&error) {
            return Err(error);
        }
        if attempt >= options.max_retries {
            tracing::warn!(
                message_type,
                attempts = attempt + 1,
                error = %error,
                "Request failed after max retries"
            );
            return Err(error);
        }

        let backoff = options.calculate_delay(attempt);
        attempt += 1;
        tracing::warn!(
            message_type,
            attempt,
            max_retries = options.max_retries,
            backoff_ms = backoff.as_millis() as u64,
            error = %error,
            "Request failed, retrying"
        );
        tokio::time::sleep(backoff).await;
    }
}

#[async_trait]
impl Messenger for RetryManager {
    fn send(&self, message_type: &str, payload: Value) {
        self.inner.send(message_type, payload);
    }

    async fn request(
        &self,
        message_type: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        run_with_retry(
            self.inner.as_ref(),
            &self.options,
            message_type,
            payload,
            timeout,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::testing::{Call, Recorder};
    use serde_json::json;
    use tokio::time::Instant;

    fn timeout_err() -> BridgeError {
        BridgeError::Timeout {
            id: "msg_1_1".to_string(),
        }
    }

    #[test]
    fn exponential_delays_are_capped() {
        let opts = RetryOptions::default();
        let delays: Vec<u64> = (0..6)
            .map(|a| opts.calculate_delay(a).as_millis() as u64)
            .collect();
        assert_eq!(delays, [1000, 2000, 4000, 8000, 10_000, 10_000]);
    }

    #[test]
    fn linear_delays_grow_by_base() {
        let opts = RetryOptions::default()
            .with_backoff(Backoff::Linear)
            .with_base_delay(Duration::from_millis(300))
            .with_max_delay(Duration::from_millis(1000));
        let delays: Vec<u64> = (0..5)
            .map(|a| opts.calculate_delay(a).as_millis() as u64)
            .collect();
        assert_eq!(delays, [300, 600, 900, 1000, 1000]);
    }

    #[test]
    fn default_condition_matches_timeouts_only() {
        let opts = RetryOptions::default();
        assert!((opts.retry_condition)(&timeout_err()));
        assert!((opts.retry_condition)(&BridgeError::remote("upstream timeout")));
        assert!(!(opts.retry_condition)(&BridgeError::remote("bad input")));
        assert!(!(opts.retry_condition)(&BridgeError::Unavailable));
    }

    #[test]
    fn options_parse_from_json() {
        let opts: RetryOptions =
            serde_json::from_str(r#"{"maxRetries":5,"baseDelay":250,"backoff":"linear"}"#).unwrap();
        assert_eq!(opts.max_retries, 5);
        assert_eq!(opts.base_delay, Duration::from_millis(250));
        assert_eq!(opts.max_delay, Duration::from_millis(10_000));
        assert_eq!(opts.backoff, Backoff::Linear);
        assert!((opts.retry_condition)(&timeout_err()));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_two_failures() {
        let recorder = Recorder::new().script(vec![Err(timeout_err()), Err(timeout_err())]);
        let retry = RetryManager::new(recorder.clone(), RetryOptions::default());

        let start = Instant::now();
        let result = retry
            .request("x:y", json!("v"), Some(Duration::from_millis(500)))
            .await
            .unwrap();

        assert_eq!(result, json!("v"));
        assert_eq!(recorder.request_count(), 3);
        // 1000ms after the first failure, 2000ms after the second.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(3000), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(3100), "{elapsed:?}");
        assert!(recorder.calls().iter().all(|c| matches!(
            c,
            Call::Request(_, _, Some(t)) if *t == Duration::from_millis(500)
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let recorder = Recorder::new().script(vec![Err(timeout_err()); 5]);
        let retry = RetryManager::new(recorder.clone(), RetryOptions::default().with_max_retries(2));

        let err = retry.request("x:y", Value::Null, None).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(recorder.request_count(), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_propagates_immediately() {
        let recorder = Recorder::new().script(vec![Err(BridgeError::remote("bad input"))]);
        let retry = RetryManager::new(recorder.clone(), RetryOptions::default());

        let err = retry.request("x:y", Value::Null, None).await.unwrap_err();
        assert_eq!(err, BridgeError::remote("bad input"));
        assert_eq!(recorder.request_count(), 1);
    }

    #[tokio::test]
    async fn send_passes_through() {
        let recorder = Recorder::new();
        let retry = RetryManager::new(recorder.clone(), RetryOptions::default());
        retry.send("ui:click", json!(1));
        assert_eq!(recorder.calls(), vec![Call::Send("ui:click".to_string(), json!(1))]);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_request_applies_overrides() {
        let recorder = Recorder::new().script(vec![
            Err(BridgeError::Unavailable),
            Err(BridgeError::Unavailable),
        ]);
        let retry = RetryManager::new(recorder.clone(), RetryOptions::default());

        let start = Instant::now();
        let result = retry
            .retry_request(
                "x:y",
                json!(7),
                RetryOverrides {
                    base_delay: Some(Duration::from_millis(10)),
                    backoff: Some(Backoff::Linear),
                    retry_condition: Some(Arc::new(|e: &BridgeError| *e == BridgeError::Unavailable)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(result, json!(7));
        assert_eq!(recorder.request_count(), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(30), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(100), "{elapsed:?}");
    }
}
