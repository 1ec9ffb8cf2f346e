//! Bridge construction with plugins.
//!
//! `create_bridge` builds a bridge core and wraps it in the configured
//! interceptors, always in the order logger → retry → queue. The queue, when
//! enabled, ends up outermost and delivers through the retry/logger chain
//! beneath it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bridge::{Bridge, DebugInfo};
use crate::config::BridgeConfig;
use crate::correlation::{Listener, ListenerId, Subscription};
use crate::error::BridgeError;
use crate::interceptor::{
    Logger, LoggerOptions, Messenger, QueueManager, QueueOptions, RetryManager, RetryOptions,
};
use crate::transport::Transport;

/// `true` (defaults), `false` (disabled) or an options object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PluginSetting<T> {
    Enabled(bool),
    Options(T),
}

impl<T> Default for PluginSetting<T> {
    fn default() -> Self {
        Self::Enabled(false)
    }
}

impl<T: Clone + Default> PluginSetting<T> {
    /// Options to apply, or None when the plugin is disabled.
    pub fn resolve(&self) -> Option<T> {
        match self {
            Self::Enabled(true) => Some(T::default()),
            Self::Enabled(false) => None,
            Self::Options(options) => Some(options.clone()),
        }
    }
}

impl<T> From<T> for PluginSetting<T> {
    fn from(options: T) -> Self {
        Self::Options(options)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logger: Option<PluginSetting<LoggerOptions>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<PluginSetting<RetryOptions>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<PluginSetting<QueueOptions>>,
}

impl PluginsConfig {
    pub fn with_logger(mut self, options: LoggerOptions) -> Self {
        self.logger = Some(options.into());
        self
    }

    pub fn with_retry(mut self, options: RetryOptions) -> Self {
        self.retry = Some(options.into());
        self
    }

    pub fn with_queue(mut self, options: QueueOptions) -> Self {
        self.queue = Some(options.into());
        self
    }
}

/// Bridge configuration plus a `plugins` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnhancedBridgeConfig {
    #[serde(flatten)]
    pub bridge: BridgeConfig,
    pub plugins: PluginsConfig,
}

impl EnhancedBridgeConfig {
    pub fn new(bridge: BridgeConfig) -> Self {
        Self {
            bridge,
            plugins: PluginsConfig::default(),
        }
    }

    pub fn with_plugins(mut self, plugins: PluginsConfig) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// A bridge core behind its interceptor chain.
pub struct EnhancedBridge<T: Transport> {
    core: Bridge<T>,
    outer: Arc<dyn Messenger>,
    retry: Option<Arc<RetryManager>>,
    queue: Option<Arc<QueueManager>>,
    plugins: Vec<&'static str>,
}

/// Build a bridge on `transport` and apply the configured plugins.
///
/// Must be called inside a tokio runtime.
pub fn create_bridge<T: Transport>(transport: T, config: EnhancedBridgeConfig) -> EnhancedBridge<T> {
    let EnhancedBridgeConfig { bridge, plugins } = config;
    let core = Bridge::new(transport, bridge);

    let mut outer: Arc<dyn Messenger> = Arc::new(core.clone());
    let mut applied = Vec::new();
    let mut retry = None;
    let mut queue = None;

    if let Some(options) = plugins.logger.as_ref().and_then(PluginSetting::resolve) {
        outer = Arc::new(Logger::new(outer, options));
        applied.push("logger");
    }

    if let Some(options) = plugins.retry.as_ref().and_then(PluginSetting::resolve) {
        let manager = Arc::new(RetryManager::new(outer, options));
        outer = manager.clone();
        retry = Some(manager);
        applied.push("retry");
    }

    if let Some(options) = plugins.queue.as_ref().and_then(PluginSetting::resolve) {
        let manager = Arc::new(QueueManager::new(outer, options));
        outer = manager.clone();
        queue = Some(manager);
        applied.push("queue");
    }

    if core.config().debug {
        tracing::debug!(plugins = ?applied, "Bridge created");
    }

    EnhancedBridge {
        core,
        outer,
        retry,
        queue,
        plugins: applied,
    }
}

impl<T: Transport> EnhancedBridge<T> {
    /// Send through the outermost plugin.
    pub fn send(&self, message_type: &str, payload: Value) {
        self.outer.send(message_type, payload);
    }

    /// Request through the outermost plugin.
    pub async fn request(
        &self,
        message_type: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        self.outer.request(message_type, payload, timeout).await
    }

    pub fn on<F, Fut>(&self, message_type: &str, handler: F) -> Subscription
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.core.on(message_type, handler)
    }

    pub fn on_listener(&self, message_type: &str, listener: Listener) -> Subscription {
        self.core.on_listener(message_type, listener)
    }

    pub fn off(&self, message_type: &str, id: Option<ListenerId>) {
        self.core.off(message_type, id);
    }

    pub fn debug_info(&self) -> DebugInfo {
        self.core.debug_info()
    }

    pub fn core(&self) -> &Bridge<T> {
        &self.core
    }

    pub fn retry(&self) -> Option<&RetryManager> {
        self.retry.as_deref()
    }

    pub fn queue(&self) -> Option<&QueueManager> {
        self.queue.as_deref()
    }

    /// Names of the applied plugins, innermost first.
    pub fn plugins(&self) -> &[&'static str] {
        &self.plugins
    }

    /// Tear down the queue, then the core. Idempotent.
    pub fn destroy(&self) {
        if let Some(queue) = &self.queue {
            queue.destroy();
        }
        self.core.destroy();
    }
}

#[async_trait]
impl<T: Transport> Messenger for EnhancedBridge<T> {
    fn send(&self, message_type: &str, payload: Value) {
        EnhancedBridge::send(self, message_type, payload);
    }

    async fn request(
        &self,
        message_type: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        EnhancedBridge::request(self, message_type, payload, timeout).await
    }
}
