//! Bridge configuration.
//!
//! Built in code with the `with_*` builders, parsed from JSON (camelCase keys,
//! durations in milliseconds), or read from `CROSSFRAME_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::now_millis;

pub const DEFAULT_TARGET_ORIGIN: &str = "*";
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    /// Origin the counterpart must have for delivery. `*` delivers anywhere.
    pub target_origin: String,
    /// Default request timeout. `None` waits until a response or teardown.
    #[serde(with = "option_millis", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Log internal bridge actions at debug level.
    pub debug: bool,
    /// Drop inbound messages whose `windowId` differs from this bridge's.
    pub enable_multi_window: bool,
    /// Explicit partition key. Generated when isolation is on and this is unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_id: Option<String>,
    /// Period of the shared timeout sweep.
    #[serde(with = "millis")]
    pub sweep_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            target_origin: DEFAULT_TARGET_ORIGIN.to_string(),
            timeout: None,
            debug: false,
            enable_multi_window: false,
            window_id: None,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target_origin(mut self, origin: impl Into<String>) -> Self {
        self.target_origin = origin.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn without_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_multi_window(mut self, enabled: bool) -> Self {
        self.enable_multi_window = enabled;
        self
    }

    pub fn with_window_id(mut self, window_id: impl Into<String>) -> Self {
        self.window_id = Some(window_id.into());
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Read overrides from `CROSSFRAME_TARGET_ORIGIN`, `CROSSFRAME_TIMEOUT_MS`,
    /// `CROSSFRAME_DEBUG` and `CROSSFRAME_WINDOW_ID`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(origin) = lookup("CROSSFRAME_TARGET_ORIGIN") {
            config.target_origin = origin;
        }
        if let Some(ms) = lookup("CROSSFRAME_TIMEOUT_MS").and_then(|s| s.parse::<u64>().ok()) {
            config.timeout = Some(Duration::from_millis(ms));
        }
        if let Some(debug) = lookup("CROSSFRAME_DEBUG") {
            config.debug = matches!(debug.as_str(), "1" | "true" | "yes");
        }
        if let Some(window_id) = lookup("CROSSFRAME_WINDOW_ID") {
            config.enable_multi_window = true;
            config.window_id = Some(window_id);
        }

        config
    }

    /// The partition key this bridge stamps and accepts, if isolation is on.
    pub fn resolve_window_id(&self) -> Option<String> {
        if !self.enable_multi_window {
            return None;
        }
        Some(
            self.window_id
                .clone()
                .filter(|id| !id.is_empty())
                .unwrap_or_else(generate_window_id),
        )
    }
}

/// `window_<unix-ms>_<9 random chars>`.
pub fn generate_window_id() -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!("window_{}_{}", now_millis(), &random[..9])
}

/// Serde helper for durations as integer milliseconds.
pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod option_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
