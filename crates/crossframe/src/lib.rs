//! crossframe: request/response messaging between a host and an embedded
//! child context over a single duplex channel.
//!
//! # Architecture
//!
//! - **protocol**: event, request and response wire shapes
//! - **correlation**: pending-request table, listener registry, timeout sweep
//! - **bridge**: one end of the channel, built on a [`transport::Transport`]
//! - **interceptor**: `Messenger` decorators (logger, retry, queue)
//! - **factory**: builds a bridge with its plugin chain from configuration
//!
//! ```text
//! caller ─► [queue ─► retry ─► logger] ─► Bridge ─► Transport ═══ Transport ─► Bridge ─► listeners
//! ```

pub mod bridge;
pub mod codec;
pub mod config;
pub mod correlation;
pub mod error;
pub mod factory;
pub mod interceptor;
pub mod protocol;
pub mod telemetry;
pub mod transport;

pub use bridge::{Bridge, DebugInfo};
pub use config::BridgeConfig;
pub use correlation::{CorrelationEngine, Listener, ListenerId, PendingReply, Subscription, listener};
pub use error::BridgeError;
pub use factory::{EnhancedBridge, EnhancedBridgeConfig, PluginSetting, PluginsConfig, create_bridge};
pub use interceptor::Messenger;
pub use protocol::{EventMessage, Message, RequestMessage, ResponseMessage};
pub use telemetry::init_tracing;
pub use transport::{ChannelTransport, StreamTransport, Transport, TransportError};
