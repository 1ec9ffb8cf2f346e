//! Tracing subscriber setup for binaries and tests embedding the bridge.
//!
//! `RUST_LOG` wins when set. Otherwise `CROSSFRAME_LOG` picks the level for
//! this crate (debug, info, warn, error; default info). `LOG_FORMAT=json`
//! switches to JSON lines. Output goes to stderr.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the global subscriber. Does nothing if one is already installed.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_directives(
            std::env::var("CROSSFRAME_LOG").ok().as_deref(),
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn default_directives(level: Option<&str>) -> String {
    let level = match level {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("crossframe={level}")
}
