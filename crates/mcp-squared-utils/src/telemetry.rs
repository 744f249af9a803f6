//! Logging bootstrap shared by every binary entry point.

use tracing_log::LogTracer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Install the global tracing subscriber.
///
/// Layers: an `EnvFilter` seeded from `RUST_LOG` (falling back to
/// `default_level`) and a fmt layer writing to **stderr** so that stdout can
/// stay a clean MCP/stdio channel for the server, proxy and daemon modes.
/// Calling this twice is a no-op.
pub fn setup_telemetry(default_level: &str) {
    let _ = LogTracer::init();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_writer(std::io::stderr);

    let subscriber = Registry::default().with(filter).with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}
