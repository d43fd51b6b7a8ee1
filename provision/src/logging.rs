//! Tracing setup shared by the CLI and the device simulator.
//!
//! Output goes to stderr so that stdout stays usable as the Improv serial
//! stream when the simulator bridges the handshake over stdio.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`. Falls back to `default_directive` if unset or invalid.
///
/// # Example
/// ```bash
/// RUST_LOG=provision=debug provision status
/// ```
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
