//! Diagnostics via `tracing`, written to stderr.
//!
//! `RUST_LOG` wins when set; otherwise each binary passes its own default
//! directive (`warn` for `smg`, `info` for `smgd`).

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global subscriber.
///
/// # Example
/// ```bash
/// RUST_LOG=smuggler=debug smgd --subscribe web
/// ```
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
