//! Diagnostic tracing for the engine and CLI.
//!
//! Controlled by `RUST_LOG` and written to stderr. Run progress and reports are
//! printed separately and are not affected by the filter.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. `--verbose` raises the default to `debug`.
///
/// ```bash
/// RUST_LOG=gantry_engine=debug gantry run
/// ```
pub fn init(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
