//! Development-time tracing for the engine.
//!
//! Tracing is a diagnostic channel only: `RUST_LOG` controls it and it goes to
//! stderr. The durable record of what happened lives in the run logs, session
//! files, worker logs and incident reports, which are written regardless.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the stderr subscriber. Defaults to `warn` when `RUST_LOG` is unset.
///
/// ```bash
/// RUST_LOG=autoheal=debug autoheal heal login
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    // A second init (e.g. from an embedding test) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false).compact())
        .try_init();
}
