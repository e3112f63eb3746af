//! Development-time tracing.
//!
//! Diagnostics go to stderr and are filtered by `RUST_LOG`. They are separate
//! from run artifacts under `.agent_artifacts/`, which are always written, and
//! from stdout, which carries only events or command output.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the stderr subscriber. Defaults to `warn` when `RUST_LOG` is unset.
///
/// ```bash
/// RUST_LOG=patchloop=debug patchloop stream --ticket "rename flag"
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
