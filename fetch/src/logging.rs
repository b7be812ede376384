//! Process-wide `tracing` subscriber.

use tracing_subscriber::EnvFilter;

fn default_directive(debug: bool) -> &'static str {
    if debug { "debug" } else { "info" }
}

/// Installs the console subscriber. `RUST_LOG` wins when set; otherwise
/// `info`, or `debug` with `--debug`. Later calls are no-ops.
pub fn init(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(debug)
        .try_init();
}
