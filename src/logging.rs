//! Diagnostic logging setup.
//!
//! Logs go to stderr so stdout stays reserved for sink output. `RUST_LOG`
//! wins when set; otherwise the level is `warn`, or `debug` with `--verbose`.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn default_directive(verbose: bool) -> &'static str {
    if verbose { "debug" } else { "warn" }
}

/// Install the global subscriber. Calling it twice is harmless.
pub fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .with_ansi(false);

    if tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .try_init()
        .is_ok()
    {
        tracing::debug!("logging initialized");
    }
}
