//! Structured logging setup using `tracing-subscriber`.
//!
//! Console-only: the resolver runs inside a host process or as a one-shot
//! CLI, so there is no rolling file layer. Controlled by `RUST_LOG`
//! (default: `info`).

use tracing_subscriber::EnvFilter;

/// Initialise human-readable logging to stderr.
///
/// Honors `RUST_LOG`; falls back to `info`.
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}
