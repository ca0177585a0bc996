//! Diagnostic tracing for the CLI.
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! binary's job. The per-run progress log kept in the accumulator is separate
//! and is always populated regardless of `RUST_LOG`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. `verbose` raises the crate's own
/// events to `debug` without touching dependency noise.
///
/// ```bash
/// RUST_LOG=pmscope=debug pmscope ask --repo https://github.com/o/r "how far along are we?"
/// ```
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("warn,pmscope=debug")
        } else {
            EnvFilter::new("warn")
        }
    });

    // A second init (tests, embedding) is harmless; ignore it.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
