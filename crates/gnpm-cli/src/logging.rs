//! Logging initialization for the CLI.
//!
//! Logging is owned by the CLI crate to keep the library crate lightweight.
//! Structured output goes to stderr so the install contract on stdout stays
//! clean.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the tracing subscriber.
///
/// Honors `RUST_LOG` when set; defaults to warnings globally with info-level
/// pipeline progress from the gnpm crates.
///
/// # Panics
/// Panics if the subscriber is initialized twice.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,gnpm=info,gnpm_core=info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}
