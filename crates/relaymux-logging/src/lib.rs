//! # relaymux-logging
//!
//! Structured logging with `tracing`.
//!
//! [`init_subscriber`] installs a global subscriber with an `EnvFilter`
//! (`RUST_LOG` wins over the configured level) and either JSON or
//! human-readable output.

#![deny(unsafe_code)]

pub mod types;

pub use types::LogFormat;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Filter used when neither `RUST_LOG` nor the configured level parses.
pub const FALLBACK_FILTER: &str = "info";

/// Build a filter from a configured level or directive string.
///
/// Invalid directives fall back to [`FALLBACK_FILTER`].
pub fn filter_for_level(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new(FALLBACK_FILTER))
}

/// Install the global subscriber.
///
/// Returns `false` if a global subscriber was already installed (tests, or a
/// second call), in which case the existing one keeps running.
pub fn init_subscriber(level: &str, format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter_for_level(level));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
    };
    result.is_ok()
}
