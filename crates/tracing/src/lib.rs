//! Logging setup for the popsigner control plane.
//!
//! `DEBUG=true` raises the default level to `debug` and switches to a
//! human-readable pretty layer; otherwise logs are emitted as JSON lines at
//! `info`, suitable for a log aggregator.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global tracing subscriber. Must be called once, as early as
/// possible in `main`.
pub fn init(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = fmt().with_env_filter(filter).with_target(true);

    if debug {
        subscriber.pretty().init();
    } else {
        subscriber.json().init();
    }
}
