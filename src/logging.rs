//! Tracing initialization.
//!
//! Log levels come from the `QECTX_LOG` environment variable in
//! `EnvFilter` syntax, e.g. `QECTX_LOG=qe_context=debug,sqlx=warn`. Without
//! it the level is `info`. Logs go to stderr so CLI output on stdout stays
//! machine-readable.

use std::sync::Once;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const LOG_ENV: &str = "QECTX_LOG";

static INIT: Once = Once::new();

/// Install the global subscriber. Only the first call has any effect.
pub fn init_tracing(json: bool) {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(filter);
        let result = if json {
            registry
                .with(
                    fmt::layer()
                        .json()
                        .with_current_span(false)
                        .with_writer(std::io::stderr),
                )
                .try_init()
        } else {
            registry
                .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
                .try_init()
        };
        if let Err(e) = result {
            eprintln!("Warning: tracing already initialized: {}", e);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_tracing(false);
        init_tracing(true);
        tracing::info!("logging initialized");
    }
}
