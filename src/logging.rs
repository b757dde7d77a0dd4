// Tracing setup for the binary. Logs go to stderr so they never interleave
// with the prompts and progress bar drawn on stdout.

use std::env;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initializes the global tracing subscriber from `RUST_LOG` / `LOG_LEVEL`
/// (default `warn`, the UI already reports progress) and
/// `LOG_FORMAT=human|json`.
pub fn init_subscriber() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "warn".to_string());
    let log_format = env::var("LOG_FORMAT").unwrap_or_else(|_| "human".to_string());

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{log_level},hyper=warn,reqwest=warn")));

    let registry = tracing_subscriber::registry().with(env_filter);
    // Already initialised (e.g. by a test harness): keep the existing one.
    let _ = if log_format == "json" {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
    };
}
