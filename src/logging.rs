// src/logging.rs
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global subscriber. `RUST_LOG` wins over `logging.level`;
/// `logging.format = "json"` switches to one JSON object per line.
///
/// Calling twice is harmless: the second install is refused and reported.
pub fn init(cfg: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directives(&cfg.level)))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    let res = if cfg.format.eq_ignore_ascii_case("json") {
        registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
    res.map_err(|e| anyhow::anyhow!("tracing subscriber already installed: {e}"))
}

/// `level` for our own targets, `warn` for everyone else.
fn default_directives(level: &str) -> String {
    let level = level.trim().to_ascii_lowercase();
    format!("warn,sync={level},posting_sync={level},tower_http={level}")
}
