//! Process-wide tracing setup.
//!
//! One subscriber per process: an `EnvFilter` built from `RUST_LOG` (or the
//! configured level when unset or unparsable) feeding a compact or JSON
//! formatter.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

use crate::types::ObservabilityConfig;

static TRACING_INIT: OnceLock<()> = OnceLock::new();

const LOG_FORMAT_VAR: &str = "SORTIE_LOG_FORMAT";
const FALLBACK_LEVEL: &str = "info";

/// Output format of the log layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    /// `SORTIE_LOG_FORMAT` (`json` or `text`) overrides `observability.json_logs`.
    pub fn resolve<F>(config: &ObservabilityConfig, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let requested = lookup(LOG_FORMAT_VAR).map(|value| value.trim().to_ascii_lowercase());
        match requested.as_deref() {
            Some("json") => LogFormat::Json,
            Some("text") | Some("compact") => LogFormat::Compact,
            _ if config.json_logs => LogFormat::Json,
            _ => LogFormat::Compact,
        }
    }
}

/// Directives from `RUST_LOG` win; a bad value falls back to `level`, then `info`.
fn build_filter(rust_log: Option<String>, level: &str) -> EnvFilter {
    rust_log
        .filter(|directives| !directives.trim().is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new(FALLBACK_LEVEL))
}

/// Install the subscriber. Later calls are no-ops.
pub fn init_tracing(config: &ObservabilityConfig) {
    TRACING_INIT.get_or_init(|| {
        let filter = build_filter(std::env::var("RUST_LOG").ok(), &config.log_level);
        let layer = match LogFormat::resolve(config, |key| std::env::var(key).ok()) {
            LogFormat::Json => fmt::layer().json().with_current_span(true).boxed(),
            LogFormat::Compact => fmt::layer().compact().boxed(),
        };

        if let Err(err) = tracing_subscriber::registry().with(filter).with(layer).try_init() {
            eprintln!("tracing init skipped: {err}");
        }
    });
}
