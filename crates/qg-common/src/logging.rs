//! Structured logging setup.
//!
//! - `LOG_FORMAT=json` emits one JSON object per event, for log aggregation.
//! - Anything else emits human-readable lines.
//! - `RUST_LOG` filters as usual, e.g. `RUST_LOG=qg_queue=debug,lapin=warn`.
//!
//! Adapters log with structured fields (`queue`, `backend`, `message_id`), so
//! JSON output can be filtered per queue without parsing message text.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

impl LogFormat {
    pub fn from_env() -> Self {
        match std::env::var("LOG_FORMAT") {
            Ok(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        }
    }
}

/// Install the global subscriber. Calling it more than once is harmless; later
/// calls are ignored.
pub fn init_logging(service_name: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let installed = match LogFormat::from_env() {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_target(true)
                    .flatten_event(true),
            )
            .try_init()
            .is_ok(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_ansi(true))
            .try_init()
            .is_ok(),
    };

    if installed {
        tracing::debug!(service = service_name, "Logging initialized");
    }
}
