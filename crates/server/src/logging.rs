//! Structured logging configuration.
//!
//! Two modes: pretty-printed human-readable logs for development and JSON
//! for log aggregation. Set `KVSERVE_LOG_FORMAT=json` for the latter;
//! `RUST_LOG` controls levels (default: info).

use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        match std::env::var("KVSERVE_LOG_FORMAT")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Initialize the logging subsystem from the environment.
pub fn init() {
    init_with_format(LogFormat::from_env());
}

pub fn init_with_format(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_thread_ids(false)
                        .with_file(false)
                        .with_line_number(false),
                )
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_target(true)
                        .with_file(true)
                        .with_line_number(true),
                )
                .init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_from_env() {
        std::env::remove_var("KVSERVE_LOG_FORMAT");
        assert_eq!(LogFormat::from_env(), LogFormat::Pretty);

        std::env::set_var("KVSERVE_LOG_FORMAT", "json");
        assert_eq!(LogFormat::from_env(), LogFormat::Json);

        std::env::set_var("KVSERVE_LOG_FORMAT", "JSON");
        assert_eq!(LogFormat::from_env(), LogFormat::Json);

        std::env::remove_var("KVSERVE_LOG_FORMAT");
    }
}
