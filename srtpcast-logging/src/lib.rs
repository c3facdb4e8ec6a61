//! Structured logging setup for srtpcast services

use std::str::FromStr;
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Output format of the log stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line (production)
    Json,
    /// Human-readable lines (development)
    Console,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "console" | "pretty" | "text" => Ok(LogFormat::Console),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Initialize logging in the requested format.
///
/// `RUST_LOG` takes precedence over `default_level`. Calling this more than
/// once keeps the first subscriber.
pub fn init(service_name: &str, format: LogFormat, default_level: &str) {
    match format {
        LogFormat::Json => init_logging(service_name, default_level),
        LogFormat::Console => init_console_logging(service_name, default_level),
    }
}

/// Initialize JSON logging
///
/// This sets up:
/// - JSON formatted logs with file/line
/// - Environment-based log level filtering
/// - Service name tagging on the first event
pub fn init_logging(service_name: &str, default_level: &str) {
    let installed = tracing_subscriber::registry()
        .with(env_filter(default_level))
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_current_span(false)
                .with_span_list(false),
        )
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(service = service_name, "Logging initialized");
    }
}

/// Initialize simple console logging (for development)
pub fn init_console_logging(service_name: &str, default_level: &str) {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(env_filter(default_level))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(service = service_name, "Console logging initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("Console".parse::<LogFormat>().unwrap(), LogFormat::Console);
        assert_eq!(" pretty ".parse::<LogFormat>().unwrap(), LogFormat::Console);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_init_twice_does_not_panic() {
        init_console_logging("test", "debug");
        init_console_logging("test", "debug");
    }
}
