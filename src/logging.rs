//! Diagnostic logging via `tracing`.
//!
//! Status lines meant for the user go through the output router. This
//! subscriber only carries internal diagnostics and writes them to stderr so
//! they never mix with process output.
//!
//! Level priority: `--log-level`, then `PROCRACK_LOG`, then `warn`.

use tracing::Level;

pub const LOG_ENV: &str = "PROCRACK_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Installs the global subscriber. Call once at startup.
pub fn init_logging(cli_level: Option<LogLevel>) {
    let level = match cli_level {
        Some(level) => level_from_log_level(level),
        None => std::env::var(LOG_ENV)
            .ok()
            .and_then(|value| parse_level_str(&value))
            .unwrap_or(Level::WARN),
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn level_from_log_level(level: LogLevel) -> Level {
    match level {
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    }
}

fn parse_level_str(value: &str) -> Option<Level> {
    match value.trim().to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_level_names() {
        assert_eq!(parse_level_str(" Debug "), Some(Level::DEBUG));
        assert_eq!(parse_level_str("warning"), Some(Level::WARN));
        assert_eq!(parse_level_str("loud"), None);
    }

    #[test]
    fn flag_levels_map_directly() {
        assert_eq!(level_from_log_level(LogLevel::Trace), Level::TRACE);
        assert_eq!(level_from_log_level(LogLevel::Error), Level::ERROR);
    }
}
