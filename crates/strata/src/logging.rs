//! Logging setup on top of `tracing`.
//!
//! Stages log reconfigurations at info, data-format flow and conversion
//! decisions at debug, per-call submits at trace. Nothing is printed until a
//! subscriber is installed; these helpers install one.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: standard tracing filter, takes precedence
//! - `STRATA_LOG`: simple level (error, warn, info, debug, trace)
//! - `STRATA_LOG_FORMAT`: "human" or "json"

use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

const LOG_LEVEL_ENV: &str = "STRATA_LOG";
const LOG_FORMAT_ENV: &str = "STRATA_LOG_FORMAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "error" => Some(LogLevel::Error),
            "warn" | "warning" => Some(LogLevel::Warn),
            "info" => Some(LogLevel::Info),
            "debug" => Some(LogLevel::Debug),
            "trace" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl LogFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "human" | "pretty" => Some(LogFormat::Human),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Include file and line in every event.
    pub with_file_info: bool,
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Level and format from `STRATA_LOG` / `STRATA_LOG_FORMAT`, defaults
    /// for anything unset or unparseable.
    pub fn from_env() -> Self {
        let level = std::env::var(LOG_LEVEL_ENV)
            .ok()
            .and_then(|s| LogLevel::parse(&s))
            .unwrap_or_default();
        let format = std::env::var(LOG_FORMAT_ENV)
            .ok()
            .and_then(|s| LogFormat::parse(&s))
            .unwrap_or_default();
        LogConfig::new().with_level(level).with_format(format)
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file_info(mut self, with_file_info: bool) -> Self {
        self.with_file_info = with_file_info;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.as_filter_str()))
    }
}

/// Install a global subscriber for `config`. Only the first call in a
/// process has any effect.
pub fn init_logging(config: &LogConfig) {
    TRACING_INITIALIZED.get_or_init(|| {
        let filter = config.filter();
        // another subscriber may already be set by the host application
        let _ = match config.format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_target(false)
                        .with_file(config.with_file_info)
                        .with_line_number(config.with_file_info),
                )
                .try_init(),
            LogFormat::Human => tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_target(true)
                        .with_file(config.with_file_info)
                        .with_line_number(config.with_file_info),
                )
                .try_init(),
        };
    });
}

/// `init_logging` with `LogConfig::from_env()`.
pub fn init_default_logging() {
    init_logging(&LogConfig::from_env());
}

pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parse() {
        assert_eq!(LogLevel::parse("DEBUG"), Some(LogLevel::Debug));
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::parse("loud"), None);
        assert_eq!(LogLevel::default(), LogLevel::Warn);
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(LogFormat::parse("json"), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("Human"), Some(LogFormat::Human));
        assert_eq!(LogFormat::parse("xml"), None);
    }

    #[test]
    fn test_init_is_idempotent() {
        init_logging(&LogConfig::new().with_level(LogLevel::Error));
        init_default_logging();
        assert!(is_initialized());
    }
}
