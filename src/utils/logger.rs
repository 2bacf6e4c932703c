//! Tracing subscriber setup
//!
//! The runner and the parallel coordinator log through `tracing`; this module
//! installs a compact subscriber whose default filter only covers this crate,
//! so user code running inside bodies keeps its own log settings.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::Level;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown log level `{0}`")]
pub struct UnknownLogLevel(String);

impl LogLevel {
    pub fn to_tracing_level(self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    fn directive(self) -> String {
        format!("{}={}", env!("CARGO_CRATE_NAME"), self)
    }
}

impl FromStr for LogLevel {
    type Err = UnknownLogLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(UnknownLogLevel(s.to_string())),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.to_tracing_level(), f)
    }
}

/// Install the global subscriber at `level`
///
/// `RUST_LOG` wins when set. Returns false when a subscriber was already
/// installed, in which case nothing changes.
pub fn init_logger(level: LogLevel) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_str() {
        assert_eq!("info".parse::<LogLevel>(), Ok(LogLevel::Info));
        assert_eq!("WARNING".parse::<LogLevel>(), Ok(LogLevel::Warn));
        let err = "loud".parse::<LogLevel>().unwrap_err();
        assert_eq!(err.to_string(), "unknown log level `loud`");
    }

    #[test]
    fn test_directive_targets_crate() {
        assert_eq!(LogLevel::Warn.directive(), "suite_runner=WARN");
    }

    #[test]
    fn test_second_init_is_refused() {
        init_logger(LogLevel::Error);
        assert!(!init_logger(LogLevel::Debug));
    }
}
