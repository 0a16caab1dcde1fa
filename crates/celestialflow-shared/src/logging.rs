//! Tracing setup.
//!
//! The tracing subscriber is the single log consumer for every stage in a
//! graph: stages emit structured events (queue put/get at TRACE, lifecycle
//! at INFO, recoverable faults at WARN) and one subscriber drains them all.

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

use crate::errors::ConfigurationError;

/// Log levels accepted by [`init_tracing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(ConfigurationError::LogLevel(other.to_string())),
        }
    }
}

/// Install a global subscriber filtered at `level` (overridable through
/// `RUST_LOG`). Safe to call more than once; later calls are no-ops.
pub fn init_tracing(level: &str) -> Result<(), ConfigurationError> {
    let level: LogLevel = level.parse()?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
    tracing::debug!(level = level.as_filter(), "tracing initialised");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_levels() {
        assert_eq!("INFO".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
    }

    #[test]
    fn rejects_unknown_level() {
        assert!(matches!(
            "loud".parse::<LogLevel>(),
            Err(ConfigurationError::LogLevel(_))
        ));
    }

    #[test]
    fn init_accepts_valid_level_and_is_idempotent() {
        assert!(init_tracing("debug").is_ok());
        assert!(init_tracing("info").is_ok());
    }

    #[test]
    fn init_rejects_invalid_level() {
        assert!(init_tracing("verbose").is_err());
    }
}
