//! Structured logging utilities for drover components.
//!
//! Provides consistent logging with component tags and structured fields.
//!
//! # Usage
//!
//! ```ignore
//! use drover_config::log_worker_info;
//!
//! log_worker_info!(hash = %hash, size, "Cached file");
//! ```

use std::str::FromStr;

/// Component identifiers for log filtering
pub struct Component;

impl Component {
    pub const WORKER: &'static str = "WORKER";
    pub const MAINTENANCE: &'static str = "MAINT";
    pub const POLLER: &'static str = "POLLER";
    pub const NODE: &'static str = "NODE";
    pub const ALERT: &'static str = "ALERT";
}

/// Log levels for runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

// === WORKER logging macros ===

#[macro_export]
macro_rules! log_worker_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = "WORKER", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_worker_info {
    ($($arg:tt)+) => {
        tracing::info!(component = "WORKER", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_worker_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = "WORKER", $($arg)+)
    };
}

// === MAINTENANCE logging macros ===

#[macro_export]
macro_rules! log_maint_info {
    ($($arg:tt)+) => {
        tracing::info!(component = "MAINT", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_maint_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = "MAINT", $($arg)+)
    };
}

// === POLLER logging macros ===

#[macro_export]
macro_rules! log_poller_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = "POLLER", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_poller_info {
    ($($arg:tt)+) => {
        tracing::info!(component = "POLLER", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_poller_debug {
    ($($arg:tt)+) => {
        tracing::debug!(component = "POLLER", $($arg)+)
    };
}

// === NODE logging macros ===

#[macro_export]
macro_rules! log_node_error {
    ($($arg:tt)+) => {
        tracing::error!(component = "NODE", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_node_warn {
    ($($arg:tt)+) => {
        tracing::warn!(component = "NODE", $($arg)+)
    };
}

#[macro_export]
macro_rules! log_node_info {
    ($($arg:tt)+) => {
        tracing::info!(component = "NODE", $($arg)+)
    };
}

/// Initialize logging with the given level filter.
/// Call this once at application startup. `RUST_LOG` takes precedence.
pub fn init_logging(level: LogLevel) {
    use tracing_subscriber::EnvFilter;

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_constants() {
        assert_eq!(Component::WORKER, "WORKER");
        assert_eq!(Component::MAINTENANCE, "MAINT");
        assert_eq!(Component::POLLER, "POLLER");
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!("INFO".parse::<LogLevel>(), Ok(LogLevel::Info));
        assert_eq!("warning".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Trace.as_filter(), "trace");
    }
}
