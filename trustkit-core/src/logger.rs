//! Pluggable logging bridge.
//!
//! The SDK logs through the `log` crate. Host applications provide a
//! [`Logger`] implementation once at startup and receive every record the
//! SDK emits; debug/trace records from foreign modules are filtered out so
//! the host only sees its own noise at those levels.

use std::sync::{Arc, OnceLock};

/// Sink for SDK log messages, implemented by the host application.
pub trait Logger: Sync + Send {
    /// Logs a message at the specified level.
    fn log(&self, level: LogLevel, message: String);
}

/// Severity levels forwarded to the host logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Very low priority, extremely detailed messages.
    Trace,
    /// Lower priority debugging information.
    Debug,
    /// Informational progress messages.
    Info,
    /// Potentially harmful situations.
    Warn,
    /// Errors that still allow the SDK to continue running.
    Error,
}

struct ForwardingLogger;

impl log::Log for ForwardingLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let from_trustkit = record
            .module_path()
            .is_some_and(|module_path| module_path.starts_with("trustkit"));
        let debug_or_trace =
            record.level() == log::Level::Debug || record.level() == log::Level::Trace;
        if debug_or_trace && !from_trustkit {
            return;
        }

        if let Some(logger) = LOGGER_INSTANCE.get() {
            logger.log(level_of(record.level()), format!("{}", record.args()));
        } else {
            eprintln!("Logger not set: {}", record.args());
        }
    }

    fn flush(&self) {}
}

const fn level_of(level: log::Level) -> LogLevel {
    match level {
        log::Level::Error => LogLevel::Error,
        log::Level::Warn => LogLevel::Warn,
        log::Level::Info => LogLevel::Info,
        log::Level::Debug => LogLevel::Debug,
        log::Level::Trace => LogLevel::Trace,
    }
}

static LOGGER_INSTANCE: OnceLock<Arc<dyn Logger>> = OnceLock::new();

/// Installs the host logger. Call once during application startup, before
/// any SDK operation; later calls are ignored.
pub fn set_logger(logger: Arc<dyn Logger>) {
    if LOGGER_INSTANCE.set(logger).is_err() {
        eprintln!("Logger already set");
        return;
    }

    static LOGGER: ForwardingLogger = ForwardingLogger;
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Trace);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(level_of(log::Level::Error), LogLevel::Error);
        assert_eq!(level_of(log::Level::Trace), LogLevel::Trace);
    }
}
