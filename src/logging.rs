//! Logging facility
//!
//! Provides a thread-safe `log` backend that writes to stderr.
//! The library only emits records; installing this logger is up to the host.

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

#[cfg(debug_assertions)]
const DEFAULT_LEVEL: LevelFilter = LevelFilter::Debug;
#[cfg(not(debug_assertions))]
const DEFAULT_LEVEL: LevelFilter = LevelFilter::Info;

/// Global logger instance
pub static LOGGER: Logger = Logger::new();

/// Thread-safe logger implementation
pub struct Logger {
    inner: Mutex<()>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    /// Creates a new logger instance
    pub const fn new() -> Logger {
        Logger {
            inner: Mutex::new(()),
        }
    }
}

impl Log for Logger {
    /// Determines if a log message should be processed based on its level
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    /// Formats messages as "[LEVEL] target: message"
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _guard = self.inner.lock();
            eprintln!("[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Installs [`LOGGER`] as the `log` backend.
///
/// # Arguments
/// * `level` - maximum level to emit. `None` picks `Debug` for debug builds
///   and `Info` for release builds.
///
/// # Errors
/// Fails if another logger was installed first.
pub fn init(level: Option<LevelFilter>) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER).map(|()| {
        log::set_max_level(level.unwrap_or(DEFAULT_LEVEL))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_respects_max_level() {
        // another test binary may already own the logger, ignore that
        let _ = init(Some(LevelFilter::Warn));
        log::set_max_level(LevelFilter::Warn);

        let warn = Metadata::builder().level(log::Level::Warn).build();
        let debug = Metadata::builder().level(log::Level::Debug).build();
        assert!(LOGGER.enabled(&warn));
        assert!(!LOGGER.enabled(&debug));
    }
}
