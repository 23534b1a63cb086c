//! A minimal stderr backend for the `log` facade.
//!
//! Lines read `LEVEL - target - message`. The level is chosen on the
//! command line; library code only ever talks to `log`.

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::io::Write;

/// Writes log records to stderr.
#[derive(Debug, Clone, Copy)]
pub struct StderrLogger {
    max_level: LevelFilter,
}

impl StderrLogger {
    /// A logger passing records at or above `max_level`.
    #[must_use]
    pub fn new(max_level: LevelFilter) -> Self {
        Self { max_level }
    }

    /// Install as the global logger.
    ///
    /// # Errors
    ///
    /// Returns [`SetLoggerError`] if a logger is already installed.
    pub fn install(self) -> Result<(), SetLoggerError> {
        log::set_boxed_logger(Box::new(self))?;
        log::set_max_level(self.max_level);
        Ok(())
    }
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut stderr = std::io::stderr().lock();
        // Nowhere to report a failed log write.
        let _ = writeln!(stderr, "{}", format_record(record));
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

fn format_record(record: &Record<'_>) -> String {
    format!("{} - {} - {}", record.level(), record.target(), record.args())
}

/// Map `-v`/`-q` to a level: warnings when quiet, info by default, then
/// debug and trace.
///
/// # Examples
///
/// ```
/// use log::LevelFilter;
/// use roestbak_provisioner::logging::level_for;
///
/// assert_eq!(level_for(0, false), LevelFilter::Info);
/// assert_eq!(level_for(2, false), LevelFilter::Trace);
/// assert_eq!(level_for(0, true), LevelFilter::Warn);
/// ```
#[must_use]
pub fn level_for(verbosity: u8, quiet: bool) -> LevelFilter {
    if quiet {
        return LevelFilter::Warn;
    }
    match verbosity {
        0 => Level::Info.to_level_filter(),
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}
