use std::fmt::{Display, Formatter};
use std::sync::Mutex;

use lazy_static::lazy_static;
use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use time::macros::format_description;
use time::OffsetDateTime;

#[derive(Clone, Debug)]
pub struct LogEntry {
    pub timestamp: OffsetDateTime,
    pub level: Level,
    pub module: Option<String>,
    pub text: String,
}

impl Display for LogEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let format = format_description!("[hour]:[minute]:[second].[subsecond digits:3]");
        let timestamp = self
            .timestamp
            .format(format)
            .unwrap_or_else(|_| "??:??:??.???".to_string());
        write!(f, "{} {:<5} ", timestamp, self.level)?;
        if let Some(module) = &self.module {
            write!(f, "[{}] ", module)?;
        }
        write!(f, "{}", self.text)
    }
}

lazy_static! {
    static ref LOGGER: Logger = Logger::default();
}

/// Collects log records from any thread, they're printed by main thread
#[derive(Debug)]
pub struct Logger {
    entries: Mutex<Vec<LogEntry>>,
}

impl Logger {
    pub fn global() -> &'static Logger {
        &LOGGER
    }

    /// Installs global logger as `log` backend
    pub fn install(level: LevelFilter) -> Result<(), SetLoggerError> {
        log::set_logger(Logger::global())?;
        log::set_max_level(level);
        Ok(())
    }

    /// Return all new entries from last call
    ///
    /// Entries are sorted from oldest (first) to newest (last)
    pub fn read_entries(&self) -> Vec<LogEntry> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(entries.as_mut())
    }

    /// Prints all new entries to stderr
    pub fn drain_to_stderr(&self) {
        for entry in self.read_entries() {
            eprintln!("{}", entry);
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self {
            entries: Mutex::new(vec![]),
        }
    }
}

impl Log for Logger {
    fn enabled(&self, _: &Metadata<'_>) -> bool {
        // filtered by log::set_max_level
        true
    }

    fn log(&self, record: &Record<'_>) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(LogEntry {
                timestamp: OffsetDateTime::now_utc(),
                level: record.level(),
                module: record.module_path().map(|s| s.to_string()),
                text: record.args().to_string(),
            });
    }

    fn flush(&self) {
        // everything in memory
    }
}
