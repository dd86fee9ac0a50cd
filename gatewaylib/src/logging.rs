//! Process-wide logger.
//!
//! The teacher wires `log::set_boxed_logger` to a small hand-rolled
//! `impl log::Log` that forwards formatted lines into a channel feeding
//! its TUI (`src/ui.rs::AppLogger`). This gateway has no TUI, so
//! `GatewayLogger` forwards formatted, timestamped lines to a plain
//! `Write` sink (stderr by default, or a file) instead of a channel,
//! keeping the same "own `log::Log` impl, no external logger crate"
//! shape described as the "Global `CLog` singleton" in `spec.md` §9.

use std::io::Write;
use std::sync::Mutex;

use chrono::Local;

pub struct GatewayLogger {
    sink: Mutex<Box<dyn Write + Send>>,
    level: log::LevelFilter,
}

impl GatewayLogger {
    fn new(sink: Box<dyn Write + Send>, level: log::LevelFilter) -> GatewayLogger {
        GatewayLogger {
            sink: Mutex::new(sink),
            level,
        }
    }

    /// Initializes the process-wide logger writing to stderr.
    pub fn init_stderr(level: log::LevelFilter) {
        let logger = GatewayLogger::new(Box::new(std::io::stderr()), level);
        Self::install(logger, level);
    }

    /// Initializes the process-wide logger writing to the given file,
    /// appending if it already exists.
    pub fn init_file(path: &std::path::Path, level: log::LevelFilter) -> std::io::Result<()> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let logger = GatewayLogger::new(Box::new(file), level);
        Self::install(logger, level);
        Ok(())
    }

    fn install(logger: GatewayLogger, level: log::LevelFilter) {
        log::set_max_level(level);
        let _ = log::set_boxed_logger(Box::new(logger));
    }
}

impl log::Log for GatewayLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "{} {:<5} {} {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        );
        if let Ok(mut sink) = self.sink.lock() {
            let _ = sink.write_all(line.as_bytes());
        }
    }

    fn flush(&self) {
        if let Ok(mut sink) = self.sink.lock() {
            let _ = sink.flush();
        }
    }
}
