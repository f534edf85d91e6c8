//! Kernel logging backend.
//!
//! Kernel code logs through the `log` facade. This crate is the sink on the
//! other side: it formats each record as a coloured `[LEVEL] target: message`
//! line and hands it to whatever [`Console`] the platform installs (a serial
//! port on hardware, stderr in hosted tests).
#![cfg_attr(not(test), no_std)]

use core::fmt::{self, Write};
use spin::{Mutex, Once};

/// Log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "TRACE",
            Level::Debug => "DEBUG",
            Level::Info => " INFO",
            Level::Warn => " WARN",
            Level::Error => "ERROR",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            Level::Trace => "\x1b[90m", // Gray
            Level::Debug => "\x1b[36m", // Cyan
            Level::Info => "\x1b[32m",  // Green
            Level::Warn => "\x1b[33m",  // Yellow
            Level::Error => "\x1b[31m", // Red
        }
    }

    /// The `log` filter that lets this level and everything more severe through.
    pub fn filter(&self) -> log::LevelFilter {
        match self {
            Level::Trace => log::LevelFilter::Trace,
            Level::Debug => log::LevelFilter::Debug,
            Level::Info => log::LevelFilter::Info,
            Level::Warn => log::LevelFilter::Warn,
            Level::Error => log::LevelFilter::Error,
        }
    }
}

impl From<log::Level> for Level {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Trace => Level::Trace,
            log::Level::Debug => Level::Debug,
            log::Level::Info => Level::Info,
            log::Level::Warn => Level::Warn,
            log::Level::Error => Level::Error,
        }
    }
}

/// Where formatted log lines end up.
pub trait Console: Send + Sync {
    fn write_str(&self, s: &str);
}

struct ConsoleWriter<'a>(&'a dyn Console);

impl Write for ConsoleWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

/// Write one complete record to `console`.
pub fn write_record(console: &dyn Console, level: Level, target: &str, args: fmt::Arguments) {
    let mut out = ConsoleWriter(console);
    let _ = writeln!(
        out,
        "{}[{}]\x1b[0m {}: {}",
        level.color(),
        level.as_str(),
        target,
        args
    );
}

struct KernelLogger {
    console: Once<&'static dyn Console>,
    // Whole records are written under this lock so lines never interleave.
    line: Mutex<()>,
}

static LOGGER: KernelLogger = KernelLogger {
    console: Once::new(),
    line: Mutex::new(()),
};

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(console) = self.console.get() {
            let _guard = self.line.lock();
            write_record(*console, record.level().into(), record.target(), *record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the kernel logger with `console` as its sink.
///
/// Only the first call takes effect; later calls return the error from
/// `log::set_logger` and leave the installed console in place.
pub fn init(console: &'static dyn Console, max: Level) -> Result<(), log::SetLoggerError> {
    LOGGER.console.call_once(|| console);
    log::set_logger(&LOGGER)?;
    log::set_max_level(max.filter());
    Ok(())
}

/// Log a message with a specific level, bypassing the `log` facade.
pub fn log(level: Level, args: fmt::Arguments) {
    if let Some(console) = LOGGER.console.get() {
        let _guard = LOGGER.line.lock();
        write_record(*console, level, "kernel", args);
    }
}
