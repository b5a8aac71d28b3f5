use crate::DebugPort;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicUsize, Ordering};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// `log` backend writing `[LEVEL] target: message` lines to the debug port.
pub struct KernelLogger {
    max_level: AtomicUsize,
}

static LOGGER: KernelLogger = KernelLogger::new(LevelFilter::Info);

impl KernelLogger {
    #[must_use]
    pub const fn new(max_level: LevelFilter) -> Self {
        Self {
            max_level: AtomicUsize::new(max_level as usize),
        }
    }

    pub fn set_max_level(&self, level: LevelFilter) {
        self.max_level.store(level as usize, Ordering::Relaxed);
    }

    #[must_use]
    pub fn max_level(&self) -> LevelFilter {
        match self.max_level.load(Ordering::Relaxed) {
            0 => LevelFilter::Off,
            1 => LevelFilter::Error,
            2 => LevelFilter::Warn,
            3 => LevelFilter::Info,
            4 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

/// Installs the kernel logger as the global `log` backend.
///
/// # Errors
/// Fails if another logger was installed first.
pub fn init_logger(level: LevelFilter) -> Result<(), SetLoggerError> {
    LOGGER.set_max_level(level);
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

/// Formats one record the way the kernel logger prints it.
///
/// # Errors
/// Propagates errors from the writer.
pub fn write_record(w: &mut impl Write, record: &Record<'_>) -> fmt::Result {
    writeln!(w, "[{}] {}: {}", record.level(), record.target(), record.args())
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let _ = write_record(&mut DebugPort, record);
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::Level;

    #[test]
    fn record_format() {
        let mut out = String::new();
        write_record(
            &mut out,
            &Record::builder()
                .level(Level::Warn)
                .target("kernel_vmm")
                .args(format_args!("free descriptors low: {}", 3))
                .build(),
        )
        .unwrap();
        assert_eq!(out, "[WARN] kernel_vmm: free descriptors low: 3\n");
    }

    #[test]
    fn level_filter() {
        let logger = KernelLogger::new(LevelFilter::Warn);
        let meta = |level| Metadata::builder().level(level).build();
        assert!(logger.enabled(&meta(Level::Error)));
        assert!(!logger.enabled(&meta(Level::Info)));
        logger.set_max_level(LevelFilter::Trace);
        assert!(logger.enabled(&meta(Level::Trace)));
        assert_eq!(logger.max_level(), LevelFilter::Trace);
    }
}
