use clap::ValueEnum;
use flexi_logger::{Duplicate, FileSpec, LogSpecBuilder, Logger, LoggerHandle};
use log::LevelFilter;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Trace => LevelFilter::Trace,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Error => LevelFilter::Error,
        }
    }
}

/// Initialize the logger. Log lines go to a file so they never interleave with guest UART
/// output on stdout; errors are duplicated to stderr.
///
/// Must keep the [`LoggerHandle`] (returned value) alive up to the very end of the program
/// to ensure that all buffered log lines are flushed out.
#[must_use]
pub fn init(level: LogLevel) -> LoggerHandle {
    let mut builder = LogSpecBuilder::new();
    builder.module("rustyline", LevelFilter::Warn);
    builder.default(level.to_level_filter());

    Logger::with(builder.build())
        .log_to_file(
            FileSpec::default()
                .directory("logs")
                .basename("deimos")
                .suffix("log"),
        )
        .duplicate_to_stderr(Duplicate::Error)
        .start()
        .unwrap()
}
