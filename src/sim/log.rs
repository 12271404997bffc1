use crate::timeq::Cycle;

#[derive(PartialEq, PartialOrd, Debug, Default, Clone, Copy)]
pub enum LogLevel {
    #[default]
    NONE,
    INFO,
    DEBUG,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::NONE => "NONE",
            LogLevel::INFO => "INFO",
            LogLevel::DEBUG => "DEBUG",
        }
    }
}

pub fn to_loglevel(ulevel: u64) -> LogLevel {
    match ulevel {
        0 => LogLevel::NONE,
        1 => LogLevel::INFO,
        2 => LogLevel::DEBUG,
        _ => LogLevel::DEBUG,
    }
}

/// Per-cycle event printer for the simulation. Independent of `env_logger`, which carries
/// configuration and lifecycle messages.
#[derive(Debug)]
pub struct Logger {
    level: LogLevel,
}

impl Logger {
    pub fn new(ulevel: u64) -> Self {
        let level = to_loglevel(ulevel);
        Logger { level }
    }

    pub fn silent() -> Self {
        Logger { level: LogLevel::NONE }
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level != LogLevel::NONE && level <= self.level
    }

    pub fn log(&self, level: LogLevel, cycle: Cycle, args: std::fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }
        println!("[{}] {:>8}: {}", level.as_str(), cycle, args);
    }
}

#[macro_export]
macro_rules! log {
    // usage: log!(logger, level, cycle, "a {} event", "clock")
    ($logger:expr, $level:expr, $cycle:expr, $($arg:tt)+) => {{
        $logger.log($level, $cycle, format_args!($($arg)+));
    }};
}
#[macro_export]
macro_rules! info {
    ($logger:expr, $cycle:expr, $($arg:tt)+) => ( $crate::log!($logger, $crate::sim::log::LogLevel::INFO, $cycle, $($arg)+); )
}
#[macro_export]
macro_rules! debug {
    ($logger:expr, $cycle:expr, $($arg:tt)+) => ( $crate::log!($logger, $crate::sim::log::LogLevel::DEBUG, $cycle, $($arg)+); )
}
