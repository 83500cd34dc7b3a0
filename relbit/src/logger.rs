use chrono::Local;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
    Query,
}

impl Level {
    fn label(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Query => "QUERY",
        }
    }
}

pub fn log_line(level: Level, args: fmt::Arguments) {
    let line = format!("[{}] {} {}", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"), level.label(), args);
    match level {
        Level::Error => eprintln!("{line}"),
        _ => println!("{line}"),
    }
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::logger::log_line($crate::logger::Level::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::logger::log_line($crate::logger::Level::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::logger::log_line($crate::logger::Level::Error, format_args!($($arg)*))
    };
}

/// Storage statements, printed only when `debug_queries` is on.
#[macro_export]
macro_rules! query {
    ($($arg:tt)*) => {
        $crate::logger::log_line($crate::logger::Level::Query, format_args!($($arg)*))
    };
}
