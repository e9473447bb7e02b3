//! stderr logging for the engine.
//!
//! Every line goes out under the stderr lock so output from the pump thread
//! and injector threads does not interleave.
//!
//! - `CPORT_LOG_LEVEL` - off|error|warn|info|debug|trace or 0..=5 (default: info)
//! - `CPORT_FLUSH_EPRINT=1` - flush after every line
//!
//! ```ignore
//! use cport_core::{kdebug, kwarn};
//!
//! kdebug!("submit {} token={}", kind, token);
//! kwarn!("shutdown leaked {} operations", n);
//! ```

use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Once;

use crate::env::{env_get_bool, env_get_str};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    /// Accepts names or digits. `None` for anything else.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "0" => Some(LogLevel::Off),
            "error" | "1" => Some(LogLevel::Error),
            "warn" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "E",
            LogLevel::Warn => "W",
            LogLevel::Info => "I",
            LogLevel::Debug => "D",
            LogLevel::Trace => "T",
        }
    }
}

static INIT: Once = Once::new();
static LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static FLUSH: AtomicBool = AtomicBool::new(false);

/// Read the environment. Runs once; later calls are no-ops.
pub fn init() {
    INIT.call_once(|| {
        if let Some(level) = LogLevel::parse(&env_get_str("CPORT_LOG_LEVEL", "")) {
            LEVEL.store(level as u8, Ordering::Relaxed);
        }
        FLUSH.store(env_get_bool("CPORT_FLUSH_EPRINT", false), Ordering::Relaxed);
    });
}

#[inline]
pub fn log_level() -> LogLevel {
    init();
    LogLevel::from_u8(LEVEL.load(Ordering::Relaxed))
}

/// Override the level. Takes precedence over `CPORT_LOG_LEVEL`.
pub fn set_log_level(level: LogLevel) {
    init();
    LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn set_flush_enabled(enabled: bool) {
    init();
    FLUSH.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= log_level()
}

fn emit(prefix: Option<LogLevel>, args: std::fmt::Arguments<'_>) {
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    if let Some(level) = prefix {
        let _ = write!(out, "cport[{}] ", level.tag());
    }
    let _ = out.write_fmt(args);
    let _ = out.write_all(b"\n");
    if FLUSH.load(Ordering::Relaxed) {
        let _ = out.flush();
    }
}

#[doc(hidden)]
pub fn _kprintln_impl(args: std::fmt::Arguments<'_>) {
    init();
    emit(None, args);
}

#[doc(hidden)]
pub fn _klog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if level_enabled(level) {
        emit(Some(level), args);
    }
}

/// Unconditional line on stderr.
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint::_kprintln_impl(format_args!(""))
    };
    ($($arg:tt)*) => {
        $crate::kprint::_kprintln_impl(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Debug, format_args!($($arg)*))
    };
}

/// Per-completion chatter. Off unless `CPORT_LOG_LEVEL=trace`.
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {
        $crate::kprint::_klog_impl($crate::kprint::LogLevel::Trace, format_args!($($arg)*))
    };
}
