//! cport error types.
//!
//! Asynchronous failures are not represented here: a queued operation
//! that fails reports its errno through the callback's error field.
//! A pump that times out returns `PumpOutcome::Timeout`, not an error.

use std::fmt;

use crate::config::ConfigError;
use crate::entry::{OpKind, Token};

#[derive(Debug)]
pub enum CportError {
    /// Bad length, buffer capacity, host string or buffer state.
    /// Raised at submit time; nothing was allocated.
    InvalidArgument(&'static str),
    /// Address family other than AF_INET.
    UnsupportedAddressFamily(i32),
    /// Queue creation or extension resolution failed. Fatal to init.
    SystemResource { what: &'static str, errno: i32 },
    /// The OS refused the operation outright. The context was released
    /// and the callback will never run.
    SystemCall { op: OpKind, errno: i32 },
    /// The wait for a completion failed for a reason other than timeout.
    System(i32),
    /// A completion carried a token with no live context.
    UnknownToken(Token),
    /// Configuration rejected by `EngineConfig::validate`.
    Config(ConfigError),
}

impl CportError {
    /// The OS errno behind this error, if there is one.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::SystemResource { errno, .. } => Some(*errno),
            Self::SystemCall { errno, .. } => Some(*errno),
            Self::System(e) => Some(*e),
            _ => None,
        }
    }

    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, Self::InvalidArgument(_))
    }
}

impl fmt::Display for CportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Self::UnsupportedAddressFamily(fam) => {
                write!(f, "unsupported address family {}", fam)
            }
            Self::SystemResource { what, errno } => {
                write!(f, "{}: errno {}", what, errno)
            }
            Self::SystemCall { op, errno } => write!(f, "{} failed: errno {}", op, errno),
            Self::System(e) => write!(f, "completion wait failed: errno {}", e),
            Self::UnknownToken(t) => write!(f, "completion for unknown token {}", t),
            Self::Config(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CportError {}

impl From<ConfigError> for CportError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

pub type Result<T> = std::result::Result<T, CportError>;
