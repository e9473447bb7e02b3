//! Engine configuration.
//!
//! Library defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls on the value returned by `from_env()`
//! 2. Environment variables
//! 3. Library defaults
//!
//! # Example
//!
//! ```rust
//! use cport_core::config::EngineConfig;
//! use std::time::Duration;
//!
//! let config = EngineConfig::from_env()
//!     .sq_entries(512)
//!     .drain_timeout(Duration::from_millis(250));
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use crate::env::{env_get, env_get_bool, env_get_opt};

pub mod defaults {
    pub const SQ_ENTRIES: u32 = 256;
    pub const EAGER_FLUSH: bool = true;
    pub const DRAIN_TIMEOUT_MS: u64 = 1000;
    /// Largest SQ size io_uring accepts.
    pub const MAX_SQ_ENTRIES: u32 = 32768;
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Submission queue entries. Power of two.
    pub sq_entries: u32,
    /// Completion queue entries. `None` = 2 * sq_entries.
    pub cq_entries: Option<u32>,
    /// Kick the kernel after every submit instead of waiting for the
    /// next pump.
    pub eager_flush: bool,
    /// How long `shutdown()` keeps pumping before leaking what is left.
    pub drain_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl EngineConfig {
    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `CPORT_SQ_ENTRIES` - submission queue size
    /// - `CPORT_CQ_ENTRIES` - completion queue size
    /// - `CPORT_EAGER_FLUSH` - flush on every submit (0/1)
    /// - `CPORT_DRAIN_TIMEOUT_MS` - shutdown drain budget
    pub fn from_env() -> Self {
        Self {
            sq_entries: env_get("CPORT_SQ_ENTRIES", defaults::SQ_ENTRIES),
            cq_entries: env_get_opt("CPORT_CQ_ENTRIES"),
            eager_flush: env_get_bool("CPORT_EAGER_FLUSH", defaults::EAGER_FLUSH),
            drain_timeout: Duration::from_millis(env_get(
                "CPORT_DRAIN_TIMEOUT_MS",
                defaults::DRAIN_TIMEOUT_MS,
            )),
        }
    }

    /// Library defaults only, no environment lookup.
    pub fn new() -> Self {
        Self {
            sq_entries: defaults::SQ_ENTRIES,
            cq_entries: None,
            eager_flush: defaults::EAGER_FLUSH,
            drain_timeout: Duration::from_millis(defaults::DRAIN_TIMEOUT_MS),
        }
    }

    pub fn sq_entries(mut self, n: u32) -> Self {
        self.sq_entries = n;
        self
    }

    pub fn cq_entries(mut self, n: u32) -> Self {
        self.cq_entries = Some(n);
        self
    }

    pub fn eager_flush(mut self, enable: bool) -> Self {
        self.eager_flush = enable;
        self
    }

    pub fn drain_timeout(mut self, d: Duration) -> Self {
        self.drain_timeout = d;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sq_entries == 0 || !self.sq_entries.is_power_of_two() {
            return Err(ConfigError::InvalidValue("sq_entries must be a power of 2"));
        }
        if self.sq_entries > defaults::MAX_SQ_ENTRIES {
            return Err(ConfigError::InvalidValue("sq_entries must be <= 32768"));
        }
        if let Some(cq) = self.cq_entries {
            if cq < self.sq_entries {
                return Err(ConfigError::InvalidValue("cq_entries must be >= sq_entries"));
            }
        }
        Ok(())
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        crate::kprintln!("cport configuration:");
        crate::kprintln!("  sq_entries:     {}", self.sq_entries);
        crate::kprintln!("  cq_entries:     {:?}", self.cq_entries);
        crate::kprintln!("  eager_flush:    {}", self.eager_flush);
        crate::kprintln!("  drain_timeout:  {:?}", self.drain_timeout);
    }
}

#[derive(Debug, Clone)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = EngineConfig::new();
        assert_eq!(config.sq_entries, defaults::SQ_ENTRIES);
        assert!(config.eager_flush);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder() {
        let config = EngineConfig::new()
            .sq_entries(64)
            .cq_entries(256)
            .eager_flush(false)
            .drain_timeout(Duration::from_millis(5));

        assert_eq!(config.sq_entries, 64);
        assert_eq!(config.cq_entries, Some(256));
        assert!(!config.eager_flush);
        assert_eq!(config.drain_timeout, Duration::from_millis(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation() {
        assert!(EngineConfig::new().sq_entries(0).validate().is_err());
        assert!(EngineConfig::new().sq_entries(100).validate().is_err());
        assert!(EngineConfig::new().sq_entries(65536).validate().is_err());
        assert!(EngineConfig::new().sq_entries(64).cq_entries(32).validate().is_err());
    }

    #[test]
    fn env_override() {
        std::env::set_var("CPORT_DRAIN_TIMEOUT_MS", "42");
        let config = EngineConfig::from_env();
        assert_eq!(config.drain_timeout, Duration::from_millis(42));
        std::env::remove_var("CPORT_DRAIN_TIMEOUT_MS");
    }
}
