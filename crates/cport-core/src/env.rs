//! Environment lookups used by [`EngineConfig::from_env`](crate::config::EngineConfig::from_env)
//! and the log setup.
//!
//! Unset or unparsable values fall back to the caller's default; a typo in
//! `CPORT_*` never aborts engine construction.

use std::str::FromStr;

/// Parse `key` as `T`, or return `default`.
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    env_get_opt(key).unwrap_or(default)
}

/// `Some(T)` when `key` is set and parses.
#[inline]
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean flag.
///
/// "1", "true", "yes", "on" are true; "0", "false", "no", "off" are false
/// (case-insensitive). Anything else, including unset, yields `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => parse_flag(&val).unwrap_or(default),
        Err(_) => default,
    }
}

/// Raw string value, or `default`.
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

pub(crate) fn parse_flag(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_returns_default() {
        let n: u32 = env_get("__CPORT_TEST_UNSET__", 7);
        assert_eq!(n, 7);
        assert!(env_get_opt::<u32>("__CPORT_TEST_UNSET__").is_none());
        assert!(env_get_bool("__CPORT_TEST_UNSET__", true));
        assert_eq!(env_get_str("__CPORT_TEST_UNSET__", "x"), "x");
    }

    #[test]
    fn parses_numbers() {
        std::env::set_var("__CPORT_TEST_NUM__", " 512 ");
        let n: u32 = env_get("__CPORT_TEST_NUM__", 0);
        assert_eq!(n, 512);
        std::env::set_var("__CPORT_TEST_NUM__", "lots");
        let n: u32 = env_get("__CPORT_TEST_NUM__", 3);
        assert_eq!(n, 3);
        std::env::remove_var("__CPORT_TEST_NUM__");
    }

    #[test]
    fn flags() {
        assert_eq!(parse_flag("YES"), Some(true));
        assert_eq!(parse_flag("1"), Some(true));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("maybe"), None);

        std::env::set_var("__CPORT_TEST_FLAG__", "garbage");
        assert!(env_get_bool("__CPORT_TEST_FLAG__", true));
        assert!(!env_get_bool("__CPORT_TEST_FLAG__", false));
        std::env::remove_var("__CPORT_TEST_FLAG__");
    }
}
