//! Environment variable parsing for the `CONN_*` configuration surface.
//!
//! Unparseable values fall back to the default with a warning rather than
//! aborting, so a half-configured guest still comes up.

use std::{env, fmt::Display, str::FromStr};

use tracing::warn;

pub fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
{
    let Ok(raw) = env::var(key) else {
        return default;
    };
    match raw.parse() {
        Ok(v) => v,
        Err(_) => {
            warn!(key, %raw, "unparseable env value, using default {default}");
            default
        }
    }
}

/// Truthy values are `1`, `true`, `yes` (case-insensitive); everything else
/// set is false. Unset falls through to `default`.
pub fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

/// Two-level lookup: the global key wins over the per-backend key, which wins
/// over the static default.
pub fn env_layered<T>(global: &str, scoped: &str, default: T) -> T
where
    T: FromStr + Display,
{
    env_or(global, env_or(scoped, default))
}

pub fn env_layered_flag(global: &str, scoped: &str, default: bool) -> bool {
    match env::var(global) {
        Ok(raw) => matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => env_flag(scoped, default),
    }
}
