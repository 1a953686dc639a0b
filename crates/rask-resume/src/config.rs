// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime configuration.
//!
//! Defaults are tuned for a worker that talks to a handful of backends.
//! Environment variables override them:
//!
//! | Variable | Type | Field |
//! |----------|------|-------|
//! | `RASK_RT_MAX_EVENTS` | `usize` | `max_events` |
//! | `RASK_RT_POLL_TIMEOUT_MS` | `u64`, or `none` to block | `poll_timeout` |
//! | `RASK_RT_MAX_CONNECTIONS` | `usize` | `max_connections` |
//! | `RASK_RT_READ_CHUNK` | `usize` | `read_chunk` |

use std::time::Duration;

use crate::error::ConfigError;

pub const ENV_MAX_EVENTS: &str = "RASK_RT_MAX_EVENTS";
pub const ENV_POLL_TIMEOUT_MS: &str = "RASK_RT_POLL_TIMEOUT_MS";
pub const ENV_MAX_CONNECTIONS: &str = "RASK_RT_MAX_CONNECTIONS";
pub const ENV_READ_CHUNK: &str = "RASK_RT_READ_CHUNK";

/// Read buffer growth step for the stock responses.
pub const DEFAULT_READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Readiness events drained per poll.
    pub max_events: usize,
    /// How long one loop turn may block waiting for readiness.
    pub poll_timeout: Option<Duration>,
    /// Upper bound on registered connections.
    pub max_connections: usize,
    /// Read buffer growth step.
    pub read_chunk: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_events: 64,
            poll_timeout: Some(Duration::from_millis(10)),
            max_connections: 1024,
            read_chunk: DEFAULT_READ_CHUNK,
        }
    }
}

impl RuntimeConfig {
    /// Defaults with `RASK_RT_*` environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults with overrides from `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(val) = lookup(ENV_MAX_EVENTS) {
            config.max_events = parse_usize(ENV_MAX_EVENTS, &val)?;
        }
        if let Some(val) = lookup(ENV_POLL_TIMEOUT_MS) {
            config.poll_timeout = if val.trim().eq_ignore_ascii_case("none") {
                None
            } else {
                Some(Duration::from_millis(parse_u64(ENV_POLL_TIMEOUT_MS, &val)?))
            };
        }
        if let Some(val) = lookup(ENV_MAX_CONNECTIONS) {
            config.max_connections = parse_usize(ENV_MAX_CONNECTIONS, &val)?;
        }
        if let Some(val) = lookup(ENV_READ_CHUNK) {
            config.read_chunk = parse_usize(ENV_READ_CHUNK, &val)?.max(1);
        }
        Ok(config)
    }
}

fn parse_usize(var: &'static str, val: &str) -> Result<usize, ConfigError> {
    val.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: val.to_string(),
        expected: "an unsigned integer",
    })
}

fn parse_u64(var: &'static str, val: &str) -> Result<u64, ConfigError> {
    val.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: val.to_string(),
        expected: "milliseconds or `none`",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn no_overrides_gives_defaults() {
        let config = RuntimeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, RuntimeConfig::default());
    }

    #[test]
    fn overrides_apply() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (ENV_MAX_EVENTS, "128"),
            (ENV_POLL_TIMEOUT_MS, " 250 "),
            (ENV_MAX_CONNECTIONS, "8"),
            (ENV_READ_CHUNK, "0"),
        ]))
        .unwrap();
        assert_eq!(config.max_events, 128);
        assert_eq!(config.poll_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.read_chunk, 1);
    }

    #[test]
    fn poll_timeout_none_blocks() {
        let config = RuntimeConfig::from_lookup(lookup(&[(ENV_POLL_TIMEOUT_MS, "None")])).unwrap();
        assert_eq!(config.poll_timeout, None);
    }

    #[test]
    fn bad_value_names_variable() {
        let err = RuntimeConfig::from_lookup(lookup(&[(ENV_MAX_CONNECTIONS, "lots")])).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains(ENV_MAX_CONNECTIONS), "{msg}");
        assert!(msg.contains("lots"), "{msg}");
    }
}
