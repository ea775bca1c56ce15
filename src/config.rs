//! Queue tuning knobs with environment overrides.

use std::time::Duration;

use thiserror::Error;

pub const ENV_BACKLOG_CAPACITY: &str = "SHERATAN_BACKLOG_CAPACITY";
pub const ENV_STALL_TIMEOUT_MS: &str = "SHERATAN_STALL_TIMEOUT_MS";
pub const ENV_POLL_MS: &str = "SHERATAN_POLL_MS";

const DEFAULT_BACKLOG_CAPACITY: usize = 1024;
const DEFAULT_STALL_TIMEOUT_MS: u64 = 5_000;
// Consumers without work back off this long between polls.
const DEFAULT_POLL_MS: u64 = 100;

/// Errors produced while loading a [`QueueConfig`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: expected a positive integer, got {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Runtime configuration for a [`CommandQueue`](crate::queue::CommandQueue).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum number of queued (not yet taken) commands.
    pub backlog_capacity: usize,
    /// Silence after which a held claim is reported as stalled.
    pub stall_timeout: Duration,
    /// Backoff used by polling consumers when `take` reports an empty backlog.
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backlog_capacity: DEFAULT_BACKLOG_CAPACITY,
            stall_timeout: Duration::from_millis(DEFAULT_STALL_TIMEOUT_MS),
            poll_interval: Duration::from_millis(DEFAULT_POLL_MS),
        }
    }
}

impl QueueConfig {
    /// Defaults overridden by any `SHERATAN_*` variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(capacity) = parse_positive(&lookup, ENV_BACKLOG_CAPACITY)? {
            config.backlog_capacity = capacity as usize;
        }
        if let Some(ms) = parse_positive(&lookup, ENV_STALL_TIMEOUT_MS)? {
            config.stall_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_positive(&lookup, ENV_POLL_MS)? {
            config.poll_interval = Duration::from_millis(ms);
        }
        Ok(config)
    }
}

fn parse_positive<F>(lookup: &F, key: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    match raw.trim().parse::<u64>() {
        Ok(value) if value > 0 => Ok(Some(value)),
        _ => Err(ConfigError::Invalid { key, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = QueueConfig::from_lookup(|_| None).expect("config");
        assert_eq!(config, QueueConfig::default());
        assert_eq!(config.backlog_capacity, 1024);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn overrides_are_applied() {
        let config = QueueConfig::from_lookup(lookup_from(&[
            (ENV_BACKLOG_CAPACITY, "8"),
            (ENV_STALL_TIMEOUT_MS, " 250 "),
            (ENV_POLL_MS, "5"),
        ]))
        .expect("config");
        assert_eq!(config.backlog_capacity, 8);
        assert_eq!(config.stall_timeout, Duration::from_millis(250));
        assert_eq!(config.poll_interval, Duration::from_millis(5));
    }

    #[test]
    fn zero_and_garbage_are_rejected() {
        let err = QueueConfig::from_lookup(lookup_from(&[(ENV_BACKLOG_CAPACITY, "0")]))
            .expect_err("zero capacity");
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: ENV_BACKLOG_CAPACITY,
                value: "0".to_string(),
            }
        );
        assert!(QueueConfig::from_lookup(lookup_from(&[(ENV_POLL_MS, "fast")])).is_err());
    }
}
