//! Configuration for the join coordinator.
//!
//! Defaults carry the reference behavior: fair lock between 08:00 and 20:00
//! with a 3s wait and 20s lease, optimistic retries (3 attempts, 50ms apart)
//! otherwise.

use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

pub use crate::coordination::breaker::CircuitBreakerConfig;
pub use crate::coordination::strategy::{CoordinationMode, TrafficWindow};

/// Top-level configuration for [`JoinCoordinator`](crate::JoinCoordinator).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinConfig {
    /// Time-of-day window during which joins take the fair lock.
    pub window: TrafficWindow,
    /// Pins the coordination mode regardless of the clock when set.
    pub forced_mode: Option<CoordinationMode>,
    /// Fair lock timings for the pessimistic path.
    pub lock: LockConfig,
    /// Retry policy for the optimistic path.
    pub retry: RetryConfig,
    /// Circuit breaker wrapping every join.
    pub breaker: CircuitBreakerConfig,
    /// Maximum number of joins in flight before the service layer sheds load.
    pub max_concurrent_joins: u32,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            window: TrafficWindow::default(),
            forced_mode: None,
            lock: LockConfig::default(),
            retry: RetryConfig::default(),
            breaker: CircuitBreakerConfig::default(),
            max_concurrent_joins: 1000,
        }
    }
}

impl JoinConfig {
    /// Parses a configuration from JSON. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if `json` is not a valid configuration document or
    /// the breaker settings are out of range.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.breaker.validate().context("invalid breaker settings")?;
        Ok(config)
    }
}

/// Fair lock timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// How long a join waits to acquire the party lock, in milliseconds.
    pub wait_timeout_ms: u64,
    /// Lease after which the lock provider frees the lock on its own, in
    /// milliseconds. Must exceed the worst-case duration of one join.
    pub lease_timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 3_000,
            lease_timeout_ms: 20_000,
        }
    }
}

impl LockConfig {
    #[must_use]
    pub const fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    #[must_use]
    pub const fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }
}

/// Optimistic retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    /// Fixed delay between attempts after a version conflict, in milliseconds.
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 50,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub const fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveTime;

    use super::*;

    #[test]
    fn join_config_defaults() {
        let config = JoinConfig::default();
        assert!(config.forced_mode.is_none());
        assert_eq!(config.lock.wait_timeout(), Duration::from_secs(3));
        assert_eq!(config.lock.lease_timeout(), Duration::from_secs(20));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.delay(), Duration::from_millis(50));
        assert_eq!(config.max_concurrent_joins, 1000);
        assert_eq!(config.window.start, NaiveTime::from_hms_opt(8, 0, 0).unwrap());
        assert_eq!(config.window.end, NaiveTime::from_hms_opt(20, 0, 0).unwrap());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = JoinConfig::from_json(
            r#"{ "retry": { "max_attempts": 5 }, "forced_mode": "optimistic" }"#,
        )
        .unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.delay_ms, 50);
        assert_eq!(config.forced_mode, Some(CoordinationMode::Optimistic));
        assert_eq!(config.lock.wait_timeout_ms, 3_000);
    }

    #[test]
    fn window_parses_from_clock_strings() {
        let config =
            JoinConfig::from_json(r#"{ "window": { "start": "22:00:00", "end": "02:00:00" } }"#)
                .unwrap();
        assert_eq!(config.window.start, NaiveTime::from_hms_opt(22, 0, 0).unwrap());
        assert_eq!(config.window.end, NaiveTime::from_hms_opt(2, 0, 0).unwrap());
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(JoinConfig::from_json("{ not json").is_err());
    }

    #[test]
    fn out_of_range_breaker_threshold_is_rejected() {
        for threshold in ["0.0", "150"] {
            let json = format!(r#"{{ "breaker": {{ "failure_rate_threshold": {threshold} }} }}"#);
            let err = JoinConfig::from_json(&json).unwrap_err();
            assert!(format!("{err:#}").contains("failure_rate_threshold"), "{err:#}");
        }
        let config = JoinConfig::from_json(r#"{ "breaker": { "failure_rate_threshold": 100 } }"#)
            .unwrap();
        assert!((config.breaker.failure_rate_threshold - 100.0).abs() < f64::EPSILON);
    }
}
