//! Configuration
//!
//! Every component has a plain config struct with defaults and `with_*`
//! builders. [`FleetConfig`] gathers them and can be loaded from `PYFLEET_*`
//! environment variables. Durations are given in milliseconds.
//!
//! | Variable | Field |
//! |---|---|
//! | `PYFLEET_POOL_NAME` | `pool.name` |
//! | `PYFLEET_POOL_SIZE` | `pool.size` |
//! | `PYFLEET_MAX_OVERFLOW` | `pool.max_overflow` |
//! | `PYFLEET_EAGER_START` | `pool.eager_start` |
//! | `PYFLEET_CHECKOUT_TIMEOUT_MS` | `pool.checkout_timeout` |
//! | `PYFLEET_OPERATION_TIMEOUT_MS` | `pool.operation_timeout` |
//! | `PYFLEET_MAX_CONSECUTIVE_FAILURES` | `pool.max_consecutive_failures` |
//! | `PYFLEET_SHUTDOWN_GRACE_MS` | `pool.shutdown_grace` |
//! | `PYFLEET_HEALTH_CHECK_INTERVAL_MS` | `pool.health_check_interval` |
//! | `PYFLEET_HEALTH_CHECK_TIMEOUT_MS` | `pool.health_check_timeout` |
//! | `PYFLEET_SESSION_TTL_MS` | `pool.session_ttl` |
//! | `PYFLEET_AFFINITY_SWEEP_INTERVAL_MS` | `pool.affinity_sweep_interval` |
//! | `PYFLEET_PYTHON` | `python.python` |
//! | `PYFLEET_SCRIPT` | `python.script` |
//! | `PYFLEET_STARTUP_TIMEOUT_MS` | `python.startup_timeout` |
//! | `PYFLEET_CIRCUIT_FAILURE_THRESHOLD` | `circuit.failure_threshold` |
//! | `PYFLEET_CIRCUIT_SUCCESS_THRESHOLD` | `circuit.success_threshold` |
//! | `PYFLEET_CIRCUIT_TIMEOUT_MS` | `circuit.timeout` |
//! | `PYFLEET_CIRCUIT_HALF_OPEN_LIMIT` | `circuit.half_open_request_limit` |
//! | `PYFLEET_RETRY_MAX_ATTEMPTS` | `retry.max_attempts` |
//! | `PYFLEET_RETRY_STRATEGY` | `retry.backoff` |
//! | `PYFLEET_RETRY_BASE_DELAY_MS` | `retry.base_delay` |
//! | `PYFLEET_RETRY_MAX_DELAY_MS` | `retry.max_delay` |
//! | `PYFLEET_RETRY_JITTER` | `retry.jitter` |
//! | `PYFLEET_HEALTH_FAILURE_THRESHOLD` | `recovery.health_failure_threshold` |
//! | `PYFLEET_DEGRADE_DELAY_MS` | `recovery.degrade_delay` |
//! | `PYFLEET_TIMEOUT_RETRY_DELAY_MS` | `recovery.timeout_retry_delay` |
//! | `PYFLEET_REPLACE_REMOVED_WORKERS` | `recovery.replace_removed_workers` |

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::pool::PoolConfig;
use crate::python::PythonWorkerConfig;
use crate::recovery::RecoveryConfig;
use crate::retry::{BackoffStrategy, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Parse {
        var: String,
        value: String,
        reason: String,
    },

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Complete configuration for a pool and its call sites
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetConfig {
    pub pool: PoolConfig,
    pub python: PythonWorkerConfig,
    pub circuit: CircuitBreakerConfig,
    pub retry: RetryPolicy,
    pub recovery: RecoveryConfig,
}

/// Typed reads over a variable lookup
struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T>(&self, var: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        let Some(raw) = (self.lookup)(var) else {
            return Ok(None);
        };
        raw.trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Parse {
                var: var.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            })
    }

    fn set<T>(&self, var: &str, target: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        if let Some(value) = self.parse(var)? {
            *target = value;
        }
        Ok(())
    }

    fn set_millis(&self, var: &str, target: &mut Duration) -> Result<(), ConfigError> {
        if let Some(ms) = self.parse::<u64>(var)? {
            *target = Duration::from_millis(ms);
        }
        Ok(())
    }

    fn set_bool(&self, var: &str, target: &mut bool) -> Result<(), ConfigError> {
        let Some(raw) = (self.lookup)(var) else {
            return Ok(());
        };
        *target = match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                return Err(ConfigError::Parse {
                    var: var.to_string(),
                    value: raw,
                    reason: "expected true or false".to_string(),
                })
            }
        };
        Ok(())
    }

    fn set_string(&self, var: &str, target: &mut String) {
        if let Some(value) = (self.lookup)(var).filter(|v| !v.is_empty()) {
            *target = value;
        }
    }
}

impl FleetConfig {
    /// Defaults overridden by `PYFLEET_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`FleetConfig::from_env`] with an explicit variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = EnvReader { lookup };
        let mut config = Self::default();

        let pool = &mut config.pool;
        env.set_string("PYFLEET_POOL_NAME", &mut pool.name);
        env.set("PYFLEET_POOL_SIZE", &mut pool.size)?;
        env.set("PYFLEET_MAX_OVERFLOW", &mut pool.max_overflow)?;
        env.set_bool("PYFLEET_EAGER_START", &mut pool.eager_start)?;
        env.set_millis("PYFLEET_CHECKOUT_TIMEOUT_MS", &mut pool.checkout_timeout)?;
        env.set_millis("PYFLEET_OPERATION_TIMEOUT_MS", &mut pool.operation_timeout)?;
        env.set("PYFLEET_MAX_CONSECUTIVE_FAILURES", &mut pool.max_consecutive_failures)?;
        env.set_millis("PYFLEET_SHUTDOWN_GRACE_MS", &mut pool.shutdown_grace)?;
        env.set_millis("PYFLEET_HEALTH_CHECK_INTERVAL_MS", &mut pool.health_check_interval)?;
        env.set_millis("PYFLEET_HEALTH_CHECK_TIMEOUT_MS", &mut pool.health_check_timeout)?;
        env.set_millis("PYFLEET_SESSION_TTL_MS", &mut pool.session_ttl)?;
        env.set_millis("PYFLEET_AFFINITY_SWEEP_INTERVAL_MS", &mut pool.affinity_sweep_interval)?;

        let python = &mut config.python;
        env.set_string("PYFLEET_PYTHON", &mut python.python);
        if let Some(script) = env.parse::<PathBuf>("PYFLEET_SCRIPT")? {
            python.script = script;
        }
        env.set_millis("PYFLEET_STARTUP_TIMEOUT_MS", &mut python.startup_timeout)?;

        let circuit = &mut config.circuit;
        env.set("PYFLEET_CIRCUIT_FAILURE_THRESHOLD", &mut circuit.failure_threshold)?;
        env.set("PYFLEET_CIRCUIT_SUCCESS_THRESHOLD", &mut circuit.success_threshold)?;
        env.set_millis("PYFLEET_CIRCUIT_TIMEOUT_MS", &mut circuit.timeout)?;
        env.set("PYFLEET_CIRCUIT_HALF_OPEN_LIMIT", &mut circuit.half_open_request_limit)?;

        let retry = &mut config.retry;
        env.set("PYFLEET_RETRY_MAX_ATTEMPTS", &mut retry.max_attempts)?;
        env.set::<BackoffStrategy>("PYFLEET_RETRY_STRATEGY", &mut retry.backoff)?;
        env.set_millis("PYFLEET_RETRY_BASE_DELAY_MS", &mut retry.base_delay)?;
        env.set_millis("PYFLEET_RETRY_MAX_DELAY_MS", &mut retry.max_delay)?;
        env.set_bool("PYFLEET_RETRY_JITTER", &mut retry.jitter)?;

        let recovery = &mut config.recovery;
        env.set("PYFLEET_HEALTH_FAILURE_THRESHOLD", &mut recovery.health_failure_threshold)?;
        env.set_millis("PYFLEET_DEGRADE_DELAY_MS", &mut recovery.degrade_delay)?;
        env.set_millis("PYFLEET_TIMEOUT_RETRY_DELAY_MS", &mut recovery.timeout_retry_delay)?;
        env.set_bool("PYFLEET_REPLACE_REMOVED_WORKERS", &mut recovery.replace_removed_workers)?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;

        if self.python.python.is_empty() {
            return Err(ConfigError::invalid("python", "interpreter must not be empty"));
        }
        if self.python.startup_timeout.is_zero() {
            return Err(ConfigError::invalid("startup_timeout", "must be positive"));
        }
        if self.circuit.failure_threshold == 0 || self.circuit.success_threshold == 0 {
            return Err(ConfigError::invalid("circuit", "thresholds must be at least 1"));
        }
        if self.circuit.half_open_request_limit == 0 {
            return Err(ConfigError::invalid(
                "half_open_request_limit",
                "must be at least 1",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(ConfigError::invalid(
                "retry",
                "base_delay must not exceed max_delay",
            ));
        }
        if self.recovery.health_failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "health_failure_threshold",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<FleetConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        FleetConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_without_env() {
        let config = load(&[]).unwrap();
        assert_eq!(config, FleetConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("PYFLEET_POOL_SIZE", "4"),
            ("PYFLEET_MAX_OVERFLOW", "2"),
            ("PYFLEET_EAGER_START", "false"),
            ("PYFLEET_CHECKOUT_TIMEOUT_MS", "250"),
            ("PYFLEET_SCRIPT", "/opt/bridge.py"),
            ("PYFLEET_RETRY_STRATEGY", "fibonacci"),
            ("PYFLEET_CIRCUIT_TIMEOUT_MS", "1500"),
            ("PYFLEET_REPLACE_REMOVED_WORKERS", "yes"),
        ])
        .unwrap();

        assert_eq!(config.pool.size, 4);
        assert_eq!(config.pool.max_overflow, 2);
        assert!(!config.pool.eager_start);
        assert_eq!(config.pool.checkout_timeout, Duration::from_millis(250));
        assert_eq!(config.python.script, PathBuf::from("/opt/bridge.py"));
        assert_eq!(config.retry.backoff, BackoffStrategy::Fibonacci);
        assert_eq!(config.circuit.timeout, Duration::from_millis(1500));
        assert!(config.recovery.replace_removed_workers);
    }

    #[test]
    fn test_malformed_value_names_variable() {
        let error = load(&[("PYFLEET_POOL_SIZE", "many")]).unwrap_err();
        assert!(matches!(&error, ConfigError::Parse { var, .. } if var == "PYFLEET_POOL_SIZE"));

        let error = load(&[("PYFLEET_EAGER_START", "maybe")]).unwrap_err();
        assert!(error.to_string().contains("PYFLEET_EAGER_START"));

        assert!(load(&[("PYFLEET_RETRY_STRATEGY", "quadratic")]).is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = FleetConfig::default();
        config.retry.base_delay = Duration::from_secs(60);
        assert!(config.validate().is_err());

        let mut config = FleetConfig::default();
        config.circuit.failure_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = FleetConfig::default();
        config.pool.size = 0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::invalid("size", "pool must allow at least one worker"))
        );
    }
}
