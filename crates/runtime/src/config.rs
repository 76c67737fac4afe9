//! Configuration management for the Boogie runtime
//!
//! Configuration comes from defaults, an optional TOML file and `BOOGIE_*`
//! environment variables, applied in that order.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::logging::{LogFormat, LoggingConfig, VALID_LEVELS};
use crate::scheduler::{CircuitBreakerConfig, SchedulerConfig};
use crate::types::ConfigError;
use crate::vm::VmConfig;

/// Main runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub vm: VmConfig,
    pub scheduler: SchedulerConfig,
    /// Defaults for per-target breakers created by SEND
    pub circuit_breaker: CircuitBreakerConfig,
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    /// Load configuration from environment variables and defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            message: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        Ok(config)
    }

    /// File (if any), then environment overrides, then validation
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `BOOGIE_*` environment variables
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(level) = env::var("BOOGIE_LOG_LEVEL") {
            self.logging.level = level.to_ascii_lowercase();
        }

        if let Ok(format) = env::var("BOOGIE_LOG_FORMAT") {
            self.logging.format = format.parse::<LogFormat>()?;
        }

        if let Ok(workers) = env::var("BOOGIE_MAX_WORKERS") {
            self.scheduler.max_workers = workers.parse().map_err(|_| ConfigError::InvalidValue {
                key: "BOOGIE_MAX_WORKERS".to_string(),
                reason: "Must be a positive integer".to_string(),
            })?;
        }

        if let Ok(timeout) = env::var("BOOGIE_SCHEDULING_TIMEOUT") {
            self.scheduler.scheduling_timeout = parse_duration("BOOGIE_SCHEDULING_TIMEOUT", &timeout)?;
        }

        if let Ok(steps) = env::var("BOOGIE_MAX_STEPS") {
            self.vm.max_steps = steps.parse().map_err(|_| ConfigError::InvalidValue {
                key: "BOOGIE_MAX_STEPS".to_string(),
                reason: "Must be a positive integer".to_string(),
            })?;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !VALID_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "logging.level".to_string(),
                reason: format!("Must be one of: {}", VALID_LEVELS.join(", ")),
            });
        }

        if self.scheduler.max_workers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "scheduler.max_workers".to_string(),
                reason: "At least one worker is required".to_string(),
            });
        }

        if self.scheduler.scheduling_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "scheduler.scheduling_timeout".to_string(),
                reason: "Timeout must be > 0".to_string(),
            });
        }

        if self.vm.max_steps == 0 {
            return Err(ConfigError::InvalidValue {
                key: "vm.max_steps".to_string(),
                reason: "Step budget must be > 0".to_string(),
            });
        }

        if self.vm.operation_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "vm.operation_timeout".to_string(),
                reason: "Timeout must be > 0".to_string(),
            });
        }

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                key: "circuit_breaker.failure_threshold".to_string(),
                reason: "Failure threshold must be > 0".to_string(),
            });
        }

        Ok(())
    }
}

fn parse_duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const ENV_KEYS: [&str; 5] = [
        "BOOGIE_LOG_LEVEL",
        "BOOGIE_LOG_FORMAT",
        "BOOGIE_MAX_WORKERS",
        "BOOGIE_SCHEDULING_TIMEOUT",
        "BOOGIE_MAX_STEPS",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.scheduler.max_workers, 8);
        assert_eq!(config.scheduler.scheduling_timeout, Duration::from_secs(30));
        assert_eq!(config.vm.max_steps, 10_000);
        assert_eq!(config.vm.operation_timeout, Duration::from_secs(300));
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        clear_env();
        env::set_var("BOOGIE_LOG_LEVEL", "DEBUG");
        env::set_var("BOOGIE_LOG_FORMAT", "json");
        env::set_var("BOOGIE_MAX_WORKERS", "2");
        env::set_var("BOOGIE_SCHEDULING_TIMEOUT", "1m 30s");
        env::set_var("BOOGIE_MAX_STEPS", "500");

        let config = RuntimeConfig::from_env().unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.scheduler.max_workers, 2);
        assert_eq!(config.scheduler.scheduling_timeout, Duration::from_secs(90));
        assert_eq!(config.vm.max_steps, 500);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_config_from_env_invalid_values() {
        clear_env();
        env::set_var("BOOGIE_MAX_WORKERS", "many");
        assert!(matches!(
            RuntimeConfig::from_env(),
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "BOOGIE_MAX_WORKERS"
        ));

        clear_env();
        env::set_var("BOOGIE_SCHEDULING_TIMEOUT", "soon");
        assert!(RuntimeConfig::from_env().is_err());

        clear_env();
    }

    #[test]
    #[serial]
    fn test_load_file_then_env() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[vm]
max_steps = 64
operation_timeout = "10s"

[scheduler]
max_workers = 4

[circuit_breaker]
failure_threshold = 5
cooldown = "2m"

[logging]
level = "warn"
format = "compact"
"#
        )
        .unwrap();

        env::set_var("BOOGIE_MAX_WORKERS", "6");
        let config = RuntimeConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.vm.max_steps, 64);
        assert_eq!(config.vm.operation_timeout, Duration::from_secs(10));
        assert_eq!(config.scheduler.max_workers, 6);
        assert_eq!(config.scheduler.scheduling_timeout, Duration::from_secs(30));
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.cooldown, Duration::from_secs(120));
        assert_eq!(config.logging.format, LogFormat::Compact);
        clear_env();
    }

    #[test]
    fn test_from_file_errors() {
        assert!(matches!(
            RuntimeConfig::from_file("/nonexistent/boogie.toml"),
            Err(ConfigError::IoError { .. })
        ));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[vm]\nmax_steps = \"lots\"").unwrap();
        assert!(matches!(
            RuntimeConfig::from_file(file.path()),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = RuntimeConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.scheduler.max_workers = 0;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.vm.max_steps = 0;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());
    }
}
