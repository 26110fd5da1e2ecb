use crate::address::{AddressError, GitalyAddress};
use crate::circuit_breaker::CircuitOptions;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),

    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(#[from] ValidationError),

    #[error("storage not found: {0:?}")]
    UnknownStorage(String),

    #[error("storage {storage:?} has an invalid gitaly_address: {source}")]
    InvalidAddress {
        storage: String,
        source: AddressError,
    },

    #[error("unknown service: {0}")]
    UnknownService(String),
}

#[derive(Error, Debug, PartialEq)]
pub enum ValidationError {
    #[error("At least one storage must be configured")]
    NoStorages,

    #[error("Storage {0:?} is missing a gitaly_address")]
    MissingAddress(String),

    #[error("Storage {storage:?} has an invalid address: {reason}")]
    InvalidAddress { storage: String, reason: String },

    #[error("Circuit breaker {0} must be greater than 0")]
    ZeroThreshold(&'static str),

    #[error("Circuit breaker error percentage must be at most 100, got {0}")]
    InvalidPercentage(u32),

    #[error("Request limit max_calls must be greater than 0")]
    ZeroMaxCalls,
}

/// Client configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Storage shard name to connection settings
    pub storages: HashMap<String, StorageConfig>,
    /// Token used for storages that do not set their own
    #[serde(default)]
    pub gitaly_token: Option<String>,
    /// Reported to the server in the `client_name` header
    #[serde(default = "default_client_name")]
    pub client_name: String,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub request_limits: RequestLimits,
    /// Static feature flag values. Flags prefixed with `gitaly_` are forwarded to the server.
    #[serde(default)]
    pub feature_flags: HashMap<String, bool>,
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

fn default_client_name() -> String {
    "gitlab-web".into()
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)?;

        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Validates the client configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.storages.is_empty() {
            return Err(ValidationError::NoStorages);
        }

        for (name, storage) in &self.storages {
            if storage.gitaly_address.trim().is_empty() {
                return Err(ValidationError::MissingAddress(name.clone()));
            }

            if let Err(e) = storage.gitaly_address.parse::<GitalyAddress>() {
                return Err(ValidationError::InvalidAddress {
                    storage: name.clone(),
                    reason: e.to_string(),
                });
            }
        }

        self.circuit_breaker.validate()?;
        self.request_limits.validate()?;

        Ok(())
    }
}

/// Connection settings for one storage shard
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct StorageConfig {
    /// One of `tcp://`, `tls://`, `unix:` or `dns:` addresses
    pub gitaly_address: String,
    #[serde(default)]
    pub gitaly_token: Option<String>,
}

/// Named call timeouts, in seconds. Zero means no deadline.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct Timeouts {
    pub default_secs: u64,
    pub medium_secs: u64,
    pub fast_secs: u64,
    pub long_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            default_secs: 55,
            medium_secs: 30,
            fast_secs: 10,
            long_secs: 6 * 60 * 60,
        }
    }
}

impl Timeouts {
    pub fn default_timeout(&self) -> Option<Duration> {
        from_secs(self.default_secs)
    }

    pub fn medium_timeout(&self) -> Option<Duration> {
        from_secs(self.medium_secs)
    }

    pub fn fast_timeout(&self) -> Option<Duration> {
        from_secs(self.fast_secs)
    }

    pub fn long_timeout(&self) -> Option<Duration> {
        from_secs(self.long_secs)
    }
}

fn from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Minimum number of samples in the time window before the error rate is evaluated
    pub volume_threshold: u32,
    pub error_threshold_percentage: u32,
    pub sleep_window_secs: u64,
    pub time_window_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            enabled: true,
            volume_threshold: 20,
            error_threshold_percentage: 50,
            sleep_window_secs: 90,
            time_window_secs: 60,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.volume_threshold == 0 {
            return Err(ValidationError::ZeroThreshold("volume_threshold"));
        }
        if self.error_threshold_percentage == 0 {
            return Err(ValidationError::ZeroThreshold("error_threshold_percentage"));
        }
        if self.error_threshold_percentage > 100 {
            return Err(ValidationError::InvalidPercentage(
                self.error_threshold_percentage,
            ));
        }
        if self.sleep_window_secs == 0 {
            return Err(ValidationError::ZeroThreshold("sleep_window_secs"));
        }
        if self.time_window_secs == 0 {
            return Err(ValidationError::ZeroThreshold("time_window_secs"));
        }
        Ok(())
    }

    pub fn options(&self) -> CircuitOptions {
        CircuitOptions {
            volume_threshold: self.volume_threshold,
            error_threshold_percentage: self.error_threshold_percentage,
            sleep_window: Duration::from_secs(self.sleep_window_secs),
            time_window: Duration::from_secs(self.time_window_secs),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RequestLimits {
    pub enforce: bool,
    pub max_calls: u64,
}

impl Default for RequestLimits {
    fn default() -> Self {
        RequestLimits {
            enforce: true,
            max_calls: crate::limits::MAXIMUM_GITALY_CALLS,
        }
    }
}

impl RequestLimits {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_calls == 0 {
            return Err(ValidationError::ZeroMaxCalls);
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
    #[serde(default = "default_metrics_prefix")]
    pub prefix: String,
}

fn default_metrics_prefix() -> String {
    "gitaly_client".into()
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LoggingConfig {
    pub sentry_dsn: Option<String>,
}
