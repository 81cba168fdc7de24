//! Configuration loading.
//!
//! Settings come from a TOML file with `FAILOVER__<SECTION>__<KEY>`
//! environment overrides, for example
//! `FAILOVER__CIRCUIT_BREAKER__FAILURE_THRESHOLD=5`. Every section is
//! optional and falls back to its defaults.

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::bulk::BulkOptions;
use crate::dispatch::RetryStrategy;
use crate::health::CircuitBreakerConfig;
use crate::notification::NotificationSettings;
use crate::provider::Provider;

const ENV_PREFIX: &str = "FAILOVER";
const MIN_TIMEOUT_MS: u64 = 1_000;
const MAX_TIMEOUT_MS: u64 = 120_000;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// The configuration file path is invalid.
    #[error("invalid configuration path: {0}")]
    InvalidPath(String),

    /// The configuration could not be parsed.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] config::ConfigError),

    /// The configuration could not be written back out as TOML.
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Which providers to use and in what order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderPreferences {
    /// Priority order; the first entry is the default provider.
    pub order: Vec<Provider>,
    pub disabled: Vec<Provider>,
    /// Per-call timeout for single requests.
    pub timeout_ms: u64,
    /// Retries on the same provider before moving on.
    pub retry_attempts: u32,
}

impl Default for ProviderPreferences {
    fn default() -> Self {
        Self {
            order: Provider::ALL.to_vec(),
            disabled: Vec::new(),
            timeout_ms: 30_000,
            retry_attempts: 2,
        }
    }
}

impl ProviderPreferences {
    /// Enabled providers in priority order.
    ///
    /// Providers missing from `order` are appended in their default order,
    /// so a partial list never hides a backend.
    pub fn enabled_in_order(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = Vec::with_capacity(Provider::ALL.len());
        for provider in self.order.iter().copied().chain(Provider::ALL) {
            if !providers.contains(&provider) {
                providers.push(provider);
            }
        }
        providers.retain(|p| !self.disabled.contains(p));
        providers
    }

    /// Makes `provider` the default by moving it to the front of the order.
    pub fn set_default(&mut self, provider: Provider) {
        self.order.retain(|p| *p != provider);
        self.order.insert(0, provider);
    }

    pub fn set_enabled(&mut self, provider: Provider, enabled: bool) {
        self.disabled.retain(|p| *p != provider);
        if !enabled {
            self.disabled.push(provider);
        }
    }

    pub fn is_enabled(&self, provider: Provider) -> bool {
        !self.disabled.contains(&provider)
    }

    /// Per-call timeout, clamped to 1s..=120s.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.clamp(MIN_TIMEOUT_MS, MAX_TIMEOUT_MS))
    }
}

/// `[circuit_breaker]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub cooldown_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 60,
            sweep_interval_secs: 30,
        }
    }
}

/// `[bulk]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkSettings {
    pub batch_size: usize,
    pub adaptive_batching: bool,
    pub pause_on_high_error_rate: bool,
    pub error_rate_threshold: f64,
    pub switch_provider_threshold: usize,
    pub inter_batch_delay_ms: u64,
    pub high_error_backoff_ms: u64,
}

impl Default for BulkSettings {
    fn default() -> Self {
        let options = BulkOptions::default();
        Self {
            batch_size: options.batch_size,
            adaptive_batching: options.adaptive_batching,
            pause_on_high_error_rate: options.pause_on_high_error_rate,
            error_rate_threshold: options.error_rate_threshold,
            switch_provider_threshold: options.switch_provider_threshold,
            inter_batch_delay_ms: options.inter_batch_delay.as_millis() as u64,
            high_error_backoff_ms: options.high_error_backoff.as_millis() as u64,
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub providers: ProviderPreferences,
    pub circuit_breaker: CircuitBreakerSettings,
    pub bulk: BulkSettings,
    pub notifications: NotificationSettings,
}

impl FailoverConfig {
    /// Load configuration from a TOML file, applying `FAILOVER__` overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The path is not valid UTF-8
    /// - The configuration file does not exist
    /// - The configuration cannot be parsed
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        let path_str = path
            .to_str()
            .ok_or_else(|| ConfigError::InvalidPath(format!("{:?}", path)))?;

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path_str.to_string()));
        }

        let config = Config::builder()
            .add_source(File::with_name(path_str).format(FileFormat::Toml))
            .add_source(env_source())
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Defaults with `FAILOVER__` overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder().add_source(env_source()).build()?;
        Ok(config.try_deserialize()?)
    }

    /// Parse inline TOML. Environment overrides are not applied.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Renders the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .with_failure_threshold(self.circuit_breaker.failure_threshold)
            .with_cooldown(Duration::from_secs(self.circuit_breaker.cooldown_secs))
            .with_sweep_interval(Duration::from_secs(self.circuit_breaker.sweep_interval_secs))
    }

    pub fn bulk_options(&self) -> BulkOptions {
        let bulk = &self.bulk;
        BulkOptions::new()
            .with_batch_size(bulk.batch_size)
            .with_adaptive_batching(bulk.adaptive_batching)
            .with_pause_on_high_error_rate(bulk.pause_on_high_error_rate)
            .with_error_rate_threshold(bulk.error_rate_threshold)
            .with_switch_provider_threshold(bulk.switch_provider_threshold)
            .with_providers(self.providers.enabled_in_order())
            .with_inter_batch_delay(Duration::from_millis(bulk.inter_batch_delay_ms))
            .with_high_error_backoff(Duration::from_millis(bulk.high_error_backoff_ms))
    }

    pub fn retry_strategy(&self) -> RetryStrategy {
        RetryStrategy {
            max_retries: self.providers.retry_attempts,
            ..RetryStrategy::default()
        }
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(true)
}
