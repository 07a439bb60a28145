// Configuration management with layered configuration (file, env)

use crate::engine::EngineOptions;
use crate::schedule::parse_timezone;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub fail_on_error_in_postconditions: bool,
    #[serde(default = "default_iterate_concurrency")]
    pub default_iterate_concurrency: usize,
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
}

fn default_iterate_concurrency() -> usize {
    1
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fail_on_error_in_postconditions: false,
            default_iterate_concurrency: default_iterate_concurrency(),
            default_timezone: default_timezone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default configuration
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            // Environment overrides, e.g. APP__ENGINE__DEFAULT_ITERATE_CONCURRENCY=4
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.engine.default_iterate_concurrency == 0 {
            return Err("Engine default_iterate_concurrency must be greater than 0".to_string());
        }

        if let Err(e) = parse_timezone(&self.engine.default_timezone) {
            return Err(format!("Engine default_timezone is invalid: {}", e));
        }

        if self.observability.log_level.trim().is_empty() {
            return Err("Observability log_level cannot be empty".to_string());
        }

        Ok(())
    }

    /// Engine options for compiling jobs
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions::from(&self.engine)
    }
}

impl From<&EngineConfig> for EngineOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            fail_on_error_in_postconditions: config.fail_on_error_in_postconditions,
            default_iterate_concurrency: config.default_iterate_concurrency,
            default_timezone: Some(config.default_timezone.clone()),
        }
    }
}
