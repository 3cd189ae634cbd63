//! Configuration Loader
//!
//! Environment-aware configuration loading. Handles file discovery,
//! environment detection, and environment-variable overrides layered on top
//! of the file values.

use super::ActivationConfig;
use crate::error::{AdapterError, Result};
use config::{Config, Environment, File};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Loads an [`ActivationConfig`] from layered sources:
/// a base file, an optional environment-specific override file, and
/// `MQ_BRIDGE__`-prefixed environment variables.
pub struct ConfigLoader {
    config_directory: PathBuf,
    environment: String,
}

impl ConfigLoader {
    /// Create a loader with environment auto-detection (`MQ_BRIDGE_ENV`,
    /// defaulting to `development`)
    pub fn new(config_directory: impl Into<PathBuf>) -> Self {
        Self {
            config_directory: config_directory.into(),
            environment: Self::detect_environment(),
        }
    }

    /// Create a loader with an explicit environment (useful for tests)
    pub fn with_environment(
        config_directory: impl Into<PathBuf>,
        environment: impl Into<String>,
    ) -> Self {
        Self {
            config_directory: config_directory.into(),
            environment: environment.into(),
        }
    }

    fn detect_environment() -> String {
        std::env::var("MQ_BRIDGE_ENV").unwrap_or_else(|_| "development".to_string())
    }

    /// The detected (or explicit) environment name
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Load and validate the activation configuration
    pub fn load(&self) -> Result<ActivationConfig> {
        let base = self.config_directory.join("mq-bridge.yaml");
        let overlay = self
            .config_directory
            .join(format!("mq-bridge.{}.yaml", self.environment));

        debug!(
            environment = %self.environment,
            directory = %self.config_directory.display(),
            "Loading activation configuration"
        );

        let mut builder = Config::builder();
        if base.exists() {
            builder = builder.add_source(File::from(base.as_path()));
        }
        if overlay.exists() {
            builder = builder.add_source(File::from(overlay.as_path()));
        }
        builder = builder.add_source(Environment::with_prefix("MQ_BRIDGE").separator("__"));

        let config: ActivationConfig = builder
            .build()
            .map_err(|e| AdapterError::configuration(format!("failed to read config: {e}")))?
            .try_deserialize()
            .map_err(|e| AdapterError::configuration(format!("invalid config: {e}")))?;

        config.validate()?;

        debug!(
            destination = %config.destination,
            pool_max_size = config.pool_max_size,
            "✅ Activation configuration loaded"
        );

        Ok(config)
    }

    /// Load from an explicit file path (no layering)
    pub fn load_file(path: &Path) -> Result<ActivationConfig> {
        let config: ActivationConfig = Config::builder()
            .add_source(File::from(path))
            .build()
            .map_err(|e| AdapterError::configuration(format!("failed to read config: {e}")))?
            .try_deserialize()
            .map_err(|e| AdapterError::configuration(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }
}
