//! Main framework settings and configuration management

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use validator::Validate;

use crate::{CircuitSettings, DdqSettings, DlqSettings, LoggerSettings, TransportSettings};

/// Main framework settings structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct FrameworkSettings {
    /// Transport configuration
    #[validate(nested)]
    #[serde(default)]
    pub transport: TransportSettings,

    /// Deduplication queue configuration
    #[validate(nested)]
    #[serde(default)]
    pub ddq: DdqSettings,

    /// Circuit breaker configuration
    #[validate(nested)]
    #[serde(default)]
    pub circuit: CircuitSettings,

    /// Dead-letter queue configuration
    #[validate(nested)]
    #[serde(default)]
    pub dlq: DlqSettings,

    /// Logger configuration
    #[validate(nested)]
    #[serde(default)]
    pub logger: LoggerSettings,
}

impl FrameworkSettings {
    /// Load configuration from layered sources.
    ///
    /// Order: `config/default.yaml`, `config/<RUST_ENV>.yaml`,
    /// `config/local.yaml`, then `SMARTMESSAGE_*` environment variables.
    /// The single `DLQ_PATH` environment variable overrides `dlq.path`
    /// regardless of the other sources.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_dir("config")
    }

    /// Load configuration with a custom config directory
    pub fn load_from_dir<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let mut config = Config::builder();

        // Default configuration
        let default_path = config_dir.join("default.yaml");
        if default_path.exists() {
            config = config.add_source(File::from(default_path).format(FileFormat::Yaml));
        }

        // Environment-specific configuration
        let env = env::var("RUST_ENV").unwrap_or_else(|_| "development".to_string());
        let env_path = config_dir.join(format!("{}.yaml", env));
        if env_path.exists() {
            config = config.add_source(File::from(env_path).format(FileFormat::Yaml));
        }

        // Local configuration (not committed to version control)
        let local_path = config_dir.join("local.yaml");
        if local_path.exists() {
            config = config.add_source(File::from(local_path).format(FileFormat::Yaml));
        }

        // Environment variables (with SMARTMESSAGE_ prefix)
        config = config.add_source(
            Environment::with_prefix("SMARTMESSAGE")
                .separator("__")
                .try_parsing(true),
        );

        let mut settings: FrameworkSettings = config.build()?.try_deserialize()?;

        // Dedicated override for the dead-letter file location
        if let Ok(path) = env::var("DLQ_PATH") {
            settings.dlq.path = path.into();
        }

        // Validate the configuration
        settings.validate().map_err(|e| {
            ConfigError::Message(format!("Configuration validation failed: {:?}", e))
        })?;

        Ok(settings)
    }
}
