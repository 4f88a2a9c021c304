//! Configuration for the claimline binary

use std::path::PathBuf;

use claimline_engine::{EngineConfig, StorageConfig, SupervisorConfig};
use serde::{Deserialize, Serialize};

/// Everything the binary reads from defaults, a file and the environment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Pipeline engine configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Drift supervisor configuration
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Storage configuration
    #[serde(default = "default_storage")]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            supervisor: SupervisorConfig::default(),
            storage: default_storage(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_storage() -> StorageConfig {
    StorageConfig::File {
        data_dir: PathBuf::from("claimline-data"),
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Defaults, then the optional file, then `CLAIMLINE_*` variables.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `CLAIMLINE_SUPERVISOR__CHECK_INTERVAL_SECS=60`.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&Settings::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("CLAIMLINE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Where `run` writes published items when no output path is given.
    pub fn publication_path(&self) -> PathBuf {
        match &self.storage {
            StorageConfig::File { data_dir } => data_dir.join("published.jsonl"),
            StorageConfig::Memory => PathBuf::from("published.jsonl"),
        }
    }
}
