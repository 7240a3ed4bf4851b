//! CLI configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via PROTONET_CONFIG or --config)
//! 3. Environment variables
//! 4. Command-line flags

use protonet_wire::ReaderConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default number of payload bytes shown before a hex dump is cut short.
pub const DEFAULT_BYTES_PREVIEW: usize = 64;

/// CLI configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Decoder limits.
    pub reader: ReaderConfig,
    /// Output formatting.
    pub output: OutputConfig,
}

impl Config {
    /// Loads configuration from `path` (if any), then applies environment
    /// variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Checks limits that would make every decode fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reader.max_depth == 0 {
            return Err(ConfigError::ValidationError(
                "reader.max_depth must be at least 1".to_string(),
            ));
        }
        if self.reader.max_message_size == 0 {
            return Err(ConfigError::ValidationError(
                "reader.max_message_size must be at least 1".to_string(),
            ));
        }
        if self.reader.buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "reader.buffer_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(depth) = var("PROTONET_MAX_DEPTH") {
            if let Ok(n) = depth.parse() {
                self.reader.max_depth = n;
            }
        }

        if let Some(size) = var("PROTONET_MAX_MESSAGE_SIZE") {
            if let Ok(n) = size.parse() {
                self.reader.max_message_size = n;
            }
        }

        if let Some(color) = var("PROTONET_COLOR") {
            self.output.color = color == "1" || color.to_lowercase() == "true";
        }
    }
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Colourise terminal output.
    pub color: bool,
    /// Payload bytes shown in hex before truncating.
    pub bytes_preview: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            color: true,
            bytes_preview: DEFAULT_BYTES_PREVIEW,
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
