//! Configuration file support

use crate::pcm::HwConstraints;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration loaded from TOML file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PcmConfig {
    /// Position poll interval in milliseconds
    pub tick_interval_ms: u64,

    /// Number of stream slots on the chip
    pub max_streams: usize,

    /// Hardware capability table
    pub constraints: HwConstraints,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Log file path (empty = no file logging)
    #[serde(default)]
    pub log_file: String,
}

impl Default for PcmConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 5,
            max_streams: 8,
            constraints: HwConstraints::default(),
            log_level: "info".to_string(),
            log_file: String::new(),
        }
    }
}

impl PcmConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_string_lossy().to_string(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default locations
    ///
    /// Searches in order:
    /// 1. Same directory as executable: pcmtrack.toml
    /// 2. User config directory: pcmtrack/config.toml
    pub fn load_default() -> Result<Self, ConfigError> {
        if let Some(path) = Self::default_paths().into_iter().find(|p| p.exists()) {
            return Self::load(path);
        }

        // Return default config if no file found
        Ok(Self::default())
    }

    fn default_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(exe_path) = std::env::current_exe() {
            if let Some(exe_dir) = exe_path.parent() {
                paths.push(exe_dir.join("pcmtrack.toml"));
            }
        }
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("pcmtrack").join("config.toml"));
        }
        paths
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = self.to_toml()?;

        // Create parent directories if needed
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                path: parent.to_string_lossy().to_string(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source: e,
        })
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Reject values the stream core cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::Invalid("tick_interval_ms must be non-zero".into()));
        }
        if self.max_streams == 0 || self.max_streams > crate::chip::MAX_SLOTS {
            return Err(ConfigError::Invalid(format!(
                "max_streams must be within 1..={}",
                crate::chip::MAX_SLOTS
            )));
        }
        let c = &self.constraints;
        if c.rate_min > c.rate_max
            || c.channels_min > c.channels_max
            || c.period_bytes_min > c.period_bytes_max
            || c.periods_min > c.periods_max
        {
            return Err(ConfigError::Invalid("constraint minimum above maximum".into()));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading/writing config file
    #[error("Failed to access config file '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    /// Error parsing TOML
    #[error("Failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    /// Error serializing config
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    /// Values out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: PcmConfig = toml::from_str("tick_interval_ms = 2\n").unwrap();
        assert_eq!(config.tick_interval(), Duration::from_millis(2));
        assert_eq!(config.max_streams, 8);
        assert_eq!(config.constraints.buffer_bytes_max, 15360);
    }

    #[test]
    fn test_nested_constraints() {
        let text = r#"
            [constraints]
            rate_max = 16000
            formats = ["s16_le", "float_le"]
        "#;
        let config: PcmConfig = toml::from_str(text).unwrap();
        assert_eq!(config.constraints.rate_max, 16000);
        assert_eq!(config.constraints.rate_min, 8000);
        assert_eq!(config.constraints.formats.len(), 2);
    }

    #[test]
    fn test_save_and_load() {
        let dir = std::env::temp_dir().join(format!("pcmtrack-test-{}", std::process::id()));
        let path = dir.join("config.toml");
        let config = PcmConfig {
            max_streams: 4,
            log_level: "debug".into(),
            ..PcmConfig::default()
        };
        config.save(&path).unwrap();
        assert_eq!(PcmConfig::load(&path).unwrap(), config);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_validation() {
        let config = PcmConfig {
            tick_interval_ms: 0,
            ..PcmConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = PcmConfig {
            max_streams: 64,
            ..PcmConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(PcmConfig::default().validate().is_ok());
    }
}
