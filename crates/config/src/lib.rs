//! Configuration loading, validation, and management for steploop.
//!
//! Loads configuration from `~/.steploop/config.toml` with environment
//! variable overrides. Validates all settings before a run starts.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.steploop/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Model requested from the backend
    #[serde(default = "default_model")]
    pub model: String,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Max tokens per model response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Hard ceiling on steps per run, enforced regardless of stop conditions
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// System instructions prepended to every request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Consume the backend as an event stream instead of single-shot responses
    #[serde(default)]
    pub streaming: bool,

    /// Seed for randomized demo tools; unset means entropy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_seed: Option<u64>,

    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

fn default_model() -> String {
    "mock-model".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_steps() -> usize {
    20
}

/// Timeouts for backend calls and tool executions, in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_ms: Option<u64>,
}

impl TimeoutConfig {
    pub fn backend(&self) -> Option<Duration> {
        self.backend_ms.map(Duration::from_millis)
    }

    pub fn tool(&self) -> Option<Duration> {
        self.tool_ms.map(Duration::from_millis)
    }
}

impl LoopConfig {
    /// Load configuration from the default path, then apply environment overrides.
    ///
    /// Priority: env vars > config file > defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply `STEPLOOP_*` overrides using the given variable lookup.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(model) = lookup("STEPLOOP_MODEL") {
            self.model = model;
        }

        if let Some(raw) = lookup("STEPLOOP_MAX_STEPS") {
            self.max_steps = raw.parse().map_err(|_| {
                ConfigError::ValidationError(format!("STEPLOOP_MAX_STEPS is not a number: {raw}"))
            })?;
        }

        if let Some(raw) = lookup("STEPLOOP_STREAMING") {
            self.streaming = matches!(raw.as_str(), "1" | "true" | "yes");
        }

        self.validate()
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".steploop")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::ValidationError(
                "temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.max_steps == 0 {
            return Err(ConfigError::ValidationError(
                "max_steps must be at least 1".into(),
            ));
        }

        if self.timeouts.backend_ms == Some(0) || self.timeouts.tool_ms == Some(0) {
            return Err(ConfigError::ValidationError(
                "timeouts must be greater than 0ms".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        Self::default().to_toml()
    }

    /// Render this configuration as TOML.
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: None,
            max_steps: default_max_steps(),
            system_prompt: None,
            streaming: false,
            tool_seed: None,
            timeouts: TimeoutConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {}: {reason}", .path.display())]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {}: {reason}", .path.display())]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = LoopConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_steps, 20);
        assert!(!config.streaming);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = LoopConfig {
            tool_seed: Some(7),
            timeouts: TimeoutConfig {
                backend_ms: Some(30_000),
                tool_ms: None,
            },
            ..LoopConfig::default()
        };
        let parsed: LoopConfig = toml::from_str(&config.to_toml()).unwrap();
        assert_eq!(parsed.tool_seed, Some(7));
        assert_eq!(parsed.timeouts.backend(), Some(Duration::from_secs(30)));
        assert_eq!(parsed.timeouts.tool(), None);
    }

    #[test]
    fn invalid_temperature_rejected() {
        let config = LoopConfig {
            temperature: 5.0,
            ..LoopConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_max_steps_rejected() {
        let config = LoopConfig {
            max_steps: 0,
            ..LoopConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_steps"));
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = LoopConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.model, "mock-model");
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
model = "gpt-4o-mini"
max_steps = 5
system_prompt = "You are terse."

[timeouts]
tool_ms = 250
"#
        )
        .unwrap();

        let config = LoopConfig::load_from(file.path()).unwrap();
        assert_eq!(config.model, "gpt-4o-mini");
        assert_eq!(config.max_steps, 5);
        assert_eq!(config.system_prompt.as_deref(), Some("You are terse."));
        assert_eq!(config.timeouts.tool(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn unparseable_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_steps = \"lots\"").unwrap();
        let err = LoopConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("STEPLOOP_MODEL", "other-model"),
            ("STEPLOOP_MAX_STEPS", "3"),
            ("STEPLOOP_STREAMING", "true"),
        ]);
        let mut config = LoopConfig::default();
        config
            .apply_env_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.model, "other-model");
        assert_eq!(config.max_steps, 3);
        assert!(config.streaming);
    }

    #[test]
    fn bad_env_override_rejected() {
        let mut config = LoopConfig::default();
        let err = config
            .apply_env_overrides(|k| (k == "STEPLOOP_MAX_STEPS").then(|| "0".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = LoopConfig::default_toml();
        assert!(toml_str.contains("mock-model"));
        assert!(toml_str.contains("max_steps = 20"));
    }
}
