//! Configuration management for fanout.
//!
//! Handles loading and saving configuration from TOML files.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::descriptor::{
    OutputBufferingMode, Target, TransportOptions, DEFAULT_MAX_RETRY_SECONDS, DEFAULT_OPEN_TIMEOUT_SECS,
    DEFAULT_OUTPUT_BUFFER_CAPACITY,
};
use super::error::UsageError;
use super::throttle::DEFAULT_THROTTLE_LIMIT;

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Transport defaults applied to every target
    pub transport: TransportConfig,

    /// Reconnect countdown display
    pub progress: ProgressConfig,

    /// Named target groups
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<TargetGroup>,

    /// Command aliases
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<CommandAlias>,
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Maximum concurrently active operations
    pub throttle_limit: usize,

    /// Turn errors of single-target invocations into terminating errors
    pub propagate_errors: bool,

    /// How long finished jobs stay in the repository
    pub job_retention_secs: u64,
}

/// Transport defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Seconds allowed for opening a connection
    pub open_timeout_secs: u64,

    /// Network retry budget
    pub max_retry_seconds: u32,

    /// Records buffered per remote execution
    pub output_buffer_capacity: usize,

    /// What happens when that buffer is full
    pub buffering_mode: OutputBufferingMode,
}

/// Reconnect countdown display settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Whether to render reconnect countdowns
    pub enabled: bool,
}

/// A named group of targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetGroup {
    /// Group name used on the command line
    pub name: String,

    /// Target specs in command-line form
    pub hosts: Vec<String>,
}

impl TargetGroup {
    /// Parse every host spec in the group.
    pub fn targets(&self) -> Vec<Target> {
        self.hosts.iter().map(|h| Target::parse(h)).collect()
    }
}

/// A named command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandAlias {
    /// Short name for the alias
    pub name: String,

    /// The script to execute
    pub script: String,

    /// Optional description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Working directory on the target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Environment variables to set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<(String, String)>,

    /// Arguments appended to the script
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<String>,
}

impl CommandAlias {
    /// Create a new alias with the minimum required fields.
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: script.into(),
            description: None,
            working_dir: None,
            env: Vec::new(),
            arguments: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Looks for config in:
    /// 1. `.fanout.toml` in current directory
    /// 2. `~/.config/fanout/config.toml`
    /// 3. Falls back to defaults
    pub fn load() -> anyhow::Result<Self> {
        let local_config = PathBuf::from(".fanout.toml");
        if local_config.exists() {
            return Self::load_from_file(&local_config);
        }

        if let Some(config_dir) = Self::config_dir() {
            let global_config = config_dir.join("config.toml");
            if global_config.exists() {
                return Self::load_from_file(&global_config);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Save configuration to the global config file.
    pub fn save(&self) -> anyhow::Result<()> {
        let dir = Self::config_dir().ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        self.save_to_file(&dir.join("config.toml"))
    }

    /// Save configuration to a specific file.
    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("fanout"))
    }

    /// Report usage errors in the configuration.
    pub fn validate(&self) -> Result<(), UsageError> {
        if self.general.throttle_limit == 0 {
            return Err(UsageError::ZeroThrottleLimit);
        }
        Ok(())
    }

    /// Transport options for a new descriptor.
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            open_timeout_secs: self.transport.open_timeout_secs,
            max_retry_seconds: self.transport.max_retry_seconds,
            ..TransportOptions::default()
        }
        .with_buffer(self.transport.output_buffer_capacity, self.transport.buffering_mode)
    }

    /// Look up a target group by name.
    pub fn target_group(&self, name: &str) -> Option<&TargetGroup> {
        self.targets.iter().find(|g| g.name == name)
    }

    /// Look up a command alias by name.
    pub fn command(&self, name: &str) -> Option<&CommandAlias> {
        self.commands.iter().find(|c| c.name == name)
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self { throttle_limit: DEFAULT_THROTTLE_LIMIT, propagate_errors: true, job_retention_secs: 3600 }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            open_timeout_secs: DEFAULT_OPEN_TIMEOUT_SECS,
            max_retry_seconds: DEFAULT_MAX_RETRY_SECONDS,
            output_buffer_capacity: DEFAULT_OUTPUT_BUFFER_CAPACITY,
            buffering_mode: OutputBufferingMode::Block,
        }
    }
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.general.throttle_limit, 32);
        assert!(config.general.propagate_errors);
        assert_eq!(config.transport.buffering_mode, OutputBufferingMode::Block);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[transport]"));
        assert!(toml_str.contains("buffering_mode = \"block\""));
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            [general]
            throttle_limit = 4

            [transport]
            buffering_mode = "drop"
            output_buffer_capacity = 16

            [[targets]]
            name = "web"
            hosts = ["web01", "ssh://ops@web02"]

            [[commands]]
            name = "uptime"
            script = "uptime"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.general.throttle_limit, 4);
        assert!(config.general.propagate_errors);

        let options = config.transport_options();
        assert_eq!(options.buffering_mode, OutputBufferingMode::Drop);
        assert_eq!(options.output_buffer_capacity, 16);

        let web = config.target_group("web").unwrap();
        assert_eq!(web.targets().len(), 2);
        assert_eq!(config.command("uptime").unwrap().script, "uptime");
    }

    #[test]
    fn test_zero_throttle_limit_rejected() {
        let toml_str = r"
            [general]
            throttle_limit = 0
        ";
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.validate(), Err(UsageError::ZeroThrottleLimit));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.general.throttle_limit = 7;
        config.commands.push(CommandAlias::new("disk", "df -h"));
        config.save_to_file(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded.general.throttle_limit, 7);
        assert_eq!(loaded.commands.len(), 1);
    }
}
