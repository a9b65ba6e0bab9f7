//! Command definitions.
//!
//! Defines the `CommandDefinition` that every target of an invocation runs.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The command sent to every target of an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDefinition {
    /// Unique identifier for this command
    pub id: String,

    /// Display name
    pub name: String,

    /// Script text executed on the target
    pub script: String,

    /// Optional description of what this command does
    pub description: Option<String>,

    /// Where the command came from
    pub source: CommandSource,

    /// Working directory on the target
    pub working_dir: Option<PathBuf>,

    /// Environment variables to set when running
    pub env: Vec<(String, String)>,

    /// Positional arguments appended to the script
    #[serde(default)]
    pub arguments: Vec<String>,
}

impl CommandDefinition {
    /// Create a new command with minimal required fields.
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        let name = name.into();
        let script = script.into();
        let id = Self::generate_id(&name, &script);

        Self {
            id,
            name,
            script,
            description: None,
            source: CommandSource::Script,
            working_dir: None,
            env: Vec::new(),
            arguments: Vec::new(),
        }
    }

    /// A command whose name is its own script text.
    pub fn script(script: impl Into<String>) -> Self {
        let script = script.into();
        Self::new(script.clone(), script)
    }

    /// Load the script text from a file.
    pub fn from_file(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let script = std::fs::read_to_string(&path)?;
        let name = path.file_name().map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        let mut command = Self::new(name, script);
        command.source = CommandSource::File(path);
        Ok(command)
    }

    /// Create a command from an alias configuration.
    pub fn from_alias(alias: &super::config::CommandAlias) -> Self {
        Self {
            id: Self::generate_id(&alias.name, &alias.script),
            name: alias.name.clone(),
            script: alias.script.clone(),
            description: alias.description.clone(),
            source: CommandSource::Alias,
            working_dir: alias.working_dir.clone(),
            env: alias.env.clone(),
            arguments: alias.arguments.clone(),
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Add a positional argument.
    #[must_use]
    pub fn with_argument(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    /// Script text with arguments appended, as a shell would receive it.
    pub fn command_line(&self) -> String {
        if self.arguments.is_empty() {
            return self.script.clone();
        }
        let mut line = self.script.clone();
        for arg in &self.arguments {
            line.push(' ');
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                line.push('"');
                line.push_str(&arg.replace('"', "\\\""));
                line.push('"');
            } else {
                line.push_str(arg);
            }
        }
        line
    }

    /// Generate a unique ID for the command.
    fn generate_id(name: &str, script: &str) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        script.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

/// Source of a command definition.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CommandSource {
    /// Given inline
    #[default]
    Script,

    /// Read from a script file
    File(PathBuf),

    /// A configured alias
    Alias,
}

impl CommandSource {
    /// Get the type name for display.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::File(_) => "file",
            Self::Alias => "alias",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CommandAlias;

    #[test]
    fn test_command_creation() {
        let cmd = CommandDefinition::new("uptime", "uptime -p");
        assert_eq!(cmd.name, "uptime");
        assert_eq!(cmd.script, "uptime -p");
        assert_eq!(cmd.id.len(), 16);
        assert_eq!(cmd.source, CommandSource::Script);
    }

    #[test]
    fn test_ids_are_stable() {
        let a = CommandDefinition::new("disk", "df -h");
        let b = CommandDefinition::new("disk", "df -h");
        let c = CommandDefinition::new("disk", "df -i");
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn test_command_line_quotes_arguments() {
        let cmd = CommandDefinition::script("echo").with_argument("plain").with_argument("two words");
        assert_eq!(cmd.command_line(), "echo plain \"two words\"");
    }

    #[test]
    fn test_command_from_alias() {
        let mut alias = CommandAlias::new("restart-web", "systemctl restart nginx");
        alias.description = Some("Bounce the web tier".to_string());
        alias.env = vec![("LANG".to_string(), "C".to_string())];

        let cmd = CommandDefinition::from_alias(&alias);
        assert_eq!(cmd.name, "restart-web");
        assert_eq!(cmd.script, "systemctl restart nginx");
        assert_eq!(cmd.description.as_deref(), Some("Bounce the web tier"));
        assert_eq!(cmd.env.len(), 1);
        assert_eq!(cmd.source.type_name(), "alias");
    }

    #[test]
    fn test_command_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("check.sh");
        std::fs::write(&path, "echo ok").unwrap();

        let cmd = CommandDefinition::from_file(&path).unwrap();
        assert_eq!(cmd.name, "check.sh");
        assert_eq!(cmd.script, "echo ok");
        assert_eq!(cmd.source, CommandSource::File(path));
    }
}
