//! Connection descriptors.
//!
//! A descriptor names a target and carries the transport options used to
//! reach it. The engine never looks inside the target beyond its display
//! name; transports decide what each kind means.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Default seconds allowed for opening a connection.
pub const DEFAULT_OPEN_TIMEOUT_SECS: u64 = 30;

/// Default seconds the transport keeps retrying a dropped network.
pub const DEFAULT_MAX_RETRY_SECONDS: u32 = 60;

/// Default number of records a remote execution buffers while nobody reads.
pub const DEFAULT_OUTPUT_BUFFER_CAPACITY: usize = 1024;

/// The addressable kinds of remote target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Target {
    /// A host reached by name
    ComputerName { name: String },
    /// A full connection URI
    Uri { uri: String },
    /// An already established session
    Session { id: Uuid, name: String },
    /// A virtual machine by id
    VmId { id: Uuid },
    /// A virtual machine by name
    VmName { name: String },
    /// A container by id
    Container { id: String },
    /// An SSH host
    Ssh {
        host: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },
    /// A new process on the local machine
    LocalProcess,
}

impl Target {
    pub fn computer(name: impl Into<String>) -> Self {
        Self::ComputerName { name: name.into() }
    }

    pub fn ssh(host: impl Into<String>) -> Self {
        Self::Ssh { host: host.into(), user: None, port: None }
    }

    /// Parse a target from its command-line form.
    ///
    /// Accepts `local`, `ssh://[user@]host[:port]`, `vm:<name>`,
    /// `container:<id>`, any other `scheme://...` as a URI, and falls back to
    /// a computer name.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        if input.eq_ignore_ascii_case("local") {
            return Self::LocalProcess;
        }
        if let Some(rest) = input.strip_prefix("ssh://") {
            let (user, host_port) = match rest.split_once('@') {
                Some((user, rest)) => (Some(user.to_string()), rest),
                None => (None, rest),
            };
            let (host, port) = match host_port.rsplit_once(':') {
                Some((host, port)) => match port.parse::<u16>() {
                    Ok(port) => (host.to_string(), Some(port)),
                    Err(_) => (host_port.to_string(), None),
                },
                None => (host_port.to_string(), None),
            };
            return Self::Ssh { host, user, port };
        }
        if let Some(name) = input.strip_prefix("vm:") {
            return match Uuid::parse_str(name) {
                Ok(id) => Self::VmId { id },
                Err(_) => Self::VmName { name: name.to_string() },
            };
        }
        if let Some(id) = input.strip_prefix("container:") {
            return Self::Container { id: id.to_string() };
        }
        if input.contains("://") {
            return Self::Uri { uri: input.to_string() };
        }
        Self::computer(input)
    }

    /// Name used to label this target's records.
    pub fn display_name(&self) -> String {
        match self {
            Self::ComputerName { name } | Self::VmName { name } => name.clone(),
            Self::Uri { uri } => uri.clone(),
            Self::Session { name, .. } => name.clone(),
            Self::VmId { id } => id.to_string(),
            Self::Container { id } => id.clone(),
            Self::Ssh { host, user, port } => {
                let mut label = String::new();
                if let Some(user) = user {
                    label.push_str(user);
                    label.push('@');
                }
                label.push_str(host);
                if let Some(port) = port {
                    label.push_str(&format!(":{port}"));
                }
                label
            }
            Self::LocalProcess => "localhost".to_string(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name())
    }
}

/// What a remote execution does when its output buffer fills up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputBufferingMode {
    /// The remote side waits for room; nothing is lost
    #[default]
    Block,
    /// New records are discarded and the loss is reported as a warning
    Drop,
}

/// Transport options carried with a descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    /// Port override
    pub port: Option<u16>,

    /// Whether to request an encrypted channel
    pub use_ssl: bool,

    /// Seconds allowed for opening
    pub open_timeout_secs: u64,

    /// Network retry budget reported in retry notifications
    pub max_retry_seconds: u32,

    /// Remote output buffer size
    pub output_buffer_capacity: usize,

    /// Remote output overflow policy
    pub buffering_mode: OutputBufferingMode,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            port: None,
            use_ssl: false,
            open_timeout_secs: DEFAULT_OPEN_TIMEOUT_SECS,
            max_retry_seconds: DEFAULT_MAX_RETRY_SECONDS,
            output_buffer_capacity: DEFAULT_OUTPUT_BUFFER_CAPACITY,
            buffering_mode: OutputBufferingMode::Block,
        }
    }
}

impl TransportOptions {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    #[must_use]
    pub fn with_open_timeout(mut self, secs: u64) -> Self {
        self.open_timeout_secs = secs;
        self
    }

    #[must_use]
    pub fn with_buffer(mut self, capacity: usize, mode: OutputBufferingMode) -> Self {
        self.output_buffer_capacity = capacity.max(1);
        self.buffering_mode = mode;
        self
    }
}

/// A target plus the options used to reach it. Immutable once an operation starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub target: Target,
    #[serde(default)]
    pub options: TransportOptions,
}

impl ConnectionDescriptor {
    pub fn new(target: Target) -> Self {
        Self { target, options: TransportOptions::default() }
    }

    #[must_use]
    pub fn with_options(mut self, options: TransportOptions) -> Self {
        self.options = options;
        self
    }

    pub fn display_name(&self) -> String {
        self.target.display_name()
    }
}

impl From<Target> for ConnectionDescriptor {
    fn from(target: Target) -> Self {
        Self::new(target)
    }
}
