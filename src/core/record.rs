//! Records produced by a remote command.
//!
//! A pipeline emits success objects, errors, informational messages
//! (warning/verbose/debug) and progress updates. Once a record reaches a job
//! it is tagged with the target that produced it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The independent output queues of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    /// Success objects
    Output,
    /// Error records
    Error,
    /// Warning, verbose and debug messages
    Informational,
    /// Progress updates
    Progress,
}

/// Broad classification of an error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// No category given by the producer
    #[default]
    NotSpecified,
    /// The target could not be reached or the session failed
    ConnectionError,
    /// The remote command reported a failure
    RemoteError,
    /// The command was stopped before it finished
    OperationStopped,
    /// The transport gave up on the target
    ResourceUnavailable,
}

/// A non-terminating error produced by a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Human readable message
    pub message: String,

    /// Classification
    #[serde(default)]
    pub category: ErrorCategory,

    /// Producer specific identifier (e.g. an exit code or error id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_id: Option<String>,
}

impl ErrorRecord {
    /// Create an error record with no category.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), category: ErrorCategory::NotSpecified, error_id: None }
    }

    /// Set the category.
    #[must_use]
    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.category = category;
        self
    }

    /// Set the error id.
    #[must_use]
    pub fn with_error_id(mut self, id: impl Into<String>) -> Self {
        self.error_id = Some(id.into());
        self
    }
}

impl fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_id {
            Some(id) => write!(f, "{} ({})", self.message, id),
            None => write!(f, "{}", self.message),
        }
    }
}

/// Level of an informational record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InfoLevel {
    Warning,
    Verbose,
    Debug,
}

/// A warning, verbose or debug message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InformationalRecord {
    pub level: InfoLevel,
    pub message: String,
}

/// Progress of a long-running remote activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Identifies the activity across updates
    pub activity_id: i32,
    /// What is being done
    pub activity: String,
    /// Current status line
    pub status: String,
    /// 0-100, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent_complete: Option<u8>,
    /// Estimated seconds remaining, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds_remaining: Option<u32>,
    /// Whether this update closes the activity
    #[serde(default)]
    pub completed: bool,
}

impl ProgressRecord {
    /// Create an in-progress update.
    pub fn new(activity_id: i32, activity: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            activity_id,
            activity: activity.into(),
            status: status.into(),
            percent_complete: None,
            seconds_remaining: None,
            completed: false,
        }
    }

    /// Set percent complete (clamped to 100).
    #[must_use]
    pub fn with_percent(mut self, percent: u8) -> Self {
        self.percent_complete = Some(percent.min(100));
        self
    }
}

/// One record emitted by a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PipelineRecord {
    Output(Value),
    Error(ErrorRecord),
    Informational(InformationalRecord),
    Progress(ProgressRecord),
}

impl PipelineRecord {
    /// A success object.
    pub fn output(value: impl Into<Value>) -> Self {
        Self::Output(value.into())
    }

    /// An error record with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorRecord::new(message))
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::Informational(InformationalRecord { level: InfoLevel::Warning, message: message.into() })
    }

    pub fn verbose(message: impl Into<String>) -> Self {
        Self::Informational(InformationalRecord { level: InfoLevel::Verbose, message: message.into() })
    }

    pub fn debug(message: impl Into<String>) -> Self {
        Self::Informational(InformationalRecord { level: InfoLevel::Debug, message: message.into() })
    }

    /// Which output queue this record belongs to.
    pub fn kind(&self) -> StreamKind {
        match self {
            Self::Output(_) => StreamKind::Output,
            Self::Error(_) => StreamKind::Error,
            Self::Informational(_) => StreamKind::Informational,
            Self::Progress(_) => StreamKind::Progress,
        }
    }

    /// Check if this is an error record.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// The success object, if this is one.
    pub fn as_output(&self) -> Option<&Value> {
        match self {
            Self::Output(value) => Some(value),
            _ => None,
        }
    }
}

/// Identifies the target an operation runs against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetLabel {
    /// Operation that produced the record
    pub operation_id: Uuid,
    /// Connection the operation runs on
    pub connection_id: Uuid,
    /// Display name of the target
    pub name: String,
}

impl fmt::Display for TargetLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// A record in a job's merged result stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Arrival order within the job
    pub sequence: u64,
    /// Where the record came from
    pub target: TargetLabel,
    /// When the job received it
    pub received_at: DateTime<Utc>,
    /// The record itself
    pub record: PipelineRecord,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_kinds() {
        assert_eq!(PipelineRecord::output("x").kind(), StreamKind::Output);
        assert_eq!(PipelineRecord::error("boom").kind(), StreamKind::Error);
        assert_eq!(PipelineRecord::warning("careful").kind(), StreamKind::Informational);
        assert_eq!(PipelineRecord::verbose("chatty").kind(), StreamKind::Informational);
        assert_eq!(PipelineRecord::debug("trace").kind(), StreamKind::Informational);
        assert_eq!(
            PipelineRecord::Progress(ProgressRecord::new(1, "copy", "working")).kind(),
            StreamKind::Progress
        );
    }

    #[test]
    fn test_error_record_display() {
        let plain = ErrorRecord::new("disk full");
        assert_eq!(plain.to_string(), "disk full");

        let with_id = ErrorRecord::new("exited").with_error_id("exit 2");
        assert_eq!(with_id.to_string(), "exited (exit 2)");
    }

    #[test]
    fn test_progress_percent_clamped() {
        let progress = ProgressRecord::new(7, "sync", "almost").with_percent(250);
        assert_eq!(progress.percent_complete, Some(100));
    }

    #[test]
    fn test_record_serialization_shape() {
        let json = serde_json::to_value(PipelineRecord::output(42)).unwrap();
        assert_eq!(json["type"], "output");
        assert_eq!(json["data"], 42);

        let json = serde_json::to_value(PipelineRecord::warning("low memory")).unwrap();
        assert_eq!(json["type"], "informational");
        assert_eq!(json["data"]["level"], "Warning");
    }
}
