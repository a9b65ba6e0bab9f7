//! Core engine for fanout.
//!
//! Connections and pipelines are the two state machines; an operation pairs
//! one of each for a single target, the throttle scheduler bounds how many
//! operations run at once, and a job aggregates them behind one handle.

pub(crate) mod command;
mod config;
mod connection;
pub(crate) mod descriptor;
mod error;
mod invoke;
mod job;
mod operation;
mod pipeline;
pub(crate) mod record;
mod repository;
mod retry;
mod streams;
mod throttle;

pub use command::{CommandDefinition, CommandSource};
pub use config::{CommandAlias, Config, GeneralConfig, ProgressConfig, TargetGroup, TransportConfig};
pub use connection::{ConnectionError, ConnectionState, ConnectionStateInfo, RunspaceConnection};
pub use descriptor::{
    ConnectionDescriptor, OutputBufferingMode, Target, TransportOptions, DEFAULT_MAX_RETRY_SECONDS,
    DEFAULT_OPEN_TIMEOUT_SECS, DEFAULT_OUTPUT_BUFFER_CAPACITY,
};
pub use error::{FanoutError, Result, UsageError};
pub use invoke::{InvokeCommand, InvokeOutcome, InvokeResult};
pub use job::{DisconnectedJob, Job, JobError, JobInfo, JobOptions, JobState, JobWake, TargetOutcome};
pub use operation::{
    DisconnectedOperation, ExecutionOperation, OperationCompletion, OperationOutcome, StartMode,
};
pub use pipeline::{CommandPipeline, PipelineError, PipelineState, PipelineStateInfo};
pub use record::{
    ErrorCategory, ErrorRecord, InfoLevel, InformationalRecord, JobRecord, PipelineRecord, ProgressRecord,
    StreamKind, TargetLabel,
};
pub use repository::{JobRepository, RepositoryError};
pub use retry::{CountdownEnd, ProgressRenderer, RetryCountdown, RetryProgressMonitor, TracingRenderer};
pub use streams::{PipelineStreams, RecordQueue, RecordSink};
pub use throttle::{SchedulerEvent, ThrottleCounters, ThrottleScheduler, DEFAULT_THROTTLE_LIMIT};
