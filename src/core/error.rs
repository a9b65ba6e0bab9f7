//! Usage errors and the crate-wide error type.

use super::connection::ConnectionError;
use super::job::JobError;
use super::pipeline::PipelineError;
use super::repository::RepositoryError;
use crate::transport::TransportError;

/// Invalid invocation options, reported before any operation starts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UsageError {
    #[error("throttle limit must be greater than zero")]
    ZeroThrottleLimit,

    #[error("cannot combine {0} with {1}")]
    ConflictingFlags(&'static str, &'static str),

    #[error("a session name is only valid together with invoke-and-disconnect")]
    SessionNameWithoutDisconnect,

    #[error("no targets given")]
    NoTargets,
}

/// Any error the engine can report.
#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, FanoutError>;
