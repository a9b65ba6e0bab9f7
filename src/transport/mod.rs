//! Transport seam.
//!
//! The engine never moves bytes itself. A [`Transport`] opens a
//! [`RemoteSession`] for a descriptor; the session runs commands and reports
//! their records through a bounded channel plus network retry notifications.

mod local;
mod simulated;

pub use local::LocalProcessTransport;
pub use simulated::{HostScript, OpenBehavior, ScriptStep, SimulatedTransport, SimulationStats};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::core::command::CommandDefinition;
use crate::core::descriptor::{ConnectionDescriptor, OutputBufferingMode};
use crate::core::record::PipelineRecord;

/// Errors reported by a transport or one of its sessions.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("target unreachable: {0}")]
    Unreachable(String),

    #[error("connection rejected: {0}")]
    Rejected(String),

    #[error("{transport} transport does not support {operation}")]
    Unsupported { transport: &'static str, operation: &'static str },

    #[error("session {0} is not available")]
    SessionUnavailable(Uuid),

    #[error("no remote execution {0}")]
    ExecutionNotFound(Uuid),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Network retry notifications raised by a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryNotification {
    /// The network dropped; the transport retries for up to `max_retry_seconds`
    NetworkFailureDetected { max_retry_seconds: u32 },
    /// A retry restored the connection
    ConnectionRetrySucceeded,
    /// The retry budget ran out; the session disconnects, remote work continues
    AutoDisconnectStarting,
    /// The transport failed internally and gave up on the session
    InternalErrorAbort { reason: String },
}

/// How a remote execution ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteOutcome {
    Completed,
    Failed(String),
    Stopped,
}

/// One event from a remote execution.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    Record(PipelineRecord),
    Finished(RemoteOutcome),
}

/// What a session is asked to run.
#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub command: CommandDefinition,
    /// Complete input, collected before the request is sent
    pub input: Vec<Value>,
}

/// The local end of a running remote execution.
///
/// Records wait in the channel while nobody reads it, including while the
/// session is disconnected.
#[derive(Debug)]
pub struct RemoteInvocation {
    pub id: Uuid,
    pub events: mpsc::Receiver<RemoteEvent>,
}

/// Opens sessions against targets.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Open a session. Called once per connection.
    async fn open(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<dyn RemoteSession>, TransportError>;
}

/// An open channel to one target.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    fn id(&self) -> Uuid;

    /// Start a command. Returns once the remote side accepted it.
    async fn invoke(&self, request: InvocationRequest) -> Result<RemoteInvocation, TransportError>;

    /// Ask a running command to stop. Its events end with `Stopped`.
    async fn stop(&self, invocation: Uuid) -> Result<(), TransportError>;

    /// Detach from the target; remote executions keep running.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Re-attach after a disconnect.
    async fn reconnect(&self) -> Result<(), TransportError>;

    /// Release the session.
    async fn close(&self) -> Result<(), TransportError>;

    /// Subscribe to network retry notifications.
    fn retry_notifications(&self) -> broadcast::Receiver<RetryNotification>;
}

/// Remote end of an execution's output channel.
///
/// Applies the buffering mode: `Block` waits for room, `Drop` discards while
/// the buffer is full and announces the loss with a warning record ahead of
/// the next record that fits.
#[derive(Debug)]
pub struct RemoteOutputWriter {
    tx: mpsc::Sender<RemoteEvent>,
    mode: OutputBufferingMode,
    dropped: AtomicU64,
}

impl RemoteOutputWriter {
    /// Create a writer and the matching invocation handle.
    pub fn channel(capacity: usize, mode: OutputBufferingMode) -> (Self, RemoteInvocation) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let writer = Self { tx, mode, dropped: AtomicU64::new(0) };
        (writer, RemoteInvocation { id: Uuid::new_v4(), events: rx })
    }

    /// Emit one record. Returns false once the reader is gone.
    pub async fn write(&self, record: PipelineRecord) -> bool {
        match self.mode {
            OutputBufferingMode::Block => self.tx.send(RemoteEvent::Record(record)).await.is_ok(),
            OutputBufferingMode::Drop => {
                if !self.flush_drop_warning() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return !self.tx.is_closed();
                }
                match self.tx.try_send(RemoteEvent::Record(record)) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            }
        }
    }

    /// Emit the terminal event. Always waits for room so it is never lost.
    pub async fn finish(&self, outcome: RemoteOutcome) {
        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            tracing::warn!(dropped, "Remote output buffer overflowed");
            let _ = self.tx.send(RemoteEvent::Record(Self::drop_warning(dropped))).await;
        }
        let _ = self.tx.send(RemoteEvent::Finished(outcome)).await;
    }

    /// Records discarded and not yet announced.
    pub fn pending_dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Announce discarded records if there is room. False if still full.
    fn flush_drop_warning(&self) -> bool {
        let dropped = self.dropped.load(Ordering::Relaxed);
        if dropped == 0 {
            return true;
        }
        match self.tx.try_send(RemoteEvent::Record(Self::drop_warning(dropped))) {
            Ok(()) => {
                self.dropped.fetch_sub(dropped, Ordering::Relaxed);
                tracing::warn!(dropped, "Remote output buffer overflowed");
                true
            }
            Err(_) => false,
        }
    }

    fn drop_warning(count: u64) -> PipelineRecord {
        PipelineRecord::warning(format!("output buffer full: {count} record(s) discarded"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(invocation: &mut RemoteInvocation) -> Vec<RemoteEvent> {
        let mut events = Vec::new();
        while let Ok(event) = invocation.events.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_block_mode_waits_for_room() {
        let (writer, mut invocation) = RemoteOutputWriter::channel(1, OutputBufferingMode::Block);
        assert!(writer.write(PipelineRecord::output(1)).await);

        let pending = tokio::spawn(async move {
            writer.write(PipelineRecord::output(2)).await;
            writer.finish(RemoteOutcome::Completed).await;
        });
        tokio::task::yield_now().await;

        let mut seen = Vec::new();
        while let Some(event) = invocation.events.recv().await {
            seen.push(event);
        }
        pending.await.unwrap();

        assert_eq!(
            seen,
            vec![
                RemoteEvent::Record(PipelineRecord::output(1)),
                RemoteEvent::Record(PipelineRecord::output(2)),
                RemoteEvent::Finished(RemoteOutcome::Completed),
            ]
        );
    }

    #[tokio::test]
    async fn test_drop_mode_reports_discarded_records() {
        let (writer, mut invocation) = RemoteOutputWriter::channel(2, OutputBufferingMode::Drop);
        for i in 0..5 {
            assert!(writer.write(PipelineRecord::output(i)).await);
        }
        assert_eq!(writer.pending_dropped(), 3);

        let first = drain(&mut invocation);
        assert_eq!(first.len(), 2);

        assert!(writer.write(PipelineRecord::output(99)).await);
        let second = drain(&mut invocation);
        assert_eq!(
            second,
            vec![
                RemoteEvent::Record(PipelineRecord::warning("output buffer full: 3 record(s) discarded")),
                RemoteEvent::Record(PipelineRecord::output(99)),
            ]
        );
    }

    #[tokio::test]
    async fn test_finish_flushes_pending_warning() {
        let (writer, mut invocation) = RemoteOutputWriter::channel(1, OutputBufferingMode::Drop);
        writer.write(PipelineRecord::output("kept")).await;
        writer.write(PipelineRecord::output("lost")).await;

        let finisher = tokio::spawn(async move { writer.finish(RemoteOutcome::Completed).await });
        let mut seen = Vec::new();
        while let Some(event) = invocation.events.recv().await {
            seen.push(event);
        }
        finisher.await.unwrap();

        assert_eq!(seen.len(), 3);
        assert!(matches!(&seen[1], RemoteEvent::Record(PipelineRecord::Informational(_))));
        assert_eq!(seen[2], RemoteEvent::Finished(RemoteOutcome::Completed));
    }
}
