//! A single command bound to one connection.
//!
//! ```text
//! NotStarted -> Running -> Completed | Failed | Stopped | Disconnected
//!               Running -> Stopping -> Stopped
//! ```
//!
//! Input is collected in full and sent when the input stream is closed.
//! Output flows into four independent queues, or into an attached sink when
//! the pipeline belongs to a job.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::command::CommandDefinition;
use super::connection::{ConnectionState, RunspaceConnection};
use super::record::{ErrorCategory, ErrorRecord, PipelineRecord};
use super::streams::{PipelineStreams, RecordSink};
use crate::transport::{
    InvocationRequest, RemoteEvent, RemoteInvocation, RemoteOutcome, RemoteSession, RetryNotification, TransportError,
};

/// Pipeline lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineState {
    NotStarted,
    Running,
    Stopping,
    Completed,
    Failed,
    Stopped,
    Disconnected,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped | Self::Disconnected)
    }

    /// Running or stopping.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Stopping)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use PipelineState::{Completed, Disconnected, Failed, NotStarted, Running, Stopped, Stopping};
        matches!(
            (self, next),
            (NotStarted, Running | Stopped | Failed)
                | (Running, Stopping | Completed | Failed | Stopped | Disconnected)
                | (Stopping, Stopped | Completed | Failed | Disconnected)
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "NotStarted",
            Self::Running => "Running",
            Self::Stopping => "Stopping",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Stopped => "Stopped",
            Self::Disconnected => "Disconnected",
        };
        f.write_str(name)
    }
}

/// Current state plus the failure reason, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStateInfo {
    pub state: PipelineState,
    pub reason: Option<String>,
}

/// Errors from pipeline verbs.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline input is closed")]
    InputClosed,

    #[error("cannot {operation} a pipeline in state {state}")]
    InvalidState { operation: &'static str, state: PipelineState },

    #[error("connection is {0}, not Opened")]
    ConnectionNotOpened(ConnectionState),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InvokeMode {
    Invoke,
    InvokeAndDisconnect,
    Resume,
}

#[derive(Clone)]
struct ActiveExecution {
    invocation_id: Uuid,
    session: Arc<dyn RemoteSession>,
}

/// One command running against one connection.
pub struct CommandPipeline {
    id: Uuid,
    connection: Arc<RunspaceConnection>,
    command: CommandDefinition,
    input: Mutex<Vec<Value>>,
    input_closed: CancellationToken,
    streams: PipelineStreams,
    state: watch::Sender<PipelineStateInfo>,
    execution: Mutex<Option<ActiveExecution>>,
    stop_token: CancellationToken,
    disconnect_token: CancellationToken,
    resume_from: Mutex<Option<RemoteInvocation>>,
    detached: Mutex<Option<RemoteInvocation>>,
    disposed: AtomicBool,
}

impl fmt::Debug for CommandPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandPipeline")
            .field("id", &self.id)
            .field("connection_id", &self.connection.id())
            .field("command", &self.command.name)
            .field("state", &self.state())
            .finish()
    }
}

impl CommandPipeline {
    /// Create a pipeline with an open input stream.
    pub fn new(connection: Arc<RunspaceConnection>, command: CommandDefinition) -> Self {
        let (state, _) = watch::channel(PipelineStateInfo { state: PipelineState::NotStarted, reason: None });
        Self {
            id: Uuid::new_v4(),
            connection,
            command,
            input: Mutex::new(Vec::new()),
            input_closed: CancellationToken::new(),
            streams: PipelineStreams::new(),
            state,
            execution: Mutex::new(None),
            stop_token: CancellationToken::new(),
            disconnect_token: CancellationToken::new(),
            resume_from: Mutex::new(None),
            detached: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// Create a pipeline whose input is already complete.
    pub fn with_input(connection: Arc<RunspaceConnection>, command: CommandDefinition, input: Vec<Value>) -> Self {
        let pipeline = Self::new(connection, command);
        *pipeline.input.lock() = input;
        pipeline.input_closed.cancel();
        pipeline
    }

    /// A new handle bound to a remote execution left running by a disconnect.
    pub fn resuming(
        connection: Arc<RunspaceConnection>,
        command: CommandDefinition,
        invocation: RemoteInvocation,
    ) -> Self {
        let pipeline = Self::with_input(connection, command, Vec::new());
        *pipeline.resume_from.lock() = Some(invocation);
        pipeline
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn connection(&self) -> &Arc<RunspaceConnection> {
        &self.connection
    }

    pub fn command(&self) -> &CommandDefinition {
        &self.command
    }

    pub fn streams(&self) -> &PipelineStreams {
        &self.streams
    }

    pub fn state(&self) -> PipelineState {
        self.state.borrow().state
    }

    pub fn state_info(&self) -> PipelineStateInfo {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineStateInfo> {
        self.state.subscribe()
    }

    /// Forward records to `sink` instead of the local queues.
    pub fn set_sink(&self, sink: Arc<dyn RecordSink>) {
        self.streams.attach_sink(sink);
    }

    /// Add one input object.
    pub fn write_input(&self, value: Value) -> Result<(), PipelineError> {
        let mut input = self.input.lock();
        if self.input_closed.is_cancelled() {
            return Err(PipelineError::InputClosed);
        }
        input.push(value);
        Ok(())
    }

    /// Finish the input. The command is sent only after this.
    pub fn close_input(&self) {
        let _guard = self.input.lock();
        self.input_closed.cancel();
    }

    pub fn is_input_closed(&self) -> bool {
        self.input_closed.is_cancelled()
    }

    fn transition(&self, to: PipelineState, reason: Option<String>) -> bool {
        self.state.send_if_modified(|info| {
            if !info.state.can_transition_to(to) {
                return false;
            }
            tracing::debug!(
                pipeline_id = %self.id,
                connection_id = %self.connection.id(),
                from = %info.state,
                to = %to,
                "Pipeline state changed"
            );
            *info = PipelineStateInfo { state: to, reason };
            true
        })
    }

    /// Start the command.
    pub fn invoke(self: &Arc<Self>) -> Result<(), PipelineError> {
        self.start(InvokeMode::Invoke)
    }

    /// Start the command and disconnect as soon as the remote side accepted it.
    pub fn invoke_and_disconnect(self: &Arc<Self>) -> Result<(), PipelineError> {
        self.start(InvokeMode::InvokeAndDisconnect)
    }

    /// Resume draining a remote execution after a reconnect.
    pub fn resume(self: &Arc<Self>) -> Result<(), PipelineError> {
        self.start(InvokeMode::Resume)
    }

    fn start(self: &Arc<Self>, mode: InvokeMode) -> Result<(), PipelineError> {
        let state = self.state();
        if state != PipelineState::NotStarted {
            return Err(PipelineError::InvalidState { operation: "invoke", state });
        }

        let connection_state = self.connection.state();
        let session = match (connection_state, self.connection.session()) {
            (ConnectionState::Opened, Some(session)) => session,
            _ => {
                self.fail_unstarted(format!("connection is {connection_state}"));
                return Err(PipelineError::ConnectionNotOpened(connection_state));
            }
        };

        let invocation = if mode == InvokeMode::Resume {
            match self.resume_from.lock().take() {
                Some(invocation) => Some(invocation),
                None => return Err(PipelineError::InvalidState { operation: "resume", state }),
            }
        } else {
            None
        };

        if !self.transition(PipelineState::Running, None) {
            return Err(PipelineError::InvalidState { operation: "invoke", state: self.state() });
        }
        if mode == InvokeMode::InvokeAndDisconnect {
            self.disconnect_token.cancel();
        }

        let retry = self.connection.retry_notifications();
        tokio::spawn(Arc::clone(self).drive(session, invocation, retry));
        Ok(())
    }

    /// Mark a never-started pipeline `Failed`, reporting `reason` as a
    /// connection error record first.
    pub fn fail_unstarted(&self, reason: impl Into<String>) -> bool {
        if self.state() != PipelineState::NotStarted {
            return false;
        }
        let reason = reason.into();
        self.streams.push(PipelineRecord::Error(ErrorRecord::new(&reason).with_category(ErrorCategory::ConnectionError)));
        let failed = self.transition(PipelineState::Failed, Some(reason));
        if failed {
            self.streams.close_all();
        }
        failed
    }

    /// Mark a never-started pipeline `Stopped`. Returns false otherwise.
    pub fn stop_unstarted(&self) -> bool {
        if self.state() != PipelineState::NotStarted {
            return false;
        }
        let stopped = self.transition(PipelineState::Stopped, None);
        if stopped {
            self.streams.close_all();
        }
        stopped
    }

    /// Stop the command.
    ///
    /// No-op unless `NotStarted` or `Running`. A running command moves to
    /// `Stopping` and reaches `Stopped` once the remote side acknowledges.
    pub async fn stop(&self) {
        match self.state() {
            PipelineState::NotStarted => {
                self.stop_unstarted();
            }
            PipelineState::Running => {
                if !self.transition(PipelineState::Stopping, None) {
                    return;
                }
                self.stop_token.cancel();
                let execution = self.execution.lock().clone();
                if let Some(execution) = execution {
                    if let Err(err) = execution.session.stop(execution.invocation_id).await {
                        tracing::warn!(pipeline_id = %self.id, error = %err, "Remote stop failed");
                    }
                }
            }
            _ => {}
        }
    }

    /// Detach from the running command, leaving it running remotely.
    pub async fn disconnect(&self) -> Result<PipelineState, PipelineError> {
        let state = self.state();
        if !state.is_active() {
            return Err(PipelineError::InvalidState { operation: "disconnect", state });
        }
        self.disconnect_token.cancel();
        Ok(self.wait_for_terminal().await)
    }

    /// Disconnect as soon as the remote side accepts the command.
    ///
    /// Sticks to a pipeline that has not started yet, so a later plain
    /// `invoke` still detaches. Returns false once terminal.
    pub fn request_disconnect(&self) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        self.disconnect_token.cancel();
        true
    }

    /// Wait for a terminal state.
    pub async fn wait_for_terminal(&self) -> PipelineState {
        let mut rx = self.state.subscribe();
        let result = rx.wait_for(|info| info.state.is_terminal()).await.map(|info| info.state);
        result.unwrap_or_else(|_| self.state())
    }

    /// The remote execution left behind by a disconnect.
    pub fn take_detached(&self) -> Option<RemoteInvocation> {
        self.detached.lock().take()
    }

    /// Release the streams. Returns false if already disposed.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.streams.close_all();
        self.streams.detach_sink();
        true
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    async fn drive(
        self: Arc<Self>,
        session: Arc<dyn RemoteSession>,
        resume: Option<RemoteInvocation>,
        mut retry: broadcast::Receiver<RetryNotification>,
    ) {
        let invocation = match resume {
            Some(invocation) => invocation,
            None => match self.send(&session).await {
                Some(invocation) => invocation,
                None => return,
            },
        };

        *self.execution.lock() =
            Some(ActiveExecution { invocation_id: invocation.id, session: Arc::clone(&session) });
        if self.stop_token.is_cancelled() {
            if let Err(err) = session.stop(invocation.id).await {
                tracing::warn!(pipeline_id = %self.id, error = %err, "Remote stop failed");
            }
        }

        self.pump(invocation, &mut retry).await;
        self.execution.lock().take();
    }

    /// Wait for the input to close, then hand the command to the session.
    async fn send(&self, session: &Arc<dyn RemoteSession>) -> Option<RemoteInvocation> {
        tokio::select! {
            () = self.input_closed.cancelled() => {}
            () = self.stop_token.cancelled() => {
                self.finish(PipelineState::Stopped, None);
                return None;
            }
        }

        let input = std::mem::take(&mut *self.input.lock());
        let request = InvocationRequest { command: self.command.clone(), input };
        match session.invoke(request).await {
            Ok(invocation) => {
                tracing::debug!(pipeline_id = %self.id, invocation_id = %invocation.id, "Command accepted");
                Some(invocation)
            }
            Err(err) => {
                let reason = err.to_string();
                self.streams.push(PipelineRecord::Error(
                    ErrorRecord::new(&reason).with_category(ErrorCategory::ConnectionError),
                ));
                self.finish(PipelineState::Failed, Some(reason));
                None
            }
        }
    }

    async fn pump(&self, mut invocation: RemoteInvocation, retry: &mut broadcast::Receiver<RetryNotification>) {
        let mut retry = Some(retry);
        loop {
            tokio::select! {
                biased;
                () = self.disconnect_token.cancelled() => {
                    match self.connection.disconnect().await {
                        Ok(()) => {
                            *self.detached.lock() = Some(invocation);
                            self.finish(PipelineState::Disconnected, None);
                        }
                        Err(err) => {
                            tracing::warn!(pipeline_id = %self.id, error = %err, "Disconnect failed");
                            self.finish(PipelineState::Failed, Some(err.to_string()));
                        }
                    }
                    return;
                }
                notification = next_retry(&mut retry) => match notification {
                    Some(RetryNotification::AutoDisconnectStarting) => {
                        self.connection.note_auto_disconnect();
                        *self.detached.lock() = Some(invocation);
                        self.finish(PipelineState::Disconnected, Some("retry budget exhausted".to_string()));
                        return;
                    }
                    Some(RetryNotification::InternalErrorAbort { reason }) => {
                        self.connection.mark_broken(reason.clone());
                        self.streams.push(PipelineRecord::Error(
                            ErrorRecord::new(&reason).with_category(ErrorCategory::ConnectionError),
                        ));
                        self.finish(PipelineState::Failed, Some(reason));
                        return;
                    }
                    Some(_) => {}
                    None => retry = None,
                },
                event = invocation.events.recv() => match event {
                    Some(RemoteEvent::Record(record)) => self.streams.push(record),
                    Some(RemoteEvent::Finished(outcome)) => {
                        match outcome {
                            RemoteOutcome::Completed => self.finish(PipelineState::Completed, None),
                            RemoteOutcome::Failed(reason) => self.finish(PipelineState::Failed, Some(reason)),
                            RemoteOutcome::Stopped => self.finish(PipelineState::Stopped, None),
                        }
                        return;
                    }
                    None => {
                        self.finish(PipelineState::Failed, Some("remote execution ended without a result".to_string()));
                        return;
                    }
                },
            }
        }
    }

    fn finish(&self, state: PipelineState, reason: Option<String>) {
        if self.transition(state, reason) {
            self.streams.close_all();
        }
    }
}

/// Next retry notification, skipping lag. `None` once the channel closes.
async fn next_retry(retry: &mut Option<&mut broadcast::Receiver<RetryNotification>>) -> Option<RetryNotification> {
    let Some(rx) = retry.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(notification) => return Some(notification),
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return None,
        }
    }
}
