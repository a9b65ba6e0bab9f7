//! Two-phase execution unit.
//!
//! An `ExecutionOperation` owns one connection and one pipeline. Starting it
//! opens the connection, invokes the pipeline once opened, closes the
//! connection when the pipeline finishes, and then completes. Completion is
//! published exactly once, after which both children are disposed (pipeline
//! first) unless the operation ended `Disconnected`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::command::CommandDefinition;
use super::connection::{ConnectionState, RunspaceConnection};
use super::descriptor::ConnectionDescriptor;
use super::pipeline::{CommandPipeline, PipelineState};
use super::record::TargetLabel;
use crate::transport::{RemoteInvocation, Transport};

/// How an operation ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationOutcome {
    Completed,
    Failed { reason: String },
    Stopped,
    Disconnected,
    /// The connection failed; the command may never have run
    Broken { reason: String },
}

impl OperationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for OperationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("Completed"),
            Self::Failed { reason } => write!(f, "Failed: {reason}"),
            Self::Stopped => f.write_str("Stopped"),
            Self::Disconnected => f.write_str("Disconnected"),
            Self::Broken { reason } => write!(f, "Broken: {reason}"),
        }
    }
}

/// The completion notice sent to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationCompletion {
    pub operation_id: Uuid,
    pub outcome: OperationOutcome,
}

/// How the pipeline is started once the connection is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    Invoke,
    InvokeAndDisconnect,
    /// Reconnect and drain an execution left running by a disconnect
    Resume,
}

/// What survives a disconnect: enough to reconnect and keep draining.
#[derive(Debug)]
pub struct DisconnectedOperation {
    pub label: TargetLabel,
    pub connection: Arc<RunspaceConnection>,
    pub command: CommandDefinition,
    pub invocation: RemoteInvocation,
}

/// One target's connection plus command, managed as a unit.
pub struct ExecutionOperation {
    id: Uuid,
    label: TargetLabel,
    connection: Arc<RunspaceConnection>,
    pipeline: Arc<CommandPipeline>,
    mode: StartMode,
    started: AtomicBool,
    completed: AtomicBool,
    disposed: AtomicBool,
    outcome: watch::Sender<Option<OperationOutcome>>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<OperationCompletion>>>,
}

impl fmt::Debug for ExecutionOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionOperation")
            .field("id", &self.id)
            .field("target", &self.label.name)
            .field("connection", &self.connection.state())
            .field("pipeline", &self.pipeline.state())
            .field("outcome", &*self.outcome.borrow())
            .finish()
    }
}

impl ExecutionOperation {
    /// Build an operation with no input.
    pub fn new(descriptor: ConnectionDescriptor, transport: Arc<dyn Transport>, command: CommandDefinition) -> Self {
        Self::with_input(descriptor, transport, command, Vec::new())
    }

    /// Build an operation whose input is already complete.
    pub fn with_input(
        descriptor: ConnectionDescriptor,
        transport: Arc<dyn Transport>,
        command: CommandDefinition,
        input: Vec<Value>,
    ) -> Self {
        let connection = Arc::new(RunspaceConnection::new(descriptor, transport));
        let pipeline = Arc::new(CommandPipeline::with_input(Arc::clone(&connection), command, input));
        Self::assemble(connection, pipeline, StartMode::Invoke)
    }

    /// Build an operation whose input stays open until the caller closes it.
    pub fn with_open_input(
        descriptor: ConnectionDescriptor,
        transport: Arc<dyn Transport>,
        command: CommandDefinition,
    ) -> Self {
        let connection = Arc::new(RunspaceConnection::new(descriptor, transport));
        let pipeline = Arc::new(CommandPipeline::new(Arc::clone(&connection), command));
        Self::assemble(connection, pipeline, StartMode::Invoke)
    }

    /// Reconnect a disconnected operation under a new local handle.
    pub fn resume(disconnected: DisconnectedOperation) -> Self {
        let DisconnectedOperation { label, connection, command, invocation } = disconnected;
        let pipeline = Arc::new(CommandPipeline::resuming(Arc::clone(&connection), command, invocation));
        let mut operation = Self::assemble(connection, pipeline, StartMode::Resume);
        operation.label.name = label.name;
        operation
    }

    fn assemble(connection: Arc<RunspaceConnection>, pipeline: Arc<CommandPipeline>, mode: StartMode) -> Self {
        let id = Uuid::new_v4();
        let label =
            TargetLabel { operation_id: id, connection_id: connection.id(), name: connection.descriptor().display_name() };
        let (outcome, _) = watch::channel(None);
        Self {
            id,
            label,
            connection,
            pipeline,
            mode,
            started: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            outcome,
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Invoke and disconnect once the command is accepted.
    #[must_use]
    pub fn invoke_and_disconnect(mut self) -> Self {
        if self.mode == StartMode::Invoke {
            self.mode = StartMode::InvokeAndDisconnect;
        }
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn label(&self) -> &TargetLabel {
        &self.label
    }

    pub fn connection(&self) -> &Arc<RunspaceConnection> {
        &self.connection
    }

    pub fn pipeline(&self) -> &Arc<CommandPipeline> {
        &self.pipeline
    }

    pub fn mode(&self) -> StartMode {
        self.mode
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// The outcome, once complete.
    pub fn outcome(&self) -> Option<OperationOutcome> {
        self.outcome.borrow().clone()
    }

    /// Register for the completion notice.
    ///
    /// Sent exactly once; immediately if the operation already completed.
    pub fn on_complete(&self, listener: mpsc::UnboundedSender<OperationCompletion>) {
        let mut listeners = self.listeners.lock();
        if let Some(outcome) = self.outcome() {
            let _ = listener.send(OperationCompletion { operation_id: self.id, outcome });
            return;
        }
        listeners.push(listener);
    }

    /// Begin the operation. Later calls do nothing.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(operation_id = %self.id, target = %self.label, mode = ?self.mode, "Operation starting");
        tokio::spawn(Arc::clone(self).run());
    }

    /// Wait for completion.
    pub async fn wait(&self) -> OperationOutcome {
        let mut rx = self.outcome.subscribe();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return self.outcome().unwrap_or(OperationOutcome::Stopped);
            }
        }
    }

    /// Stop whichever phase is active.
    ///
    /// Safe at any time: before start it completes the operation as
    /// `Stopped`, after completion it does nothing.
    pub async fn stop(&self) {
        if self.is_completed() {
            return;
        }
        if self.cancel_pending() {
            return;
        }

        let connection = self.connection.state();
        let connecting = connection == ConnectionState::BeforeOpen || connection.is_connecting();
        if connecting {
            self.connection.abort_open();
        }

        match self.pipeline.state() {
            PipelineState::NotStarted | PipelineState::Running => self.pipeline.stop().await,
            PipelineState::Stopping => {}
            state if !connecting => {
                if state != PipelineState::Disconnected {
                    self.connection.close().await;
                }
                self.complete(self.settled_outcome());
            }
            _ => {}
        }
    }

    /// Complete a never-started operation as `Stopped` without running it.
    ///
    /// Returns false if the operation had already started.
    pub fn cancel_pending(&self) -> bool {
        if self.started.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.pipeline.stop_unstarted();
        self.connection.close_unopened();
        self.complete(OperationOutcome::Stopped);
        true
    }

    /// Detach from the running command, leaving it running remotely.
    ///
    /// An operation still connecting disconnects right after its command is
    /// accepted.
    pub async fn disconnect(&self) -> bool {
        if !self.pipeline.request_disconnect() {
            return false;
        }
        if self.pipeline.state().is_active() {
            return self.pipeline.wait_for_terminal().await == PipelineState::Disconnected;
        }
        false
    }

    /// Hand over a disconnected operation so it can be resumed.
    pub fn detach(&self) -> Option<DisconnectedOperation> {
        if self.outcome() != Some(OperationOutcome::Disconnected) {
            return None;
        }
        let invocation = self.pipeline.take_detached()?;
        Some(DisconnectedOperation {
            label: self.label.clone(),
            connection: Arc::clone(&self.connection),
            command: self.pipeline.command().clone(),
            invocation,
        })
    }

    async fn run(self: Arc<Self>) {
        let opened = match self.mode {
            StartMode::Resume => match self.connection.reconnect().await {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(operation_id = %self.id, target = %self.label, error = %err, "Reconnect failed");
                    false
                }
            },
            StartMode::Invoke | StartMode::InvokeAndDisconnect => {
                self.connection.open().await == ConnectionState::Opened
            }
        };

        if !opened {
            let info = self.connection.state_info();
            let reason = info.reason.unwrap_or_else(|| format!("connection is {}", info.state));
            let outcome = if info.state == ConnectionState::Closed {
                self.pipeline.stop_unstarted();
                OperationOutcome::Stopped
            } else {
                self.pipeline.fail_unstarted(reason.clone());
                OperationOutcome::Broken { reason }
            };
            self.complete(outcome);
            return;
        }

        let invoked = match self.mode {
            StartMode::Resume => self.pipeline.resume(),
            StartMode::InvokeAndDisconnect => self.pipeline.invoke_and_disconnect(),
            StartMode::Invoke => self.pipeline.invoke(),
        };
        if let Err(err) = invoked {
            tracing::debug!(operation_id = %self.id, error = %err, "Pipeline not invoked");
        }

        let state = self.pipeline.wait_for_terminal().await;
        if state != PipelineState::Disconnected {
            self.connection.close().await;
        }
        self.complete(self.settled_outcome());
    }

    /// Outcome derived from the children once the pipeline is terminal.
    fn settled_outcome(&self) -> OperationOutcome {
        let pipeline = self.pipeline.state_info();
        match pipeline.state {
            PipelineState::Completed => OperationOutcome::Completed,
            PipelineState::Stopped => OperationOutcome::Stopped,
            PipelineState::Disconnected => OperationOutcome::Disconnected,
            PipelineState::Failed => {
                let reason = pipeline.reason.unwrap_or_else(|| "command failed".to_string());
                if self.connection.state() == ConnectionState::Broken {
                    OperationOutcome::Broken { reason }
                } else {
                    OperationOutcome::Failed { reason }
                }
            }
            PipelineState::NotStarted | PipelineState::Running | PipelineState::Stopping => match self.connection.state() {
                ConnectionState::Broken => OperationOutcome::Broken {
                    reason: self.connection.state_info().reason.unwrap_or_else(|| "connection broken".to_string()),
                },
                _ => OperationOutcome::Stopped,
            },
        }
    }

    /// Publish the outcome. Only the first call has any effect.
    fn complete(&self, outcome: OperationOutcome) -> bool {
        if self.completed.swap(true, Ordering::AcqRel) {
            return false;
        }

        if outcome != OperationOutcome::Disconnected {
            self.pipeline.dispose();
            self.connection.dispose();
            self.disposed.store(true, Ordering::Release);
        }

        tracing::debug!(operation_id = %self.id, target = %self.label, outcome = %outcome, "Operation complete");
        self.outcome.send_replace(Some(outcome.clone()));

        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in listeners {
            let _ = listener.send(OperationCompletion { operation_id: self.id, outcome: outcome.clone() });
        }
        true
    }
}
