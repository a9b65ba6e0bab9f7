//! Scripted in-memory transport.
//!
//! Each host name maps to a [`HostScript`] describing how opening behaves and
//! what a command does once invoked. Used by the tests, the benchmarks and the
//! CLI's `--simulate` mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    InvocationRequest, RemoteInvocation, RemoteOutcome, RemoteOutputWriter, RemoteSession, RetryNotification,
    Transport, TransportError,
};
use crate::core::descriptor::{ConnectionDescriptor, TransportOptions};
use crate::core::record::PipelineRecord;

/// How opening a session behaves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OpenBehavior {
    #[default]
    Succeed,
    /// Succeed after a delay
    Delay(Duration),
    Fail(String),
    /// Never finish opening
    Hang,
}

/// One step of a simulated command.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    Emit(PipelineRecord),
    /// Emit outputs `0..n`
    EmitSequence(u64),
    /// Emit `"<host>: <command line>"`
    EchoCommand,
    Sleep(Duration),
    /// Run until stopped
    WaitForStop,
    /// Drop the network for `outage`. Without `recovers` the retry budget
    /// runs out and the session auto-disconnects while the command keeps going.
    NetworkFailure { max_retry_seconds: u32, outage: Duration, recovers: bool },
    /// Abort the session with an internal transport error. The execution
    /// produces nothing more until the session is released.
    InternalError(String),
}

/// Behaviour of one simulated host.
#[derive(Debug, Clone, PartialEq)]
pub struct HostScript {
    open: OpenBehavior,
    steps: Vec<ScriptStep>,
    outcome: RemoteOutcome,
    reconnect_fails: bool,
    echo_input: bool,
}

impl Default for HostScript {
    fn default() -> Self {
        Self {
            open: OpenBehavior::Succeed,
            steps: Vec::new(),
            outcome: RemoteOutcome::Completed,
            reconnect_fails: false,
            echo_input: false,
        }
    }
}

impl HostScript {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn open(mut self, behavior: OpenBehavior) -> Self {
        self.open = behavior;
        self
    }

    #[must_use]
    pub fn step(mut self, step: ScriptStep) -> Self {
        self.steps.push(step);
        self
    }

    /// How the command ends when it runs to the last step.
    #[must_use]
    pub fn outcome(mut self, outcome: RemoteOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    #[must_use]
    pub fn reconnect_fails(mut self) -> Self {
        self.reconnect_fails = true;
        self
    }

    /// Emit every input value as output before the steps run.
    #[must_use]
    pub fn echo_input(mut self) -> Self {
        self.echo_input = true;
        self
    }
}

#[derive(Debug, Default)]
struct StatsInner {
    opened: AtomicUsize,
    invoked: AtomicUsize,
    live_sessions: AtomicUsize,
    peak_sessions: AtomicUsize,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

/// Counters shared by every clone of a transport.
#[derive(Debug, Clone, Default)]
pub struct SimulationStats {
    inner: Arc<StatsInner>,
}

impl SimulationStats {
    /// Sessions successfully opened.
    pub fn opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    /// Commands accepted.
    pub fn invoked(&self) -> usize {
        self.inner.invoked.load(Ordering::SeqCst)
    }

    /// Sessions opening or open and not yet closed.
    pub fn live_sessions(&self) -> usize {
        self.inner.live_sessions.load(Ordering::SeqCst)
    }

    pub fn peak_sessions(&self) -> usize {
        self.inner.peak_sessions.load(Ordering::SeqCst)
    }

    /// Commands currently executing.
    pub fn running(&self) -> usize {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn peak_running(&self) -> usize {
        self.inner.peak_running.load(Ordering::SeqCst)
    }

    fn session_started(&self) {
        let live = self.inner.live_sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak_sessions.fetch_max(live, Ordering::SeqCst);
    }

    fn session_ended(&self) {
        self.inner.live_sessions.fetch_sub(1, Ordering::SeqCst);
    }

    fn execution_started(&self) {
        self.inner.invoked.fetch_add(1, Ordering::SeqCst);
        let running = self.inner.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak_running.fetch_max(running, Ordering::SeqCst);
    }

    fn execution_ended(&self) {
        self.inner.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Transport over scripted hosts. Unknown hosts use the default script.
#[derive(Debug, Clone, Default)]
pub struct SimulatedTransport {
    hosts: Arc<HashMap<String, HostScript>>,
    default: HostScript,
    stats: SimulationStats,
}

impl SimulatedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>, script: HostScript) -> Self {
        Arc::make_mut(&mut self.hosts).insert(host.into(), script);
        self
    }

    #[must_use]
    pub fn with_default(mut self, script: HostScript) -> Self {
        self.default = script;
        self
    }

    pub fn stats(&self) -> SimulationStats {
        self.stats.clone()
    }

    fn script_for(&self, host: &str) -> &HostScript {
        self.hosts.get(host).unwrap_or(&self.default)
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn open(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<dyn RemoteSession>, TransportError> {
        let host = descriptor.display_name();
        let script = self.script_for(&host).clone();

        self.stats.session_started();
        let guard = OpenGuard { stats: &self.stats, armed: true };
        match &script.open {
            OpenBehavior::Succeed => {}
            OpenBehavior::Delay(delay) => tokio::time::sleep(*delay).await,
            OpenBehavior::Fail(reason) => return Err(TransportError::Unreachable(format!("{host}: {reason}"))),
            OpenBehavior::Hang => std::future::pending::<()>().await,
        }
        guard.disarm();
        self.stats.inner.opened.fetch_add(1, Ordering::SeqCst);

        let (retry, _) = broadcast::channel(64);
        tracing::debug!(host = %host, "Simulated session opened");
        Ok(Arc::new(SimulatedSession {
            id: Uuid::new_v4(),
            host,
            script,
            options: descriptor.options.clone(),
            stats: self.stats.clone(),
            executions: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            retry,
        }))
    }
}

/// Releases the live-session slot when an open fails or is abandoned.
struct OpenGuard<'a> {
    stats: &'a SimulationStats,
    armed: bool,
}

impl OpenGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for OpenGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.stats.session_ended();
        }
    }
}

struct SimulatedSession {
    id: Uuid,
    host: String,
    script: HostScript,
    options: TransportOptions,
    stats: SimulationStats,
    executions: Mutex<HashMap<Uuid, CancellationToken>>,
    connected: AtomicBool,
    closed: AtomicBool,
    retry: broadcast::Sender<RetryNotification>,
}

impl SimulatedSession {
    /// Cancel every execution and free the session slot. Runs once.
    fn release(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for token in self.executions.lock().values() {
            token.cancel();
        }
        self.stats.session_ended();
    }

    fn ensure_available(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) || !self.connected.load(Ordering::Acquire) {
            return Err(TransportError::SessionUnavailable(self.id));
        }
        Ok(())
    }
}

impl Drop for SimulatedSession {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl RemoteSession for SimulatedSession {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn invoke(&self, request: InvocationRequest) -> Result<RemoteInvocation, TransportError> {
        self.ensure_available()?;

        let (writer, invocation) =
            RemoteOutputWriter::channel(self.options.output_buffer_capacity, self.options.buffering_mode);
        let stop = CancellationToken::new();
        self.executions.lock().insert(invocation.id, stop.clone());
        self.stats.execution_started();

        let run = Execution {
            host: self.host.clone(),
            script: self.script.clone(),
            request,
            writer,
            stop,
            stats: self.stats.clone(),
            retry: self.retry.clone(),
        };
        tokio::spawn(run.run());
        Ok(invocation)
    }

    async fn stop(&self, invocation: Uuid) -> Result<(), TransportError> {
        let executions = self.executions.lock();
        let token = executions.get(&invocation).ok_or(TransportError::ExecutionNotFound(invocation))?;
        token.cancel();
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.ensure_available()?;
        self.connected.store(false, Ordering::Release);
        tracing::debug!(host = %self.host, "Simulated session disconnected");
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::SessionUnavailable(self.id));
        }
        if self.script.reconnect_fails {
            return Err(TransportError::Unreachable(format!("{}: reconnect refused", self.host)));
        }
        self.connected.store(true, Ordering::Release);
        tracing::debug!(host = %self.host, "Simulated session reconnected");
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.release();
        Ok(())
    }

    fn retry_notifications(&self) -> broadcast::Receiver<RetryNotification> {
        self.retry.subscribe()
    }
}

struct Execution {
    host: String,
    script: HostScript,
    request: InvocationRequest,
    writer: RemoteOutputWriter,
    stop: CancellationToken,
    stats: SimulationStats,
    retry: broadcast::Sender<RetryNotification>,
}

impl Execution {
    async fn run(self) {
        let outcome = self.steps().await;
        tokio::select! {
            () = self.writer.finish(outcome) => {}
            () = self.stop.cancelled(), if !self.stop.is_cancelled() => {}
        }
        self.stats.execution_ended();
    }

    async fn steps(&self) -> RemoteOutcome {
        if self.script.echo_input {
            for value in &self.request.input {
                if !self.emit(PipelineRecord::Output(value.clone())).await {
                    return RemoteOutcome::Stopped;
                }
            }
        }

        for step in &self.script.steps {
            let finished = match step {
                ScriptStep::Emit(record) => !self.emit(record.clone()).await,
                ScriptStep::EmitSequence(count) => {
                    let mut stopped = false;
                    for i in 0..*count {
                        if !self.emit(PipelineRecord::output(i)).await {
                            stopped = true;
                            break;
                        }
                    }
                    stopped
                }
                ScriptStep::EchoCommand => {
                    let line = format!("{}: {}", self.host, self.request.command.command_line());
                    !self.emit(PipelineRecord::output(line)).await
                }
                ScriptStep::Sleep(duration) => !self.pause(*duration).await,
                ScriptStep::WaitForStop => {
                    self.stop.cancelled().await;
                    true
                }
                ScriptStep::NetworkFailure { max_retry_seconds, outage, recovers } => {
                    let _ = self.retry.send(RetryNotification::NetworkFailureDetected {
                        max_retry_seconds: *max_retry_seconds,
                    });
                    if !self.pause(*outage).await {
                        true
                    } else {
                        let notification = if *recovers {
                            RetryNotification::ConnectionRetrySucceeded
                        } else {
                            RetryNotification::AutoDisconnectStarting
                        };
                        let _ = self.retry.send(notification);
                        false
                    }
                }
                ScriptStep::InternalError(reason) => {
                    let _ = self.retry.send(RetryNotification::InternalErrorAbort { reason: reason.clone() });
                    self.stop.cancelled().await;
                    return RemoteOutcome::Stopped;
                }
            };
            if finished {
                return RemoteOutcome::Stopped;
            }
        }
        self.script.outcome.clone()
    }

    /// Write one record unless stopped first. False once stopped.
    async fn emit(&self, record: PipelineRecord) -> bool {
        if self.stop.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            () = self.stop.cancelled() => false,
            written = self.writer.write(record) => written || !self.stop.is_cancelled(),
        }
    }

    /// Sleep unless stopped first. False once stopped.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            () = self.stop.cancelled() => false,
            () = tokio::time::sleep(duration) => true,
        }
    }
}
