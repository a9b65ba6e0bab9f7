//! Jobs aggregate many operations under one handle.
//!
//! A job hands its operations to a [`ThrottleScheduler`], merges every
//! record they produce into one arrival-ordered stream tagged with the
//! originating target, and derives its own state from the states of its
//! child pipelines.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::error::UsageError;
use super::operation::{DisconnectedOperation, ExecutionOperation, OperationOutcome};
use super::pipeline::PipelineState;
use super::record::{ErrorRecord, JobRecord, PipelineRecord, TargetLabel};
use super::retry::RetryProgressMonitor;
use super::streams::{RecordQueue, RecordSink};
use super::throttle::{ThrottleCounters, ThrottleScheduler, DEFAULT_THROTTLE_LIMIT};

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    NotStarted,
    Running,
    Completed,
    Failed,
    Stopped,
    Disconnected,
}

impl JobState {
    /// Everything except `NotStarted` and `Running`.
    pub fn is_finished(self) -> bool {
        !matches!(self, Self::NotStarted | Self::Running)
    }

    /// Derive a job's state from its children.
    ///
    /// Running while any child can still make progress; otherwise
    /// Disconnected if any child disconnected, Failed if any failed, Stopped
    /// if any stopped, and Completed when every child completed.
    pub fn derive(children: &[PipelineState]) -> Self {
        let any = |wanted: &[PipelineState]| children.iter().any(|s| wanted.contains(s));
        if any(&[PipelineState::NotStarted, PipelineState::Running, PipelineState::Stopping]) {
            Self::Running
        } else if any(&[PipelineState::Disconnected]) {
            Self::Disconnected
        } else if any(&[PipelineState::Failed]) {
            Self::Failed
        } else if any(&[PipelineState::Stopped]) {
            Self::Stopped
        } else {
            Self::Completed
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "NotStarted",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Stopped => "Stopped",
            Self::Disconnected => "Disconnected",
        };
        f.write_str(name)
    }
}

/// Errors from job verbs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("job {0} was already started")]
    AlreadyStarted(Uuid),

    #[error("{target}: {error}")]
    Terminated { target: String, error: ErrorRecord },

    #[error("job is {0}, expected Running")]
    NotRunning(JobState),

    #[error("job is {0}, expected Disconnected")]
    NotDisconnected(JobState),

    #[error("job is {0} and cannot be disposed")]
    InUse(JobState),

    #[error(transparent)]
    Usage(#[from] UsageError),
}

/// Why [`Job::wait_for_activity`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobWake {
    /// Records are ready to read
    ResultsAvailable,
    /// The job reached a final state and every record has been read
    Finished(JobState),
    /// The caller's disconnect signal fired
    DisconnectRequested,
}

/// Options for a new job.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub throttle_limit: usize,
    /// Turn an error on a single-target job into a terminating error
    pub propagate_errors: bool,
    pub command: String,
    pub retry_monitor: Option<Arc<RetryProgressMonitor>>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self { throttle_limit: DEFAULT_THROTTLE_LIMIT, propagate_errors: true, command: String::new(), retry_monitor: None }
    }
}

impl JobOptions {
    #[must_use]
    pub fn throttle_limit(mut self, limit: usize) -> Self {
        self.throttle_limit = limit;
        self
    }

    #[must_use]
    pub fn propagate_errors(mut self, propagate: bool) -> Self {
        self.propagate_errors = propagate;
        self
    }

    #[must_use]
    pub fn command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    #[must_use]
    pub fn retry_monitor(mut self, monitor: Arc<RetryProgressMonitor>) -> Self {
        self.retry_monitor = Some(monitor);
        self
    }
}

/// Summary of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: Uuid,
    pub name: String,
    pub command: String,
    pub state: JobState,
    pub targets: usize,
    pub records: u64,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobInfo {
    /// Wall time from creation to finish, if finished.
    pub fn duration(&self) -> Option<Duration> {
        self.finished_at.and_then(|end| (end - self.created_at).to_std().ok())
    }
}

/// Terminal notice for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetOutcome {
    pub target: TargetLabel,
    pub state: PipelineState,
    pub outcome: Option<OperationOutcome>,
}

struct JobInner {
    id: Uuid,
    name: String,
    options: JobOptions,
    operations: RwLock<Vec<Arc<ExecutionOperation>>>,
    results: RecordQueue<JobRecord>,
    sequence: AtomicU64,
    state: watch::Sender<JobState>,
    scheduler: Mutex<Option<ThrottleScheduler>>,
    started: AtomicBool,
    terminating: Mutex<Option<JobError>>,
    created_at: DateTime<Utc>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
    disposed: AtomicBool,
}

impl JobInner {
    fn push_record(&self, target: &TargetLabel, record: PipelineRecord) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        self.results.push(JobRecord { sequence, target: target.clone(), received_at: Utc::now(), record });
    }

    fn terminate(&self, target: &TargetLabel, error: &ErrorRecord) {
        {
            let mut terminating = self.terminating.lock();
            if terminating.is_some() {
                return;
            }
            *terminating = Some(JobError::Terminated { target: target.name.clone(), error: error.clone() });
        }
        tracing::debug!(job_id = %self.id, target = %target, error = %error, "Terminating error, stopping job");
        if let Some(scheduler) = self.scheduler.lock().as_ref() {
            scheduler.stop_all();
        }
        self.results.wake();
    }

    fn child_states(&self) -> Vec<PipelineState> {
        self.operations.read().iter().map(|op| op.pipeline().state()).collect()
    }

    fn refresh_state(&self) -> JobState {
        let mut state = JobState::derive(&self.child_states());
        if state.is_finished() && self.terminating.lock().is_some() {
            state = JobState::Failed;
        }
        self.state.send_if_modified(|current| {
            if *current == state || current.is_finished() {
                return false;
            }
            tracing::debug!(job_id = %self.id, from = %current, to = %state, "Job state changed");
            *current = state;
            true
        });
        *self.state.borrow()
    }
}

/// Forwards a pipeline's records into its job.
struct JobSink {
    job: Weak<JobInner>,
    target: TargetLabel,
    propagate: bool,
}

impl RecordSink for JobSink {
    fn push(&self, record: PipelineRecord) {
        let Some(job) = self.job.upgrade() else {
            return;
        };
        if self.propagate {
            if let PipelineRecord::Error(error) = &record {
                job.terminate(&self.target, error);
            }
        }
        job.push_record(&self.target, record);
    }
}

/// Handle to a multi-target job. Cheap to clone.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("operations", &self.inner.operations.read().len())
            .finish()
    }
}

impl Job {
    /// Create a job. A zero throttle limit is a usage error.
    pub fn new(name: impl Into<String>, options: JobOptions) -> Result<Self, UsageError> {
        if options.throttle_limit == 0 {
            return Err(UsageError::ZeroThrottleLimit);
        }
        let (state, _) = watch::channel(JobState::NotStarted);
        Ok(Self {
            inner: Arc::new(JobInner {
                id: Uuid::new_v4(),
                name: name.into(),
                options,
                operations: RwLock::new(Vec::new()),
                results: RecordQueue::new(),
                sequence: AtomicU64::new(0),
                state,
                scheduler: Mutex::new(None),
                started: AtomicBool::new(false),
                terminating: Mutex::new(None),
                created_at: Utc::now(),
                finished_at: Mutex::new(None),
                disposed: AtomicBool::new(false),
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> JobState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.inner.state.subscribe()
    }

    pub fn operations(&self) -> Vec<Arc<ExecutionOperation>> {
        self.inner.operations.read().clone()
    }

    /// Scheduler bookkeeping, once started.
    pub fn counters(&self) -> Option<ThrottleCounters> {
        self.inner.scheduler.lock().as_ref().map(ThrottleScheduler::counters)
    }

    /// The terminating error raised under the propagate-errors rule.
    pub fn terminating_error(&self) -> Option<JobError> {
        self.inner.terminating.lock().clone()
    }

    /// Hand the operations to a scheduler and start mirroring their output.
    pub fn start_operations(&self, operations: Vec<Arc<ExecutionOperation>>) -> Result<(), JobError> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(JobError::AlreadyStarted(self.inner.id));
        }

        let scheduler = ThrottleScheduler::new(self.inner.options.throttle_limit)?;
        let propagate = self.inner.options.propagate_errors && operations.len() == 1;
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        for operation in &operations {
            let sink =
                JobSink { job: Arc::downgrade(&self.inner), target: operation.label().clone(), propagate };
            operation.pipeline().set_sink(Arc::new(sink));
            operation.on_complete(done_tx.clone());
            if let Some(monitor) = &self.inner.options.retry_monitor {
                monitor.observe(operation.id(), operation.label().name.clone(), operation.connection().retry_notifications());
            }
        }
        drop(done_tx);

        *self.inner.operations.write() = operations.clone();
        *self.inner.scheduler.lock() = Some(scheduler.clone());
        self.inner.state.send_replace(JobState::Running);
        tracing::debug!(
            job_id = %self.inner.id,
            name = %self.inner.name,
            targets = operations.len(),
            throttle_limit = scheduler.limit(),
            propagate,
            "Job started"
        );

        scheduler.submit_all(operations);
        tokio::spawn(monitor(Arc::clone(&self.inner), scheduler, done_rx));
        Ok(())
    }

    /// Drain whatever is buffered without waiting.
    pub fn read_all(&self) -> Vec<JobRecord> {
        self.inner.results.read_all()
    }

    pub fn has_results(&self) -> bool {
        !self.inner.results.is_empty()
    }

    /// Wait for new records, the end of the job, or `disconnect`, whichever comes first.
    pub async fn wait_for_activity(&self, disconnect: Option<&CancellationToken>) -> JobWake {
        loop {
            let notified = self.inner.results.notified();
            if !self.inner.results.is_empty() {
                return JobWake::ResultsAvailable;
            }
            if self.inner.terminating.lock().is_some() && self.state().is_finished() {
                return JobWake::Finished(self.state());
            }
            if self.inner.results.is_closed() {
                return JobWake::Finished(self.state());
            }
            if disconnect.is_some_and(CancellationToken::is_cancelled) {
                return JobWake::DisconnectRequested;
            }

            let external = async {
                match disconnect {
                    Some(token) => token.cancelled().await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                () = notified => {}
                () = external => return JobWake::DisconnectRequested,
            }
        }
    }

    /// Collect every record until the job finishes.
    ///
    /// Under the propagate-errors rule the terminating error is returned once
    /// the job has stopped.
    pub async fn wait_and_collect(&self) -> Result<Vec<JobRecord>, JobError> {
        let mut records = Vec::new();
        loop {
            records.extend(self.read_all());
            if self.inner.terminating.lock().is_some() {
                self.wait_finished().await;
                return Err(self.terminating_error().unwrap_or(JobError::NotRunning(self.state())));
            }
            match self.wait_for_activity(None).await {
                JobWake::ResultsAvailable => {}
                JobWake::Finished(_) | JobWake::DisconnectRequested => {
                    records.extend(self.read_all());
                    if let Some(err) = self.terminating_error() {
                        return Err(err);
                    }
                    return Ok(records);
                }
            }
        }
    }

    /// Wait until the job reaches a final state.
    pub async fn wait_finished(&self) -> JobState {
        let mut rx = self.inner.state.subscribe();
        let result = rx.wait_for(|state| state.is_finished()).await.map(|state| *state);
        result.unwrap_or_else(|_| self.state())
    }

    /// Stop every operation and wait for the job to finish.
    pub async fn stop(&self) -> JobState {
        let scheduler = self.inner.scheduler.lock().clone();
        match scheduler {
            Some(scheduler) => {
                tracing::debug!(job_id = %self.inner.id, "Stopping job");
                scheduler.stop_all();
                self.wait_finished().await
            }
            None => {
                if self.inner.state.send_if_modified(|state| {
                    if *state == JobState::NotStarted {
                        *state = JobState::Stopped;
                        true
                    } else {
                        false
                    }
                }) {
                    self.inner.started.store(true, Ordering::Release);
                    self.inner.results.close();
                    *self.inner.finished_at.lock() = Some(Utc::now());
                }
                self.state()
            }
        }
    }

    /// Disconnect every running operation and return a handle that can reconnect.
    ///
    /// Operations still queued by the throttle are dropped and end `Stopped`.
    pub async fn disconnect(&self) -> Result<DisconnectedJob, JobError> {
        let state = self.state();
        if state != JobState::Running {
            return Err(JobError::NotRunning(state));
        }
        if let Some(scheduler) = self.inner.scheduler.lock().as_ref() {
            scheduler.drop_pending();
        }

        let operations = self.operations();
        futures::future::join_all(operations.iter().map(|op| op.disconnect())).await;
        self.wait_finished().await;

        self.take_disconnected().ok_or_else(|| JobError::NotDisconnected(self.state()))
    }

    /// Collect the operations left running remotely.
    ///
    /// Each operation can be taken once; `None` if there are none.
    pub fn take_disconnected(&self) -> Option<DisconnectedJob> {
        let operations: Vec<DisconnectedOperation> = self.operations().iter().filter_map(|op| op.detach()).collect();
        if operations.is_empty() {
            return None;
        }
        Some(DisconnectedJob { origin: self.clone(), operations })
    }

    /// Per-target terminal notices.
    pub fn target_outcomes(&self) -> Vec<TargetOutcome> {
        self.operations()
            .iter()
            .map(|op| TargetOutcome { target: op.label().clone(), state: op.pipeline().state(), outcome: op.outcome() })
            .collect()
    }

    pub fn info(&self) -> JobInfo {
        JobInfo {
            id: self.inner.id,
            name: self.inner.name.clone(),
            command: self.inner.options.command.clone(),
            state: self.state(),
            targets: self.inner.operations.read().len(),
            records: self.inner.sequence.load(Ordering::Relaxed),
            created_at: self.inner.created_at,
            finished_at: *self.inner.finished_at.lock(),
        }
    }

    /// Release the job once every child has been disposed.
    ///
    /// A running or disconnected job cannot be disposed.
    pub fn dispose(&self) -> Result<(), JobError> {
        let state = self.state();
        if !state.is_finished() || state == JobState::Disconnected {
            return Err(JobError::InUse(state));
        }
        if self.operations().iter().any(|op| !op.is_disposed()) {
            return Err(JobError::InUse(state));
        }
        if !self.inner.disposed.swap(true, Ordering::AcqRel) {
            self.inner.results.close();
            self.inner.scheduler.lock().take();
            tracing::debug!(job_id = %self.inner.id, "Job disposed");
        }
        Ok(())
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }
}

/// Follow completions until the scheduler is done, then settle the job.
async fn monitor(
    job: Arc<JobInner>,
    scheduler: ThrottleScheduler,
    mut done: mpsc::UnboundedReceiver<super::operation::OperationCompletion>,
) {
    let finished = scheduler.wait_complete();
    tokio::pin!(finished);
    loop {
        tokio::select! {
            completion = done.recv() => match completion {
                Some(completion) => {
                    tracing::debug!(job_id = %job.id, operation_id = %completion.operation_id, outcome = %completion.outcome, "Child finished");
                    job.refresh_state();
                }
                None => {
                    (&mut finished).await;
                    break;
                }
            },
            _ = &mut finished => break,
        }
    }

    let state = job.refresh_state();
    *job.finished_at.lock() = Some(Utc::now());
    if let Some(monitor) = &job.options.retry_monitor {
        for operation in job.operations.read().iter() {
            monitor.stop(operation.id());
        }
    }
    job.results.close();
    tracing::debug!(job_id = %job.id, state = %state, records = job.sequence.load(Ordering::Relaxed), "Job finished");
}

/// Operations detached from a job, ready to reconnect.
///
/// Holds the original job so it outlives the detached connections.
#[derive(Debug)]
pub struct DisconnectedJob {
    origin: Job,
    operations: Vec<DisconnectedOperation>,
}

impl DisconnectedJob {
    pub fn id(&self) -> Uuid {
        self.origin.id()
    }

    pub fn name(&self) -> &str {
        self.origin.name()
    }

    /// The job the operations were detached from.
    pub fn origin(&self) -> &Job {
        &self.origin
    }

    /// Targets still running remotely.
    pub fn targets(&self) -> Vec<String> {
        self.operations.iter().map(|op| op.label.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Reconnect every operation and resume draining in a new job.
    pub fn connect(self) -> Result<Job, JobError> {
        let options = self.origin.inner.options.clone();
        let job = Job::new(self.origin.name(), options)?;
        let operations = self.operations.into_iter().map(|op| Arc::new(ExecutionOperation::resume(op))).collect();
        tracing::debug!(origin = %self.origin.id(), job_id = %job.id(), "Reconnecting disconnected job");
        job.start_operations(operations)?;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::CommandDefinition;
    use crate::core::descriptor::{ConnectionDescriptor, Target};
    use crate::transport::{HostScript, ScriptStep, SimulatedTransport};

    fn job_with(transport: &SimulatedTransport, hosts: &[&str], options: JobOptions) -> Job {
        let job = Job::new("test", options).unwrap();
        let operations = hosts
            .iter()
            .map(|host| {
                Arc::new(ExecutionOperation::new(
                    ConnectionDescriptor::new(Target::computer(*host)),
                    Arc::new(transport.clone()),
                    CommandDefinition::script("report"),
                ))
            })
            .collect();
        job.start_operations(operations).unwrap();
        job
    }

    #[test]
    fn test_derive_state() {
        use PipelineState as P;
        assert_eq!(JobState::derive(&[]), JobState::Completed);
        assert_eq!(JobState::derive(&[P::Completed, P::Running]), JobState::Running);
        assert_eq!(JobState::derive(&[P::Completed, P::NotStarted]), JobState::Running);
        assert_eq!(JobState::derive(&[P::Completed, P::Disconnected, P::Failed]), JobState::Disconnected);
        assert_eq!(JobState::derive(&[P::Completed, P::Failed, P::Stopped]), JobState::Failed);
        assert_eq!(JobState::derive(&[P::Completed, P::Stopped]), JobState::Stopped);
        assert_eq!(JobState::derive(&[P::Completed, P::Completed]), JobState::Completed);
    }

    #[test]
    fn test_zero_throttle_rejected() {
        let err = Job::new("bad", JobOptions::default().throttle_limit(0)).unwrap_err();
        assert_eq!(err, UsageError::ZeroThrottleLimit);
    }

    #[tokio::test]
    async fn test_records_tagged_with_target() {
        let transport = SimulatedTransport::new()
            .with_host("a", HostScript::new().step(ScriptStep::Emit(PipelineRecord::output("from a"))))
            .with_host("b", HostScript::new().step(ScriptStep::Emit(PipelineRecord::output("from b"))));
        let job = job_with(&transport, &["a", "b"], JobOptions::default());

        let records = job.wait_and_collect().await.unwrap();
        assert_eq!(records.len(), 2);
        for record in &records {
            let expected = format!("from {}", record.target.name);
            assert_eq!(record.record.as_output().and_then(|v| v.as_str()), Some(expected.as_str()));
        }
        assert_eq!(job.state(), JobState::Completed);
        assert!(job.info().finished_at.is_some());
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let transport = SimulatedTransport::new();
        let job = job_with(&transport, &["a"], JobOptions::default());
        assert!(matches!(job.start_operations(Vec::new()), Err(JobError::AlreadyStarted(_))));
    }

    #[tokio::test]
    async fn test_stop_unstarted_job() {
        let job = Job::new("idle", JobOptions::default()).unwrap();
        assert_eq!(job.stop().await, JobState::Stopped);
        assert_eq!(job.wait_for_activity(None).await, JobWake::Finished(JobState::Stopped));
    }

    #[tokio::test]
    async fn test_external_disconnect_signal_wakes_waiter() {
        let transport = SimulatedTransport::new().with_host("a", HostScript::new().step(ScriptStep::WaitForStop));
        let job = job_with(&transport, &["a"], JobOptions::default());
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(job.wait_for_activity(Some(&token)).await, JobWake::DisconnectRequested);
        job.stop().await;
    }

    #[tokio::test]
    async fn test_dispose_requires_finished_job() {
        let transport = SimulatedTransport::new().with_host("a", HostScript::new().step(ScriptStep::WaitForStop));
        let job = job_with(&transport, &["a"], JobOptions::default());
        assert!(matches!(job.dispose(), Err(JobError::InUse(JobState::Running))));

        assert_eq!(job.stop().await, JobState::Stopped);
        job.dispose().unwrap();
        assert!(job.is_disposed());
    }
}
