//! Front-end for running one command across many targets.
//!
//! Validates the invocation flags before anything runs, builds one operation
//! per target, and then either waits for the results, returns the running job,
//! or hands back the disconnected job.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use uuid::Uuid;

use super::command::CommandDefinition;
use super::config::Config;
use super::descriptor::{ConnectionDescriptor, Target, TransportOptions};
use super::error::{FanoutError, UsageError};
use super::job::{DisconnectedJob, Job, JobOptions, JobState, TargetOutcome};
use super::operation::{ExecutionOperation, OperationOutcome};
use super::record::JobRecord;
use super::retry::RetryProgressMonitor;
use super::throttle::DEFAULT_THROTTLE_LIMIT;
use crate::transport::Transport;

/// Result of a synchronous invocation.
#[derive(Debug)]
pub struct InvokeResult {
    pub job_id: Uuid,
    /// Every record, in arrival order
    pub records: Vec<JobRecord>,
    pub outcomes: Vec<TargetOutcome>,
    pub state: JobState,
    pub total_duration: Duration,
}

impl InvokeResult {
    pub fn all_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.outcome.as_ref().is_some_and(OperationOutcome::is_success))
    }

    pub fn success_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.outcome.as_ref().is_some_and(OperationOutcome::is_success)).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.outcome, Some(OperationOutcome::Failed { .. } | OperationOutcome::Broken { .. })))
            .count()
    }

    /// Success objects only.
    pub fn outputs(&self) -> Vec<&Value> {
        self.records.iter().filter_map(|r| r.record.as_output()).collect()
    }
}

/// What an invocation produced.
#[derive(Debug)]
pub enum InvokeOutcome {
    /// Waited for every target
    Completed(InvokeResult),
    /// Started in the background
    Job(Job),
    /// Left running remotely under a session name
    Disconnected { session_name: String, job: DisconnectedJob },
}

/// Builder for a multi-target invocation.
#[derive(Debug, Clone)]
pub struct InvokeCommand {
    throttle_limit: usize,
    as_job: bool,
    invoke_and_disconnect: bool,
    session_name: Option<String>,
    propagate_errors: bool,
    job_name: Option<String>,
    retry_monitor: Option<Arc<RetryProgressMonitor>>,
    options: TransportOptions,
}

impl Default for InvokeCommand {
    fn default() -> Self {
        Self {
            throttle_limit: DEFAULT_THROTTLE_LIMIT,
            as_job: false,
            invoke_and_disconnect: false,
            session_name: None,
            propagate_errors: true,
            job_name: None,
            retry_monitor: None,
            options: TransportOptions::default(),
        }
    }
}

impl InvokeCommand {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from the configured defaults.
    pub fn from_config(config: &Config) -> Self {
        Self {
            throttle_limit: config.general.throttle_limit,
            propagate_errors: config.general.propagate_errors,
            options: config.transport_options(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn throttle_limit(mut self, limit: usize) -> Self {
        self.throttle_limit = limit;
        self
    }

    #[must_use]
    pub fn as_job(mut self, as_job: bool) -> Self {
        self.as_job = as_job;
        self
    }

    #[must_use]
    pub fn invoke_and_disconnect(mut self, disconnect: bool) -> Self {
        self.invoke_and_disconnect = disconnect;
        self
    }

    #[must_use]
    pub fn session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn propagate_errors(mut self, propagate: bool) -> Self {
        self.propagate_errors = propagate;
        self
    }

    #[must_use]
    pub fn job_name(mut self, name: impl Into<String>) -> Self {
        self.job_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn retry_monitor(mut self, monitor: Arc<RetryProgressMonitor>) -> Self {
        self.retry_monitor = Some(monitor);
        self
    }

    #[must_use]
    pub fn options(mut self, options: TransportOptions) -> Self {
        self.options = options;
        self
    }

    /// Reject flag combinations that cannot run.
    pub fn validate(&self) -> Result<(), UsageError> {
        if self.throttle_limit == 0 {
            return Err(UsageError::ZeroThrottleLimit);
        }
        if self.as_job && self.invoke_and_disconnect {
            return Err(UsageError::ConflictingFlags("--as-job", "--disconnect"));
        }
        if self.session_name.is_some() && !self.invoke_and_disconnect {
            return Err(UsageError::SessionNameWithoutDisconnect);
        }
        Ok(())
    }

    /// Validate, build one operation per target, and start them as a job.
    pub fn start(
        &self,
        transport: Arc<dyn Transport>,
        targets: Vec<Target>,
        command: &CommandDefinition,
        input: Vec<Value>,
    ) -> Result<Job, FanoutError> {
        self.validate()?;
        if targets.is_empty() {
            return Err(UsageError::NoTargets.into());
        }

        let operations: Vec<Arc<ExecutionOperation>> = targets
            .into_iter()
            .map(|target| {
                let descriptor = ConnectionDescriptor::new(target).with_options(self.options.clone());
                let operation =
                    ExecutionOperation::with_input(descriptor, Arc::clone(&transport), command.clone(), input.clone());
                let operation = if self.invoke_and_disconnect { operation.invoke_and_disconnect() } else { operation };
                Arc::new(operation)
            })
            .collect();

        let mut options = JobOptions::default()
            .throttle_limit(self.throttle_limit)
            .propagate_errors(self.propagate_errors)
            .command(command.command_line());
        if let Some(monitor) = &self.retry_monitor {
            options = options.retry_monitor(Arc::clone(monitor));
        }

        let name = self.job_name.clone().unwrap_or_else(|| command.name.clone());
        let job = Job::new(name, options)?;
        tracing::debug!(
            job_id = %job.id(),
            transport = transport.name(),
            targets = operations.len(),
            as_job = self.as_job,
            disconnect = self.invoke_and_disconnect,
            "Invoking command"
        );
        job.start_operations(operations)?;
        Ok(job)
    }

    /// Run the invocation according to its flags.
    pub async fn execute(
        &self,
        transport: Arc<dyn Transport>,
        targets: Vec<Target>,
        command: &CommandDefinition,
        input: Vec<Value>,
    ) -> Result<InvokeOutcome, FanoutError> {
        let started = Instant::now();
        let job = self.start(transport, targets, command, input)?;

        if self.as_job {
            return Ok(InvokeOutcome::Job(job));
        }

        if self.invoke_and_disconnect {
            job.wait_finished().await;
            if let Some(disconnected) = job.take_disconnected() {
                let session_name = self.session_name.clone().unwrap_or_else(|| generated_session_name(job.id()));
                tracing::debug!(job_id = %job.id(), session = %session_name, targets = disconnected.len(), "Job disconnected");
                return Ok(InvokeOutcome::Disconnected { session_name, job: disconnected });
            }
        }

        let records = job.wait_and_collect().await?;
        Ok(InvokeOutcome::Completed(InvokeResult {
            job_id: job.id(),
            records,
            outcomes: job.target_outcomes(),
            state: job.state(),
            total_duration: started.elapsed(),
        }))
    }
}

fn generated_session_name(id: Uuid) -> String {
    let simple = id.simple().to_string();
    format!("Session{}", &simple[..8])
}
