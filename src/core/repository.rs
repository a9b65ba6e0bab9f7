//! Registry of jobs started in the background.
//!
//! Jobs are registered when started and can be queried later by id or name.
//! Disconnected jobs are parked under a session name until a caller takes them
//! back to reconnect.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::job::{DisconnectedJob, Job, JobInfo, JobState};

/// Errors from the job repository.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RepositoryError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("job {id} is {state} and cannot be removed")]
    StillRunning { id: Uuid, state: JobState },

    #[error("no disconnected session named '{0}'")]
    SessionNotFound(String),
}

/// Jobs by id, plus disconnected jobs by session name.
#[derive(Default)]
pub struct JobRepository {
    jobs: RwLock<HashMap<Uuid, Job>>,
    sessions: RwLock<HashMap<String, DisconnectedJob>>,
}

impl std::fmt::Debug for JobRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRepository")
            .field("jobs", &self.jobs.read().len())
            .field("sessions", &self.sessions.read().len())
            .finish()
    }
}

impl JobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job. Adding the same job twice keeps one entry.
    pub fn add(&self, job: Job) -> Uuid {
        let id = job.id();
        tracing::debug!(job_id = %id, name = %job.name(), "Job registered");
        self.jobs.write().insert(id, job);
        id
    }

    pub fn get(&self, id: Uuid) -> Option<Job> {
        self.jobs.read().get(&id).cloned()
    }

    /// The most recently created job with this name.
    pub fn get_by_name(&self, name: &str) -> Option<Job> {
        self.jobs
            .read()
            .values()
            .filter(|job| job.name() == name)
            .max_by_key(|job| job.info().created_at)
            .cloned()
    }

    /// Summaries of every job, oldest first.
    pub fn list(&self) -> Vec<JobInfo> {
        let mut infos: Vec<JobInfo> = self.jobs.read().values().map(Job::info).collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    pub fn list_running(&self) -> Vec<JobInfo> {
        self.list().into_iter().filter(|info| !info.state.is_finished()).collect()
    }

    pub fn running_count(&self) -> usize {
        self.jobs.read().values().filter(|job| !job.state().is_finished()).count()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }

    /// Remove a finished job and dispose it if nothing still references it.
    pub fn remove(&self, id: Uuid) -> Result<Job, RepositoryError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get(&id).ok_or(RepositoryError::NotFound(id))?;
        let state = job.state();
        if !state.is_finished() {
            return Err(RepositoryError::StillRunning { id, state });
        }
        let job = jobs.remove(&id).ok_or(RepositoryError::NotFound(id))?;
        drop(jobs);

        if let Err(err) = job.dispose() {
            tracing::debug!(job_id = %id, error = %err, "Removed job left undisposed");
        }
        Ok(job)
    }

    /// Park a disconnected job under a session name.
    ///
    /// Returns the job previously parked under that name, if any.
    pub fn park(&self, session: impl Into<String>, job: DisconnectedJob) -> Option<DisconnectedJob> {
        let session = session.into();
        tracing::debug!(session = %session, job_id = %job.id(), targets = job.len(), "Parked disconnected job");
        let previous = self.sessions.write().insert(session.clone(), job);
        if previous.is_some() {
            tracing::warn!(session = %session, "Replaced a disconnected job with the same session name");
        }
        previous
    }

    /// Take a parked job back so it can be reconnected.
    pub fn take_disconnected(&self, session: &str) -> Result<DisconnectedJob, RepositoryError> {
        self.sessions.write().remove(session).ok_or_else(|| RepositoryError::SessionNotFound(session.to_string()))
    }

    /// Names of parked sessions, sorted.
    pub fn sessions(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop finished jobs that ended more than `retention` ago.
    ///
    /// Disconnected jobs are kept. Returns the number removed.
    pub fn cleanup(&self, retention: Duration) -> usize {
        let Ok(retention) = chrono::Duration::from_std(retention) else {
            return 0;
        };
        let now = Utc::now();
        let expired: Vec<Uuid> = self
            .jobs
            .read()
            .values()
            .filter(|job| {
                let info = job.info();
                info.state.is_finished()
                    && info.state != JobState::Disconnected
                    && info.finished_at.is_some_and(|at| now - at > retention)
            })
            .map(Job::id)
            .collect();

        expired.into_iter().filter(|id| self.remove(*id).is_ok()).count()
    }
}
