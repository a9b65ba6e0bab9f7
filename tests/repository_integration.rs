//! Repository Integration Tests
//!
//! Background jobs and named disconnected sessions kept in a job repository.

use std::sync::Arc;
use std::time::Duration;

use fanout::core::{
    CommandDefinition, InvokeCommand, InvokeOutcome, JobRepository, JobState, RepositoryError, Target,
};
use fanout::transport::{HostScript, ScriptStep, SimulatedTransport};

fn hosts(names: &[&str]) -> Vec<Target> {
    names.iter().map(|name| Target::computer(*name)).collect()
}

// ============================================================================
// Background Jobs
// ============================================================================

mod background_jobs {
    use super::*;

    #[tokio::test]
    async fn test_as_job_registers_and_finishes() {
        let transport =
            SimulatedTransport::new().with_default(HostScript::new().step(ScriptStep::Sleep(Duration::from_millis(30))));
        let repository = JobRepository::new();

        let outcome = InvokeCommand::new()
            .as_job(true)
            .job_name("patch-check")
            .execute(Arc::new(transport), hosts(&["web01", "web02"]), &CommandDefinition::script("uname -r"), Vec::new())
            .await
            .unwrap();
        let InvokeOutcome::Job(job) = outcome else {
            panic!("expected a background job");
        };
        let id = repository.add(job.clone());

        assert_eq!(repository.running_count(), 1);
        assert!(matches!(repository.remove(id), Err(RepositoryError::StillRunning { .. })));

        assert_eq!(job.wait_finished().await, JobState::Completed);
        assert_eq!(repository.get_by_name("patch-check").unwrap().id(), id);
        assert!(repository.list_running().is_empty());

        let info = &repository.list()[0];
        assert_eq!(info.targets, 2);
        assert_eq!(info.command, "uname -r");

        let removed = repository.remove(id).unwrap();
        assert!(removed.is_disposed());
        assert!(repository.is_empty());
    }

    #[tokio::test]
    async fn test_list_is_ordered_by_creation() {
        let transport = SimulatedTransport::new();
        let repository = JobRepository::new();

        for name in ["first", "second", "third"] {
            let job = InvokeCommand::new()
                .job_name(name)
                .start(Arc::new(transport.clone()), hosts(&["web01"]), &CommandDefinition::script("true"), Vec::new())
                .unwrap();
            repository.add(job);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let names: Vec<String> = repository.list().into_iter().map(|info| info.name).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
    }
}

// ============================================================================
// Disconnected Sessions
// ============================================================================

mod sessions {
    use super::*;

    fn long_running() -> SimulatedTransport {
        SimulatedTransport::new().with_default(
            HostScript::new().step(ScriptStep::Sleep(Duration::from_millis(50))).step(ScriptStep::EmitSequence(3)),
        )
    }

    #[tokio::test]
    async fn test_park_and_resume_session() {
        let repository = JobRepository::new();
        let outcome = InvokeCommand::new()
            .invoke_and_disconnect(true)
            .session_name("nightly")
            .execute(Arc::new(long_running()), hosts(&["web01", "web02"]), &CommandDefinition::script("backup"), Vec::new())
            .await
            .unwrap();
        let InvokeOutcome::Disconnected { session_name, job } = outcome else {
            panic!("expected a disconnected job");
        };

        repository.add(job.origin().clone());
        assert!(repository.park(session_name, job).is_none());
        assert_eq!(repository.sessions(), vec!["nightly".to_string()]);

        // A disconnected job stays through cleanup.
        assert_eq!(repository.cleanup(Duration::ZERO), 0);

        let parked = repository.take_disconnected("nightly").unwrap();
        let resumed = parked.connect().unwrap();
        let records = resumed.wait_and_collect().await.unwrap();
        assert_eq!(records.len(), 6);
        assert_eq!(resumed.state(), JobState::Completed);
        assert!(repository.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_generated_session_name() {
        let outcome = InvokeCommand::new()
            .invoke_and_disconnect(true)
            .execute(Arc::new(long_running()), hosts(&["web01"]), &CommandDefinition::script("backup"), Vec::new())
            .await
            .unwrap();
        let InvokeOutcome::Disconnected { session_name, job } = outcome else {
            panic!("expected a disconnected job");
        };
        assert!(session_name.starts_with("Session"));
        assert_eq!(session_name.len(), "Session".len() + 8);

        let resumed = job.connect().unwrap();
        assert_eq!(resumed.wait_finished().await, JobState::Completed);
    }

    #[tokio::test]
    async fn test_parking_replaces_previous_session() {
        let repository = JobRepository::new();
        let mut previous = None;
        for _ in 0..2 {
            let outcome = InvokeCommand::new()
                .invoke_and_disconnect(true)
                .session_name("nightly")
                .execute(Arc::new(long_running()), hosts(&["web01"]), &CommandDefinition::script("backup"), Vec::new())
                .await
                .unwrap();
            let InvokeOutcome::Disconnected { session_name, job } = outcome else {
                panic!("expected a disconnected job");
            };
            previous = repository.park(session_name, job);
        }

        let replaced = previous.unwrap();
        assert_eq!(repository.sessions().len(), 1);
        assert_ne!(replaced.id(), repository.take_disconnected("nightly").unwrap().id());
    }
}
