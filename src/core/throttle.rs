//! Bounded-concurrency scheduler.
//!
//! Operations are started in submission order while fewer than the throttle
//! limit are active; each completion frees a slot for the next one. All
//! counters live inside a single actor task that receives both caller
//! commands and completion notices, so no two sources ever update them
//! concurrently.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

use super::error::UsageError;
use super::operation::{ExecutionOperation, OperationCompletion, OperationOutcome};

/// Default maximum concurrently active operations.
pub const DEFAULT_THROTTLE_LIMIT: usize = 32;

/// Snapshot of the scheduler's bookkeeping.
///
/// `queued + active + completed + dropped == total` at every snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleCounters {
    /// Operations ever submitted
    pub total: usize,
    /// Waiting to start
    pub queued: usize,
    /// Started and not yet complete
    pub active: usize,
    /// Ever started
    pub started: usize,
    /// Started and complete
    pub completed: usize,
    /// Dropped without starting
    pub dropped: usize,
    /// Highest `active` seen
    pub peak_active: usize,
}

impl ThrottleCounters {
    /// Operations that will never be active again.
    pub fn finished(&self) -> usize {
        self.completed + self.dropped
    }

    pub fn is_consistent(&self) -> bool {
        self.queued + self.active + self.finished() == self.total && self.started + self.dropped + self.queued == self.total
    }
}

/// Scheduler lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    Started { operation_id: Uuid, active: usize },
    Completed { operation_id: Uuid, outcome: OperationOutcome },
    Dropped { operation_id: Uuid },
    /// Nothing queued, nothing active, no more submissions. Sent once.
    ThrottleComplete,
}

enum SchedulerCommand {
    Submit(Vec<Arc<ExecutionOperation>>),
    EndSubmit,
    DropPending,
    StopAll,
}

/// Handle to a scheduler actor.
#[derive(Debug, Clone)]
pub struct ThrottleScheduler {
    limit: usize,
    commands: mpsc::UnboundedSender<SchedulerCommand>,
    counters: watch::Receiver<ThrottleCounters>,
    complete: watch::Receiver<bool>,
    events: broadcast::Sender<SchedulerEvent>,
}

impl ThrottleScheduler {
    /// Spawn a scheduler. A limit of zero is a usage error.
    pub fn new(limit: usize) -> Result<Self, UsageError> {
        if limit == 0 {
            return Err(UsageError::ZeroThrottleLimit);
        }

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (counters_tx, counters) = watch::channel(ThrottleCounters::default());
        let (complete_tx, complete) = watch::channel(false);
        let (events, _) = broadcast::channel(1024);

        let actor = SchedulerActor {
            limit,
            queue: VecDeque::new(),
            active: HashMap::new(),
            counters: ThrottleCounters::default(),
            submissions_closed: false,
            draining: false,
            complete_fired: false,
            counters_tx,
            complete_tx,
            events: events.clone(),
        };
        tokio::spawn(actor.run(command_rx));

        Ok(Self { limit, commands, counters, complete, events })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Subscribe to events. Subscribe before submitting to see every event.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Queue operations and start as many as the limit allows.
    pub fn submit(&self, operations: Vec<Arc<ExecutionOperation>>) -> bool {
        self.commands.send(SchedulerCommand::Submit(operations)).is_ok()
    }

    /// Declare that nothing more will be submitted.
    pub fn end_submit(&self) -> bool {
        self.commands.send(SchedulerCommand::EndSubmit).is_ok()
    }

    /// Submit a complete set of operations.
    pub fn submit_all(&self, operations: Vec<Arc<ExecutionOperation>>) -> bool {
        self.submit(operations) && self.end_submit()
    }

    /// Drop every queued operation without starting it; active ones keep running.
    pub fn drop_pending(&self) {
        let _ = self.commands.send(SchedulerCommand::DropPending);
    }

    /// Stop every active operation and drop every queued one.
    pub fn stop_all(&self) {
        let _ = self.commands.send(SchedulerCommand::StopAll);
    }

    pub fn counters(&self) -> ThrottleCounters {
        *self.counters.borrow()
    }

    pub fn is_complete(&self) -> bool {
        *self.complete.borrow()
    }

    /// Wait until the throttle-complete condition holds.
    pub async fn wait_complete(&self) -> ThrottleCounters {
        let mut complete = self.complete.clone();
        let _ = complete.wait_for(|done| *done).await;
        self.counters()
    }
}

struct SchedulerActor {
    limit: usize,
    queue: VecDeque<Arc<ExecutionOperation>>,
    active: HashMap<Uuid, Arc<ExecutionOperation>>,
    counters: ThrottleCounters,
    submissions_closed: bool,
    draining: bool,
    complete_fired: bool,
    counters_tx: watch::Sender<ThrottleCounters>,
    complete_tx: watch::Sender<bool>,
    events: broadcast::Sender<SchedulerEvent>,
}

impl SchedulerActor {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SchedulerCommand>) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<OperationCompletion>();
        let mut commands_open = true;

        loop {
            tokio::select! {
                biased;
                command = commands.recv(), if commands_open => match command {
                    Some(SchedulerCommand::Submit(operations)) => {
                        if self.submissions_closed {
                            tracing::warn!(count = operations.len(), "Submission after end of submissions ignored");
                            for operation in operations {
                                operation.cancel_pending();
                            }
                        } else {
                            self.counters.total += operations.len();
                            self.queue.extend(operations);
                            self.draining_drop();
                            self.fill(&done_tx);
                        }
                    }
                    Some(SchedulerCommand::EndSubmit) => self.submissions_closed = true,
                    None => {
                        tracing::debug!("Scheduler handles dropped, closing submissions");
                        commands_open = false;
                        self.submissions_closed = true;
                    }
                    Some(SchedulerCommand::DropPending) => {
                        self.draining = true;
                        self.draining_drop();
                    }
                    Some(SchedulerCommand::StopAll) => {
                        self.draining = true;
                        self.draining_drop();
                        for operation in self.active.values() {
                            let operation = Arc::clone(operation);
                            tokio::spawn(async move { operation.stop().await });
                        }
                    }
                },
                Some(done) = done_rx.recv() => {
                    if self.active.remove(&done.operation_id).is_some() {
                        self.counters.completed += 1;
                        self.counters.active = self.active.len();
                        tracing::debug!(
                            operation_id = %done.operation_id,
                            outcome = %done.outcome,
                            active = self.active.len(),
                            "Operation finished"
                        );
                        let _ = self.events.send(SchedulerEvent::Completed {
                            operation_id: done.operation_id,
                            outcome: done.outcome,
                        });
                        self.fill(&done_tx);
                    }
                }
            }

            self.counters.queued = self.queue.len();
            self.counters.active = self.active.len();
            self.counters_tx.send_replace(self.counters);

            if self.check_complete() {
                break;
            }
        }
    }

    /// Start queued operations in order while slots are free.
    fn fill(&mut self, done_tx: &mpsc::UnboundedSender<OperationCompletion>) {
        while !self.draining && self.active.len() < self.limit {
            let Some(operation) = self.queue.pop_front() else {
                break;
            };
            operation.on_complete(done_tx.clone());
            self.active.insert(operation.id(), Arc::clone(&operation));
            self.counters.started += 1;
            self.counters.active = self.active.len();
            self.counters.peak_active = self.counters.peak_active.max(self.active.len());

            tracing::debug!(operation_id = %operation.id(), target = %operation.label(), active = self.active.len(), "Starting operation");
            let _ = self.events.send(SchedulerEvent::Started { operation_id: operation.id(), active: self.active.len() });
            operation.start();
        }
    }

    /// While draining, every queued operation completes as dropped.
    fn draining_drop(&mut self) {
        if !self.draining {
            return;
        }
        while let Some(operation) = self.queue.pop_front() {
            operation.cancel_pending();
            self.counters.dropped += 1;
            tracing::debug!(operation_id = %operation.id(), target = %operation.label(), "Dropped queued operation");
            let _ = self.events.send(SchedulerEvent::Dropped { operation_id: operation.id() });
        }
    }

    fn check_complete(&mut self) -> bool {
        if self.complete_fired || !self.submissions_closed || !self.queue.is_empty() || !self.active.is_empty() {
            return false;
        }
        self.complete_fired = true;
        tracing::debug!(
            total = self.counters.total,
            completed = self.counters.completed,
            dropped = self.counters.dropped,
            peak_active = self.counters.peak_active,
            "Throttle complete"
        );
        let _ = self.events.send(SchedulerEvent::ThrottleComplete);
        self.complete_tx.send_replace(true);
        true
    }
}
