//! Reconnect countdowns driven by transport retry notifications.
//!
//! The monitor only observes. It never touches connections or pipelines, so
//! an absent or slow renderer cannot affect how a job runs.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::transport::RetryNotification;

const TICK: Duration = Duration::from_secs(1);

/// A running countdown for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryCountdown {
    pub source: Uuid,
    pub target: String,
    pub total_seconds: u32,
    pub remaining_seconds: u32,
}

impl RetryCountdown {
    /// Percentage of the retry budget used so far.
    pub fn percent_elapsed(&self) -> u8 {
        if self.total_seconds == 0 {
            return 100;
        }
        let elapsed = self.total_seconds.saturating_sub(self.remaining_seconds);
        (u64::from(elapsed) * 100 / u64::from(self.total_seconds)) as u8
    }
}

/// Why a countdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CountdownEnd {
    Recovered,
    AutoDisconnect,
    Aborted,
    Exhausted,
    Stopped,
}

impl fmt::Display for CountdownEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Recovered => "recovered",
            Self::AutoDisconnect => "auto-disconnect",
            Self::Aborted => "aborted",
            Self::Exhausted => "exhausted",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Displays countdowns.
pub trait ProgressRenderer: Send + Sync {
    fn render(&self, countdown: &RetryCountdown);
    fn clear(&self, countdown: &RetryCountdown, end: CountdownEnd);
}

/// Writes countdowns to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRenderer;

impl ProgressRenderer for TracingRenderer {
    fn render(&self, countdown: &RetryCountdown) {
        tracing::warn!(
            target_name = %countdown.target,
            remaining = countdown.remaining_seconds,
            total = countdown.total_seconds,
            "Network failure, retrying connection"
        );
    }

    fn clear(&self, countdown: &RetryCountdown, end: CountdownEnd) {
        tracing::debug!(target_name = %countdown.target, end = %end, "Retry countdown cleared");
    }
}

struct Entry {
    countdown: RetryCountdown,
    generation: u64,
    ticker: CancellationToken,
}

struct MonitorState {
    renderer: Arc<dyn ProgressRenderer>,
    countdowns: Mutex<HashMap<Uuid, Entry>>,
    generation: Mutex<u64>,
}

impl MonitorState {
    fn start(self: &Arc<Self>, source: Uuid, target: &str, max_retry_seconds: u32) {
        if max_retry_seconds == 0 {
            self.finish(source, CountdownEnd::Exhausted);
            return;
        }
        let countdown = RetryCountdown {
            source,
            target: target.to_string(),
            total_seconds: max_retry_seconds,
            remaining_seconds: max_retry_seconds,
        };

        let generation = {
            let mut next = self.generation.lock();
            *next += 1;
            *next
        };
        let ticker = CancellationToken::new();
        let previous = self
            .countdowns
            .lock()
            .insert(source, Entry { countdown: countdown.clone(), generation, ticker: ticker.clone() });
        if let Some(previous) = previous {
            previous.ticker.cancel();
        }

        self.renderer.render(&countdown);
        tokio::spawn(Arc::clone(self).tick(source, generation, ticker));
    }

    async fn tick(self: Arc<Self>, source: Uuid, generation: u64, ticker: CancellationToken) {
        let mut interval = interval_at(Instant::now() + TICK, TICK);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = ticker.cancelled() => return,
                _ = interval.tick() => {}
            }

            let (snapshot, exhausted) = {
                let mut countdowns = self.countdowns.lock();
                let Some(entry) = countdowns.get_mut(&source).filter(|e| e.generation == generation) else {
                    return;
                };
                entry.countdown.remaining_seconds = entry.countdown.remaining_seconds.saturating_sub(1);
                let snapshot = entry.countdown.clone();
                let exhausted = snapshot.remaining_seconds == 0;
                if exhausted {
                    countdowns.remove(&source);
                }
                (snapshot, exhausted)
            };

            if exhausted {
                self.renderer.clear(&snapshot, CountdownEnd::Exhausted);
                return;
            }
            self.renderer.render(&snapshot);
        }
    }

    fn finish(&self, source: Uuid, end: CountdownEnd) {
        let removed = self.countdowns.lock().remove(&source);
        if let Some(entry) = removed {
            entry.ticker.cancel();
            self.renderer.clear(&entry.countdown, end);
        }
    }
}

/// Per-job countdown tracker.
pub struct RetryProgressMonitor {
    state: Arc<MonitorState>,
    observers: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl fmt::Debug for RetryProgressMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryProgressMonitor")
            .field("active", &self.active_count())
            .field("observed", &self.observers.lock().len())
            .finish()
    }
}

impl Default for RetryProgressMonitor {
    fn default() -> Self {
        Self::new(Arc::new(TracingRenderer))
    }
}

impl RetryProgressMonitor {
    pub fn new(renderer: Arc<dyn ProgressRenderer>) -> Self {
        Self {
            state: Arc::new(MonitorState {
                renderer,
                countdowns: Mutex::new(HashMap::new()),
                generation: Mutex::new(0),
            }),
            observers: Mutex::new(HashMap::new()),
        }
    }

    /// Follow a source's notifications until the channel closes or [`stop`](Self::stop).
    pub fn observe(&self, source: Uuid, target: String, mut notifications: broadcast::Receiver<RetryNotification>) {
        let token = CancellationToken::new();
        if let Some(previous) = self.observers.lock().insert(source, token.clone()) {
            previous.cancel();
        }

        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            loop {
                let notification = tokio::select! {
                    () = token.cancelled() => break,
                    received = notifications.recv() => received,
                };
                match notification {
                    Ok(notification) => handle(&state, source, &target, &notification),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(source = %source, skipped, "Retry notifications lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Apply one notification.
    pub fn handle(&self, source: Uuid, target: &str, notification: &RetryNotification) {
        handle(&self.state, source, target, notification);
    }

    /// Stop observing a source and clear its countdown.
    pub fn stop(&self, source: Uuid) {
        if let Some(token) = self.observers.lock().remove(&source) {
            token.cancel();
        }
        self.state.finish(source, CountdownEnd::Stopped);
    }

    pub fn countdown(&self, source: Uuid) -> Option<RetryCountdown> {
        self.state.countdowns.lock().get(&source).map(|entry| entry.countdown.clone())
    }

    pub fn active_count(&self) -> usize {
        self.state.countdowns.lock().len()
    }
}

impl Drop for RetryProgressMonitor {
    fn drop(&mut self) {
        for (_, token) in self.observers.lock().drain() {
            token.cancel();
        }
        for (_, entry) in self.state.countdowns.lock().drain() {
            entry.ticker.cancel();
        }
    }
}

fn handle(state: &Arc<MonitorState>, source: Uuid, target: &str, notification: &RetryNotification) {
    match notification {
        RetryNotification::NetworkFailureDetected { max_retry_seconds } => {
            state.start(source, target, *max_retry_seconds);
        }
        RetryNotification::ConnectionRetrySucceeded => state.finish(source, CountdownEnd::Recovered),
        RetryNotification::AutoDisconnectStarting => state.finish(source, CountdownEnd::AutoDisconnect),
        RetryNotification::InternalErrorAbort { .. } => state.finish(source, CountdownEnd::Aborted),
    }
}
