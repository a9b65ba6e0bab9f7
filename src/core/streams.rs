//! Order-preserving record queues.
//!
//! Each pipeline owns four independent queues so that readers of one kind
//! never wait behind readers of another. A pipeline attached to a job skips
//! its own queues and forwards every record to the job's sink instead.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use super::record::{ErrorRecord, InformationalRecord, PipelineRecord, ProgressRecord};

/// Receiver for records forwarded out of a pipeline.
pub trait RecordSink: Send + Sync {
    /// Accept one record. Called in arrival order.
    fn push(&self, record: PipelineRecord);
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// A FIFO that can be drained without blocking or awaited for more data.
#[derive(Debug)]
pub struct RecordQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T> Default for RecordQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RecordQueue<T> {
    /// Create an empty, open queue.
    pub fn new() -> Self {
        Self { state: Mutex::new(QueueState { items: VecDeque::new(), closed: false }), notify: Notify::new() }
    }

    /// Append an item. Returns false if the queue is closed.
    pub fn push(&self, item: T) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.items.push_back(item);
        }
        self.notify.notify_waiters();
        true
    }

    /// Take everything currently buffered.
    pub fn read_all(&self) -> Vec<T> {
        self.state.lock().items.drain(..).collect()
    }

    /// Take the oldest item, if any.
    pub fn try_next(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    /// Wait for the next item. Returns `None` once the queue is closed and empty.
    pub async fn next(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// A future that resolves on the next push, close or wake.
    ///
    /// Create it before checking the queue to avoid missing a wakeup.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Wake every waiter without pushing anything.
    pub fn wake(&self) {
        self.notify.notify_waiters();
    }

    /// Stop accepting new items. Buffered items can still be read.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }
}

/// The four output queues of one pipeline.
#[derive(Default)]
pub struct PipelineStreams {
    output: RecordQueue<Value>,
    error: RecordQueue<ErrorRecord>,
    informational: RecordQueue<InformationalRecord>,
    progress: RecordQueue<ProgressRecord>,
    sink: RwLock<Option<Arc<dyn RecordSink>>>,
}

impl std::fmt::Debug for PipelineStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineStreams")
            .field("output", &self.output.len())
            .field("error", &self.error.len())
            .field("informational", &self.informational.len())
            .field("progress", &self.progress.len())
            .field("forwarding", &self.sink.read().is_some())
            .finish()
    }
}

impl PipelineStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward all future records to `sink` instead of the local queues.
    pub fn attach_sink(&self, sink: Arc<dyn RecordSink>) {
        *self.sink.write() = Some(sink);
    }

    /// Stop forwarding.
    pub fn detach_sink(&self) {
        self.sink.write().take();
    }

    /// Route one record to the sink or to its queue.
    pub fn push(&self, record: PipelineRecord) {
        let sink = self.sink.read().clone();
        if let Some(sink) = sink {
            sink.push(record);
            return;
        }
        match record {
            PipelineRecord::Output(value) => {
                self.output.push(value);
            }
            PipelineRecord::Error(error) => {
                self.error.push(error);
            }
            PipelineRecord::Informational(info) => {
                self.informational.push(info);
            }
            PipelineRecord::Progress(progress) => {
                self.progress.push(progress);
            }
        }
    }

    pub fn output(&self) -> &RecordQueue<Value> {
        &self.output
    }

    pub fn error(&self) -> &RecordQueue<ErrorRecord> {
        &self.error
    }

    pub fn informational(&self) -> &RecordQueue<InformationalRecord> {
        &self.informational
    }

    pub fn progress(&self) -> &RecordQueue<ProgressRecord> {
        &self.progress
    }

    /// Close every queue; readers drain what is left and then see the end.
    pub fn close_all(&self) {
        self.output.close();
        self.error.close();
        self.informational.close();
        self.progress.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CollectingSink(Mutex<Vec<PipelineRecord>>);

    impl RecordSink for CollectingSink {
        fn push(&self, record: PipelineRecord) {
            self.0.lock().push(record);
        }
    }

    #[test]
    fn test_queue_preserves_order() {
        let queue = RecordQueue::new();
        for i in 0..5 {
            assert!(queue.push(i));
        }
        assert_eq!(queue.read_all(), vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_closed_queue_rejects_push() {
        let queue = RecordQueue::new();
        queue.push("a");
        queue.close();
        assert!(!queue.push("b"));
        assert_eq!(queue.read_all(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_next_waits_for_push() {
        let queue = Arc::new(RecordQueue::new());
        let reader = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;
        queue.push(7);
        assert_eq!(reader.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_next_returns_none_after_close() {
        let queue: RecordQueue<u8> = RecordQueue::new();
        queue.close();
        assert_eq!(queue.next().await, None);
    }

    #[test]
    fn test_streams_route_by_kind() {
        let streams = PipelineStreams::new();
        streams.push(PipelineRecord::output("one"));
        streams.push(PipelineRecord::error("bad"));
        streams.push(PipelineRecord::warning("hmm"));
        streams.push(PipelineRecord::output("two"));

        assert_eq!(streams.output().read_all(), vec![Value::from("one"), Value::from("two")]);
        assert_eq!(streams.error().len(), 1);
        assert_eq!(streams.informational().len(), 1);
        assert!(streams.progress().is_empty());
    }

    #[test]
    fn test_streams_forward_to_sink() {
        let streams = PipelineStreams::new();
        let sink = Arc::new(CollectingSink(Mutex::new(Vec::new())));
        streams.attach_sink(sink.clone());

        streams.push(PipelineRecord::output(1));
        streams.push(PipelineRecord::error("x"));

        assert!(streams.output().is_empty());
        assert!(streams.error().is_empty());
        assert_eq!(sink.0.lock().len(), 2);
    }
}
