//! Ingestion queue: bounded in-memory buffer between the event source and workers.
//!
//! Producers never block: when the buffer is full the newest event is dropped
//! and a backpressure warning is logged. Consumers poll with a timeout so they
//! can observe a stop flag between waits.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::pipeline::types::InboundEvent;

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Result of a non-blocking enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Accepted,
    /// Buffer full; the event was dropped.
    Dropped,
    /// Engine not running; the event was ignored.
    Closed,
}

/// Bounded multi-consumer event queue.
pub struct IngestionQueue {
    tx: mpsc::Sender<InboundEvent>,
    rx: Mutex<mpsc::Receiver<InboundEvent>>,
    capacity: usize,
    open: AtomicBool,
    dropped: AtomicU64,
}

impl IngestionQueue {
    /// Create a closed queue. Call [`open`](Self::open) before delivering events.
    pub fn new(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Arc::new(Self {
            tx,
            rx: Mutex::new(rx),
            capacity,
            open: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        })
    }

    /// Start accepting events.
    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
    }

    /// Stop accepting events. Already-queued events stay until discarded.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Non-blocking enqueue with drop-newest on overflow.
    pub fn enqueue(&self, event: InboundEvent) -> EnqueueOutcome {
        if !self.is_open() {
            return EnqueueOutcome::Closed;
        }

        match self.tx.try_send(event) {
            Ok(()) => EnqueueOutcome::Accepted,
            Err(mpsc::error::TrySendError::Full(event)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    capacity = self.capacity,
                    message_id = event.message_id,
                    source = event.source_channel_id,
                    dropped_total = total,
                    "Ingestion queue full, dropping newest event"
                );
                EnqueueOutcome::Dropped
            }
            // The queue owns a sender, so the channel never closes while `self` lives.
            Err(mpsc::error::TrySendError::Closed(_)) => EnqueueOutcome::Closed,
        }
    }

    /// Wait up to `timeout` for the next event. `None` means the queue stayed empty.
    pub async fn dequeue(&self, timeout: Duration) -> Option<InboundEvent> {
        tokio::time::timeout(timeout, async {
            let mut rx = self.rx.lock().await;
            rx.recv().await
        })
        .await
        .ok()
        .flatten()
    }

    /// Drop everything currently buffered. Returns how many events were discarded.
    pub async fn discard_pending(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut discarded = 0;
        while rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded, "Discarded undrained events");
        }
        discarded
    }

    /// Events currently buffered.
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Events dropped because the buffer was full, since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Handle given to an event source for delivering events into the engine.
///
/// Cheap to clone; delivery never blocks.
#[derive(Clone)]
pub struct EventSink {
    queue: Arc<IngestionQueue>,
}

impl EventSink {
    pub fn new(queue: Arc<IngestionQueue>) -> Self {
        Self { queue }
    }

    /// Hand an event to the engine.
    pub fn deliver(&self, event: InboundEvent) -> EnqueueOutcome {
        let message_id = event.message_id;
        let source = event.source_channel_id;
        let outcome = self.queue.enqueue(event);
        if outcome == EnqueueOutcome::Accepted {
            debug!(message_id, source, "Queued inbound event");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHORT: Duration = Duration::from_millis(20);

    fn event(id: i64) -> InboundEvent {
        InboundEvent::text(-100, id, format!("message {id}"))
    }

    #[tokio::test]
    async fn overflow_drops_newest() {
        let queue = IngestionQueue::new(DEFAULT_QUEUE_CAPACITY);
        queue.open();

        let outcomes: Vec<_> = (0..101).map(|i| queue.enqueue(event(i))).collect();
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| **o == EnqueueOutcome::Dropped)
                .count(),
            1
        );
        assert_eq!(outcomes[100], EnqueueOutcome::Dropped);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.len(), 100);

        let mut drained = Vec::new();
        while let Some(ev) = queue.dequeue(SHORT).await {
            drained.push(ev.message_id);
        }
        assert_eq!(drained.len(), 100);
        assert_eq!(drained.first(), Some(&0));
        assert_eq!(drained.last(), Some(&99));
    }

    #[tokio::test]
    async fn closed_queue_ignores_events() {
        let queue = IngestionQueue::new(4);
        assert_eq!(queue.enqueue(event(1)), EnqueueOutcome::Closed);
        assert!(queue.is_empty());
        assert_eq!(queue.dropped(), 0);
    }

    #[tokio::test]
    async fn dequeue_times_out_on_empty() {
        let queue = IngestionQueue::new(4);
        queue.open();
        let started = tokio::time::Instant::now();
        assert!(queue.dequeue(SHORT).await.is_none());
        assert!(started.elapsed() >= SHORT);
    }

    #[tokio::test]
    async fn discard_pending_empties_buffer() {
        let queue = IngestionQueue::new(8);
        queue.open();
        for i in 0..5 {
            queue.enqueue(event(i));
        }
        assert_eq!(queue.discard_pending().await, 5);
        assert!(queue.is_empty());
        assert!(queue.dequeue(SHORT).await.is_none());
    }

    #[tokio::test]
    async fn sink_delivers_into_queue() {
        let queue = IngestionQueue::new(2);
        queue.open();
        let sink = EventSink::new(Arc::clone(&queue));
        assert_eq!(sink.deliver(event(1)), EnqueueOutcome::Accepted);
        assert_eq!(sink.deliver(event(2)), EnqueueOutcome::Accepted);
        assert_eq!(sink.deliver(event(3)), EnqueueOutcome::Dropped);
        assert_eq!(queue.dequeue(SHORT).await.map(|e| e.message_id), Some(1));
    }
}
