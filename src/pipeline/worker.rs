//! Worker pool: a fixed set of tasks draining the ingestion queue.
//!
//! Each worker polls the queue with a timeout so it can observe the stop flag
//! between waits. A fault while processing one event is contained: it is
//! logged, counted against the ban guard, and the worker keeps going.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::pipeline::processor::ForwardProcessor;
use crate::pipeline::queue::IngestionQueue;

/// Handles to a running set of workers.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Ask every worker to exit after its current item. Does not wait.
    pub fn signal_stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Workers currently processing an event.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Whether every worker task has exited.
    pub fn is_finished(&self) -> bool {
        self.handles.iter().all(|h| h.is_finished())
    }

    /// Stop and wait for every worker to exit.
    pub async fn join(self) {
        self.signal_stop();
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                error!(error = %e, "Forward worker task failed");
            }
        }
    }
}

/// Spawn `count` workers draining `queue` through `processor`.
pub fn spawn_workers(
    count: usize,
    queue: Arc<IngestionQueue>,
    processor: Arc<ForwardProcessor>,
    dequeue_timeout: Duration,
    error_pause: Duration,
) -> WorkerPool {
    let count = count.max(1);
    let running = Arc::new(AtomicBool::new(true));
    let active = Arc::new(AtomicUsize::new(0));
    let permits = Arc::new(Semaphore::new(count));

    let handles = (0..count)
        .map(|i| {
            let worker = ForwardWorker {
                name: format!("worker-{i}"),
                queue: Arc::clone(&queue),
                processor: Arc::clone(&processor),
                permits: Arc::clone(&permits),
                running: Arc::clone(&running),
                active: Arc::clone(&active),
                dequeue_timeout,
                error_pause,
            };
            tokio::spawn(worker.run())
        })
        .collect();

    info!(workers = count, "Started forward workers");

    WorkerPool {
        handles,
        running,
        active,
    }
}

struct ForwardWorker {
    name: String,
    queue: Arc<IngestionQueue>,
    processor: Arc<ForwardProcessor>,
    permits: Arc<Semaphore>,
    running: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
    dequeue_timeout: Duration,
    error_pause: Duration,
}

impl ForwardWorker {
    async fn run(self) {
        debug!(worker = %self.name, "Forward worker started");

        while self.running.load(Ordering::SeqCst) {
            let Some(event) = self.queue.dequeue(self.dequeue_timeout).await else {
                continue;
            };

            if !self.running.load(Ordering::SeqCst) {
                debug!(
                    worker = %self.name,
                    message_id = event.message_id,
                    "Stopped, discarding dequeued event"
                );
                break;
            }

            let Ok(_permit) = self.permits.acquire().await else {
                break;
            };

            self.active.fetch_add(1, Ordering::SeqCst);
            let result = AssertUnwindSafe(self.processor.process(&event, &self.name))
                .catch_unwind()
                .await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            match result {
                Ok(outcome) => {
                    debug!(
                        worker = %self.name,
                        message_id = event.message_id,
                        ?outcome,
                        "Processed event"
                    );
                }
                Err(panic) => {
                    let errors = self.processor.record_fault();
                    error!(
                        worker = %self.name,
                        message_id = event.message_id,
                        consecutive_errors = errors,
                        panic = %panic_message(panic.as_ref()),
                        "Worker fault while processing event"
                    );
                    tokio::time::sleep(self.error_pause).await;
                }
            }
        }

        debug!(worker = %self.name, "Forward worker stopped");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
