//! Forwarding controller: owns the engine lifecycle and its active rule set.
//!
//! States: `Stopped` (initial) and `Running`. `start` requires an
//! authenticated session and is idempotent. `stop` signals the workers and
//! returns without waiting for them; `shutdown` also waits.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::activity::{ActivityLog, ActivityRecord, ActivityType};
use crate::channels::{EventSource, IdentityResolver, Publisher, SessionProvider};
use crate::config::ForwarderConfig;
use crate::error::EngineError;
use crate::pipeline::processor::ForwardProcessor;
use crate::pipeline::queue::{EventSink, IngestionQueue};
use crate::pipeline::ruleset::RuleSet;
use crate::pipeline::types::{ForwardingRule, NewRule};
use crate::pipeline::worker::{WorkerPool, spawn_workers};
use crate::store::{RuleStore, StoredRule};

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Stopped,
    Running,
}

/// External collaborators the engine is built from.
pub struct EngineDeps {
    pub source: Arc<dyn EventSource>,
    pub resolver: Arc<dyn IdentityResolver>,
    pub publisher: Arc<dyn Publisher>,
    pub session: Arc<dyn SessionProvider>,
    pub activity: Arc<dyn ActivityLog>,
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub state: EngineState,
    pub daily_forwards: u64,
    pub max_daily_forwards: u64,
    pub total_rules: usize,
    pub consecutive_errors: u32,
    pub queue_depth: usize,
    pub dropped_events: u64,
    pub processed_events: u64,
    pub last_forward_at: Option<DateTime<Utc>>,
    /// Live workers; zero when stopped.
    pub workers: usize,
    /// Workers in the middle of an event.
    pub busy_workers: usize,
    /// A stopped pool still has workers finishing their last event.
    pub draining: bool,
}

struct Lifecycle {
    state: EngineState,
    pool: Option<WorkerPool>,
    /// Pool signalled by `stop` whose workers may still be finishing.
    draining: Option<WorkerPool>,
    subscribed: bool,
}

/// The forwarding engine.
pub struct ForwardingController {
    config: ForwarderConfig,
    rules: Arc<RuleSet>,
    queue: Arc<IngestionQueue>,
    processor: Arc<ForwardProcessor>,
    source: Arc<dyn EventSource>,
    session: Arc<dyn SessionProvider>,
    activity: Arc<dyn ActivityLog>,
    lifecycle: Mutex<Lifecycle>,
}

impl ForwardingController {
    pub fn new(config: ForwarderConfig, deps: EngineDeps) -> Self {
        let rules = Arc::new(RuleSet::new());
        let queue = IngestionQueue::new(config.queue_capacity);
        let processor = Arc::new(ForwardProcessor::new(
            &config,
            Arc::clone(&rules),
            deps.resolver,
            deps.publisher,
            Arc::clone(&deps.activity),
        ));

        Self {
            config,
            rules,
            queue,
            processor,
            source: deps.source,
            session: deps.session,
            activity: deps.activity,
            lifecycle: Mutex::new(Lifecycle {
                state: EngineState::Stopped,
                pool: None,
                draining: None,
                subscribed: false,
            }),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Transition to `Running`. No-op if already running.
    pub async fn start(&self) -> Result<(), EngineError> {
        if !self.session.is_authenticated() {
            return Err(EngineError::NotAuthenticated);
        }

        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.state == EngineState::Running {
            debug!("Forwarding already running");
            return Ok(());
        }

        // Old workers would otherwise discard events meant for the new run.
        if let Some(old) = lifecycle.draining.take() {
            old.join().await;
        }
        // Whatever was left from a previous run is discarded, not replayed.
        self.queue.discard_pending().await;

        if !lifecycle.subscribed {
            self.source.subscribe(EventSink::new(Arc::clone(&self.queue)))?;
            lifecycle.subscribed = true;
            info!(source = self.source.name(), "Registered event source");
        }

        self.queue.open();
        lifecycle.pool = Some(spawn_workers(
            self.config.worker_count,
            Arc::clone(&self.queue),
            Arc::clone(&self.processor),
            self.config.dequeue_timeout,
            self.config.worker_error_pause,
        ));
        lifecycle.state = EngineState::Running;
        drop(lifecycle);

        let rules = self.rules.len().await;
        info!(rules, workers = self.config.worker_count, "Forwarding started");
        self.log_activity(ActivityRecord::new(
            ActivityType::ForwardingStarted,
            format!("Message forwarding started with {rules} active rules"),
        ))
        .await;
        Ok(())
    }

    /// Transition to `Stopped`. Signals workers and returns without joining them.
    pub async fn stop(&self) {
        {
            let mut lifecycle = self.lifecycle.lock().await;
            if lifecycle.state == EngineState::Stopped {
                return;
            }
            lifecycle.state = EngineState::Stopped;
            self.queue.close();
            if let Some(pool) = lifecycle.pool.take() {
                pool.signal_stop();
                lifecycle.draining = Some(pool);
            }
        }

        info!("Forwarding stopped");
        self.log_activity(ActivityRecord::new(
            ActivityType::ForwardingStopped,
            "Message forwarding stopped",
        ))
        .await;
    }

    /// Stop and wait for every worker to exit.
    pub async fn shutdown(&self) {
        self.stop().await;
        let draining = self.lifecycle.lock().await.draining.take();
        if let Some(pool) = draining {
            pool.join().await;
        }
        let discarded = self.queue.discard_pending().await;
        if discarded > 0 {
            info!(discarded, "Discarded undrained events on shutdown");
        }
    }

    pub async fn state(&self) -> EngineState {
        self.lifecycle.lock().await.state
    }

    pub async fn is_running(&self) -> bool {
        self.state().await == EngineState::Running
    }

    /// Handle for delivering events directly, bypassing the registered source.
    pub fn sink(&self) -> EventSink {
        EventSink::new(Arc::clone(&self.queue))
    }

    // ── Rules ───────────────────────────────────────────────────────

    /// Add a rule to the active set. Returns the active rule and whether it is new.
    pub async fn add_rule(&self, rule: NewRule) -> (ForwardingRule, bool) {
        self.rules.add(rule).await
    }

    /// Remove by external id, then by engine id.
    pub async fn remove_rule(&self, id: i64) -> Option<ForwardingRule> {
        let removed = self.rules.remove(id).await;
        if removed.is_none() {
            debug!(id, "No active rule to remove");
        }
        removed
    }

    pub async fn list_active_rules(&self) -> Vec<ForwardingRule> {
        self.rules.list().await
    }

    /// Replace the active set with the store's enabled rules.
    ///
    /// With `auto_start`, starts the engine if any rule is active and stops
    /// it if none is. Returns the number of active rules.
    pub async fn reconcile(
        &self,
        store: &dyn RuleStore,
        auto_start: bool,
    ) -> crate::error::Result<usize> {
        let stored = store.list_enabled_rules().await?;

        self.processor.clear_resolution_cache().await;
        let active = self
            .rules
            .replace(stored.iter().map(StoredRule::to_new_rule).collect())
            .await;
        info!(active, "Reconciled forwarding rules");

        if auto_start {
            if active > 0 {
                self.start().await?;
            } else if self.is_running().await {
                info!("No enabled rules, stopping forwarding");
                self.stop().await;
            }
        }
        Ok(active)
    }

    // ── Stats ───────────────────────────────────────────────────────

    pub async fn stats(&self) -> EngineStats {
        let (state, workers, busy_workers, draining) = {
            let lifecycle = self.lifecycle.lock().await;
            let draining = lifecycle.draining.as_ref();
            (
                lifecycle.state,
                lifecycle.pool.as_ref().map_or(0, WorkerPool::size),
                lifecycle.pool.as_ref().map_or(0, WorkerPool::active)
                    + draining.map_or(0, WorkerPool::active),
                draining.is_some_and(|pool| !pool.is_finished()),
            )
        };
        let counters = self.processor.counters();

        EngineStats {
            state,
            daily_forwards: counters.daily_count(),
            max_daily_forwards: counters.max_daily(),
            total_rules: self.rules.len().await,
            consecutive_errors: self.processor.guard().consecutive_errors(),
            queue_depth: self.queue.len(),
            dropped_events: self.queue.dropped(),
            processed_events: self.processor.processed(),
            last_forward_at: counters.last_forward_at(),
            workers,
            busy_workers,
            draining,
        }
    }

    async fn log_activity(&self, record: ActivityRecord) {
        if let Err(e) = self.activity.append(record).await {
            warn!(error = %e, "Failed to append activity record");
        }
    }
}
