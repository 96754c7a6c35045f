//! Forward processor: the per-event pipeline a worker runs.
//!
//! Flow for one event:
//! 1. Daily limit (rolls the date over first)
//! 2. Rule matcher, against a snapshot of the active rules
//! 3. Per matching rule: ban guard → throttle → guard again → resolve target → republish
//!
//! A publish failure affects only its own rule; the other rules are still attempted.
//! Nothing is retried or requeued.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::json;
use tracing::{debug, info, warn};

use crate::activity::{ActivityLog, ActivityRecord, ActivityType};
use crate::channels::{IdentityResolver, Publisher};
use crate::config::ForwarderConfig;
use crate::error::PublishError;
use crate::pipeline::guard::{BanGuard, ForwardCounters};
use crate::pipeline::republisher::{Delivery, Republisher};
use crate::pipeline::rules::RuleMatcher;
use crate::pipeline::ruleset::{RuleEntry, RuleSet};
use crate::pipeline::throttle::PublishThrottle;
use crate::pipeline::types::InboundEvent;

/// What happened to one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// No active rule accepted the event.
    NoMatch,
    /// Daily forward limit reached; nothing was attempted.
    DailyLimit,
    /// Ban guard cooldown active; nothing was attempted.
    Cooldown,
    /// At least one matching rule was attempted.
    Forwarded { delivered: usize, failed: usize },
}

/// Result of attempting one matched rule.
enum Attempt {
    Published(Delivery),
    /// Skipped without touching any counter.
    Halted(ProcessOutcome),
    Failed(PublishError),
}

/// Shared per-event pipeline. One instance serves every worker.
pub struct ForwardProcessor {
    rules: Arc<RuleSet>,
    matcher: RuleMatcher,
    throttle: PublishThrottle,
    guard: BanGuard,
    counters: ForwardCounters,
    publisher: Arc<dyn Publisher>,
    republisher: Republisher,
    activity: Arc<dyn ActivityLog>,
    processed: AtomicU64,
}

impl ForwardProcessor {
    pub fn new(
        config: &ForwarderConfig,
        rules: Arc<RuleSet>,
        resolver: Arc<dyn IdentityResolver>,
        publisher: Arc<dyn Publisher>,
        activity: Arc<dyn ActivityLog>,
    ) -> Self {
        Self {
            rules,
            matcher: RuleMatcher::new(resolver),
            throttle: PublishThrottle::new(config.max_per_window, config.rate_window, config.jitter),
            guard: BanGuard::new(config.max_consecutive_errors, config.error_cooldown),
            counters: ForwardCounters::new(config.max_daily_forwards),
            republisher: Republisher::new(Arc::clone(&publisher)),
            publisher,
            activity,
            processed: AtomicU64::new(0),
        }
    }

    /// Run one event through the pipeline.
    pub async fn process(&self, event: &InboundEvent, worker: &str) -> ProcessOutcome {
        let outcome = self.process_inner(event, worker).await;
        self.processed.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    async fn process_inner(&self, event: &InboundEvent, worker: &str) -> ProcessOutcome {
        if !self.counters.has_daily_capacity() {
            debug!(
                worker,
                message_id = event.message_id,
                limit = self.counters.max_daily(),
                "Daily forward limit reached, skipping event"
            );
            return ProcessOutcome::DailyLimit;
        }

        let mut delivered = 0;
        let mut failed = 0;

        for entry in self.rules.active().await {
            let rule = entry.rule();
            if !self
                .matcher
                .matches(rule, event.source_channel_id, &event.content)
                .await
            {
                continue;
            }

            debug!(
                worker,
                rule_id = rule.id,
                message_id = event.message_id,
                "Event matched rule"
            );

            match self.forward(&entry, event, worker).await {
                Attempt::Published(delivery) => {
                    delivered += 1;
                    self.record_success(&entry, event, delivery).await;
                }
                Attempt::Halted(outcome) => {
                    if delivered + failed > 0 {
                        break;
                    }
                    return outcome;
                }
                Attempt::Failed(e) => {
                    failed += 1;
                    let errors = self.guard.record_failure();
                    warn!(
                        worker,
                        rule_id = rule.id,
                        message_id = event.message_id,
                        consecutive_errors = errors,
                        error = %e,
                        "Failed to forward message"
                    );
                }
            }
        }

        if delivered + failed == 0 {
            ProcessOutcome::NoMatch
        } else {
            ProcessOutcome::Forwarded { delivered, failed }
        }
    }

    /// Guard, throttle and publish for one matched rule.
    async fn forward(&self, entry: &RuleEntry, event: &InboundEvent, worker: &str) -> Attempt {
        let rule = entry.rule();

        if self.guard.should_skip() {
            debug!(worker, rule_id = rule.id, "Ban guard cooldown active, skipping");
            return Attempt::Halted(ProcessOutcome::Cooldown);
        }

        let jitter = self.throttle.admit().await;

        // Other workers may have tripped the guard or used the last daily slot while we waited.
        if self.guard.should_skip() {
            return Attempt::Halted(ProcessOutcome::Cooldown);
        }
        if !self.counters.has_daily_capacity() {
            return Attempt::Halted(ProcessOutcome::DailyLimit);
        }

        debug!(
            worker,
            rule_id = rule.id,
            jitter_ms = jitter.as_millis() as u64,
            "Publishing"
        );

        let target = match self.publisher.resolve_target(&rule.target).await {
            Ok(target) => target,
            Err(e) => return Attempt::Failed(e),
        };
        match self.republisher.republish(&target, event).await {
            Ok(delivery) => Attempt::Published(delivery),
            Err(e) => Attempt::Failed(e),
        }
    }

    async fn record_success(&self, entry: &RuleEntry, event: &InboundEvent, delivery: Delivery) {
        let rule = entry.rule();
        let rule_count = entry.record_forward();
        let daily = self.counters.record_forward();

        info!(
            rule_id = rule.id,
            source = %rule.source,
            target = %rule.target,
            strategy = delivery.label(),
            rule_count,
            daily,
            "Forwarded message"
        );

        let mut record = ActivityRecord::new(
            ActivityType::MessageForwarded,
            format!("Forwarded message from {} to {}", rule.source, rule.target),
        )
        .with_details(json!({
            "engine_rule_id": rule.id,
            "message_id": event.message_id,
            "message_type": event.content.label(),
            "has_text": event.content.has_text(),
            "strategy": delivery.label(),
        }));

        if let Some(id) = rule.external_id.or_else(|| i64::try_from(rule.id).ok()) {
            record = record.with_rule(id);
        }

        if let Err(e) = self.activity.append(record).await {
            warn!(rule_id = rule.id, error = %e, "Failed to append activity record");
        }
    }

    /// Record a fault that escaped the pipeline (e.g. a panic).
    ///
    /// The event still counts as processed.
    pub fn record_fault(&self) -> u32 {
        self.processed.fetch_add(1, Ordering::SeqCst);
        self.guard.record_failure()
    }

    pub fn guard(&self) -> &BanGuard {
        &self.guard
    }

    pub fn counters(&self) -> &ForwardCounters {
        &self.counters
    }

    /// Events that finished processing, whatever the outcome.
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::SeqCst)
    }

    /// Drop cached source resolutions.
    pub async fn clear_resolution_cache(&self) {
        self.matcher.clear_cache().await;
    }
}
