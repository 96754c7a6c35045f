//! The engine's in-memory active rule set.
//!
//! This set is never synchronized with any persistent store automatically;
//! the store layer calls `add`/`remove` after its own writes succeed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::info;

use crate::pipeline::types::{ForwardingRule, NewRule};

/// An active rule plus its live publish counter.
#[derive(Debug)]
pub struct RuleEntry {
    rule: ForwardingRule,
    message_count: AtomicU64,
}

impl RuleEntry {
    fn new(rule: ForwardingRule) -> Self {
        let count = rule.message_count;
        Self {
            rule,
            message_count: AtomicU64::new(count),
        }
    }

    /// Static rule definition. `message_count` on it is not live; use [`snapshot`](Self::snapshot).
    pub fn rule(&self) -> &ForwardingRule {
        &self.rule
    }

    pub fn id(&self) -> u64 {
        self.rule.id
    }

    /// Same external id, or same `(source, target)` pair.
    fn is_same_rule(&self, new: &NewRule) -> bool {
        let r = &self.rule;
        (new.external_id.is_some() && r.external_id == new.external_id)
            || (r.source == new.source && r.target == new.target)
    }

    /// Whether `new` describes exactly this rule.
    fn has_definition(&self, new: &NewRule) -> bool {
        let r = &self.rule;
        r.external_id == new.external_id
            && r.source == new.source
            && r.target == new.target
            && r.filters == new.filters
    }

    /// Record one successful publish. Returns the new count.
    pub fn record_forward(&self) -> u64 {
        self.message_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::SeqCst)
    }

    /// Copy of the rule with the current count.
    pub fn snapshot(&self) -> ForwardingRule {
        ForwardingRule {
            message_count: self.message_count(),
            ..self.rule.clone()
        }
    }
}

/// Active forwarding rules, shared between the controller and workers.
pub struct RuleSet {
    entries: RwLock<Vec<Arc<RuleEntry>>>,
    next_id: AtomicU64,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleSet {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Add a rule. If one with the same external id or the same
    /// `(source, target)` pair is already active, that one is returned instead
    /// and `added` is false.
    pub async fn add(&self, new: NewRule) -> (ForwardingRule, bool) {
        let mut entries = self.entries.write().await;

        if let Some(existing) = entries.iter().find(|e| e.is_same_rule(&new)) {
            info!(
                rule_id = existing.id(),
                source = %new.source,
                target = %new.target,
                "Rule already exists"
            );
            return (existing.snapshot(), false);
        }

        let rule = self.build(new);
        info!(
            rule_id = rule.id,
            source = %rule.source,
            target = %rule.target,
            "Added forwarding rule"
        );
        entries.push(Arc::new(RuleEntry::new(rule.clone())));
        (rule, true)
    }

    /// Swap the whole active set for `rules` in one step.
    ///
    /// An active rule that `rules` names again (by external id or pair) keeps
    /// its engine id and message count. Unchanged rules keep their entry, so
    /// publishes already in flight still count. Returns the new set's size.
    pub async fn replace(&self, rules: Vec<NewRule>) -> usize {
        let mut entries = self.entries.write().await;
        let mut next: Vec<Arc<RuleEntry>> = Vec::with_capacity(rules.len());

        for new in rules {
            if next.iter().any(|e| e.is_same_rule(&new)) {
                continue;
            }

            let previous = entries
                .iter()
                .find(|e| e.is_same_rule(&new) && !next.iter().any(|n| n.id() == e.id()));
            let entry = match previous {
                Some(entry) if entry.has_definition(&new) => Arc::clone(entry),
                Some(entry) => Arc::new(RuleEntry::new(ForwardingRule {
                    id: entry.id(),
                    message_count: entry.message_count(),
                    created_at: entry.rule().created_at,
                    ..self.build(new)
                })),
                None => Arc::new(RuleEntry::new(self.build(new))),
            };
            next.push(entry);
        }

        let removed = entries
            .iter()
            .filter(|e| !next.iter().any(|n| n.id() == e.id()))
            .count();
        *entries = next;
        info!(active = entries.len(), removed, "Replaced active rule set");
        entries.len()
    }

    fn build(&self, new: NewRule) -> ForwardingRule {
        ForwardingRule {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            external_id: new.external_id,
            source: new.source,
            target: new.target,
            filters: new.filters,
            enabled: true,
            message_count: 0,
            created_at: Utc::now(),
        }
    }

    /// Remove by external id, falling back to the engine-local id.
    pub async fn remove(&self, id: i64) -> Option<ForwardingRule> {
        let mut entries = self.entries.write().await;

        let position = entries
            .iter()
            .position(|e| e.rule().external_id == Some(id))
            .or_else(|| {
                u64::try_from(id)
                    .ok()
                    .and_then(|local| entries.iter().position(|e| e.id() == local))
            })?;

        let removed = entries.remove(position).snapshot();
        info!(
            rule_id = removed.id,
            source = %removed.source,
            target = %removed.target,
            "Removed forwarding rule"
        );
        Some(removed)
    }

    /// Snapshots of all active rules.
    pub async fn list(&self) -> Vec<ForwardingRule> {
        self.entries
            .read()
            .await
            .iter()
            .map(|e| e.snapshot())
            .collect()
    }

    /// Shared handles for the processing path.
    pub async fn active(&self) -> Vec<Arc<RuleEntry>> {
        self.entries.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
