//! Activity log: a record of what the engine did, for operators.
//!
//! The engine appends fire-and-forget; a failing log never fails a publish.
//! `BroadcastActivityLog` fans records out to any number of live subscribers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::StoreError;

/// Default broadcast buffer; slower subscribers lag rather than block.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Kind of activity being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    MessageForwarded,
    ForwardingStarted,
    ForwardingStopped,
}

impl ActivityType {
    /// Matches the serde tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageForwarded => "message_forwarded",
            Self::ForwardingStarted => "forwarding_started",
            Self::ForwardingStopped => "forwarding_stopped",
        }
    }
}

impl std::fmt::Display for ActivityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One activity log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub id: Uuid,
    pub activity_type: ActivityType,
    pub description: String,
    /// Rule store id when the rule has one, else the engine id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ActivityRecord {
    pub fn new(activity_type: ActivityType, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            activity_type,
            description: description.into(),
            rule_id: None,
            details: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_rule(mut self, rule_id: i64) -> Self {
        self.rule_id = Some(rule_id);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Sink for activity records.
#[async_trait]
pub trait ActivityLog: Send + Sync {
    async fn append(&self, record: ActivityRecord) -> Result<(), StoreError>;
}

/// Activity log that logs each record and broadcasts it to subscribers.
pub struct BroadcastActivityLog {
    tx: broadcast::Sender<ActivityRecord>,
}

impl Default for BroadcastActivityLog {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl BroadcastActivityLog {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Receive records appended from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ActivityRecord> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl ActivityLog for BroadcastActivityLog {
    async fn append(&self, record: ActivityRecord) -> Result<(), StoreError> {
        info!(
            activity = %record.activity_type,
            rule_id = ?record.rule_id,
            "{}",
            record.description
        );
        // No subscribers is not an error.
        if self.tx.send(record).is_err() {
            debug!("No activity subscribers");
        }
        Ok(())
    }
}
