//! `RuleStore` trait: where persisted forwarding rules come from.
//!
//! The engine never writes back: the store layer calls the engine's
//! `add_rule` / `remove_rule` after its own writes succeed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::pipeline::types::{NewRule, RuleFilters};

/// A persisted forwarding rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRule {
    /// Store-assigned id. Becomes the engine rule's external id.
    pub id: i64,
    pub source: String,
    pub target: String,
    #[serde(flatten)]
    pub filters: RuleFilters,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl StoredRule {
    /// Request to activate this rule in the engine.
    pub fn to_new_rule(&self) -> NewRule {
        NewRule::new(&self.source, &self.target)
            .with_filters(self.filters.clone())
            .with_external_id(self.id)
    }
}

/// Read side of the rule store used for reconciliation.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Every rule currently marked enabled.
    async fn list_enabled_rules(&self) -> Result<Vec<StoredRule>, StoreError>;
}
