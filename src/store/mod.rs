//! Rule persistence: the store the engine's active rules are reconciled from.

pub mod json;
pub mod traits;

pub use json::JsonRuleStore;
pub use traits::{RuleStore, StoredRule};
