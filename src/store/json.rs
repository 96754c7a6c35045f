//! JSON-file rule store.
//!
//! The whole file is one array of [`StoredRule`]. A missing file is an empty
//! store. Writes go to a sibling temp file that is then renamed over the original.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::pipeline::types::RuleFilters;
use crate::store::traits::{RuleStore, StoredRule};

/// Rule store backed by a single JSON file.
pub struct JsonRuleStore {
    path: PathBuf,
    // Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl JsonRuleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All rules, enabled or not.
    pub async fn list_rules(&self) -> Result<Vec<StoredRule>, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Rules file not found, starting empty");
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Persist a new rule and return it with its assigned id.
    pub async fn insert_rule(
        &self,
        source: &str,
        target: &str,
        filters: RuleFilters,
    ) -> Result<StoredRule, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut rules = self.list_rules().await?;

        let rule = StoredRule {
            id: rules.iter().map(|r| r.id).max().unwrap_or(0) + 1,
            source: source.to_string(),
            target: target.to_string(),
            filters,
            enabled: true,
        };
        rules.push(rule.clone());
        self.write_all(&rules).await?;

        info!(id = rule.id, source, target, "Stored forwarding rule");
        Ok(rule)
    }

    /// Flip a rule's enabled flag.
    pub async fn set_enabled(&self, id: i64, enabled: bool) -> Result<StoredRule, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut rules = self.list_rules().await?;

        let rule = rules
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound { id })?;
        rule.enabled = enabled;
        let updated = rule.clone();

        self.write_all(&rules).await?;
        Ok(updated)
    }

    pub async fn delete_rule(&self, id: i64) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut rules = self.list_rules().await?;

        let before = rules.len();
        rules.retain(|r| r.id != id);
        if rules.len() == before {
            return Err(StoreError::NotFound { id });
        }

        self.write_all(&rules).await
    }

    async fn write_all(&self, rules: &[StoredRule]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(rules)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl RuleStore for JsonRuleStore {
    async fn list_enabled_rules(&self) -> Result<Vec<StoredRule>, StoreError> {
        let rules = self.list_rules().await?;
        Ok(rules.into_iter().filter(|r| r.enabled).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, JsonRuleStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonRuleStore::new(dir.path().join("data").join("rules.json"));
        (dir, store)
    }

    #[tokio::test]
    async fn missing_file_is_empty() {
        let (_dir, store) = store();
        assert!(store.list_enabled_rules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn insert_assigns_increasing_ids() {
        let (_dir, store) = store();
        let a = store
            .insert_rule("@a", "@b", RuleFilters::default())
            .await
            .unwrap();
        let b = store
            .insert_rule("@c", "@d", RuleFilters::default().include(["sale"]))
            .await
            .unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);

        let rules = store.list_rules().await.unwrap();
        assert_eq!(rules.len(), 2);
        assert!(rules[1].filters.include_keywords.contains("sale"));
    }

    #[tokio::test]
    async fn disabled_rules_are_not_listed_as_enabled() {
        let (_dir, store) = store();
        let a = store
            .insert_rule("@a", "@b", RuleFilters::default())
            .await
            .unwrap();
        store
            .insert_rule("@c", "@d", RuleFilters::default())
            .await
            .unwrap();
        store.set_enabled(a.id, false).await.unwrap();

        let enabled = store.list_enabled_rules().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].source, "@c");
    }

    #[tokio::test]
    async fn delete_missing_rule_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.delete_rule(9).await,
            Err(StoreError::NotFound { id: 9 })
        ));
    }

    #[tokio::test]
    async fn reads_hand_written_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(
            &path,
            r#"[
                {"id": 7, "source": "@news", "target": "-100200", "keywords": ["sale"], "exclude_keywords": ["spam"]},
                {"id": 8, "source": "@x", "target": "@y", "enabled": false}
            ]"#,
        )
        .unwrap();

        let store = JsonRuleStore::new(&path);
        let enabled = store.list_enabled_rules().await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, 7);
        assert!(enabled[0].filters.exclude_keywords.contains("spam"));
    }

    #[tokio::test]
    async fn garbage_file_is_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, "not json").unwrap();
        let store = JsonRuleStore::new(&path);
        assert!(matches!(
            store.list_rules().await,
            Err(StoreError::Serialization(_))
        ));
    }
}
