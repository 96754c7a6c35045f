//! Rule matcher: decides whether an inbound event belongs to a rule.
//!
//! Two checks, in order:
//! - Source: the rule's source spec is resolved to a channel id and compared
//!   against the event's channel id, raw encoding first, then the broadcast
//!   offset encoding.
//! - Keywords: include (any hit, when non-empty) then exclude (no hit), matched
//!   case-insensitively against the text body only.
//!
//! A resolution failure is a non-match, never an error.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::channels::IdentityResolver;
use crate::pipeline::types::{Content, ForwardingRule, RuleFilters, broadcast_channel_id};

/// Evaluates events against rules, caching successful resolutions.
pub struct RuleMatcher {
    resolver: Arc<dyn IdentityResolver>,
    resolved: RwLock<HashMap<String, i64>>,
}

impl RuleMatcher {
    pub fn new(resolver: Arc<dyn IdentityResolver>) -> Self {
        Self {
            resolver,
            resolved: RwLock::new(HashMap::new()),
        }
    }

    /// Whether `rule` accepts an event from `source_channel_id` with `content`.
    pub async fn matches(
        &self,
        rule: &ForwardingRule,
        source_channel_id: i64,
        content: &Content,
    ) -> bool {
        if !self.source_matches(&rule.source, source_channel_id).await {
            return false;
        }
        let passed = filters_pass(&rule.filters, content);
        if !passed {
            debug!(rule_id = rule.id, "Event filtered out by keywords");
        }
        passed
    }

    async fn source_matches(&self, spec: &str, source_channel_id: i64) -> bool {
        let Some(resolved) = self.resolve(spec).await else {
            return false;
        };

        if channel_ids_match(resolved, source_channel_id) {
            return true;
        }

        // Numeric literals also match on magnitude, so "-100123" and "100123" agree.
        let literal = spec.trim().parse::<i64>().is_ok();
        literal && resolved.unsigned_abs() == source_channel_id.unsigned_abs()
    }

    async fn resolve(&self, spec: &str) -> Option<i64> {
        if let Some(id) = self.resolved.read().await.get(spec) {
            return Some(*id);
        }

        match self.resolver.resolve(spec).await {
            Ok(id) => {
                self.resolved.write().await.insert(spec.to_string(), id);
                Some(id)
            }
            Err(e) => {
                debug!(spec, error = %e, "Source spec did not resolve, treating as non-match");
                None
            }
        }
    }

    /// Forget cached resolutions (e.g. after a handle changed owner).
    pub async fn clear_cache(&self) {
        self.resolved.write().await.clear();
    }
}

/// Compare a resolved id against an event's channel id in both encodings.
///
/// An id with no valid offset encoding only matches raw.
pub fn channel_ids_match(resolved: i64, event_channel_id: i64) -> bool {
    resolved == event_channel_id || broadcast_channel_id(resolved) == Some(event_channel_id)
}

/// Apply include then exclude keywords to the textual body of `content`.
///
/// Content without a text body (media, polls, contacts, locations) passes only
/// when both keyword sets are empty.
pub fn filters_pass(filters: &RuleFilters, content: &Content) -> bool {
    let Some(text) = content.text_body() else {
        return filters.is_empty();
    };
    let text = text.to_lowercase();

    if !filters.include_keywords.is_empty()
        && !filters
            .include_keywords
            .iter()
            .any(|k| text.contains(&k.to_lowercase()))
    {
        return false;
    }

    !filters
        .exclude_keywords
        .iter()
        .any(|k| text.contains(&k.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::error::ResolutionError;
    use crate::pipeline::types::{Media, MediaKind, MediaSource};

    struct MapResolver {
        entries: HashMap<String, i64>,
        calls: AtomicUsize,
    }

    impl MapResolver {
        fn new(entries: &[(&str, i64)]) -> Self {
            Self {
                entries: entries.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl IdentityResolver for MapResolver {
        async fn resolve(&self, spec: &str) -> Result<i64, ResolutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(id) = spec.parse() {
                return Ok(id);
            }
            self.entries
                .get(spec)
                .copied()
                .ok_or_else(|| ResolutionError::NotFound { spec: spec.into() })
        }
    }

    fn rule(source: &str, filters: RuleFilters) -> ForwardingRule {
        ForwardingRule {
            id: 1,
            external_id: None,
            source: source.into(),
            target: "@out".into(),
            filters,
            enabled: true,
            message_count: 0,
            created_at: Utc::now(),
        }
    }

    fn text(s: &str) -> Content {
        Content::Text(s.into())
    }

    fn matcher(entries: &[(&str, i64)]) -> (RuleMatcher, Arc<MapResolver>) {
        let resolver = Arc::new(MapResolver::new(entries));
        (RuleMatcher::new(resolver.clone()), resolver)
    }

    #[tokio::test]
    async fn matches_raw_id() {
        let (m, _) = matcher(&[("@group", 4242)]);
        assert!(m.matches(&rule("@group", RuleFilters::default()), 4242, &text("x")).await);
    }

    #[tokio::test]
    async fn matches_offset_encoded_channel() {
        let (m, _) = matcher(&[("@news", 1234567890)]);
        let r = rule("@news", RuleFilters::default());
        assert!(m.matches(&r, -1_001_234_567_890, &text("x")).await);
        assert!(!m.matches(&r, -1_001_234_567_891, &text("x")).await);
    }

    #[tokio::test]
    async fn numeric_literal_matches_on_magnitude() {
        let (m, _) = matcher(&[]);
        let r = rule("-555", RuleFilters::default());
        assert!(m.matches(&r, -555, &text("x")).await);
        assert!(m.matches(&r, 555, &text("x")).await);
        assert!(!m.matches(&r, 556, &text("x")).await);
    }

    #[tokio::test]
    async fn extreme_numeric_source_is_non_match() {
        let (m, _) = matcher(&[]);
        let r = rule("9223372036854775807", RuleFilters::default());
        assert!(!m.matches(&r, 10, &text("x")).await);
        assert!(m.matches(&r, i64::MAX, &text("x")).await);
    }

    #[test]
    fn ids_without_offset_encoding_compare_raw_only() {
        assert!(!channel_ids_match(i64::MAX, i64::MIN));
        assert!(channel_ids_match(i64::MAX, i64::MAX));
        assert!(channel_ids_match(5, -1_000_000_000_005));
    }

    #[tokio::test]
    async fn unresolvable_source_is_non_match() {
        let (m, _) = matcher(&[]);
        assert!(!m.matches(&rule("@ghost", RuleFilters::default()), 1, &text("x")).await);
    }

    #[tokio::test]
    async fn resolution_is_cached() {
        let (m, resolver) = matcher(&[("@group", 7)]);
        let r = rule("@group", RuleFilters::default());
        m.matches(&r, 7, &text("a")).await;
        m.matches(&r, 7, &text("b")).await;
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);

        m.clear_cache().await;
        m.matches(&r, 7, &text("c")).await;
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_resolution_is_not_cached() {
        let (m, resolver) = matcher(&[]);
        let r = rule("@ghost", RuleFilters::default());
        m.matches(&r, 1, &text("a")).await;
        m.matches(&r, 1, &text("a")).await;
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn include_keywords_case_insensitive() {
        let f = RuleFilters::default().include(["Sale"]);
        assert!(filters_pass(&f, &text("big SALE today")));
        assert!(!filters_pass(&f, &text("hello")));
    }

    #[test]
    fn include_is_or_matched() {
        let f = RuleFilters::default().include(["sale", "deal"]);
        assert!(filters_pass(&f, &text("great deal")));
    }

    #[test]
    fn exclude_rejects_any_hit() {
        let f = RuleFilters::default().include(["sale"]).exclude(["spam"]);
        assert!(!filters_pass(&f, &text("sale SPAM")));
        assert!(filters_pass(&f, &text("sale")));
    }

    #[test]
    fn empty_filters_pass_everything() {
        let f = RuleFilters::default();
        assert!(filters_pass(&f, &text("")));
        assert!(filters_pass(&f, &Content::Unknown));
    }

    #[test]
    fn structured_content_needs_empty_filters() {
        let media = Content::Media(
            Media::new(MediaKind::Photo, MediaSource::Reference("f".into()))
                .with_caption("sale"),
        );
        // Captions are not consulted.
        assert!(!filters_pass(&RuleFilters::default().include(["sale"]), &media));
        assert!(!filters_pass(&RuleFilters::default().exclude(["spam"]), &media));
        assert!(filters_pass(&RuleFilters::default(), &media));
    }
}
