//! Shared types for the forwarding pipeline.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Channel identifiers ─────────────────────────────────────────────

/// Offset the provider subtracts from raw broadcast/supergroup ids.
pub const CHANNEL_ID_OFFSET: i64 = 1_000_000_000_000;

/// Encode a raw broadcast/supergroup id the way inbound events carry it.
///
/// `None` when the encoded id would not fit in an `i64`.
pub fn broadcast_channel_id(raw: i64) -> Option<i64> {
    CHANNEL_ID_OFFSET
        .checked_neg()
        .and_then(|offset| offset.checked_sub(raw))
}

// ── Rules ───────────────────────────────────────────────────────────

/// Keyword filters applied to the textual body of an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleFilters {
    /// At least one must appear (case-insensitive) when non-empty.
    #[serde(default, rename = "keywords")]
    pub include_keywords: BTreeSet<String>,
    /// None may appear (case-insensitive).
    #[serde(default)]
    pub exclude_keywords: BTreeSet<String>,
}

impl RuleFilters {
    pub fn include<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_keywords
            .extend(keywords.into_iter().map(Into::into));
        self
    }

    pub fn exclude<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_keywords
            .extend(keywords.into_iter().map(Into::into));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.include_keywords.is_empty() && self.exclude_keywords.is_empty()
    }
}

/// An active forwarding rule: one source channel to one target.
///
/// Rules held by the engine are always enabled; disabling a rule removes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardingRule {
    /// Engine-local id, unique within the active set.
    pub id: u64,
    /// Id assigned by the external rule store, if any.
    pub external_id: Option<i64>,
    /// Source spec: handle (`@name` / `name`) or numeric channel id.
    pub source: String,
    /// Target spec: handle or numeric channel id.
    pub target: String,
    pub filters: RuleFilters,
    pub enabled: bool,
    /// Successful publishes through this rule. Never decreases.
    pub message_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Request to add a rule to the active set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewRule {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub filters: RuleFilters,
    #[serde(default)]
    pub external_id: Option<i64>,
}

impl NewRule {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            filters: RuleFilters::default(),
            external_id: None,
        }
    }

    pub fn with_filters(mut self, filters: RuleFilters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_external_id(mut self, id: i64) -> Self {
        self.external_id = Some(id);
        self
    }
}

// ── Inbound events ──────────────────────────────────────────────────

/// A message delivered by the event source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    /// Channel id as the provider encodes it (may carry the broadcast offset).
    pub source_channel_id: i64,
    pub message_id: i64,
    pub timestamp: DateTime<Utc>,
    pub content: Content,
}

impl InboundEvent {
    pub fn new(source_channel_id: i64, message_id: i64, content: Content) -> Self {
        Self {
            source_channel_id,
            message_id,
            timestamp: Utc::now(),
            content,
        }
    }

    pub fn text(source_channel_id: i64, message_id: i64, text: impl Into<String>) -> Self {
        Self::new(source_channel_id, message_id, Content::Text(text.into()))
    }
}

/// Message content, by variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Content {
    Text(String),
    Media(Media),
    Poll {
        question: String,
        answers: Vec<String>,
    },
    Contact {
        first_name: String,
        last_name: Option<String>,
        phone: String,
    },
    Location {
        latitude: f64,
        longitude: f64,
    },
    Unknown,
}

impl Content {
    /// Body that keyword filters see. Media captions are deliberately not included.
    pub fn text_body(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Whether the content carries any human text (body or caption).
    pub fn has_text(&self) -> bool {
        match self {
            Self::Text(text) => !text.is_empty(),
            Self::Media(media) => media.caption.as_deref().is_some_and(|c| !c.is_empty()),
            _ => false,
        }
    }

    /// Short label for logging and activity details.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Media(_) => "media",
            Self::Poll { .. } => "poll",
            Self::Contact { .. } => "contact",
            Self::Location { .. } => "location",
            Self::Unknown => "unknown",
        }
    }
}

/// Media attached to an inbound event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Media {
    pub kind: MediaKind,
    pub source: MediaSource,
    pub caption: Option<String>,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
}

impl Media {
    pub fn new(kind: MediaKind, source: MediaSource) -> Self {
        Self {
            kind,
            source,
            caption: None,
            mime_type: None,
            file_name: None,
        }
    }

    pub fn with_caption(mut self, caption: impl Into<String>) -> Self {
        self.caption = Some(caption.into());
        self
    }

    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }

    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }
}

/// Provider-reported media kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Video,
    Animation,
    Audio,
    Voice,
    Document,
}

impl MediaKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Photo => "photo",
            Self::Video => "video",
            Self::Animation => "animation",
            Self::Audio => "audio",
            Self::Voice => "voice",
            Self::Document => "document",
        }
    }
}

/// Where media bytes come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaSource {
    /// Provider-native reference (e.g. a file id) that can be re-sent as-is.
    Reference(String),
    /// Raw bytes already in memory.
    Bytes(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_id_applies_offset() {
        assert_eq!(broadcast_channel_id(1234567890), Some(-1_001_234_567_890));
    }

    #[test]
    fn broadcast_id_overflow_is_none() {
        assert_eq!(broadcast_channel_id(i64::MAX), None);
        assert_eq!(broadcast_channel_id(i64::MAX - CHANNEL_ID_OFFSET), None);
        assert!(broadcast_channel_id(-CHANNEL_ID_OFFSET).is_some());
    }

    #[test]
    fn text_body_only_for_text() {
        let media = Content::Media(
            Media::new(MediaKind::Photo, MediaSource::Reference("f".into()))
                .with_caption("sale"),
        );
        assert_eq!(media.text_body(), None);
        assert!(media.has_text());
        assert_eq!(Content::Text("hi".into()).text_body(), Some("hi"));
    }

    #[test]
    fn filters_deserialize_from_store_format() {
        let filters: RuleFilters =
            serde_json::from_str(r#"{"keywords": ["sale"], "exclude_keywords": ["spam"]}"#)
                .unwrap();
        assert!(filters.include_keywords.contains("sale"));
        assert!(filters.exclude_keywords.contains("spam"));
    }

    #[test]
    fn filters_default_when_missing() {
        let rule: NewRule = serde_json::from_str(r#"{"source": "@a", "target": "@b"}"#).unwrap();
        assert!(rule.filters.is_empty());
        assert_eq!(rule.external_id, None);
    }

    #[test]
    fn content_labels() {
        assert_eq!(Content::Unknown.label(), "unknown");
        assert_eq!(
            Content::Location {
                latitude: 1.0,
                longitude: 2.0
            }
            .label(),
            "location"
        );
    }
}
