//! Provider-facing traits the engine depends on.
//!
//! Each provider implements these against its own API. The engine only ever
//! talks to a provider through them.

use async_trait::async_trait;

use crate::error::{ChannelError, PublishError, ResolutionError};
use crate::pipeline::queue::EventSink;
use crate::pipeline::types::{InboundEvent, MediaKind};

/// Delivers inbound events through a registered sink. The engine never polls it.
pub trait EventSource: Send + Sync {
    /// Source name (e.g. "telegram").
    fn name(&self) -> &str;

    /// Register the sink. Deliveries must not block.
    fn subscribe(&self, sink: EventSink) -> Result<(), ChannelError>;
}

/// Maps a human-readable spec (handle or numeric literal) to a canonical channel id.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Returns the raw id. The matcher applies the broadcast offset itself.
    async fn resolve(&self, spec: &str) -> Result<i64, ResolutionError>;
}

/// Reports whether the provider session is usable.
pub trait SessionProvider: Send + Sync {
    fn is_authenticated(&self) -> bool;
}

/// A resolved publish destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetHandle {
    pub chat_id: String,
}

impl TargetHandle {
    pub fn new(chat_id: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
        }
    }
}

impl std::fmt::Display for TargetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.chat_id)
    }
}

/// Media payload for an outbound publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaPayload {
    /// Provider-native reference, re-sent without transferring bytes.
    Reference(String),
    /// Bytes to upload.
    Bytes(Vec<u8>),
}

/// Outbound media publish request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaUpload {
    pub kind: MediaKind,
    pub payload: MediaPayload,
    pub file_name: Option<String>,
    pub caption: Option<String>,
    /// Request streaming playback for videos.
    pub supports_streaming: bool,
}

/// Publish primitives.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Resolve a target spec into something the send primitives accept.
    async fn resolve_target(&self, spec: &str) -> Result<TargetHandle, PublishError>;

    async fn send_text(&self, target: &TargetHandle, text: &str) -> Result<(), PublishError>;

    async fn send_media(
        &self,
        target: &TargetHandle,
        upload: MediaUpload,
    ) -> Result<(), PublishError>;

    /// Fetch the full bytes of the media attached to `event`.
    async fn download_media(&self, event: &InboundEvent) -> Result<Vec<u8>, PublishError>;
}
