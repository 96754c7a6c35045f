//! Content republisher: turns a matched event into a brand-new outbound message.
//!
//! Content is never natively forwarded, so forward-restricted sources still
//! come through. Media goes through an ordered list of strategies; each one
//! is tried only if the previous failed, and only the last one's failure is
//! reported.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::channels::{MediaPayload, MediaUpload, Publisher, TargetHandle};
use crate::error::PublishError;
use crate::pipeline::types::{Content, InboundEvent, Media, MediaKind, MediaSource};

/// Sent for content the engine cannot represent.
pub const UNSUPPORTED_PLACEHOLDER: &str = "[Empty or unsupported message]";

/// Sent when media could not be copied and there is no caption to keep.
pub const MEDIA_PLACEHOLDER: &str = "📎 [Media from protected chat - couldn't be copied]";

/// How a publish was ultimately delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Text sent verbatim.
    Text,
    /// Poll, contact or location rendered to text.
    Rendered,
    /// Native media reference re-sent.
    Direct,
    /// Media downloaded and uploaded again.
    Reupload,
    /// Media replaced by a placeholder text.
    Placeholder,
    /// Unknown content replaced by the unsupported placeholder.
    Unsupported,
}

impl Delivery {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Rendered => "rendered",
            Self::Direct => "direct",
            Self::Reupload => "reupload",
            Self::Placeholder => "placeholder",
            Self::Unsupported => "unsupported",
        }
    }
}

/// Media fallback tiers, in the order they are attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaStrategy {
    Direct,
    Reupload,
    Placeholder,
}

const MEDIA_STRATEGIES: [MediaStrategy; 3] = [
    MediaStrategy::Direct,
    MediaStrategy::Reupload,
    MediaStrategy::Placeholder,
];

impl MediaStrategy {
    fn delivery(self) -> Delivery {
        match self {
            Self::Direct => Delivery::Direct,
            Self::Reupload => Delivery::Reupload,
            Self::Placeholder => Delivery::Placeholder,
        }
    }
}

/// Publishes matched content to a resolved target.
pub struct Republisher {
    publisher: Arc<dyn Publisher>,
}

impl Republisher {
    pub fn new(publisher: Arc<dyn Publisher>) -> Self {
        Self { publisher }
    }

    /// Publish `event`'s content to `target` as a new message.
    pub async fn republish(
        &self,
        target: &TargetHandle,
        event: &InboundEvent,
    ) -> Result<Delivery, PublishError> {
        match &event.content {
            Content::Text(text) if !text.is_empty() => {
                self.publisher.send_text(target, text).await?;
                Ok(Delivery::Text)
            }
            Content::Media(media) => self.republish_media(target, event, media).await,
            content @ (Content::Poll { .. } | Content::Contact { .. } | Content::Location { .. }) => {
                // Rendering is total for these variants.
                let text = render_structured(content).unwrap_or_default();
                self.publisher.send_text(target, &text).await?;
                Ok(Delivery::Rendered)
            }
            Content::Text(_) | Content::Unknown => {
                self.publisher
                    .send_text(target, UNSUPPORTED_PLACEHOLDER)
                    .await?;
                Ok(Delivery::Unsupported)
            }
        }
    }

    async fn republish_media(
        &self,
        target: &TargetHandle,
        event: &InboundEvent,
        media: &Media,
    ) -> Result<Delivery, PublishError> {
        let mut last_error = None;

        for strategy in MEDIA_STRATEGIES {
            let attempt = match strategy {
                MediaStrategy::Direct => self.send_direct(target, media).await,
                MediaStrategy::Reupload => self.send_reupload(target, event, media).await,
                MediaStrategy::Placeholder => {
                    self.publisher
                        .send_text(target, &media_placeholder(media.caption.as_deref()))
                        .await
                }
            };

            match attempt {
                Ok(()) => {
                    debug!(
                        message_id = event.message_id,
                        strategy = strategy.delivery().label(),
                        "Media republished"
                    );
                    return Ok(strategy.delivery());
                }
                Err(e) => {
                    if strategy == MediaStrategy::Placeholder {
                        warn!(message_id = event.message_id, error = %e, "Media placeholder send failed");
                    } else {
                        debug!(
                            message_id = event.message_id,
                            strategy = strategy.delivery().label(),
                            error = %e,
                            "Media strategy failed, falling back"
                        );
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| PublishError::SendFailed {
            target: target.to_string(),
            reason: "no media strategy attempted".into(),
        }))
    }

    async fn send_direct(&self, target: &TargetHandle, media: &Media) -> Result<(), PublishError> {
        let payload = match &media.source {
            MediaSource::Reference(id) => MediaPayload::Reference(id.clone()),
            MediaSource::Bytes(bytes) => MediaPayload::Bytes(bytes.clone()),
        };
        let upload = MediaUpload {
            kind: media.kind,
            payload,
            file_name: media.file_name.clone(),
            caption: media.caption.clone(),
            supports_streaming: false,
        };
        self.publisher.send_media(target, upload).await
    }

    async fn send_reupload(
        &self,
        target: &TargetHandle,
        event: &InboundEvent,
        media: &Media,
    ) -> Result<(), PublishError> {
        let bytes = self.publisher.download_media(event).await?;
        if bytes.is_empty() {
            return Err(PublishError::DownloadFailed("empty media body".into()));
        }

        let (kind, supports_streaming) = classify_reupload(media);
        let file_name = media
            .file_name
            .clone()
            .unwrap_or_else(|| synthesize_filename(media, event.timestamp.timestamp()));

        let upload = MediaUpload {
            kind,
            payload: MediaPayload::Bytes(bytes),
            file_name: Some(file_name),
            caption: media.caption.clone(),
            supports_streaming,
        };
        self.publisher.send_media(target, upload).await
    }
}

// ── Rendering ───────────────────────────────────────────────────────

/// Render a poll, contact or location as text. `None` for anything else.
pub fn render_structured(content: &Content) -> Option<String> {
    match content {
        Content::Poll { question, answers } => {
            let mut text = format!("📊 Poll: {question}");
            for (i, answer) in answers.iter().enumerate() {
                text.push_str(&format!("\n{}. {answer}", i + 1));
            }
            Some(text)
        }
        Content::Contact {
            first_name,
            last_name,
            phone,
        } => {
            let name = match last_name.as_deref().filter(|l| !l.is_empty()) {
                Some(last) => format!("{first_name} {last}"),
                None => first_name.clone(),
            };
            Some(format!("📞 Contact:\nName: {name}\nPhone: {phone}"))
        }
        Content::Location {
            latitude,
            longitude,
        } => Some(format!(
            "📍 Location:\nLatitude: {latitude}\nLongitude: {longitude}"
        )),
        _ => None,
    }
}

/// Text published when media could not be copied at all.
pub fn media_placeholder(caption: Option<&str>) -> String {
    match caption.filter(|c| !c.is_empty()) {
        Some(caption) => format!("📎 [Media couldn't be copied]\n{caption}"),
        None => MEDIA_PLACEHOLDER.to_string(),
    }
}

// ── Media classification ────────────────────────────────────────────

/// Pick the upload kind for re-uploaded bytes. Returns `(kind, supports_streaming)`.
pub fn classify_reupload(media: &Media) -> (MediaKind, bool) {
    let mime = media
        .mime_type
        .as_deref()
        .unwrap_or_default()
        .to_ascii_lowercase();

    if media.kind == MediaKind::Photo || mime.starts_with("image/") {
        (MediaKind::Photo, false)
    } else if media.kind == MediaKind::Video || mime.starts_with("video/") {
        (MediaKind::Video, true)
    } else {
        (MediaKind::Document, false)
    }
}

/// `"{Kind}_{unix_ts}.{ext}"` for media whose original name is unknown.
pub fn synthesize_filename(media: &Media, unix_ts: i64) -> String {
    if media.kind == MediaKind::Photo {
        return format!("Photo_{unix_ts}.jpg");
    }

    let mime = media
        .mime_type
        .as_deref()
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| default_mime(media.kind).to_string());

    let (stem, ext) = if mime.contains("image") {
        if mime.contains("png") {
            ("Image", Some("png"))
        } else if mime.contains("gif") {
            ("Animation", Some("gif"))
        } else {
            ("Image", Some("jpg"))
        }
    } else if mime.contains("video") {
        if mime.contains("webm") {
            ("Video", Some("webm"))
        } else {
            ("Video", Some("mp4"))
        }
    } else if mime.contains("audio") {
        if mime.contains("ogg") {
            ("Voice", Some("ogg"))
        } else {
            ("Audio", Some("mp3"))
        }
    } else if mime.contains("application/pdf") {
        ("Document", Some("pdf"))
    } else if mime.contains("text") {
        ("TextFile", Some("txt"))
    } else {
        ("Document", None)
    };

    match ext {
        Some(ext) => format!("{stem}_{unix_ts}.{ext}"),
        None => format!("{stem}_{unix_ts}"),
    }
}

/// Mime assumed when the provider reported none.
fn default_mime(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Photo => "image/jpeg",
        MediaKind::Video => "video/mp4",
        MediaKind::Animation => "image/gif",
        MediaKind::Audio => "audio/mpeg",
        MediaKind::Voice => "audio/ogg",
        MediaKind::Document => "",
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Text(String),
        Media(MediaUpload),
    }

    /// Publisher with switchable failures per primitive.
    #[derive(Default)]
    struct ScriptedPublisher {
        fail_reference: bool,
        fail_bytes: bool,
        fail_text: bool,
        download: Option<Vec<u8>>,
        sent: Mutex<Vec<Sent>>,
    }

    impl ScriptedPublisher {
        fn sent(&self) -> Vec<Sent> {
            self.sent.lock().unwrap().clone()
        }
    }

    fn failed(reason: &str) -> PublishError {
        PublishError::SendFailed {
            target: "t".into(),
            reason: reason.into(),
        }
    }

    #[async_trait]
    impl Publisher for ScriptedPublisher {
        async fn resolve_target(&self, spec: &str) -> Result<TargetHandle, PublishError> {
            Ok(TargetHandle::new(spec))
        }

        async fn send_text(&self, _: &TargetHandle, text: &str) -> Result<(), PublishError> {
            if self.fail_text {
                return Err(failed("text"));
            }
            self.sent.lock().unwrap().push(Sent::Text(text.into()));
            Ok(())
        }

        async fn send_media(&self, _: &TargetHandle, upload: MediaUpload) -> Result<(), PublishError> {
            let fail = match upload.payload {
                MediaPayload::Reference(_) => self.fail_reference,
                MediaPayload::Bytes(_) => self.fail_bytes,
            };
            if fail {
                return Err(failed("media"));
            }
            self.sent.lock().unwrap().push(Sent::Media(upload));
            Ok(())
        }

        async fn download_media(&self, _: &InboundEvent) -> Result<Vec<u8>, PublishError> {
            self.download
                .clone()
                .ok_or_else(|| PublishError::DownloadFailed("not scripted".into()))
        }
    }

    fn target() -> TargetHandle {
        TargetHandle::new("@out")
    }

    fn media_event(media: Media) -> InboundEvent {
        InboundEvent::new(-100, 7, Content::Media(media))
    }

    fn photo() -> Media {
        Media::new(MediaKind::Photo, MediaSource::Reference("file-1".into())).with_caption("look")
    }

    #[tokio::test]
    async fn text_is_sent_verbatim() {
        let publisher = Arc::new(ScriptedPublisher::default());
        let republisher = Republisher::new(publisher.clone());
        let delivery = republisher
            .republish(&target(), &InboundEvent::text(1, 1, "hello"))
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Text);
        assert_eq!(publisher.sent(), vec![Sent::Text("hello".into())]);
    }

    #[tokio::test]
    async fn direct_send_keeps_caption() {
        let publisher = Arc::new(ScriptedPublisher::default());
        let republisher = Republisher::new(publisher.clone());
        let delivery = republisher
            .republish(&target(), &media_event(photo()))
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Direct);
        let Sent::Media(upload) = &publisher.sent()[0] else {
            panic!("expected media");
        };
        assert_eq!(upload.payload, MediaPayload::Reference("file-1".into()));
        assert_eq!(upload.caption.as_deref(), Some("look"));
    }

    #[tokio::test]
    async fn falls_back_to_reupload() {
        let publisher = Arc::new(ScriptedPublisher {
            fail_reference: true,
            download: Some(vec![1, 2, 3]),
            ..Default::default()
        });
        let republisher = Republisher::new(publisher.clone());
        let media = Media::new(MediaKind::Document, MediaSource::Reference("v".into()))
            .with_mime_type("video/mp4");
        let delivery = republisher
            .republish(&target(), &media_event(media))
            .await
            .unwrap();

        assert_eq!(delivery, Delivery::Reupload);
        let sent = publisher.sent();
        assert_eq!(sent.len(), 1);
        let Sent::Media(upload) = &sent[0] else {
            panic!("expected media");
        };
        assert_eq!(upload.kind, MediaKind::Video);
        assert!(upload.supports_streaming);
        assert_eq!(upload.payload, MediaPayload::Bytes(vec![1, 2, 3]));
        assert!(upload.file_name.as_deref().unwrap().starts_with("Video_"));
    }

    #[tokio::test]
    async fn reupload_keeps_original_filename() {
        let publisher = Arc::new(ScriptedPublisher {
            fail_reference: true,
            download: Some(vec![9]),
            ..Default::default()
        });
        let republisher = Republisher::new(publisher.clone());
        let media = Media::new(MediaKind::Document, MediaSource::Reference("d".into()))
            .with_file_name("report.xlsx");
        republisher
            .republish(&target(), &media_event(media))
            .await
            .unwrap();
        let Sent::Media(upload) = &publisher.sent()[0] else {
            panic!("expected media");
        };
        assert_eq!(upload.kind, MediaKind::Document);
        assert_eq!(upload.file_name.as_deref(), Some("report.xlsx"));
    }

    #[tokio::test]
    async fn placeholder_keeps_caption() {
        let publisher = Arc::new(ScriptedPublisher {
            fail_reference: true,
            ..Default::default()
        });
        let republisher = Republisher::new(publisher.clone());
        let delivery = republisher
            .republish(&target(), &media_event(photo()))
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Placeholder);
        assert_eq!(
            publisher.sent(),
            vec![Sent::Text("📎 [Media couldn't be copied]\nlook".into())]
        );
    }

    #[tokio::test]
    async fn empty_download_falls_through() {
        let publisher = Arc::new(ScriptedPublisher {
            fail_reference: true,
            download: Some(Vec::new()),
            ..Default::default()
        });
        let republisher = Republisher::new(publisher.clone());
        let media = Media::new(MediaKind::Photo, MediaSource::Reference("p".into()));
        let delivery = republisher
            .republish(&target(), &media_event(media))
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Placeholder);
        assert_eq!(publisher.sent(), vec![Sent::Text(MEDIA_PLACEHOLDER.into())]);
    }

    #[tokio::test]
    async fn only_final_tier_failure_is_reported() {
        let publisher = Arc::new(ScriptedPublisher {
            fail_reference: true,
            fail_bytes: true,
            fail_text: true,
            download: Some(vec![1]),
            ..Default::default()
        });
        let republisher = Republisher::new(publisher.clone());
        let err = republisher
            .republish(&target(), &media_event(photo()))
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::SendFailed { ref reason, .. } if reason == "text"));
    }

    #[tokio::test]
    async fn unknown_and_empty_text_get_unsupported_placeholder() {
        let publisher = Arc::new(ScriptedPublisher::default());
        let republisher = Republisher::new(publisher.clone());
        for content in [Content::Unknown, Content::Text(String::new())] {
            let delivery = republisher
                .republish(&target(), &InboundEvent::new(1, 1, content))
                .await
                .unwrap();
            assert_eq!(delivery, Delivery::Unsupported);
        }
        assert_eq!(
            publisher.sent(),
            vec![
                Sent::Text(UNSUPPORTED_PLACEHOLDER.into()),
                Sent::Text(UNSUPPORTED_PLACEHOLDER.into())
            ]
        );
    }

    #[tokio::test]
    async fn structured_content_is_sent_as_text() {
        let publisher = Arc::new(ScriptedPublisher::default());
        let republisher = Republisher::new(publisher.clone());
        let poll = Content::Poll {
            question: "Lunch?".into(),
            answers: vec!["Pizza".into(), "Sushi".into()],
        };
        let delivery = republisher
            .republish(&target(), &InboundEvent::new(1, 1, poll))
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::Rendered);
        assert_eq!(
            publisher.sent(),
            vec![Sent::Text("📊 Poll: Lunch?\n1. Pizza\n2. Sushi".into())]
        );
    }

    #[test]
    fn renders_contact_and_location() {
        let contact = Content::Contact {
            first_name: "Ada".into(),
            last_name: None,
            phone: "+100".into(),
        };
        assert_eq!(
            render_structured(&contact).unwrap(),
            "📞 Contact:\nName: Ada\nPhone: +100"
        );

        let location = Content::Location {
            latitude: 51.5,
            longitude: -0.12,
        };
        assert_eq!(
            render_structured(&location).unwrap(),
            "📍 Location:\nLatitude: 51.5\nLongitude: -0.12"
        );
        assert!(render_structured(&Content::Unknown).is_none());
    }

    #[test]
    fn classify_by_mime_hint() {
        let doc = |mime: &str| {
            Media::new(MediaKind::Document, MediaSource::Reference("x".into())).with_mime_type(mime)
        };
        assert_eq!(classify_reupload(&doc("image/png")), (MediaKind::Photo, false));
        assert_eq!(classify_reupload(&doc("video/webm")), (MediaKind::Video, true));
        assert_eq!(classify_reupload(&doc("application/zip")), (MediaKind::Document, false));
        assert_eq!(classify_reupload(&photo()), (MediaKind::Photo, false));
    }

    #[test]
    fn synthesized_names() {
        let with = |kind, mime: Option<&str>| {
            let media = Media::new(kind, MediaSource::Reference("x".into()));
            let media = match mime {
                Some(m) => media.with_mime_type(m),
                None => media,
            };
            synthesize_filename(&media, 1700)
        };
        assert_eq!(with(MediaKind::Photo, None), "Photo_1700.jpg");
        assert_eq!(with(MediaKind::Document, Some("image/png")), "Image_1700.png");
        assert_eq!(with(MediaKind::Document, Some("image/gif")), "Animation_1700.gif");
        assert_eq!(with(MediaKind::Document, Some("video/webm")), "Video_1700.webm");
        assert_eq!(with(MediaKind::Voice, None), "Voice_1700.ogg");
        assert_eq!(with(MediaKind::Document, Some("audio/mpeg")), "Audio_1700.mp3");
        assert_eq!(with(MediaKind::Document, Some("application/pdf")), "Document_1700.pdf");
        assert_eq!(with(MediaKind::Document, Some("text/plain")), "TextFile_1700.txt");
        assert_eq!(with(MediaKind::Document, None), "Document_1700");
    }
}
