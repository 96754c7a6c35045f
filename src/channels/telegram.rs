//! Telegram provider: Bot API over reqwest.
//!
//! One value implements every collaborator the engine needs: it long-polls
//! `getUpdates` into the engine's sink, resolves `@handles` via `getChat`,
//! and publishes through `sendMessage` / `send{Photo,Video,...}`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use secrecy::ExposeSecret;
use serde_json::{Value, json};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channels::{
    EventSource, IdentityResolver, MediaPayload, MediaUpload, Publisher, SessionProvider,
    TargetHandle,
};
use crate::config::TelegramConfig;
use crate::error::{ChannelError, PublishError, ResolutionError};
use crate::pipeline::queue::{EnqueueOutcome, EventSink};
use crate::pipeline::types::{Content, InboundEvent, Media, MediaKind, MediaSource};

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Pause after a failed poll before trying again.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Extra time on top of the long-poll timeout before the HTTP request gives up.
const POLL_HTTP_GRACE: Duration = Duration::from_secs(10);

/// Telegram Bot API provider.
pub struct TelegramProvider {
    config: TelegramConfig,
    client: reqwest::Client,
    authenticated: AtomicBool,
    chat_ids: RwLock<HashMap<String, i64>>,
    poller: Mutex<Option<(JoinHandle<()>, Arc<AtomicBool>)>>,
}

impl TelegramProvider {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            authenticated: AtomicBool::new(false),
            chat_ids: RwLock::new(HashMap::new()),
            poller: Mutex::new(None),
        }
    }

    fn api_url(&self, method: &str) -> String {
        api_url(&self.config, method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!(
            "{}/file/bot{}/{file_path}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token.expose_secret()
        )
    }

    /// Verify the bot token with `getMe`. Returns the bot's username.
    pub async fn authenticate(&self) -> Result<String, ChannelError> {
        let result = self.call("getMe", &json!({})).await;
        let me = match result {
            Ok(me) => me,
            Err(e) => {
                self.authenticated.store(false, Ordering::SeqCst);
                return Err(ChannelError::AuthFailed {
                    name: "telegram".into(),
                    reason: e.to_string(),
                });
            }
        };

        let username = me
            .get("username")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        self.authenticated.store(true, Ordering::SeqCst);
        info!(bot = %username, "Telegram bot authenticated");
        Ok(username)
    }

    /// Stop the update poller, if one is running.
    pub fn shutdown(&self) {
        let poller = self.poller.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((handle, shutdown)) = poller {
            shutdown.store(true, Ordering::SeqCst);
            handle.abort();
            info!("Telegram update poller stopped");
        }
    }

    /// POST a Bot API method and unwrap its `result`.
    async fn call(&self, method: &str, body: &Value) -> Result<Value, ApiError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(ApiError::transport)?;
        read_response(resp).await
    }

    async fn call_multipart(&self, method: &str, form: Form) -> Result<Value, ApiError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .multipart(form)
            .send()
            .await
            .map_err(ApiError::transport)?;
        read_response(resp).await
    }

    async fn send_message_chunk(&self, chat_id: &str, text: &str) -> Result<(), PublishError> {
        let body = json!({
            "chat_id": chat_id,
            "text": text,
        });
        self.call("sendMessage", &body)
            .await
            .map(|_| ())
            .map_err(|e| e.into_publish(chat_id))
    }

    fn media_file_id(event: &InboundEvent) -> Option<&str> {
        match &event.content {
            Content::Media(Media {
                source: MediaSource::Reference(file_id),
                ..
            }) => Some(file_id.as_str()),
            _ => None,
        }
    }
}

// ── Session ─────────────────────────────────────────────────────────

impl SessionProvider for TelegramProvider {
    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }
}

// ── Identity resolution ─────────────────────────────────────────────

#[async_trait]
impl IdentityResolver for TelegramProvider {
    async fn resolve(&self, spec: &str) -> Result<i64, ResolutionError> {
        let spec = spec.trim();
        if let Ok(id) = spec.parse::<i64>() {
            return Ok(id);
        }
        let handle = normalize_handle(spec)?;

        if let Some(id) = self.chat_ids.read().await.get(&handle) {
            return Ok(*id);
        }

        let chat = self
            .call("getChat", &json!({ "chat_id": handle }))
            .await
            .map_err(|e| match e.status {
                Some(400) | Some(404) => ResolutionError::NotFound {
                    spec: spec.to_string(),
                },
                _ => ResolutionError::LookupFailed {
                    spec: spec.to_string(),
                    reason: e.to_string(),
                },
            })?;

        let id = chat
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| ResolutionError::LookupFailed {
                spec: spec.to_string(),
                reason: "getChat result has no id".into(),
            })?;

        debug!(handle = %handle, id, "Resolved chat handle");
        self.chat_ids.write().await.insert(handle, id);
        Ok(id)
    }
}

/// `name` / `@name` → `@name`.
fn normalize_handle(spec: &str) -> Result<String, ResolutionError> {
    let name = spec.trim_start_matches('@');
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(ResolutionError::InvalidSpec(spec.to_string()));
    }
    Ok(format!("@{name}"))
}

// ── Publishing ──────────────────────────────────────────────────────

#[async_trait]
impl Publisher for TelegramProvider {
    async fn resolve_target(&self, spec: &str) -> Result<TargetHandle, PublishError> {
        let id = self
            .resolve(spec)
            .await
            .map_err(|e| PublishError::TargetUnresolved {
                spec: spec.to_string(),
                reason: e.to_string(),
            })?;
        Ok(TargetHandle::new(id.to_string()))
    }

    /// Splits text over Telegram's 4096 char limit into several messages.
    async fn send_text(&self, target: &TargetHandle, text: &str) -> Result<(), PublishError> {
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_message_chunk(&target.chat_id, &chunk).await?;
        }
        Ok(())
    }

    async fn send_media(
        &self,
        target: &TargetHandle,
        upload: MediaUpload,
    ) -> Result<(), PublishError> {
        let (method, field) = media_method(upload.kind);
        let chat_id = target.chat_id.as_str();

        let result = match upload.payload {
            MediaPayload::Reference(file_id) => {
                let mut body = json!({ "chat_id": chat_id });
                body[field] = Value::String(file_id);
                if let Some(caption) = upload.caption.filter(|c| !c.is_empty()) {
                    body["caption"] = Value::String(caption);
                }
                if upload.supports_streaming {
                    body["supports_streaming"] = Value::Bool(true);
                }
                self.call(method, &body).await
            }
            MediaPayload::Bytes(bytes) => {
                let file_name = upload
                    .file_name
                    .unwrap_or_else(|| format!("{}.bin", upload.kind.label()));
                let part = Part::bytes(bytes).file_name(file_name);

                let mut form = Form::new()
                    .text("chat_id", chat_id.to_string())
                    .part(field, part);
                if let Some(caption) = upload.caption.filter(|c| !c.is_empty()) {
                    form = form.text("caption", caption);
                }
                if upload.supports_streaming {
                    form = form.text("supports_streaming", "true");
                }
                self.call_multipart(method, form).await
            }
        };

        result.map(|_| ()).map_err(|e| e.into_publish(chat_id))
    }

    async fn download_media(&self, event: &InboundEvent) -> Result<Vec<u8>, PublishError> {
        let file_id = Self::media_file_id(event).ok_or_else(|| {
            PublishError::DownloadFailed(format!(
                "message {} has no downloadable media",
                event.message_id
            ))
        })?;

        let file = self
            .call("getFile", &json!({ "file_id": file_id }))
            .await
            .map_err(|e| PublishError::DownloadFailed(e.to_string()))?;
        let file_path = file
            .get("file_path")
            .and_then(Value::as_str)
            .ok_or_else(|| PublishError::DownloadFailed("getFile result has no file_path".into()))?;

        let resp = self
            .client
            .get(self.file_url(file_path))
            .send()
            .await
            .map_err(|e| PublishError::Http(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(PublishError::DownloadFailed(format!(
                "file download returned {}",
                resp.status()
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| PublishError::Http(e.to_string()))?;
        debug!(file_id, size = bytes.len(), "Downloaded media");
        Ok(bytes.to_vec())
    }
}

/// Bot API method and form field for a media kind.
fn media_method(kind: MediaKind) -> (&'static str, &'static str) {
    match kind {
        MediaKind::Photo => ("sendPhoto", "photo"),
        MediaKind::Video => ("sendVideo", "video"),
        MediaKind::Animation => ("sendAnimation", "animation"),
        MediaKind::Audio => ("sendAudio", "audio"),
        MediaKind::Voice => ("sendVoice", "voice"),
        MediaKind::Document => ("sendDocument", "document"),
    }
}

// ── Event source ────────────────────────────────────────────────────

impl EventSource for TelegramProvider {
    fn name(&self) -> &str {
        "telegram"
    }

    fn subscribe(&self, sink: EventSink) -> Result<(), ChannelError> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: "no async runtime to run the update poller".into(),
            });
        }

        let mut poller = self.poller.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, old)) = poller.take() {
            old.store(true, Ordering::SeqCst);
        }
        *poller = Some(spawn_update_poller(
            self.client.clone(),
            self.config.clone(),
            sink,
        ));
        Ok(())
    }
}

/// Spawn the `getUpdates` long-poll loop feeding `sink`.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop polling.
pub fn spawn_update_poller(
    client: reqwest::Client,
    config: TelegramConfig,
    sink: EventSink,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        let url = api_url(&config, "getUpdates");
        let request_timeout = Duration::from_secs(config.poll_timeout_secs) + POLL_HTTP_GRACE;
        let mut offset: i64 = 0;

        info!("Telegram update poller listening for messages");

        while !shutdown.load(Ordering::Relaxed) {
            let body = json!({
                "offset": offset,
                "timeout": config.poll_timeout_secs,
                "allowed_updates": ["message", "channel_post"],
            });

            let sent = client
                .post(&url)
                .timeout(request_timeout)
                .json(&body)
                .send()
                .await;
            let updates = match sent {
                Ok(resp) => read_response(resp).await,
                Err(e) => Err(ApiError::transport(e)),
            };

            let updates = match updates {
                Ok(Value::Array(updates)) => updates,
                Ok(other) => {
                    warn!(result = %other, "Unexpected getUpdates result");
                    tokio::time::sleep(POLL_ERROR_BACKOFF).await;
                    continue;
                }
                Err(e) => {
                    let backoff = e
                        .retry_after
                        .map(Duration::from_secs)
                        .unwrap_or(POLL_ERROR_BACKOFF);
                    warn!(error = %e, backoff_secs = backoff.as_secs(), "Telegram poll error");
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            };

            for update in &updates {
                if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                    offset = offset.max(uid + 1);
                }

                let Some(event) = parse_update(update) else {
                    continue;
                };
                if sink.deliver(event) == EnqueueOutcome::Closed {
                    debug!("Engine not running, update ignored");
                }
            }
        }

        info!("Telegram update poller shutting down");
    });

    (handle, shutdown_flag)
}

// ── Update parsing ──────────────────────────────────────────────────

/// Convert a `getUpdates` entry into an inbound event.
///
/// Handles `message` and `channel_post`. Other update kinds yield `None`.
pub fn parse_update(update: &Value) -> Option<InboundEvent> {
    let message = update
        .get("message")
        .or_else(|| update.get("channel_post"))?;

    let chat_id = message.get("chat")?.get("id")?.as_i64()?;
    let message_id = message.get("message_id")?.as_i64()?;
    let timestamp = message
        .get("date")
        .and_then(Value::as_i64)
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .unwrap_or_else(Utc::now);

    Some(InboundEvent {
        source_channel_id: chat_id,
        message_id,
        timestamp,
        content: parse_content(message),
    })
}

fn parse_content(message: &Value) -> Content {
    let str_field = |v: &Value, key: &str| v.get(key).and_then(Value::as_str).map(String::from);

    if let Some(text) = message.get("text").and_then(Value::as_str) {
        return Content::Text(text.to_string());
    }

    if let Some(media) = parse_media(message) {
        return Content::Media(media);
    }

    if let Some(poll) = message.get("poll") {
        let answers = poll
            .get("options")
            .and_then(Value::as_array)
            .map(|opts| opts.iter().filter_map(|o| str_field(o, "text")).collect())
            .unwrap_or_default();
        return Content::Poll {
            question: str_field(poll, "question").unwrap_or_default(),
            answers,
        };
    }

    if let Some(contact) = message.get("contact") {
        return Content::Contact {
            first_name: str_field(contact, "first_name").unwrap_or_default(),
            last_name: str_field(contact, "last_name"),
            phone: str_field(contact, "phone_number").unwrap_or_default(),
        };
    }

    if let Some(location) = message.get("location") {
        let coord = |key: &str| location.get(key).and_then(Value::as_f64);
        if let (Some(latitude), Some(longitude)) = (coord("latitude"), coord("longitude")) {
            return Content::Location {
                latitude,
                longitude,
            };
        }
    }

    Content::Unknown
}

fn parse_media(message: &Value) -> Option<Media> {
    let str_field = |v: &Value, key: &str| v.get(key).and_then(Value::as_str).map(String::from);

    let (kind, file) = if let Some(sizes) = message.get("photo").and_then(Value::as_array) {
        // Sizes are ordered smallest first.
        (MediaKind::Photo, sizes.last()?)
    } else {
        [
            ("animation", MediaKind::Animation),
            ("video", MediaKind::Video),
            ("audio", MediaKind::Audio),
            ("voice", MediaKind::Voice),
            ("document", MediaKind::Document),
        ]
        .into_iter()
        .find_map(|(key, kind)| message.get(key).map(|file| (kind, file)))?
    };

    let file_id = str_field(file, "file_id")?;
    Some(Media {
        kind,
        source: MediaSource::Reference(file_id),
        caption: str_field(message, "caption"),
        mime_type: str_field(file, "mime_type"),
        file_name: str_field(file, "file_name"),
    })
}

// ── API plumbing ────────────────────────────────────────────────────

fn api_url(config: &TelegramConfig, method: &str) -> String {
    format!(
        "{}/bot{}/{method}",
        config.api_base.trim_end_matches('/'),
        config.bot_token.expose_secret()
    )
}

/// A failed Bot API call.
#[derive(Debug, Clone, PartialEq)]
struct ApiError {
    status: Option<u16>,
    description: String,
    retry_after: Option<u64>,
}

impl ApiError {
    fn transport(e: reqwest::Error) -> Self {
        Self {
            status: e.status().map(|s| s.as_u16()),
            description: e.to_string(),
            retry_after: None,
        }
    }

    fn into_publish(self, target: &str) -> PublishError {
        if self.status == Some(429) || self.retry_after.is_some() {
            return PublishError::RateLimited {
                retry_after: self.retry_after.map(Duration::from_secs),
            };
        }
        PublishError::SendFailed {
            target: target.to_string(),
            reason: self.to_string(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} (status {status})", self.description),
            None => f.write_str(&self.description),
        }
    }
}

async fn read_response(resp: reqwest::Response) -> Result<Value, ApiError> {
    let status = resp.status().as_u16();
    let body: Value = resp.json().await.map_err(|e| ApiError {
        status: Some(status),
        description: format!("unreadable response: {e}"),
        retry_after: None,
    })?;
    unwrap_api_response(status, body)
}

/// Bot API envelope: `{"ok": true, "result": ...}` or `{"ok": false, "description": ...}`.
fn unwrap_api_response(status: u16, mut body: Value) -> Result<Value, ApiError> {
    if body.get("ok").and_then(Value::as_bool) == Some(true) {
        return Ok(body.get_mut("result").map(Value::take).unwrap_or(Value::Null));
    }

    Err(ApiError {
        status: body
            .get("error_code")
            .and_then(Value::as_u64)
            .and_then(|c| u16::try_from(c).ok())
            .or(Some(status)),
        description: body
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("Telegram API error")
            .to_string(),
        retry_after: body
            .get("parameters")
            .and_then(|p| p.get("retry_after"))
            .and_then(Value::as_u64),
    })
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts on a char boundary.
fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut limit = max_len;
        while !remaining.is_char_boundary(limit) {
            limit -= 1;
        }

        // Find a good split point
        let chunk = &remaining[..limit];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(limit);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { limit } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────
