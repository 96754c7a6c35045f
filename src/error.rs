//! Error types for the forwarding engine.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),

    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Provider connection errors (event delivery, session checks).
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },

    #[error("Authentication failed for channel {name}: {reason}")]
    AuthFailed { name: String, reason: String },
}

/// Failure while publishing to a target. Counts toward the ban guard.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Send to {target} failed: {reason}")]
    SendFailed { target: String, reason: String },

    #[error("Media download failed: {0}")]
    DownloadFailed(String),

    #[error("Target {spec} could not be resolved: {reason}")]
    TargetUnresolved { spec: String, reason: String },

    #[error("Provider rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Failure mapping a channel spec to a canonical id. Treated as a non-match.
#[derive(Debug, thiserror::Error)]
pub enum ResolutionError {
    #[error("Channel {spec} not found")]
    NotFound { spec: String },

    #[error("Invalid channel spec: {0:?}")]
    InvalidSpec(String),

    #[error("Lookup of {spec} failed: {reason}")]
    LookupFailed { spec: String, reason: String },
}

/// Engine lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Client not authenticated")]
    NotAuthenticated,

    #[error("Event source failed to register: {0}")]
    Subscribe(#[from] ChannelError),
}

/// Rule store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Rule {id} not found")]
    NotFound { id: i64 },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
