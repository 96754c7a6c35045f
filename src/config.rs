//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use tracing::warn;

use crate::error::ConfigError;

/// Default Telegram Bot API base URL.
pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Base delay of the normal jitter profile when none is configured.
const DEFAULT_FORWARD_DELAY: Duration = Duration::from_millis(100);

/// How the pre-publish delay is randomized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum JitterProfile {
    /// Minimal delay, uniform in 50–150ms.
    Fast,
    /// Uniform in `[0.5 * base, 1.5 * base]`.
    Normal { base: Duration },
}

impl JitterProfile {
    /// Inclusive bounds of the jitter band.
    pub fn bounds(&self) -> (Duration, Duration) {
        match self {
            Self::Fast => (Duration::from_millis(50), Duration::from_millis(150)),
            Self::Normal { base } => (base.mul_f64(0.5), base.mul_f64(1.5)),
        }
    }
}

/// Forwarding engine configuration.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Ingestion queue capacity; the newest event is dropped when full.
    pub queue_capacity: usize,
    /// Number of concurrent workers draining the queue.
    pub worker_count: usize,
    /// How long a worker waits on an empty queue before re-checking the stop flag.
    pub dequeue_timeout: Duration,
    /// Maximum publishes admitted per `rate_window`.
    pub max_per_window: u32,
    /// Rolling window for `max_per_window`.
    pub rate_window: Duration,
    /// Randomized delay before each publish.
    pub jitter: JitterProfile,
    /// Publishes allowed per calendar day.
    pub max_daily_forwards: u64,
    /// Consecutive failures that trip the ban guard.
    pub max_consecutive_errors: u32,
    /// How long the ban guard suspends publishing once tripped.
    pub error_cooldown: Duration,
    /// Pause after a worker-level fault before polling again.
    pub worker_error_pause: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            worker_count: 5,
            dequeue_timeout: Duration::from_secs(1),
            max_per_window: 60,
            rate_window: Duration::from_secs(60),
            jitter: JitterProfile::Fast,
            max_daily_forwards: 100,
            max_consecutive_errors: 5,
            error_cooldown: Duration::from_secs(30 * 60), // 30 minutes
            worker_error_pause: Duration::from_millis(200),
        }
    }
}

impl ForwarderConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let instant_mode = std::env::var("INSTANT_FORWARDING")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);

        let jitter = if instant_mode {
            JitterProfile::Fast
        } else {
            let base_secs: f64 = env_or(
                "DELAY_BETWEEN_FORWARDS",
                DEFAULT_FORWARD_DELAY.as_secs_f64(),
            );
            JitterProfile::Normal {
                base: delay_from_secs("DELAY_BETWEEN_FORWARDS", base_secs),
            }
        };

        let worker_error_pause = if instant_mode {
            Duration::from_millis(200)
        } else {
            Duration::from_secs(1)
        };

        Self {
            queue_capacity: env_or("RELAYCAST_QUEUE_CAPACITY", defaults.queue_capacity),
            worker_count: env_or("MAX_CONCURRENT_FORWARDS", defaults.worker_count),
            dequeue_timeout: Duration::from_millis(env_or("RELAYCAST_DEQUEUE_TIMEOUT_MS", 1000)),
            max_per_window: env_or("MAX_MESSAGES_PER_MINUTE", defaults.max_per_window),
            rate_window: Duration::from_secs(env_or("RELAYCAST_RATE_WINDOW_SECS", 60)),
            jitter,
            max_daily_forwards: env_or("MAX_DAILY_FORWARDS", defaults.max_daily_forwards),
            max_consecutive_errors: env_or(
                "MAX_CONSECUTIVE_ERRORS",
                defaults.max_consecutive_errors,
            ),
            error_cooldown: Duration::from_secs(env_or("RELAYCAST_ERROR_COOLDOWN_SECS", 1800)),
            worker_error_pause,
        }
    }

    /// Reject values that would leave the engine unable to make progress.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(invalid("queue_capacity", "must be at least 1"));
        }
        if self.worker_count == 0 {
            return Err(invalid("worker_count", "must be at least 1"));
        }
        if self.max_per_window == 0 {
            return Err(invalid("max_per_window", "must be at least 1"));
        }
        if self.rate_window.is_zero() {
            return Err(invalid("rate_window", "must be non-zero"));
        }
        if self.max_consecutive_errors == 0 {
            return Err(invalid("max_consecutive_errors", "must be at least 1"));
        }
        Ok(())
    }
}

/// Telegram Bot API provider configuration.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    pub api_base: String,
    pub poll_timeout_secs: u64,
}

impl TelegramConfig {
    /// Load from environment. `TELEGRAM_BOT_TOKEN` is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let token = std::env::var("TELEGRAM_BOT_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("TELEGRAM_BOT_TOKEN".into()))?;

        Ok(Self {
            bot_token: SecretString::from(token),
            api_base: std::env::var("TELEGRAM_API_BASE")
                .unwrap_or_else(|_| DEFAULT_TELEGRAM_API_BASE.to_string()),
            poll_timeout_secs: env_or("TELEGRAM_POLL_TIMEOUT_SECS", 30),
        })
    }
}

/// Location of the JSON rules file used by the binary.
pub fn rules_path_from_env() -> PathBuf {
    std::env::var("RELAYCAST_RULES_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data/rules.json"))
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(key, value = %raw, ?default, "Unparseable config value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Non-negative seconds to a `Duration`, falling back to the default when out of range.
fn delay_from_secs(key: &str, secs: f64) -> Duration {
    match Duration::try_from_secs_f64(secs.max(0.0)) {
        Ok(delay) => delay,
        Err(_) => {
            warn!(key, secs, default = ?DEFAULT_FORWARD_DELAY, "Delay out of range, using default");
            DEFAULT_FORWARD_DELAY
        }
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}
