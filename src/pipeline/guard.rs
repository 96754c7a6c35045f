//! Ban guard and forward counters.
//!
//! The guard is a failure-counting circuit breaker: once `threshold`
//! consecutive failures have been recorded, every item is skipped until the
//! cooldown has elapsed since the last failure. The counter is then reset to
//! zero regardless of how the next attempt turns out. Successes do not reset it.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, NaiveDate, Utc};
use tracing::{info, warn};

#[derive(Debug, Default)]
struct GuardState {
    consecutive_errors: u32,
    last_error_at: Option<Instant>,
}

/// Failure-counting cooldown guard.
pub struct BanGuard {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<GuardState>,
}

impl BanGuard {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(GuardState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether publishing is currently suspended.
    pub fn should_skip(&self) -> bool {
        self.should_skip_at(Instant::now())
    }

    /// [`should_skip`](Self::should_skip) against an explicit clock reading.
    pub fn should_skip_at(&self, now: Instant) -> bool {
        let mut state = self.state();
        if state.consecutive_errors < self.threshold {
            return false;
        }
        let Some(last) = state.last_error_at else {
            return false;
        };
        if now.saturating_duration_since(last) < self.cooldown {
            return true;
        }

        info!(
            errors = state.consecutive_errors,
            "Error cooldown elapsed, resuming publishing"
        );
        state.consecutive_errors = 0;
        false
    }

    /// Record a pipeline failure. Returns the new consecutive count.
    pub fn record_failure(&self) -> u32 {
        self.record_failure_at(Instant::now())
    }

    pub fn record_failure_at(&self, now: Instant) -> u32 {
        let mut state = self.state();
        state.consecutive_errors = state.consecutive_errors.saturating_add(1);
        state.last_error_at = Some(now);

        if state.consecutive_errors >= self.threshold {
            warn!(
                errors = state.consecutive_errors,
                cooldown_secs = self.cooldown.as_secs(),
                "Too many consecutive errors, entering cooldown"
            );
        }
        state.consecutive_errors
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.state().consecutive_errors
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}

#[derive(Debug)]
struct CounterState {
    daily_count: u64,
    reset_date: NaiveDate,
    last_forward_at: Option<DateTime<Utc>>,
}

/// Process-local publish counters with a daily cap.
pub struct ForwardCounters {
    max_daily: u64,
    state: Mutex<CounterState>,
}

impl ForwardCounters {
    pub fn new(max_daily: u64) -> Self {
        Self::starting_on(max_daily, Local::now().date_naive())
    }

    pub fn starting_on(max_daily: u64, today: NaiveDate) -> Self {
        Self {
            max_daily,
            state: Mutex::new(CounterState {
                daily_count: 0,
                reset_date: today,
                last_forward_at: None,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CounterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Roll the daily count over if the date advanced, then report whether
    /// another publish is allowed today.
    pub fn has_daily_capacity(&self) -> bool {
        self.has_daily_capacity_on(Local::now().date_naive())
    }

    pub fn has_daily_capacity_on(&self, today: NaiveDate) -> bool {
        let mut state = self.state();
        if today > state.reset_date {
            info!(
                previous = state.daily_count,
                date = %today,
                "New day, resetting daily forward count"
            );
            state.daily_count = 0;
            state.reset_date = today;
        }
        state.daily_count < self.max_daily
    }

    /// Record a successful publish. Returns the new daily count.
    pub fn record_forward(&self) -> u64 {
        let mut state = self.state();
        state.daily_count += 1;
        state.last_forward_at = Some(Utc::now());
        state.daily_count
    }

    pub fn daily_count(&self) -> u64 {
        self.state().daily_count
    }

    pub fn max_daily(&self) -> u64 {
        self.max_daily
    }

    pub fn last_forward_at(&self) -> Option<DateTime<Utc>> {
        self.state().last_forward_at
    }
}
