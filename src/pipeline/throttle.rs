//! Publish throttle: caps the issue rate of publishes and adds randomized jitter.
//!
//! Only the rate at which publishes *start* is bounded; publishes already in
//! flight are not throttled.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use rand::Rng;
use tracing::debug;

use crate::config::JitterProfile;

/// Rate limiter plus jitter applied before each publish.
pub struct PublishThrottle {
    limiter: DefaultDirectRateLimiter,
    jitter: JitterProfile,
}

impl PublishThrottle {
    /// Admit at most `max_per_window` publishes per `window`.
    pub fn new(max_per_window: u32, window: Duration, jitter: JitterProfile) -> Self {
        let burst = NonZeroU32::new(max_per_window).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(window / burst.get())
            .map(|q| q.allow_burst(burst))
            .unwrap_or_else(|| Quota::per_second(burst));

        Self {
            limiter: RateLimiter::direct(quota),
            jitter,
        }
    }

    /// Take a permit without waiting. False when the window is exhausted.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Wait for a rate permit, then sleep a random jitter. Returns the jitter slept.
    pub async fn admit(&self) -> Duration {
        self.wait_for_permit().await;

        let delay = self.next_jitter();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        delay
    }

    async fn wait_for_permit(&self) {
        if self.limiter.check().is_ok() {
            return;
        }
        debug!("Publish rate limit reached, waiting for permit");
        self.limiter.until_ready().await;
    }

    /// Draw a delay from the configured jitter band.
    pub fn next_jitter(&self) -> Duration {
        let (lo, hi) = self.jitter.bounds();
        if hi <= lo {
            return lo;
        }
        let secs = rand::thread_rng().gen_range(lo.as_secs_f64()..=hi.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fast_jitter_stays_in_band() {
        let throttle = PublishThrottle::new(60, Duration::from_secs(60), JitterProfile::Fast);
        for _ in 0..200 {
            let d = throttle.next_jitter();
            assert!(d >= Duration::from_millis(50), "{d:?} below band");
            assert!(d <= Duration::from_millis(150), "{d:?} above band");
        }
    }

    #[test]
    fn normal_jitter_stays_in_band() {
        let throttle = PublishThrottle::new(
            60,
            Duration::from_secs(60),
            JitterProfile::Normal {
                base: Duration::from_millis(200),
            },
        );
        for _ in 0..200 {
            let d = throttle.next_jitter();
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(300));
        }
    }

    #[test]
    fn zero_base_means_no_jitter() {
        let throttle = PublishThrottle::new(
            60,
            Duration::from_secs(60),
            JitterProfile::Normal {
                base: Duration::ZERO,
            },
        );
        assert_eq!(throttle.next_jitter(), Duration::ZERO);
    }

    #[test]
    fn burst_capped_at_window_limit() {
        let throttle = PublishThrottle::new(
            3,
            Duration::from_secs(60),
            JitterProfile::Normal {
                base: Duration::ZERO,
            },
        );
        assert!(throttle.try_acquire());
        assert!(throttle.try_acquire());
        assert!(throttle.try_acquire());
        assert!(!throttle.try_acquire());
    }

    #[tokio::test]
    async fn blocked_admit_resumes_when_permit_replenishes() {
        let throttle = PublishThrottle::new(
            1,
            Duration::from_millis(10),
            JitterProfile::Normal {
                base: Duration::ZERO,
            },
        );
        throttle.admit().await;
        let started = std::time::Instant::now();
        throttle.admit().await;
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(5), "{waited:?} too short");
        assert!(waited < Duration::from_millis(100), "{waited:?} too long");
    }

    #[tokio::test]
    async fn admit_is_immediate_under_limit() {
        let throttle = PublishThrottle::new(
            10,
            Duration::from_secs(60),
            JitterProfile::Normal {
                base: Duration::ZERO,
            },
        );
        let started = std::time::Instant::now();
        for _ in 0..10 {
            throttle.admit().await;
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
