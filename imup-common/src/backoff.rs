//! Scheduling and retry delay draws.
//!
//! Retries here are deliberately *not* exponential: the ingest API expects
//! clients to spread themselves with a flat, uniformly jittered delay
//! between a lower and upper bound, independent of the attempt number.

use std::time::Duration;

use rand::Rng;
use rand_distr::{Distribution, Normal, Poisson};

/// Mean interval between randomly scheduled speed tests, in seconds.
/// Six hours keeps data consumption predictable for metered connections.
pub const SPEED_TEST_MEAN_SECS: f64 = 21_600.0;

/// Draw a delay uniformly between `min` and `max`, inclusive.
///
/// If the bounds are inverted or equal, `min` is returned unchanged.
#[must_use]
pub fn exact_jitter(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }

    let mut rng = rand::rng();
    let millis = rng.random_range(min.as_millis()..=max.as_millis());
    Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
}

/// Draw the wait until the next randomly scheduled speed test.
///
/// A Poisson draw around the mean gives a consistent number of tests per day
/// while keeping individual test times unpredictable enough to avoid
/// saturating a network on a fixed schedule.
#[must_use]
pub fn speed_test_interval(mean_secs: f64) -> Duration {
    let secs = Poisson::new(mean_secs)
        .map(|poisson| poisson.sample(&mut rand::rng()))
        .unwrap_or(mean_secs);

    Duration::from_secs_f64(secs.max(1.0))
}

/// Draw the wait before retrying a failed NDT7 speed test.
///
/// Normal around `mean_secs` with a 5% standard deviation, clamped to the
/// 60–960 second window the NDT7 non-interactive client requirements call
/// for.
#[must_use]
pub fn ndt7_retry_wait(mean_secs: f64) -> Duration {
    let secs = Normal::new(mean_secs, 0.05 * mean_secs)
        .map(|normal| normal.sample(&mut rand::rng()))
        .unwrap_or(mean_secs);

    Duration::from_secs_f64(secs.clamp(60.0, 960.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_within_bounds() {
        let min = Duration::from_secs(30);
        let max = Duration::from_secs(60);

        for _ in 0..1_000 {
            let delay = exact_jitter(min, max);
            assert!(delay >= min && delay <= max, "delay {delay:?} out of range");
        }
    }

    #[test]
    fn jitter_with_inverted_bounds_returns_min() {
        let min = Duration::from_secs(60);
        let max = Duration::from_secs(30);
        assert_eq!(exact_jitter(min, max), min);
        assert_eq!(exact_jitter(min, min), min);
    }

    #[test]
    fn ndt7_retry_wait_is_clamped() {
        // a mean far above the window still produces a bounded wait
        for mean in [60.0, 120.0, 960.0, 4_000.0] {
            let wait = ndt7_retry_wait(mean);
            assert!(wait >= Duration::from_secs(60));
            assert!(wait <= Duration::from_secs(960));
        }
    }

    #[test]
    fn speed_test_interval_is_positive() {
        let interval = speed_test_interval(SPEED_TEST_MEAN_SECS);
        assert!(interval >= Duration::from_secs(1));
        // a poisson draw stays in the same order of magnitude as the mean
        assert!(interval <= Duration::from_secs(43_200));
    }
}
