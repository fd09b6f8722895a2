//! Poll Backoff
//!
//! Exponential backoff with jitter for the queue polling loop. An empty or
//! failed pop sleeps for the next delay; the first successful pop resets it.

use std::time::Duration;

use rand::Rng;

/// Configuration for poll backoff.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first empty poll.
    pub initial_delay: Duration,
    /// Upper bound on the delay.
    pub max_delay: Duration,
    /// Multiplier applied after each consecutive empty poll.
    pub multiplier: f64,
    /// Jitter factor as a fraction (e.g., 0.1 = ±10% randomization).
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(250),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Backoff between `initial_delay` and `max_delay` with default multiplier and jitter.
    #[must_use]
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Self::default()
        }
    }
}

/// Stateful backoff sequence.
///
/// # Example
///
/// ```rust
/// use price_relay::application::services::backoff::{BackoffConfig, BackoffPolicy};
/// use std::time::Duration;
///
/// let mut policy = BackoffPolicy::new(BackoffConfig {
///     jitter_factor: 0.0,
///     ..BackoffConfig::new(Duration::from_millis(5), Duration::from_millis(20))
/// });
///
/// assert_eq!(policy.next_delay(), Duration::from_millis(5));
/// assert_eq!(policy.next_delay(), Duration::from_millis(10));
/// policy.reset();
/// assert_eq!(policy.next_delay(), Duration::from_millis(5));
/// ```
#[derive(Debug)]
pub struct BackoffPolicy {
    config: BackoffConfig,
    current_delay: Duration,
    consecutive_empty: u32,
}

impl BackoffPolicy {
    /// Create a new backoff policy.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            current_delay: initial_delay,
            consecutive_empty: 0,
        }
    }

    /// Delay to sleep now, advancing the sequence.
    #[must_use]
    pub fn next_delay(&mut self) -> Duration {
        self.consecutive_empty = self.consecutive_empty.saturating_add(1);

        let delay_with_jitter = self.apply_jitter(self.current_delay);

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                scaled as u128
            }
        } else {
            0
        };
        let capped = next_millis.min(self.config.max_delay.as_millis());
        self.current_delay = Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX));

        delay_with_jitter
    }

    /// Reset after a successful pop.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.consecutive_empty = 0;
    }

    /// Number of empty or failed polls since the last reset.
    #[must_use]
    pub const fn consecutive_empty(&self) -> u32 {
        self.consecutive_empty
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(initial_ms: u64, max_ms: u64) -> BackoffConfig {
        BackoffConfig {
            jitter_factor: 0.0,
            ..BackoffConfig::new(
                Duration::from_millis(initial_ms),
                Duration::from_millis(max_ms),
            )
        }
    }

    #[test]
    fn default_config_values() {
        let config = BackoffConfig::default();
        assert_eq!(config.initial_delay, Duration::from_millis(5));
        assert_eq!(config.max_delay, Duration::from_millis(250));
        assert!((config.multiplier - 2.0).abs() < f64::EPSILON);
        assert!((config.jitter_factor - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn delay_doubles_until_capped() {
        let mut policy = BackoffPolicy::new(no_jitter(10, 50));
        let delays: Vec<_> = (0..5).map(|_| policy.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![10, 20, 40, 50, 50]);
        assert_eq!(policy.consecutive_empty(), 5);
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut policy = BackoffPolicy::new(no_jitter(10, 50));
        let _ = policy.next_delay();
        let _ = policy.next_delay();
        policy.reset();
        assert_eq!(policy.consecutive_empty(), 0);
        assert_eq!(policy.next_delay(), Duration::from_millis(10));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        for _ in 0..100 {
            let mut policy = BackoffPolicy::new(BackoffConfig {
                jitter_factor: 0.1,
                ..BackoffConfig::new(Duration::from_millis(200), Duration::from_secs(1))
            });
            let millis = policy.next_delay().as_millis();
            assert!((180..=220).contains(&millis), "delay {millis}ms out of bounds");
        }
    }
}
