//! Reconnection Schedule
//!
//! Delay generators for reconnect attempts and the stability watch that
//! decides when a connection has been up long enough to restart the
//! schedule from its first value.
//!
//! The default follows Kraken's guidance: retry immediately twice, then
//! after one second, then every five seconds.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;

/// Kraken's documented retry pattern; the last value repeats forever.
const KRAKEN_PATTERN: [Duration; 4] = [
    Duration::ZERO,
    Duration::ZERO,
    Duration::from_secs(1),
    Duration::from_secs(5),
];

/// Default stability window.
pub const DEFAULT_STABILITY_WINDOW: Duration = Duration::from_secs(5);

// =============================================================================
// Exponential Backoff
// =============================================================================

/// Parameters for exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Attempts before the schedule is exhausted (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ExponentialConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 0,
        }
    }
}

/// Exponential delay iterator.
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: ExponentialConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ExponentialBackoff {
    /// Start a new sequence.
    #[must_use]
    pub const fn new(config: ExponentialConfig) -> Self {
        let current_delay = config.initial_delay;
        Self {
            config,
            current_delay,
            attempt_count: 0,
        }
    }

    /// Number of delays handed out so far.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.config.max_attempts > 0 && self.attempt_count >= self.config.max_attempts {
            return None;
        }
        self.attempt_count += 1;

        let delay = self.apply_jitter(self.current_delay);

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

        Some(delay)
    }
}

// =============================================================================
// Backoff Schedule
// =============================================================================

/// Iterator of reconnect delays.
pub type Delays = Box<dyn Iterator<Item = Duration> + Send>;

/// Factory for reconnect delay sequences.
///
/// Each call to [`BackoffSchedule::start`] returns a fresh sequence; the
/// engine restarts the sequence whenever a connection stabilizes.
#[derive(Clone, Default)]
pub enum BackoffSchedule {
    /// 0 s, 0 s, 1 s, then 5 s forever.
    #[default]
    Kraken,
    /// Exponential growth with jitter and a cap.
    Exponential(ExponentialConfig),
    /// A fixed list; the schedule is exhausted after the last value.
    Finite(Vec<Duration>),
    /// Caller-supplied sequence.
    Custom(Arc<dyn Fn() -> Delays + Send + Sync>),
}

impl BackoffSchedule {
    /// Begin a new delay sequence.
    #[must_use]
    pub fn start(&self) -> Delays {
        match self {
            Self::Kraken => {
                let last = KRAKEN_PATTERN[KRAKEN_PATTERN.len() - 1];
                Box::new(KRAKEN_PATTERN.into_iter().chain(std::iter::repeat(last)))
            }
            Self::Exponential(config) => Box::new(ExponentialBackoff::new(config.clone())),
            Self::Finite(delays) => Box::new(delays.clone().into_iter()),
            Self::Custom(factory) => factory(),
        }
    }

    /// Short label for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Kraken => "kraken",
            Self::Exponential(_) => "exponential",
            Self::Finite(_) => "finite",
            Self::Custom(_) => "custom",
        }
    }
}

impl fmt::Debug for BackoffSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exponential(config) => f.debug_tuple("Exponential").field(config).finish(),
            Self::Finite(delays) => f.debug_tuple("Finite").field(delays).finish(),
            other => f.write_str(other.name()),
        }
    }
}

// =============================================================================
// Stability Watch
// =============================================================================

/// Decides when an open connection counts as stable.
///
/// Armed once per connection; when the returned future completes before
/// the connection fails, the backoff schedule restarts.
#[derive(Clone)]
pub enum StabilityWatch {
    /// Stable after this long without a failure.
    After(Duration),
    /// Caller-supplied condition.
    Custom(Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>),
}

impl StabilityWatch {
    /// Arm the watch for a newly opened connection.
    #[must_use]
    pub fn arm(&self) -> BoxFuture<'static, ()> {
        match self {
            Self::After(window) => Box::pin(tokio::time::sleep(*window)),
            Self::Custom(factory) => factory(),
        }
    }
}

impl Default for StabilityWatch {
    fn default() -> Self {
        Self::After(DEFAULT_STABILITY_WINDOW)
    }
}

impl fmt::Debug for StabilityWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::After(window) => f.debug_tuple("After").field(window).finish(),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

// =============================================================================
// Reconnect Config
// =============================================================================

/// Reconnect behavior of a connection engine.
#[derive(Debug, Clone, Default)]
pub struct ReconnectConfig {
    /// Delay sequence between attempts.
    pub schedule: BackoffSchedule,
    /// Condition that restarts the sequence.
    pub stability: StabilityWatch,
}

impl ReconnectConfig {
    /// Create a configuration.
    #[must_use]
    pub const fn new(schedule: BackoffSchedule, stability: StabilityWatch) -> Self {
        Self {
            schedule,
            stability,
        }
    }

    /// Create configuration from `ReconnectSettings`.
    #[must_use]
    pub fn from_settings(settings: &crate::ReconnectSettings) -> Self {
        let schedule = match settings.schedule {
            crate::ScheduleKind::Kraken => BackoffSchedule::Kraken,
            crate::ScheduleKind::Exponential => BackoffSchedule::Exponential(ExponentialConfig {
                initial_delay: settings.initial_delay,
                max_delay: settings.max_delay,
                multiplier: settings.multiplier,
                jitter_factor: settings.jitter_factor,
                max_attempts: settings.max_attempts,
            }),
        };
        Self::new(schedule, StabilityWatch::After(settings.stability_window))
    }
}

/// Error type for reconnection failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconnectError {
    /// A finite schedule ran out of delays.
    #[error("reconnect schedule exhausted after {0} attempts")]
    ScheduleExhausted(u32),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(initial_ms: u64, max_ms: u64, multiplier: f64, max_attempts: u32) -> ExponentialConfig {
        ExponentialConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier,
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    #[test]
    fn kraken_pattern_repeats_last_delay() {
        let delays: Vec<u64> = BackoffSchedule::Kraken
            .start()
            .take(7)
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![0, 0, 1, 5, 5, 5, 5]);
    }

    #[test]
    fn start_restarts_sequence() {
        let schedule = BackoffSchedule::Kraken;
        let mut first = schedule.start();
        let _ = first.nth(3);
        assert_eq!(schedule.start().next(), Some(Duration::ZERO));
    }

    #[test]
    fn exponential_doubles_then_caps() {
        let schedule = BackoffSchedule::Exponential(no_jitter(100, 500, 2.0, 0));
        let delays: Vec<u128> = schedule.start().take(5).map(|d| d.as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn exponential_exhausts_after_max_attempts() {
        let mut backoff = ExponentialBackoff::new(no_jitter(100, 1_000, 2.0, 3));
        assert!(backoff.next().is_some());
        assert!(backoff.next().is_some());
        assert!(backoff.next().is_some());
        assert_eq!(backoff.attempt_count(), 3);
        assert!(backoff.next().is_none());
    }

    #[test]
    fn jitter_stays_in_bounds() {
        for _ in 0..100 {
            let mut backoff = ExponentialBackoff::new(ExponentialConfig {
                initial_delay: Duration::from_millis(1000),
                jitter_factor: 0.1,
                ..ExponentialConfig::default()
            });
            let millis = backoff.next().unwrap().as_millis();
            assert!((900..=1100).contains(&millis), "delay {millis}ms out of bounds");
        }
    }

    #[test]
    fn finite_schedule_ends() {
        let schedule = BackoffSchedule::Finite(vec![Duration::from_millis(10)]);
        let mut delays = schedule.start();
        assert_eq!(delays.next(), Some(Duration::from_millis(10)));
        assert_eq!(delays.next(), None);
    }

    #[test]
    fn custom_schedule_uses_factory() {
        let schedule =
            BackoffSchedule::Custom(Arc::new(|| Box::new(std::iter::repeat(Duration::from_secs(2)))));
        assert_eq!(schedule.start().nth(10), Some(Duration::from_secs(2)));
        assert_eq!(format!("{schedule:?}"), "custom");
    }

    #[tokio::test(start_paused = true)]
    async fn stability_after_window() {
        let started = tokio::time::Instant::now();
        StabilityWatch::default().arm().await;
        assert!(started.elapsed() >= DEFAULT_STABILITY_WINDOW);
    }

    #[test]
    fn defaults() {
        let config = ReconnectConfig::default();
        assert_eq!(config.schedule.name(), "kraken");
        assert!(matches!(config.stability, StabilityWatch::After(d) if d == DEFAULT_STABILITY_WINDOW));
    }
}
