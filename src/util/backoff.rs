use std::time::Duration;

use rand::Rng;

pub const DEFAULT_INITIAL_DELAY_MILLIS: u64 = 1_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_DELAY_MILLIS: u64 = 60 * 1_000;
pub const RANDOM_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(DEFAULT_INITIAL_DELAY_MILLIS),
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MILLIS),
            jitter_factor: RANDOM_FACTOR,
        }
    }
}

/// Exponential backoff with jitter for reconnecting streams.
///
/// The first attempt after construction or [`ExponentialBackoff::reset`] is immediate. Each later
/// attempt waits the current base delay plus up to `jitter_factor` of it in either direction, then
/// grows the base by `backoff_factor`, clamped to `[initial_delay, max_delay]`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current_base_millis: f64,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current_base_millis: 0.0,
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    pub fn reset(&mut self) {
        self.current_base_millis = 0.0;
    }

    /// Forces the next delay to the configured maximum (used after resource-exhausted errors).
    pub fn reset_to_max(&mut self) {
        self.current_base_millis = self.config.max_delay.as_millis() as f64;
    }

    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with_rng(&mut rand::thread_rng())
    }

    fn next_delay_with_rng<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Duration {
        let base = self.current_base_millis;
        let jitter = if base > 0.0 && self.config.jitter_factor > 0.0 {
            self.config.jitter_factor * base * rng.gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        let delay = (base + jitter).round().max(0.0);

        let initial = self.config.initial_delay.as_millis() as f64;
        let max = self.config.max_delay.as_millis() as f64;
        self.current_base_millis = (base * self.config.backoff_factor).clamp(initial, max.max(initial));

        Duration::from_millis(delay as u64)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
