//! Capped exponential backoff for loops that must keep going.
//!
//! The watcher never gives up on Consul: every failed poll waits a little
//! longer before the next one, up to a ceiling, and the first success drops
//! the delay back to the floor. No jitter is applied; there is exactly one
//! watcher per process so there is no herd to spread out.

use std::time::Duration;

/// Configuration for a capped exponential backoff.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffConfig {
    /// Delay after the first failure, and after every reset
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier applied after each consecutive failure
    pub multiplier: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2,
        }
    }
}

/// Backoff state for one retry loop.
///
/// ```ignore
/// let mut backoff = Backoff::new(BackoffConfig::default());
/// loop {
///     match poll().await {
///         Ok(_) => backoff.reset(),
///         Err(_) => tokio::time::sleep(backoff.next_delay()).await,
///     }
/// }
/// ```
#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
}

impl Backoff {
    /// Start at the configured floor
    pub fn new(config: BackoffConfig) -> Self {
        let current = config.initial_delay;
        Self { config, current }
    }

    /// Delay to wait after the failure that just happened.
    ///
    /// Each call advances the state, so consecutive calls yield
    /// `initial, initial*m, initial*m^2, ...` capped at `max_delay`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self
            .current
            .saturating_mul(self.config.multiplier)
            .min(self.config.max_delay);
        delay
    }

    /// Drop back to the floor after a success
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
    }
}
