use crate::config::BridgeConfig;
use std::time::Duration;

/// Delay between a failed publish and the next cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackoffStrategy {
    Fixed(Duration),
    /// Doubles per consecutive failure, starting at `initial`, capped at `max`.
    Exponential { initial: Duration, max: Duration },
}

/// Retry policy for data publishes. Attempts are unlimited: the daemon never
/// gives up on the broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    strategy: BackoffStrategy,
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        RetryPolicy {
            strategy: BackoffStrategy::Fixed(delay),
        }
    }

    pub fn exponential(initial: Duration, max: Duration) -> Self {
        RetryPolicy {
            strategy: BackoffStrategy::Exponential {
                initial,
                max: max.max(initial),
            },
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        let initial = Duration::from_secs(config.backoff_secs);
        match config.backoff_max_secs {
            Some(max) if max > config.backoff_secs => {
                Self::exponential(initial, Duration::from_secs(max))
            }
            _ => Self::fixed(initial),
        }
    }

    pub fn strategy(&self) -> BackoffStrategy {
        self.strategy
    }

    /// Delay after `failures` consecutive failed attempts (1 for the first).
    pub fn delay_for(&self, failures: u32) -> Duration {
        match self.strategy {
            BackoffStrategy::Fixed(delay) => delay,
            BackoffStrategy::Exponential { initial, max } => {
                let doublings = failures.saturating_sub(1).min(31);
                initial
                    .checked_mul(1u32 << doublings)
                    .map_or(max, |delay| delay.min(max))
            }
        }
    }

    /// No retry ever happens sooner than this after a failure.
    pub fn minimum_delay(&self) -> Duration {
        match self.strategy {
            BackoffStrategy::Fixed(delay) => delay,
            BackoffStrategy::Exponential { initial, .. } => initial,
        }
    }
}
