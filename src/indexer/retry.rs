//! Retry policy for RPC calls and block-range sizing for log fetches.

use std::time::Duration;

use crate::config::SyncConfig;

/// Retry strategy for transient RPC failures.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    /// No retry
    None,
    /// Fixed delay between retries
    Fixed { delay_ms: u64 },
    /// Exponential backoff, capped
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryStrategy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::Exponential {
            initial_delay_ms: config.initial_backoff_ms,
            max_delay_ms: config.max_backoff_ms,
            multiplier: config.backoff_multiplier,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::None => Duration::ZERO,
            RetryStrategy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            RetryStrategy::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let delay = (*initial_delay_ms as f64) * multiplier.powi(exponent);
                let delay = delay.min(*max_delay_ms as f64);
                Duration::from_millis(delay as u64)
            }
        }
    }
}

/// Adaptive block-range size.
///
/// Halves on "response too large" and doubles, up to `max`, after
/// `grow_after` consecutive successes.
#[derive(Debug, Clone)]
pub struct BatchSizer {
    current: u64,
    max: u64,
    grow_after: u32,
    successes: u32,
}

impl BatchSizer {
    pub fn new(initial: u64, max: u64, grow_after: u32) -> Self {
        let max = max.max(1);
        Self {
            current: initial.clamp(1, max),
            max,
            grow_after,
            successes: 0,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.initial_batch_size,
            config.max_batch_size,
            config.grow_after_successes,
        )
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    /// Halves the range. Returns `false` when it is already a single block.
    pub fn shrink(&mut self) -> bool {
        self.successes = 0;
        if self.current <= 1 {
            return false;
        }
        self.current = (self.current / 2).max(1);
        true
    }

    pub fn record_success(&mut self) {
        if self.grow_after == 0 {
            return;
        }
        self.successes += 1;
        if self.successes >= self.grow_after {
            self.successes = 0;
            self.current = self.current.saturating_mul(2).min(self.max);
        }
    }
}
