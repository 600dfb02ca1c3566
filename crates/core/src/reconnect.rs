use std::time::Duration;

/// Backoff settings for unexpected link loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(300),
            max_attempts: 5,
        }
    }
}

/// Bounded exponential backoff, scoped to one session.
///
/// The attempt counter only moves forward through `next_delay` and goes back
/// to zero on `reset`, which the driver calls after every successful connect.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt, or `None` once the cap is reached.
    ///
    /// Attempt `n` (1-based) waits `base * 2^(n-1)`.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.config.max_attempts {
            return None;
        }
        self.attempt += 1;
        let factor = 1u32.checked_shl(self.attempt - 1).unwrap_or(u32::MAX);
        Some(self.config.base_delay.saturating_mul(factor))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts scheduled since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
