use std::time::Duration;

pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_millis(5_000);
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 3;

/// Linear reconnect policy: attempt `n` waits `n * base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_RECONNECT_BACKOFF,
            max_attempts: DEFAULT_RECONNECT_ATTEMPTS,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self { base, max_attempts }
    }

    /// Wait before reconnect attempt `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(attempt)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_linearly() {
        let backoff = Backoff::new(Duration::from_millis(250), 3);
        assert_eq!(backoff.delay(1), Duration::from_millis(250));
        assert_eq!(backoff.delay(2), Duration::from_millis(500));
        assert_eq!(backoff.delay(3), Duration::from_millis(750));
        assert!(backoff.allows(3));
        assert!(!backoff.allows(4));
    }

    #[test]
    fn delay_saturates() {
        let backoff = Backoff::new(Duration::MAX, 2);
        assert_eq!(backoff.delay(2), Duration::MAX);
    }
}
