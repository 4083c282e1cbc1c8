//! Exponential backoff for transient accept failures.

use std::time::Duration;

/// First retry delay.
pub const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(5);

/// Upper bound on any retry delay.
pub const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
/// capped at `max`. Attempt zero means no delay.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let factor = 2u32.saturating_pow(attempt - 1);
    base.saturating_mul(factor).min(max)
}

/// Backoff state for one accept loop.
#[derive(Debug, Clone)]
pub struct AcceptBackoff {
    attempt: u32,
    base: Duration,
    max: Duration,
}

impl AcceptBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { attempt: 0, base, max }
    }

    /// Delay to sleep after another temporary failure.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        calculate_backoff(self.attempt, self.base, self.max)
    }

    /// Forget previous failures after a successful accept.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for AcceptBackoff {
    fn default() -> Self {
        Self::new(ACCEPT_BACKOFF_BASE, ACCEPT_BACKOFF_MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(1000);
        assert_eq!(calculate_backoff(0, base, max), Duration::ZERO);
        assert_eq!(calculate_backoff(1, base, max), Duration::from_millis(100));
        assert_eq!(calculate_backoff(2, base, max), Duration::from_millis(200));
        assert_eq!(calculate_backoff(10, base, max), max);
        assert_eq!(calculate_backoff(u32::MAX, base, max), max);
    }

    #[test]
    fn accept_sequence_doubles_to_cap() {
        let mut backoff = AcceptBackoff::default();
        let delays: Vec<u64> = (0..10).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 320, 640, 1000, 1000]);
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = AcceptBackoff::default();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
    }
}
