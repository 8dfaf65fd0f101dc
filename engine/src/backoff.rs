//! Exponential backoff for the soft/hard reconnect retry delays.

use std::time::Duration;

use backoff::backoff::Backoff as _;

/// Doubling delay bounded by a ceiling, used for `softDelayMs`
/// (250ms → 2.5s) and `hardDelayMs` (6s → 30s).
pub struct BackoffDelayer(backoff::ExponentialBackoff);

impl BackoffDelayer {
    /// Creates a new delayer starting at `initial_interval`, doubling
    /// (`multiplier = 2.0`) on every [`next`](Self::next) call, capped at
    /// `max_interval`.
    #[must_use]
    pub fn new(initial_interval: Duration, max_interval: Duration) -> Self {
        let mut backoff = backoff::ExponentialBackoff {
            current_interval: initial_interval,
            initial_interval,
            multiplier: 2.0,
            max_interval,
            max_elapsed_time: None,
            randomization_factor: 0.0,
            ..backoff::ExponentialBackoff::default()
        };
        backoff.reset();
        Self(backoff)
    }

    /// Returns the next delay in the sequence, capped at `max_interval`.
    pub fn next(&mut self) -> Duration {
        self.0.next_backoff().unwrap_or(self.0.max_interval)
    }

    /// Resets the sequence back to the initial interval.
    pub fn reset(&mut self) {
        self.0.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_delay_doubles_up_to_cap() {
        let mut soft = BackoffDelayer::new(Duration::from_millis(250), Duration::from_millis(2500));
        assert_eq!(soft.next(), Duration::from_millis(250));
        assert_eq!(soft.next(), Duration::from_millis(500));
        assert_eq!(soft.next(), Duration::from_millis(1000));
        assert_eq!(soft.next(), Duration::from_millis(2000));
        assert_eq!(soft.next(), Duration::from_millis(2500));
        assert_eq!(soft.next(), Duration::from_millis(2500));
    }

    #[test]
    fn hard_delay_doubles_up_to_cap() {
        let mut hard = BackoffDelayer::new(Duration::from_secs(6), Duration::from_secs(30));
        assert_eq!(hard.next(), Duration::from_secs(6));
        assert_eq!(hard.next(), Duration::from_secs(12));
        assert_eq!(hard.next(), Duration::from_secs(24));
        assert_eq!(hard.next(), Duration::from_secs(30));
    }

    #[test]
    fn reset_restarts_from_initial_interval() {
        let mut soft = BackoffDelayer::new(Duration::from_millis(250), Duration::from_millis(2500));
        let _ = soft.next();
        let _ = soft.next();
        soft.reset();
        assert_eq!(soft.next(), Duration::from_millis(250));
    }
}
