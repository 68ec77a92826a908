//! Exponential backoff for reconnection

use std::time::{Duration, Instant};

/// Compute the reconnect delay for an attempt count.
///
/// `delay = min(base * 2^attempt, max)`; the shift is clamped so the
/// multiplication cannot overflow. Non-decreasing in `attempt`, never
/// exceeds `max`, and `delay(0) == base` (subject to the cap).
pub fn delay_for_attempt(attempt: u32, base: Duration, max: Duration) -> Duration {
    let base_ms = base.as_millis();
    let max_ms = max.as_millis();
    let shift = attempt.min(64);
    let delay_ms = base_ms
        .checked_shl(shift)
        .unwrap_or(u128::MAX)
        .min(max_ms)
        .min(u64::MAX as u128);
    Duration::from_millis(delay_ms as u64)
}

/// Add bounded random jitter to a delay without breaking the cap.
///
/// `factor` is the fraction of the delay that may be added (0.0 to 1.0).
pub fn jittered(delay: Duration, max: Duration, factor: f64) -> Duration {
    if factor <= 0.0 {
        return delay;
    }
    let jitter = delay.as_secs_f64() * factor.min(1.0) * rand::random::<f64>();
    (delay + Duration::from_secs_f64(jitter)).min(max)
}

/// Attempt counter owned by a reconnecting manager.
///
/// Reset to zero on every successful transition to `forwarding`.
#[derive(Debug, Default)]
pub struct BackoffState {
    attempt: u32,
    last_failure: Option<Instant>,
}

impl BackoffState {
    /// Fresh state with no failures recorded
    pub fn new() -> Self {
        Self::default()
    }

    /// Current attempt count
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// When the last failure was recorded
    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }

    /// Record a failure and return the delay to wait before the next attempt
    pub fn next_delay(&mut self, base: Duration, max: Duration) -> Duration {
        let delay = delay_for_attempt(self.attempt, base, max);
        self.attempt = self.attempt.saturating_add(1);
        self.last_failure = Some(Instant::now());
        delay
    }

    /// Reset after a successful connect
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last_failure = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(500);
    const MAX: Duration = Duration::from_secs(30);

    #[test]
    fn first_delay_is_base() {
        assert_eq!(delay_for_attempt(0, BASE, MAX), BASE);
    }

    #[test]
    fn delays_double_until_cap() {
        assert_eq!(delay_for_attempt(1, BASE, MAX), Duration::from_millis(1000));
        assert_eq!(delay_for_attempt(2, BASE, MAX), Duration::from_millis(2000));
        assert_eq!(delay_for_attempt(6, BASE, MAX), Duration::from_millis(32000).min(MAX));
        assert_eq!(delay_for_attempt(7, BASE, MAX), MAX);
    }

    #[test]
    fn monotone_and_capped() {
        let mut prev = Duration::ZERO;
        for attempt in 0..200 {
            let d = delay_for_attempt(attempt, BASE, MAX);
            assert!(d >= prev, "delay decreased at attempt {}", attempt);
            assert!(d <= MAX, "delay exceeded max at attempt {}", attempt);
            prev = d;
        }
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        assert_eq!(delay_for_attempt(u32::MAX, BASE, MAX), MAX);
    }

    #[test]
    fn state_advances_and_resets() {
        let mut state = BackoffState::new();
        assert_eq!(state.next_delay(BASE, MAX), BASE);
        assert_eq!(state.next_delay(BASE, MAX), Duration::from_millis(1000));
        assert_eq!(state.attempt(), 2);
        assert!(state.last_failure().is_some());

        state.reset();
        assert_eq!(state.attempt(), 0);
        assert!(state.last_failure().is_none());
        assert_eq!(state.next_delay(BASE, MAX), BASE);
    }

    #[test]
    fn jitter_never_exceeds_max() {
        for _ in 0..100 {
            let d = jittered(MAX, MAX, 0.5);
            assert!(d <= MAX);
        }
    }

    #[test]
    fn jitter_never_shrinks_delay() {
        for _ in 0..100 {
            let d = jittered(BASE, MAX, 0.1);
            assert!(d >= BASE);
            assert!(d <= BASE + BASE.mul_f64(0.1));
        }
    }
}
