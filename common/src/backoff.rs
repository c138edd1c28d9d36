use std::time::Duration;

pub const INITIAL_RETRY: Duration = Duration::from_secs(5);
pub const MAX_RETRY: Duration = Duration::from_secs(120);

/// Doubling reconnect delay, capped, reset after a successful connect.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_RETRY, MAX_RETRY)
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt after a failure.
    pub fn on_failure(&mut self) -> Duration {
        self.current = (self.current * 2).min(self.max);
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_cap() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..6).map(|_| backoff.on_failure().as_secs()).collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 120, 120]);
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut backoff = Backoff::default();
        backoff.on_failure();
        backoff.on_failure();
        backoff.reset();
        assert_eq!(backoff.current(), INITIAL_RETRY);
        assert_eq!(backoff.on_failure(), Duration::from_secs(10));
    }
}
