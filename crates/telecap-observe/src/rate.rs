use std::time::{Duration, Instant};

/// Gate for warning-class logs that can fire every tick.
///
/// `check()` returns true at most once per window; callers skip the log
/// otherwise. Suppressed counts are reported with the next allowed event.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: None,
            suppressed: 0,
        }
    }

    /// Returns `Some(suppressed_since_last)` when the caller may log now.
    pub fn check(&mut self) -> Option<u64> {
        let now = Instant::now();
        match self.last {
            Some(prev) if now.duration_since(prev) < self.window => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last = Some(now);
                let suppressed = self.suppressed;
                self.suppressed = 0;
                Some(suppressed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_event_passes_then_window_gates() {
        let mut rl = RateLimiter::new(Duration::from_secs(60));
        assert_eq!(rl.check(), Some(0));
        assert_eq!(rl.check(), None);
        assert_eq!(rl.check(), None);
    }

    #[test]
    fn zero_window_never_suppresses() {
        let mut rl = RateLimiter::new(Duration::ZERO);
        assert_eq!(rl.check(), Some(0));
        assert_eq!(rl.check(), Some(0));
    }
}
