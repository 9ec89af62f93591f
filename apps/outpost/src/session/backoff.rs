use std::time::Duration;

pub const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Exponential reconnect delay: doubles on every failure up to the cap and
/// drops back to the floor after a successful dial.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    floor: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, cap: Duration) -> Self {
        Self {
            current: floor,
            floor,
            cap: cap.max(floor),
        }
    }

    /// Delay to wait after the failure that just happened. Advances the
    /// schedule for the next one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(INITIAL_RETRY_DELAY, MAX_RETRY_DELAY)
    }
}
