use rand::Rng;
use std::time::Duration;

/// Hard ceiling on any reconnect delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(6);

/// Reconnect delay: a random sub-second jitter first, then doubling from
/// one second up to the cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    cap: Duration,
}

impl Backoff {
    pub fn new(cap: Duration) -> Self {
        Self { attempt: 0, cap }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = if self.attempt == 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..1000))
        } else {
            let exp = (self.attempt - 1).min(16);
            Duration::from_secs(1u64 << exp).min(self.cap)
        };
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(MAX_BACKOFF)
    }
}
