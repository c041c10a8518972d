/// Capped exponential backoff for push channel reconnects
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    /// Fraction of the delay randomised away (0.0 = deterministic)
    jitter: f64,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier: multiplier.max(1.0),
            jitter: 0.2,
            current: initial,
            attempts: 0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the next attempt; grows until the cap
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.attempts = self.attempts.saturating_add(1);
        self.current = base.mul_f64(self.multiplier).min(self.max);

        if self.jitter == 0.0 {
            return base;
        }
        // Shave up to `jitter` of the delay so reconnecting clients spread out.
        let factor = 1.0 - rand::thread_rng().gen_range(0.0..=self.jitter);
        base.mul_f64(factor).max(Duration::from_millis(1))
    }

    /// Consecutive delays handed out since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }
}
