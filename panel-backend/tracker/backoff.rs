use std::time::Duration;

/// Geometric delay between poll ticks: `initial * multiplier^n`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    multiplier: f64,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            initial,
            multiplier: multiplier.max(1.0),
            max: max.max(initial),
            attempt: 0,
        }
    }

    /// Delay before the next tick; advances the growth counter.
    pub fn next_delay(&mut self) -> Duration {
        let factor = self.multiplier.powi(self.attempt.min(i32::MAX as u32) as i32);
        let millis = (self.initial.as_millis() as f64 * factor).floor();
        let max_millis = self.max.as_millis() as f64;

        let delay = if millis.is_finite() && millis < max_millis {
            Duration::from_millis(millis as u64)
        } else {
            self.max
        };

        if delay < self.max {
            self.attempt = self.attempt.saturating_add(1);
        }
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
