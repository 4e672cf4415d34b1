use std::time::Duration;

use rand::Rng;

/// Capped exponential reconnect delay with proportional jitter.
///
/// `delay(n)` is `min(base * 2^n, max)`, with up to `jitter` of that value
/// replaced by a uniformly random amount so that many clients dropped by the
/// same server restart do not reconnect in lockstep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: f64,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = clamp_jitter(jitter);
        self
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay)
    }

    /// Upper bound for the given attempt (0-based), before jitter.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        if self.jitter == 0.0 || ceiling.is_zero() {
            return ceiling;
        }
        let fixed = ceiling.mul_f64(1.0 - self.jitter);
        let spread = ceiling.saturating_sub(fixed);
        let random = rand::thread_rng().gen_range(0.0..=1.0);
        fixed + spread.mul_f64(random)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30)).with_jitter(0.5)
    }
}

/// Keeps a jitter fraction inside `[0, 1]`; NaN and infinities disable jitter.
pub(crate) fn clamp_jitter(jitter: f64) -> f64 {
    if jitter.is_finite() {
        jitter.clamp(0.0, 1.0)
    } else {
        0.0
    }
}
