//! Retry delay computation for failed attempts.

use std::time::Duration;

use rand::Rng;

/// Largest exponent applied to the base delay; keeps the shift well away
/// from overflow even with misconfigured caps.
const MAX_EXPONENT: u32 = 20;

/// Delay before the next attempt after `attempts` completed failures:
/// `base * 2^min(attempts, cap) * (1 + jitter)` with `jitter in [0, 0.25)`.
pub(crate) fn retry_delay(base: Duration, cap: u32, attempts: u32) -> Duration {
    let exponent = attempts.min(cap).min(MAX_EXPONENT);
    let scaled = base.saturating_mul(1u32 << exponent);
    let jitter: f64 = rand::rng().random_range(0.0..0.25);
    scaled.mul_f64(1.0 + jitter)
}
