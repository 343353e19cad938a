use std::time::Duration;

/// Largest exponent applied to the base delay. Keeps the shift well inside
/// `u32` and caps the wait at `base * 2^16`.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Delay to wait after the `attempt`-th failed delivery (1-based).
///
/// Doubles the base delay per attempt: `base * 2^(attempt - 1)`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
    base.saturating_mul(1u32 << exponent)
}
