//! Shared exponential backoff used by every retry layer.
//!
//! Exactly one function computes retry delays; the extraction client, the
//! orchestrator's stage retries, and the stale-run reaper all call it, so a
//! retried failure is never backed off twice by independent policies.

use std::time::Duration;

/// Calculate a retry delay using exponential backoff with jitter.
///
/// `retry_count` is zero-based: the delay before the first retry uses
/// `base_delay_ms`, doubling on each subsequent retry up to `max_delay_ms`.
pub fn calculate_retry_backoff(retry_count: u32, base_delay_ms: i64, max_delay_ms: i64) -> i64 {
    use rand::Rng;
    debug_assert!(base_delay_ms > 0);
    debug_assert!(max_delay_ms >= base_delay_ms);

    // Exponential: base * 2^retry_count
    let exponent = retry_count.min(20); // Prevent overflow
    let multiplier = 2_i64.saturating_pow(exponent);
    let delay = base_delay_ms.saturating_mul(multiplier);

    let capped_delay = delay.min(max_delay_ms);

    // Add jitter (±10%)
    let mut rng = rand::thread_rng();
    let jitter_factor = rng.gen_range(0.9..=1.1);
    let final_delay = ((capped_delay as f64) * jitter_factor) as i64;

    final_delay.clamp(base_delay_ms, max_delay_ms)
}

/// Same computation as [`calculate_retry_backoff`], returned as a `Duration`
/// for in-process sleeps.
pub fn backoff_duration(retry_count: u32, base_delay_ms: i64, max_delay_ms: i64) -> Duration {
    let delay_ms = calculate_retry_backoff(retry_count, base_delay_ms, max_delay_ms);
    Duration::from_millis(delay_ms.max(0) as u64)
}
