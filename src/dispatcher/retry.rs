//! Retry eligibility and backoff for dispatched calls.

use std::time::Duration;

use rand::{Rng, thread_rng};

use crate::config::{BackoffStrategy, RetryPolicyConfig};
use crate::error::IntegrationError;

/// A failed call is retried only when its error is retryable and it has attempts left.
pub fn should_retry(err: &IntegrationError, attempts_made: u32, max_attempts: u32) -> bool {
    err.retryable && attempts_made < max_attempts
}

/// Backoff before the retry that follows `retries_done` earlier retries, without jitter.
pub fn base_delay(policy: &RetryPolicyConfig, retries_done: u32) -> Duration {
    let base = policy.base_delay_ms as f64;
    let raw = match policy.strategy {
        BackoffStrategy::Exponential => base * 2_f64.powi(retries_done.min(30) as i32),
        BackoffStrategy::Linear => base * f64::from(retries_done + 1),
    };
    Duration::from_millis(raw.min(policy.max_delay_ms as f64) as u64)
}

/// Delay before re-enqueueing: the policy backoff, stretched to any server-provided
/// `retry_after`, plus up to `jitter_factor` of random extra.
pub fn retry_delay(
    policy: &RetryPolicyConfig,
    retries_done: u32,
    retry_after: Option<Duration>,
) -> Duration {
    let mut delay = base_delay(policy, retries_done);
    if let Some(hint) = retry_after {
        delay = delay.max(hint);
    }
    with_jitter(delay, policy.jitter_factor, &mut thread_rng())
}

pub fn with_jitter<R: Rng + ?Sized>(delay: Duration, jitter_factor: f64, rng: &mut R) -> Duration {
    let spread = delay.as_secs_f64() * jitter_factor.clamp(0.0, 1.0);
    if spread <= 0.0 {
        return delay;
    }
    delay + Duration::from_secs_f64(rng.gen_range(0.0..spread))
}
