//! Bounded retry shared by every agent that talks to an external API.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::Retryable;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    None,
    Fixed(Duration),
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay after the `failed`-th failed attempt (1-based).
    pub fn delay_for_attempt(&self, failed: u32) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let factor = 2u32.saturating_pow(failed.saturating_sub(1));
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self { max_attempts: max_attempts.max(1), backoff }
    }

    #[cfg(test)]
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Backoff::None)
    }
}

/// Outcome of a retried operation plus how many attempts it took.
#[derive(Debug)]
pub struct Retried<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempt ceiling is reached. `op` receives the 1-based attempt number.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, op_name: &str, mut op: F) -> Retried<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Retried { result: Ok(value), attempts: attempt },
            Err(e) if attempt < policy.max_attempts && e.is_retryable() => {
                let delay = policy.backoff.delay_for_attempt(attempt);
                warn!(op = op_name, attempt, error = %e, delay_ms = delay.as_millis() as u64, "🔄 retrying");
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            Err(e) => return Retried { result: Err(e), attempts: attempt },
        }
    }
}
