//! Exponential backoff around external calls.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry budget and backoff curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total invocations, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

impl RetryConfig {
    /// Delay before zero-based attempt `k`: nothing before the first attempt,
    /// `base × factor^(k−1)` afterwards.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let nanos = (self.base_delay_ms as f64 * 1e6 * self.backoff_factor.max(0.0).powi(exponent)).round();
        if nanos.is_finite() && nanos < u64::MAX as f64 {
            Duration::from_nanos(nanos as u64)
        } else {
            Duration::MAX
        }
    }
}

/// Where the retrier waits between attempts.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, delay: Duration);
}

/// Blocks the calling worker thread.
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

#[derive(Clone)]
pub struct Retrier {
    config: RetryConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl Retrier {
    pub fn new(config: RetryConfig) -> Self {
        Self::with_sleeper(config, Arc::new(ThreadSleeper))
    }

    pub fn with_sleeper(config: RetryConfig, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { config, sleeper }
    }

    /// Invoke `f` until it succeeds or the budget is spent; every error is
    /// retried the same way. Returns the last error.
    pub fn call<T, E, F>(&self, label: &str, f: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Result<T, E>,
    {
        self.call_if(label, f, |_| true)
    }

    /// Like [`Retrier::call`], but an error for which `retryable` returns
    /// false is returned immediately.
    pub fn call_if<T, E, F, P>(&self, label: &str, mut f: F, retryable: P) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Result<T, E>,
        P: Fn(&E) -> bool,
    {
        let budget = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if attempt >= budget || !retryable(&e) {
                        return Err(e);
                    }
                    let delay = self.config.delay_before(attempt);
                    tracing::debug!(
                        call = %label,
                        attempt,
                        budget,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "call failed, retrying"
                    );
                    self.sleeper.sleep(delay);
                }
            }
        }
    }
}
