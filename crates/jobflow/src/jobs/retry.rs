use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::error::Error;

/// Backoff for transient store failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total tries including the first one.
    pub max_attempts: u32,
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_ms: 50,
            max_ms: 2_000,
            jitter_pct: 0.20,
        }
    }
}

impl RetryConfig {
    /// Single try, no sleeping. Handy for tests that want failures surfaced.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

pub fn next_delay(attempt_no: u32, cfg: &RetryConfig, rng: &mut impl Rng) -> Duration {
    let attempt_no = attempt_no.max(1);

    // exponent = attempt_no - 1
    let exp = attempt_no.saturating_sub(1);

    // 2^exp; past 63 the cap takes over anyway
    let pow2 = 1_u64.checked_shl(exp).unwrap_or(u64::MAX);

    let delay = cfg.base_ms.saturating_mul(pow2).min(cfg.max_ms);

    // jitter in range [-jitter_pct, +jitter_pct]
    let jitter_range = (delay as f64) * cfg.jitter_pct;
    let jitter = if jitter_range > 0.0 {
        rng.gen_range(-jitter_range..=jitter_range)
    } else {
        0.0
    };

    let jittered = (delay as f64 + jitter).round().max(0.0) as u64;
    Duration::from_millis(jittered.min(cfg.max_ms))
}

/// Runs `op` until it succeeds, fails permanently, or the attempt budget is spent.
/// Only transient store errors are retried.
pub async fn with_backoff<T, F, Fut>(cfg: &RetryConfig, what: &str, mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < cfg.max_attempts => {
                let delay = next_delay(attempt, cfg, &mut rand::thread_rng());
                tracing::warn!(
                    op = what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient store error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
