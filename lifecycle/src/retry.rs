//! Exponential backoff for ledger submissions.
//!
//! Only `LedgerError::Unavailable` is retried. Anything past the point of
//! submission (`Uncertain`) or refused outright (`Rejected`) is returned to the
//! caller on the first occurrence.

use crate::ledger::LedgerError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{fmt, future::Future, time::Duration};
use tracing::warn;

const DEFAULT_BASE_DELAY_MS: u64 = 500;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_MAX_RETRIES: u32 = 4;
const DEFAULT_JITTER_FACTOR: f64 = 0.1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    /// Fraction of the delay randomly added or removed, in `0.0..=1.0`.
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl fmt::Display for BackoffPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BackoffPolicy(base={:?}, max={:?}, retries={}, jitter={:.0}%)",
            self.base_delay,
            self.max_delay,
            self.max_retries,
            self.jitter_factor * 100.0
        )
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based), without jitter.
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay_for(retry);
        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let scale = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        base.mul_f64(scale).min(self.max_delay)
    }

    pub fn can_retry(&self, retry: u32) -> bool {
        retry < self.max_retries
    }
}

/// Run `attempt` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of retries. `attempt` receives the attempt number starting
/// at 0 so it can re-check the ledger before resubmitting.
pub async fn with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    label: &str,
    mut attempt: F,
) -> Result<T, LedgerError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let mut n = 0;
    loop {
        match attempt(n).await {
            Err(LedgerError::Unavailable(reason)) if policy.can_retry(n) => {
                let delay = policy.delay_for(n);
                warn!(
                    attempt = n + 1,
                    delay_ms = delay.as_millis() as u64,
                    "{} failed before reaching the ledger: {}",
                    label,
                    reason
                );
                tokio::time::sleep(delay).await;
                n += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            max_retries: 3,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn delays_grow_exponentially_up_to_the_cap() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            max_retries: 10,
            jitter_factor: 0.0,
        };
        let delays: Vec<_> = (0..5).map(|r| policy.delay_for(r).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
        assert_eq!(policy.base_delay_for(64), Duration::from_secs(5));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            max_retries: 3,
            jitter_factor: 0.1,
        };
        for _ in 0..100 {
            let d = policy.delay_for(0).as_millis();
            assert!((900..=1100).contains(&d), "delay {} out of range", d);
        }
    }

    #[tokio::test]
    async fn unavailable_is_retried_until_success() {
        let calls = AtomicU32::new(0);
        let res = with_backoff(&fast(), "fund", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(LedgerError::Unavailable("connection refused".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(res.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let res: Result<(), _> = with_backoff(&fast(), "fund", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(LedgerError::Unavailable("down".into())) }
        })
        .await;
        assert!(matches!(res, Err(LedgerError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn uncertain_outcomes_are_never_retried() {
        let calls = AtomicU32::new(0);
        let res: Result<(), _> = with_backoff(&fast(), "release", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(LedgerError::Uncertain {
                    tx_ref: None,
                    reason: "receipt timed out".into(),
                })
            }
        })
        .await;
        assert!(matches!(res, Err(LedgerError::Uncertain { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
