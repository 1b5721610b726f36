//! Backoff loops shared by everything that talks to the chain.
//!
//! Both loops start at `initial_backoff`, double every attempt up to
//! `max_backoff`, stretch each wait by a random factor in `[1.0, 1.1]` and clamp
//! the stretched wait to `max_backoff` again. They give up once the total time
//! spent waiting would exceed `timeout`.

use crate::error::{KeepError, KeepResult};
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MAX_JITTER: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
    pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(120);

    pub const fn new(initial_backoff: Duration, max_backoff: Duration, timeout: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            timeout,
        }
    }

    /// 1s initial, 120s cap.
    pub const fn with_timeout(timeout: Duration) -> Self {
        Self::new(
            Self::DEFAULT_INITIAL_BACKOFF,
            Self::DEFAULT_MAX_BACKOFF,
            timeout,
        )
    }

    fn backoff(&self) -> JitteredBackoff {
        JitteredBackoff {
            inner: ExponentialBuilder::default()
                .with_min_delay(self.initial_backoff)
                .with_max_delay(self.max_backoff)
                .with_factor(2.0)
                .without_max_times()
                .build(),
            max: self.max_backoff,
        }
    }
}

/// Exponential backoff with a small multiplicative jitter; the cap is applied
/// after the jitter.
struct JitteredBackoff {
    inner: ExponentialBackoff,
    max: Duration,
}

impl Iterator for JitteredBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let base = self.inner.next().unwrap_or(self.max);
        Some(apply_jitter(base, self.max, &mut rand::thread_rng()))
    }
}

fn apply_jitter(base: Duration, max: Duration, rng: &mut impl Rng) -> Duration {
    let factor = 1.0 + rng.gen_range(0.0..=MAX_JITTER);
    base.mul_f64(factor).min(max)
}

async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> KeepResult<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(KeepError::Canceled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Calls `f` until it succeeds. Errors that are not retryable (see
/// [`KeepError::is_retryable`]) are returned immediately; otherwise the last
/// error is returned, annotated with the timeout, once the cumulative wait
/// would exceed `policy.timeout`.
pub async fn do_with_retry<T, F, Fut>(
    cancel: &CancellationToken,
    policy: RetryPolicy,
    mut f: F,
) -> KeepResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = KeepResult<T>>,
{
    let mut backoff = policy.backoff();
    let mut waited = Duration::ZERO;
    loop {
        if cancel.is_cancelled() {
            return Err(KeepError::Canceled);
        }
        let err = match f().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) => err,
        };
        let delay = backoff.next().unwrap_or(policy.max_backoff);
        if waited + delay > policy.timeout {
            return Err(err.context(format!("retry timeout [{:?}] exceeded", policy.timeout)));
        }
        tracing::debug!(%err, ?delay, "retrying after failure");
        sleep_or_cancel(cancel, delay).await?;
        waited += delay;
    }
}

/// Polls `f` until it reports `true`. Returns `Ok(false)` once the cumulative
/// wait would exceed `policy.timeout`. Errors are propagated immediately.
pub async fn confirm_with_timeout<F, Fut>(
    cancel: &CancellationToken,
    policy: RetryPolicy,
    mut f: F,
) -> KeepResult<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = KeepResult<bool>>,
{
    let mut backoff = policy.backoff();
    let mut waited = Duration::ZERO;
    loop {
        if cancel.is_cancelled() {
            return Err(KeepError::Canceled);
        }
        if f().await? {
            return Ok(true);
        }
        let delay = backoff.next().unwrap_or(policy.max_backoff);
        if waited + delay > policy.timeout {
            return Ok(false);
        }
        sleep_or_cancel(cancel, delay).await?;
        waited += delay;
    }
}
