//! Retry and cancellation primitives
//!
//! Jittered exponential backoff settings, a bounded retry policy, and the
//! [`CallContext`] that carries a caller's cancellation token and deadline
//! through every blocking point.

use std::time::Duration;

use backoff::backoff::Backoff as _;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Shape of an exponential backoff; each retry loop starts its own
/// [`RetryBackoff`] from it.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffSettings {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    /// Each wait is drawn from `interval * (1 +/- randomization_factor)`.
    pub randomization_factor: f64,
}

impl BackoffSettings {
    pub fn new(initial_interval: Duration, max_interval: Duration) -> Self {
        Self {
            initial_interval,
            max_interval,
            multiplier: 2.0,
            randomization_factor: 0.5,
        }
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_randomization_factor(mut self, factor: f64) -> Self {
        self.randomization_factor = factor;
        self
    }

    /// Fresh backoff state for one retry loop.
    pub fn start(&self) -> RetryBackoff {
        let initial = self.initial_interval.max(Duration::from_millis(1));
        let inner = backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(initial)
            .with_max_interval(self.max_interval.max(initial))
            .with_multiplier(self.multiplier.max(1.0))
            .with_randomization_factor(self.randomization_factor.clamp(0.0, 1.0))
            .with_max_elapsed_time(None)
            .build();
        RetryBackoff { inner }
    }
}

impl Default for BackoffSettings {
    /// 1s doubling to 30s.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Backoff state of one retry loop.
pub struct RetryBackoff {
    inner: backoff::ExponentialBackoff,
}

impl RetryBackoff {
    /// The wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        // No elapsed-time cap is set, so the sequence never ends.
        self.inner
            .next_backoff()
            .unwrap_or(self.inner.max_interval)
    }
}

/// Bounded number of attempts plus the backoff between them.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffSettings,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: BackoffSettings) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Transient transport failures: 5 attempts, 500ms doubling to 30s.
    pub fn transport_default() -> Self {
        Self::new(
            5,
            BackoffSettings::new(Duration::from_millis(500), Duration::from_secs(30)),
        )
    }

    /// Etag conflicts: 10 attempts, 1s doubling to 30s.
    pub fn conflict_default() -> Self {
        Self::new(10, BackoffSettings::default())
    }

    pub fn no_retry() -> Self {
        Self::new(1, BackoffSettings::default())
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    pub fn allows_another(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::transport_default()
    }
}

// =========================================================================
// Call context
// =========================================================================

/// Cancellation and deadline propagated from the caller.
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Keep the earlier of the existing deadline and `deadline`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time left before the deadline, if there is one.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail if the call was cancelled or its deadline has passed.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if self.remaining().is_some_and(|r| r.is_zero()) {
            return Err(Error::DeadlineExceeded);
        }
        Ok(())
    }

    /// Sleep for `duration`, waking early on cancellation or deadline.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.check()?;
        let capped = match self.remaining() {
            Some(remaining) if remaining < duration => remaining,
            _ => duration,
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(capped) => {
                if capped < duration {
                    Err(Error::DeadlineExceeded)
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Run `fut` unless the call is cancelled or its deadline passes first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        self.check()?;
        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = deadline => Err(Error::DeadlineExceeded),
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_backoff_doubles_and_truncates() {
        let mut b = BackoffSettings::default()
            .with_randomization_factor(0.0)
            .start();
        let secs: Vec<u64> = (0..7).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_jitter_stays_around_interval() {
        let mut jittered = BackoffSettings::default().start();
        let mut exact = BackoffSettings::default()
            .with_randomization_factor(0.0)
            .start();
        for _ in 0..8 {
            let interval = exact.next_delay();
            let d = jittered.next_delay();
            assert!(
                d >= interval / 2 && d <= interval.mul_f64(1.5) + Duration::from_millis(1),
                "{d:?} outside {interval:?}"
            );
        }
    }

    #[test]
    fn test_each_loop_starts_from_initial_interval() {
        let settings = BackoffSettings::new(Duration::from_millis(10), Duration::from_millis(20))
            .with_randomization_factor(0.0);
        let mut first = settings.start();
        first.next_delay();
        first.next_delay();
        assert_eq!(settings.start().next_delay().as_millis(), 10);
    }

    #[test]
    fn test_policy_attempt_budget() {
        let p = RetryPolicy::new(3, BackoffSettings::default());
        assert!(p.allows_another(1));
        assert!(p.allows_another(2));
        assert!(!p.allows_another(3));
        assert!(!RetryPolicy::no_retry().allows_another(1));
    }

    #[tokio::test]
    async fn test_cancelled_context_fails_fast() {
        let ctx = CallContext::new();
        ctx.cancel();
        let err = ctx.sleep(Duration::from_secs(60)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        let err = ctx.run(async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_wakes_on_cancel() {
        let ctx = CallContext::new();
        let child = ctx.clone();
        let handle = tokio::spawn(async move { child.sleep(Duration::from_secs(3600)).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        ctx.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_caps_sleep_and_run() {
        let ctx = CallContext::new().with_timeout(Duration::from_secs(5));
        let err = ctx.sleep(Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));

        let ctx = CallContext::new().with_timeout(Duration::from_secs(5));
        let err = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[test]
    fn test_with_deadline_keeps_earliest() {
        let now = Instant::now();
        let ctx = CallContext::new()
            .with_deadline(now + Duration::from_secs(10))
            .with_deadline(now + Duration::from_secs(60));
        assert_eq!(ctx.deadline(), Some(now + Duration::from_secs(10)));
    }
}
