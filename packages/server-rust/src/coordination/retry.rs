//! Optimistic retry executor.
//!
//! Re-runs the join only when it lost a version race. Every other outcome,
//! success or rejection, is final on the first attempt.

use std::future::Future;
use std::time::Duration;

use joingate_core::PartyId;
use tokio_util::sync::CancellationToken;

use super::classify::CoordinationError;
use crate::config::RetryConfig;

/// Bounded, fixed-delay retry on [`DomainError::VersionConflict`](joingate_core::DomainError::VersionConflict).
#[derive(Debug, Clone, Copy)]
pub struct OptimisticRetry {
    max_attempts: u32,
    delay: Duration,
}

impl OptimisticRetry {
    /// `max_attempts` of 0 is treated as 1.
    #[must_use]
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.delay())
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Invokes `operation` until it stops reporting a version conflict or the
    /// attempt budget runs out.
    ///
    /// # Errors
    ///
    /// - [`CoordinationError::RetriesExhausted`] when every attempt conflicted.
    /// - [`CoordinationError::LockWaitInterrupted`] when `cancel` fires during
    ///   the delay between attempts.
    /// - Any non-conflict error from `operation`, unchanged.
    pub async fn run<F, Fut, T>(
        &self,
        party_id: PartyId,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, CoordinationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoordinationError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match operation().await {
                Err(CoordinationError::Domain(err)) if err.is_version_conflict() => err,
                other => return other,
            };

            metrics::counter!("joingate_version_conflicts_total").increment(1);
            tracing::warn!(
                %party_id,
                attempt,
                max_attempts = self.max_attempts,
                error = %err,
                "optimistic conflict, retrying"
            );

            if attempt >= self.max_attempts {
                return Err(CoordinationError::RetriesExhausted {
                    party_id,
                    attempts: attempt,
                });
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::warn!(%party_id, attempt, "cancelled between optimistic attempts");
                    return Err(CoordinationError::LockWaitInterrupted);
                }
                () = tokio::time::sleep(self.delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use joingate_core::DomainError;
    use tokio::time::Instant;

    use super::*;

    const PARTY: PartyId = PartyId(11);

    fn conflict() -> CoordinationError {
        CoordinationError::Domain(DomainError::VersionConflict {
            party_id: PARTY,
            expected: 1,
            actual: 2,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_conflicts() {
        let retry = OptimisticRetry::new(3, Duration::from_millis(50));
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let out = retry
            .run(PARTY, &CancellationToken::new(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(conflict())
                } else {
                    Ok("joined")
                }
            })
            .await
            .unwrap();

        assert_eq!(out, "joined");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_max_attempts_without_trailing_delay() {
        let retry = OptimisticRetry::new(3, Duration::from_millis(50));
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let err = retry
            .run(PARTY, &CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(conflict())
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CoordinationError::RetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn domain_rejection_is_not_retried() {
        let retry = OptimisticRetry::new(3, Duration::from_millis(50));
        let calls = AtomicU32::new(0);

        let err = retry
            .run(PARTY, &CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CoordinationError::Domain(DomainError::PartyFull {
                    party_id: PARTY,
                    capacity: 4,
                }))
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CoordinationError::Domain(DomainError::PartyFull { .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn infrastructure_failure_is_not_retried() {
        let retry = OptimisticRetry::new(3, Duration::from_millis(50));
        let calls = AtomicU32::new(0);

        let err = retry
            .run(PARTY, &CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(CoordinationError::Store(anyhow::anyhow!("pool exhausted")))
            })
            .await
            .unwrap_err();

        assert!(err.is_infrastructure());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_delay_is_interrupted() {
        let retry = OptimisticRetry::new(3, Duration::from_millis(50));
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let task = {
            let cancel = cancel.clone();
            let calls = Arc::clone(&calls);
            tokio::spawn(async move {
                retry
                    .run(PARTY, &cancel, || {
                        let calls = Arc::clone(&calls);
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Err::<(), _>(conflict())
                        }
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, CoordinationError::LockWaitInterrupted));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_attempts_is_clamped() {
        assert_eq!(OptimisticRetry::new(0, Duration::ZERO).max_attempts(), 1);
        assert_eq!(
            OptimisticRetry::from_config(&RetryConfig::default()).max_attempts(),
            3
        );
    }
}
