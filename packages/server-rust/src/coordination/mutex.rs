//! Distributed mutex adapter.
//!
//! [`DistributedMutex`] is the narrow provider contract (acquire, ownership
//! query, release). [`MutexAdapter::with_lock`] runs one operation under the
//! lock and guarantees release on every exit path through [`LockGuard`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::classify::CoordinationError;

// ---------------------------------------------------------------------------
// Provider contract
// ---------------------------------------------------------------------------

/// Proof of holding a lock, handed out by [`DistributedMutex::acquire`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken {
    /// Key the lock was acquired on.
    pub key: String,
    /// Unique identity of this acquisition.
    pub holder_id: String,
    /// Monotonic per-provider acquisition number.
    pub fencing: u64,
}

/// Failure of the lock provider itself (not contention).
#[derive(Debug, thiserror::Error)]
pub enum MutexError {
    #[error("lock backend failure on {key}: {source}")]
    Backend {
        key: String,
        source: anyhow::Error,
    },
}

/// Fair, lease-bounded mutual exclusion keyed by string.
///
/// Waiters on the same key are granted the lock in arrival order. A held
/// lock is freed by the provider once its lease elapses, even if the holder
/// never releases it.
#[async_trait]
pub trait DistributedMutex: Send + Sync {
    /// Waits up to `wait` for the lock on `key`, holding it for at most
    /// `lease`. Returns `Ok(None)` when `wait` elapses first.
    async fn acquire(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<Option<LockToken>, MutexError>;

    /// Returns `true` if `token` is still the live holder of its key.
    async fn is_held_by(&self, token: &LockToken) -> Result<bool, MutexError>;

    /// Releases the lock if `token` still holds it. Idempotent.
    async fn release(&self, token: &LockToken) -> Result<(), MutexError>;
}

// ---------------------------------------------------------------------------
// LockGuard
// ---------------------------------------------------------------------------

/// Scoped ownership of a lock.
///
/// Call [`LockGuard::release`] on the normal path. A guard dropped without
/// release (for example because the future holding it was cancelled) spawns
/// a best-effort release on the current Tokio runtime; without a runtime the
/// lease frees the lock.
pub struct LockGuard {
    mutex: Arc<dyn DistributedMutex>,
    token: LockToken,
    released: bool,
}

impl LockGuard {
    #[must_use]
    pub fn new(mutex: Arc<dyn DistributedMutex>, token: LockToken) -> Self {
        Self {
            mutex,
            token,
            released: false,
        }
    }

    #[must_use]
    pub fn token(&self) -> &LockToken {
        &self.token
    }

    /// Releases the lock if this guard is still its holder.
    pub async fn release(mut self) {
        release_if_held(self.mutex.as_ref(), &self.token).await;
        self.released = true;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key = %self.token.key, "no runtime to release lock, relying on lease");
            return;
        };
        let mutex = Arc::clone(&self.mutex);
        let token = self.token.clone();
        handle.spawn(async move {
            release_if_held(mutex.as_ref(), &token).await;
        });
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("token", &self.token)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

/// Ownership check, then release. Failures are logged: the lease bounds how
/// long a lock we failed to release can stay held.
async fn release_if_held(mutex: &dyn DistributedMutex, token: &LockToken) {
    match mutex.is_held_by(token).await {
        Ok(true) => {
            if let Err(err) = mutex.release(token).await {
                tracing::error!(key = %token.key, error = %err, "failed to release lock");
            }
        }
        Ok(false) => {
            tracing::warn!(
                key = %token.key,
                holder_id = %token.holder_id,
                "lock no longer held at release, lease expired first"
            );
        }
        Err(err) => {
            tracing::error!(key = %token.key, error = %err, "lock ownership check failed");
        }
    }
}

// ---------------------------------------------------------------------------
// MutexAdapter
// ---------------------------------------------------------------------------

/// Runs operations under a [`DistributedMutex`].
#[derive(Clone)]
pub struct MutexAdapter {
    mutex: Arc<dyn DistributedMutex>,
}

impl MutexAdapter {
    #[must_use]
    pub fn new(mutex: Arc<dyn DistributedMutex>) -> Self {
        Self { mutex }
    }

    /// Acquires `key`, runs `operation` exactly once while holding it, and
    /// releases the lock before returning.
    ///
    /// # Errors
    ///
    /// - [`CoordinationError::LockContention`] when `wait` elapses before the
    ///   lock is granted.
    /// - [`CoordinationError::LockWaitInterrupted`] when `cancel` fires while
    ///   waiting; no lock is held afterwards.
    /// - [`CoordinationError::Mutex`] when the provider fails to acquire.
    /// - Whatever `operation` returns.
    pub async fn with_lock<F, Fut, T>(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, CoordinationError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CoordinationError>>,
    {
        let acquired = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tracing::warn!(key, "cancelled while waiting for lock");
                return Err(CoordinationError::LockWaitInterrupted);
            }
            acquired = self.mutex.acquire(key, wait, lease) => acquired?,
        };

        let Some(token) = acquired else {
            metrics::counter!("joingate_lock_contention_total").increment(1);
            tracing::warn!(key, ?wait, "lock wait timed out");
            return Err(CoordinationError::LockContention {
                key: key.to_owned(),
            });
        };

        let guard = LockGuard::new(Arc::clone(&self.mutex), token);
        let result = operation().await;
        guard.release().await;
        result
    }
}

impl fmt::Debug for MutexAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexAdapter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use joingate_core::{DomainError, PartyId};

    use super::*;
    use crate::lock::InMemoryFairLock;

    const WAIT: Duration = Duration::from_secs(3);
    const LEASE: Duration = Duration::from_secs(20);

    /// Provider that always fails.
    struct BrokenMutex;

    #[async_trait]
    impl DistributedMutex for BrokenMutex {
        async fn acquire(
            &self,
            key: &str,
            _wait: Duration,
            _lease: Duration,
        ) -> Result<Option<LockToken>, MutexError> {
            Err(MutexError::Backend {
                key: key.to_owned(),
                source: anyhow::anyhow!("connection refused"),
            })
        }

        async fn is_held_by(&self, _token: &LockToken) -> Result<bool, MutexError> {
            Ok(false)
        }

        async fn release(&self, _token: &LockToken) -> Result<(), MutexError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn runs_operation_once_and_releases() {
        let lock = InMemoryFairLock::new();
        let adapter = MutexAdapter::new(Arc::new(lock.clone()));
        let calls = AtomicUsize::new(0);

        let out = adapter
            .with_lock("party:join:1", WAIT, LEASE, &CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                assert!(lock.is_locked("party:join:1"));
                Ok::<_, CoordinationError>(42)
            })
            .await
            .unwrap();

        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!lock.is_locked("party:join:1"));
    }

    #[tokio::test]
    async fn releases_after_operation_error() {
        let lock = InMemoryFairLock::new();
        let adapter = MutexAdapter::new(Arc::new(lock.clone()));

        let err = adapter
            .with_lock("party:join:2", WAIT, LEASE, &CancellationToken::new(), || async {
                Err::<(), _>(CoordinationError::Domain(DomainError::PartyNotFound {
                    party_id: PartyId(2),
                }))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CoordinationError::Domain(_)));
        assert!(!lock.is_locked("party:join:2"));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_timeout_is_contention() {
        let lock = InMemoryFairLock::new();
        let held = lock.acquire("k", WAIT, LEASE).await.unwrap().unwrap();
        let adapter = MutexAdapter::new(Arc::new(lock.clone()));
        let calls = AtomicUsize::new(0);

        let err = adapter
            .with_lock("k", Duration::from_millis(100), LEASE, &CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CoordinationError>(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CoordinationError::LockContention { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(lock.is_held_by(&held).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_while_waiting_is_interrupted() {
        let lock = InMemoryFairLock::new();
        let held = lock.acquire("k", WAIT, LEASE).await.unwrap().unwrap();
        let adapter = MutexAdapter::new(Arc::new(lock.clone()));
        let cancel = CancellationToken::new();

        let waiter = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                adapter
                    .with_lock("k", WAIT, LEASE, &cancel, || async {
                        Ok::<_, CoordinationError>(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, CoordinationError::LockWaitInterrupted));
        assert_eq!(lock.waiting("k"), 0);

        lock.release(&held).await.unwrap();
        assert!(!lock.is_locked("k"));
    }

    #[tokio::test]
    async fn provider_failure_surfaces_as_mutex_error() {
        let adapter = MutexAdapter::new(Arc::new(BrokenMutex));
        let err = adapter
            .with_lock("k", WAIT, LEASE, &CancellationToken::new(), || async {
                Ok::<_, CoordinationError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Mutex(_)));
        assert!(err.is_infrastructure());
    }

    #[tokio::test]
    async fn dropped_guard_releases_in_background() {
        let lock = InMemoryFairLock::new();
        let token = lock.acquire("k", WAIT, LEASE).await.unwrap().unwrap();
        let guard = LockGuard::new(Arc::new(lock.clone()), token);
        drop(guard);

        for _ in 0..10 {
            if !lock.is_locked("k") {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!lock.is_locked("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn release_after_lease_expiry_leaves_new_holder_alone() {
        let lock = InMemoryFairLock::new();
        let first = lock
            .acquire("k", WAIT, Duration::from_millis(50))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let second = lock.acquire("k", WAIT, LEASE).await.unwrap().unwrap();
        LockGuard::new(Arc::new(lock.clone()), first).release().await;

        assert!(lock.is_held_by(&second).await.unwrap());
    }
}
