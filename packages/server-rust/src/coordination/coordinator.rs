//! The join coordinator: the single public entry point for party joins.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use joingate_core::{MemberId, Party, PartyId, PartyMembership, WallClock};
use tokio_util::sync::CancellationToken;

use super::breaker::CircuitBreaker;
use super::classify::{classify, CoordinationError, JoinError};
use super::mutex::{DistributedMutex, MutexAdapter};
use super::retry::OptimisticRetry;
use super::strategy::{CoordinationMode, StrategySelector};
use crate::config::JoinConfig;

/// Name the join breaker reports in logs and metrics.
pub const JOIN_BREAKER: &str = "party-join";

/// Lock key scoping mutual exclusion to one party.
#[must_use]
pub fn lock_key(party_id: PartyId) -> String {
    format!("party:join:{party_id}")
}

/// Coordinates concurrent joins so party invariants hold under contention.
///
/// Each join runs inside the circuit breaker. Inside it, the strategy
/// selector picks the fair lock (one membership call under the party lock)
/// or optimistic retries (up to `retry.max_attempts` membership calls).
/// Failures go through [`classify`] on the way out.
///
/// Configuration can be swapped at runtime with
/// [`JoinCoordinator::update_config`]; joins already running keep the
/// snapshot they started with. The breaker keeps the settings it was built
/// with.
pub struct JoinCoordinator {
    membership: Arc<dyn PartyMembership>,
    mutex: MutexAdapter,
    selector: StrategySelector,
    breaker: CircuitBreaker,
    config: ArcSwap<JoinConfig>,
}

impl JoinCoordinator {
    #[must_use]
    pub fn new(
        membership: Arc<dyn PartyMembership>,
        mutex: Arc<dyn DistributedMutex>,
        clock: Arc<dyn WallClock>,
        config: JoinConfig,
    ) -> Self {
        Self {
            membership,
            mutex: MutexAdapter::new(mutex),
            selector: StrategySelector::new(clock),
            breaker: CircuitBreaker::new(JOIN_BREAKER, config.breaker.clone()),
            config: ArcSwap::from_pointee(config),
        }
    }

    /// Current configuration snapshot.
    #[must_use]
    pub fn config(&self) -> Arc<JoinConfig> {
        self.config.load_full()
    }

    /// Replaces the configuration for joins started from now on.
    pub fn update_config(&self, config: JoinConfig) {
        self.config.store(Arc::new(config));
    }

    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Mode a join started now would use.
    #[must_use]
    pub fn current_mode(&self) -> CoordinationMode {
        self.selector.select(&self.config.load())
    }

    /// Adds `member_id` to `party_id`.
    ///
    /// # Errors
    ///
    /// Returns the classified [`JoinError`]: business rejections with their
    /// reason, `Full` for contention, `ServiceUnavailable` for anything the
    /// caller cannot act on.
    pub async fn join_party(&self, party_id: PartyId, member_id: MemberId) -> Result<Party, JoinError> {
        self.join_party_cancellable(party_id, member_id, &CancellationToken::new())
            .await
    }

    /// Like [`JoinCoordinator::join_party`], with waits that end early when
    /// `cancel` fires.
    ///
    /// # Errors
    ///
    /// As [`JoinCoordinator::join_party`], plus
    /// [`JoinError::LockWaitInterrupted`] on cancellation.
    pub async fn join_party_cancellable(
        &self,
        party_id: PartyId,
        member_id: MemberId,
        cancel: &CancellationToken,
    ) -> Result<Party, JoinError> {
        let config = self.config.load_full();
        self.breaker
            .execute(
                self.coordinate(&config, party_id, member_id, cancel),
                |failure| Err(classify(failure, party_id)),
            )
            .await
    }

    async fn coordinate(
        &self,
        config: &JoinConfig,
        party_id: PartyId,
        member_id: MemberId,
        cancel: &CancellationToken,
    ) -> Result<Party, CoordinationError> {
        let mode = self.selector.select(config);
        // Filled in on the request span when running under the service pipeline.
        tracing::Span::current().record("mode", mode.as_str());
        match mode {
            CoordinationMode::Pessimistic => {
                let key = lock_key(party_id);
                self.mutex
                    .with_lock(
                        &key,
                        config.lock.wait_timeout(),
                        config.lock.lease_timeout(),
                        cancel,
                        || self.attempt(party_id, member_id),
                    )
                    .await
            }
            CoordinationMode::Optimistic => {
                OptimisticRetry::from_config(&config.retry)
                    .run(party_id, cancel, || self.attempt(party_id, member_id))
                    .await
            }
        }
    }

    async fn attempt(&self, party_id: PartyId, member_id: MemberId) -> Result<Party, CoordinationError> {
        Ok(self.membership.join_party(party_id, member_id).await?)
    }
}

impl fmt::Debug for JoinCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinCoordinator")
            .field("breaker", &self.breaker)
            .field("config", &self.config.load())
            .finish_non_exhaustive()
    }
}
