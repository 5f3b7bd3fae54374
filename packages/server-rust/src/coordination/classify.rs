//! Failure classification for the join path.
//!
//! Everything that can go wrong inside a coordinated join is a
//! [`CoordinationError`]. The breaker wraps it in a [`BreakerFailure`] and
//! [`classify`] turns that into the [`JoinError`] the caller sees: business
//! rejections pass through with their specific reason, infrastructure faults
//! are logged and masked as [`JoinError::ServiceUnavailable`].

use joingate_core::{DomainError, MemberId, PartyId, StoreError};

use super::breaker::{BreakerFailure, BreakerRecord};
use super::mutex::MutexError;

// ---------------------------------------------------------------------------
// CoordinationError
// ---------------------------------------------------------------------------

/// Failure of one coordinated join attempt, before classification.
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    /// Business rejection from the membership operation.
    #[error(transparent)]
    Domain(#[from] DomainError),
    /// The party lock could not be acquired within the wait timeout.
    #[error("lock {key} is contended")]
    LockContention { key: String },
    /// The join was cancelled while waiting for the lock or a retry delay.
    #[error("interrupted while waiting")]
    LockWaitInterrupted,
    /// Every optimistic attempt hit a version conflict.
    #[error("party {party_id} still conflicting after {attempts} attempts")]
    RetriesExhausted { party_id: PartyId, attempts: u32 },
    /// The membership store failed.
    #[error("party store failure: {0}")]
    Store(#[source] anyhow::Error),
    /// The lock provider failed.
    #[error(transparent)]
    Mutex(#[from] MutexError),
}

impl From<StoreError> for CoordinationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Domain(domain) => Self::Domain(domain),
            StoreError::Unavailable(source) => Self::Store(source),
        }
    }
}

impl CoordinationError {
    /// Short label used in logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Domain(_) => "domain",
            Self::LockContention { .. } => "lock_contention",
            Self::LockWaitInterrupted => "lock_wait_interrupted",
            Self::RetriesExhausted { .. } => "retries_exhausted",
            Self::Store(_) => "store",
            Self::Mutex(_) => "mutex",
        }
    }

    /// Returns `true` for failures of a dependency rather than of the request.
    #[must_use]
    pub const fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Mutex(_))
    }
}

impl BreakerRecord for CoordinationError {
    fn is_breaker_failure(&self) -> bool {
        self.is_infrastructure()
    }
}

// ---------------------------------------------------------------------------
// JoinError
// ---------------------------------------------------------------------------

/// Outcome of a rejected join, as exposed to the application layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("the system is temporarily degraded, please retry later")]
    ServiceUnavailable,
    #[error("member {member_id} does not match the gender restriction of party {party_id}")]
    GenderMismatch { party_id: PartyId, member_id: MemberId },
    #[error("party {party_id} is full or too busy, please retry later")]
    Full { party_id: PartyId },
    #[error("member {member_id} is already in party {party_id}")]
    AlreadyMember { party_id: PartyId, member_id: MemberId },
    #[error("member {member_id} is not in party {party_id}")]
    NotAMember { party_id: PartyId, member_id: MemberId },
    #[error("party {party_id} not found")]
    NotFound { party_id: PartyId },
    #[error("party {party_id} has been deleted")]
    AlreadyDeleted { party_id: PartyId },
    #[error("member {member_id} not found")]
    MemberNotFound { member_id: MemberId },
    #[error("invalid message type: {message_type}")]
    InvalidMessageType { message_type: String },
    #[error("joining party {party_id} was interrupted, please retry")]
    LockWaitInterrupted { party_id: PartyId },
}

impl JoinError {
    /// Stable machine-readable code, used as a log field and metric label.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::ServiceUnavailable => "service_unavailable",
            Self::GenderMismatch { .. } => "gender_mismatch",
            Self::Full { .. } => "full",
            Self::AlreadyMember { .. } => "already_member",
            Self::NotAMember { .. } => "not_a_member",
            Self::NotFound { .. } => "not_found",
            Self::AlreadyDeleted { .. } => "already_deleted",
            Self::MemberNotFound { .. } => "member_not_found",
            Self::InvalidMessageType { .. } => "invalid_message_type",
            Self::LockWaitInterrupted { .. } => "lock_wait_interrupted",
        }
    }

    /// Returns `true` when the rejection is about the request itself, so the
    /// caller should not simply retry.
    #[must_use]
    pub const fn is_user_fault(&self) -> bool {
        !matches!(
            self,
            Self::ServiceUnavailable | Self::Full { .. } | Self::LockWaitInterrupted { .. }
        )
    }
}

impl From<DomainError> for JoinError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::GenderMismatch { party_id, member_id } => {
                Self::GenderMismatch { party_id, member_id }
            }
            DomainError::PartyFull { party_id, .. }
            | DomainError::VersionConflict { party_id, .. } => Self::Full { party_id },
            DomainError::AlreadyMember { party_id, member_id } => {
                Self::AlreadyMember { party_id, member_id }
            }
            DomainError::NotAMember { party_id, member_id } => {
                Self::NotAMember { party_id, member_id }
            }
            DomainError::PartyNotFound { party_id } => Self::NotFound { party_id },
            DomainError::AlreadyDeleted { party_id } => Self::AlreadyDeleted { party_id },
            DomainError::MemberNotFound { member_id } => Self::MemberNotFound { member_id },
            DomainError::InvalidMessageType { message_type } => {
                Self::InvalidMessageType { message_type }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// classify
// ---------------------------------------------------------------------------

/// Fail-fast handler: maps the failure that reached the breaker fallback to
/// the caller-visible outcome.
#[must_use]
pub fn classify(failure: BreakerFailure<CoordinationError>, party_id: PartyId) -> JoinError {
    let err = match failure {
        BreakerFailure::CallNotPermitted { breaker } => {
            tracing::error!(%party_id, breaker, "circuit breaker open, failing fast");
            return JoinError::ServiceUnavailable;
        }
        BreakerFailure::Failed(err) => err,
    };

    match err {
        CoordinationError::Domain(domain) => JoinError::from(domain),
        CoordinationError::LockContention { .. } | CoordinationError::RetriesExhausted { .. } => {
            JoinError::Full { party_id }
        }
        CoordinationError::LockWaitInterrupted => JoinError::LockWaitInterrupted { party_id },
        infra @ (CoordinationError::Store(_) | CoordinationError::Mutex(_)) => {
            tracing::error!(
                %party_id,
                error_kind = infra.kind(),
                error = %infra,
                "infrastructure failure masked as service unavailable"
            );
            JoinError::ServiceUnavailable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARTY: PartyId = PartyId(3);
    const MEMBER: MemberId = MemberId(9);

    fn failed(err: CoordinationError) -> JoinError {
        classify(BreakerFailure::Failed(err), PARTY)
    }

    #[test]
    fn breaker_open_is_service_unavailable() {
        let err = classify(BreakerFailure::CallNotPermitted { breaker: "party-join" }, PARTY);
        assert_eq!(err, JoinError::ServiceUnavailable);
    }

    #[test]
    fn domain_rejections_pass_through() {
        let cases = [
            (
                DomainError::GenderMismatch { party_id: PARTY, member_id: MEMBER },
                JoinError::GenderMismatch { party_id: PARTY, member_id: MEMBER },
            ),
            (
                DomainError::PartyFull { party_id: PARTY, capacity: 4 },
                JoinError::Full { party_id: PARTY },
            ),
            (
                DomainError::AlreadyMember { party_id: PARTY, member_id: MEMBER },
                JoinError::AlreadyMember { party_id: PARTY, member_id: MEMBER },
            ),
            (
                DomainError::NotAMember { party_id: PARTY, member_id: MEMBER },
                JoinError::NotAMember { party_id: PARTY, member_id: MEMBER },
            ),
            (
                DomainError::PartyNotFound { party_id: PARTY },
                JoinError::NotFound { party_id: PARTY },
            ),
            (
                DomainError::AlreadyDeleted { party_id: PARTY },
                JoinError::AlreadyDeleted { party_id: PARTY },
            ),
            (
                DomainError::MemberNotFound { member_id: MEMBER },
                JoinError::MemberNotFound { member_id: MEMBER },
            ),
            (
                DomainError::InvalidMessageType { message_type: "VOICE".into() },
                JoinError::InvalidMessageType { message_type: "VOICE".into() },
            ),
        ];
        for (domain, expected) in cases {
            assert_eq!(failed(CoordinationError::Domain(domain)), expected);
        }
    }

    #[test]
    fn contention_and_exhausted_retries_look_full() {
        assert_eq!(
            failed(CoordinationError::LockContention { key: "party:join:3".into() }),
            JoinError::Full { party_id: PARTY }
        );
        assert_eq!(
            failed(CoordinationError::RetriesExhausted { party_id: PARTY, attempts: 3 }),
            JoinError::Full { party_id: PARTY }
        );
        assert_eq!(
            failed(CoordinationError::Domain(DomainError::VersionConflict {
                party_id: PARTY,
                expected: 1,
                actual: 2,
            })),
            JoinError::Full { party_id: PARTY }
        );
    }

    #[test]
    fn interruption_is_distinct() {
        assert_eq!(
            failed(CoordinationError::LockWaitInterrupted),
            JoinError::LockWaitInterrupted { party_id: PARTY }
        );
    }

    #[test]
    fn infrastructure_failures_are_masked() {
        let err = failed(CoordinationError::Store(anyhow::anyhow!(
            "connection refused: db-primary:5432"
        )));
        assert_eq!(err, JoinError::ServiceUnavailable);
        assert!(!err.to_string().contains("db-primary"));

        let err = failed(CoordinationError::Mutex(MutexError::Backend {
            key: "party:join:3".into(),
            source: anyhow::anyhow!("READONLY You can't write against a read only replica"),
        }));
        assert_eq!(err, JoinError::ServiceUnavailable);
        assert!(!err.to_string().contains("READONLY"));
    }

    #[test]
    fn only_infrastructure_counts_against_breaker() {
        assert!(CoordinationError::Store(anyhow::anyhow!("down")).is_breaker_failure());
        assert!(!CoordinationError::Domain(DomainError::PartyNotFound { party_id: PARTY })
            .is_breaker_failure());
        assert!(!CoordinationError::LockContention { key: String::new() }.is_breaker_failure());
        assert!(!CoordinationError::LockWaitInterrupted.is_breaker_failure());
    }

    #[test]
    fn store_error_conversion_keeps_domain_kind() {
        let err = CoordinationError::from(StoreError::Domain(DomainError::PartyNotFound {
            party_id: PARTY,
        }));
        assert!(matches!(
            err,
            CoordinationError::Domain(DomainError::PartyNotFound { .. })
        ));

        let err = CoordinationError::from(StoreError::Unavailable(anyhow::anyhow!("timeout")));
        assert!(err.is_infrastructure());
    }

    #[test]
    fn codes_and_fault_attribution() {
        assert_eq!(JoinError::ServiceUnavailable.code(), "service_unavailable");
        assert!(!JoinError::ServiceUnavailable.is_user_fault());
        assert!(!JoinError::Full { party_id: PARTY }.is_user_fault());
        assert!(JoinError::GenderMismatch { party_id: PARTY, member_id: MEMBER }.is_user_fault());
    }
}
