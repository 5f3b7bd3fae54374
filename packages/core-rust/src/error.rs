//! Domain error taxonomy for party membership operations.

use crate::types::{MemberId, PartyId};

/// Business rejection reported by the party membership operation.
///
/// Every variant except [`DomainError::VersionConflict`] is a final answer:
/// retrying the same request against the same state yields the same error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    #[error("member {member_id} does not match the gender restriction of party {party_id}")]
    GenderMismatch { party_id: PartyId, member_id: MemberId },
    #[error("party {party_id} is full (capacity {capacity})")]
    PartyFull { party_id: PartyId, capacity: u32 },
    #[error("member {member_id} is already in party {party_id}")]
    AlreadyMember { party_id: PartyId, member_id: MemberId },
    #[error("member {member_id} is not in party {party_id}")]
    NotAMember { party_id: PartyId, member_id: MemberId },
    #[error("party {party_id} not found")]
    PartyNotFound { party_id: PartyId },
    #[error("party {party_id} has been deleted")]
    AlreadyDeleted { party_id: PartyId },
    #[error("member {member_id} not found")]
    MemberNotFound { member_id: MemberId },
    #[error("invalid message type: {message_type}")]
    InvalidMessageType { message_type: String },
    #[error("party {party_id} changed concurrently (expected version {expected}, found {actual})")]
    VersionConflict {
        party_id: PartyId,
        expected: u64,
        actual: u64,
    },
}

impl DomainError {
    /// Returns `true` for the one kind that may succeed when re-attempted.
    #[must_use]
    pub const fn is_version_conflict(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

/// Failure of a [`PartyMembership`](crate::PartyMembership) call.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The request was evaluated and rejected by a business rule.
    #[error(transparent)]
    Domain(#[from] DomainError),
    /// The backing store could not evaluate the request.
    #[error("party store unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
}

impl StoreError {
    /// Returns the domain rejection, if this is one.
    #[must_use]
    pub const fn as_domain(&self) -> Option<&DomainError> {
        match self {
            Self::Domain(err) => Some(err),
            Self::Unavailable(_) => None,
        }
    }
}
