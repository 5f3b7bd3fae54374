use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{MemberId, Party, PartyId};

/// The domain operation that adds a member to a party.
///
/// Implementations re-read the current party state on every call and apply
/// the mutation all-or-nothing. Optimistic implementations report a
/// concurrent write as [`DomainError::VersionConflict`](crate::DomainError::VersionConflict);
/// implementations running under an external lock may never produce it.
#[async_trait]
pub trait PartyMembership: Send + Sync {
    /// Add `member_id` to `party_id` and return the updated party.
    async fn join_party(&self, party_id: PartyId, member_id: MemberId) -> Result<Party, StoreError>;
}

#[async_trait]
impl<T: PartyMembership + ?Sized> PartyMembership for Arc<T> {
    async fn join_party(&self, party_id: PartyId, member_id: MemberId) -> Result<Party, StoreError> {
        (**self).join_party(party_id, member_id).await
    }
}
