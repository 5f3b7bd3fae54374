//! In-memory party store with version-checked writes.
//!
//! `join_party` reads a snapshot, applies the admission rules to a copy, and
//! writes the copy back only if the stored version is unchanged. Losing the
//! race yields [`DomainError::VersionConflict`], which is exactly what the
//! optimistic path retries on.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use joingate_core::{DomainError, MemberId, MemberRef, Party, PartyId, PartyMembership, StoreError};

/// Party and member tables backed by [`DashMap`].
pub struct InMemoryPartyStore {
    parties: DashMap<PartyId, Party>,
    members: DashMap<MemberId, MemberRef>,
    available: AtomicBool,
    think_time: Duration,
    join_calls: AtomicU64,
}

impl InMemoryPartyStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            parties: DashMap::new(),
            members: DashMap::new(),
            available: AtomicBool::new(true),
            think_time: Duration::ZERO,
            join_calls: AtomicU64::new(0),
        }
    }

    /// Pauses for `think_time` between reading a party and writing it back,
    /// widening the window in which concurrent joins conflict. With the
    /// default of zero the store still yields once to the scheduler.
    #[must_use]
    pub fn with_think_time(mut self, think_time: Duration) -> Self {
        self.think_time = think_time;
        self
    }

    pub fn insert_party(&self, party: Party) {
        self.parties.insert(party.id(), party);
    }

    pub fn register_member(&self, member: MemberRef) {
        self.members.insert(member.id, member);
    }

    /// Current stored state of `party_id`.
    #[must_use]
    pub fn party(&self, party_id: PartyId) -> Option<Party> {
        self.parties.get(&party_id).map(|entry| entry.value().clone())
    }

    /// Simulates an outage: while unavailable every call fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of `join_party` calls received, including failed ones.
    #[must_use]
    pub fn join_calls(&self) -> u64 {
        self.join_calls.load(Ordering::SeqCst)
    }

    /// Removes `member_id` from `party_id`. The host leaving deletes the party.
    ///
    /// # Errors
    ///
    /// [`DomainError::PartyNotFound`], or the rejection from [`Party::remove`].
    pub fn leave_party(&self, party_id: PartyId, member_id: MemberId) -> Result<Party, StoreError> {
        self.check_available()?;
        let mut entry = self
            .parties
            .get_mut(&party_id)
            .ok_or(DomainError::PartyNotFound { party_id })?;
        entry.remove(member_id)?;
        Ok(entry.value().clone())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(anyhow::anyhow!(
                "party store connection refused"
            )))
        }
    }
}

impl Default for InMemoryPartyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PartyMembership for InMemoryPartyStore {
    async fn join_party(&self, party_id: PartyId, member_id: MemberId) -> Result<Party, StoreError> {
        self.join_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;

        let snapshot = self
            .party(party_id)
            .ok_or(DomainError::PartyNotFound { party_id })?;
        let member = self
            .members
            .get(&member_id)
            .map(|entry| *entry.value())
            .ok_or(DomainError::MemberNotFound { member_id })?;

        let mut updated = snapshot.clone();
        updated.admit(&member)?;

        if self.think_time.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.think_time).await;
        }

        let mut entry = self
            .parties
            .get_mut(&party_id)
            .ok_or(DomainError::PartyNotFound { party_id })?;
        if entry.version() != snapshot.version() {
            return Err(DomainError::VersionConflict {
                party_id,
                expected: snapshot.version(),
                actual: entry.version(),
            }
            .into());
        }
        *entry = updated.clone();
        Ok(updated)
    }
}
