use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Identity of a party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartyId(pub u64);

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a member (a user that can join parties).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(pub u64);

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Gender of a member, checked against a party's same-gender restriction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Gender {
    Male,
    Female,
}

/// A member as seen by the join path: identity plus the attribute used for
/// the gender-compatibility check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberRef {
    pub id: MemberId,
    pub gender: Gender,
}

impl MemberRef {
    #[must_use]
    pub const fn new(id: MemberId, gender: Gender) -> Self {
        Self { id, gender }
    }
}

/// A capacity-bounded group that members join and leave.
///
/// The participant count is derived from the member set, so
/// `current_participants() == members().len()` holds structurally. Every
/// mutating method validates first and only then touches state, so a
/// rejected mutation leaves the party exactly as it was.
///
/// `version` increases by one on every successful mutation and is what
/// optimistic writers compare against to detect concurrent updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    id: PartyId,
    capacity: u32,
    same_gender_only: bool,
    deleted: bool,
    host: MemberRef,
    members: BTreeSet<MemberId>,
    version: u64,
}

impl Party {
    /// Creates a party hosted by `host`, who becomes its first member.
    ///
    /// A capacity of 0 is raised to 1 so the host always fits.
    #[must_use]
    pub fn new(id: PartyId, capacity: u32, host: MemberRef, same_gender_only: bool) -> Self {
        let mut members = BTreeSet::new();
        members.insert(host.id);
        Self {
            id,
            capacity: capacity.max(1),
            same_gender_only,
            deleted: false,
            host,
            members,
            version: 0,
        }
    }

    #[must_use]
    pub const fn id(&self) -> PartyId {
        self.id
    }

    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Number of members currently in the party, host included.
    #[must_use]
    pub fn current_participants(&self) -> u32 {
        u32::try_from(self.members.len()).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub const fn same_gender_only(&self) -> bool {
        self.same_gender_only
    }

    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted
    }

    #[must_use]
    pub const fn host(&self) -> MemberRef {
        self.host
    }

    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn members(&self) -> &BTreeSet<MemberId> {
        &self.members
    }

    #[must_use]
    pub fn contains(&self, member_id: MemberId) -> bool {
        self.members.contains(&member_id)
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.current_participants() >= self.capacity
    }

    /// Adds `member` to the party.
    ///
    /// Checks run in order: deleted, already a member, full, gender. The
    /// first failing check is reported and nothing is modified.
    ///
    /// # Errors
    ///
    /// Returns the [`DomainError`] describing the violated rule.
    pub fn admit(&mut self, member: &MemberRef) -> Result<(), DomainError> {
        if self.deleted {
            return Err(DomainError::AlreadyDeleted { party_id: self.id });
        }
        if self.contains(member.id) {
            return Err(DomainError::AlreadyMember {
                party_id: self.id,
                member_id: member.id,
            });
        }
        if self.is_full() {
            return Err(DomainError::PartyFull {
                party_id: self.id,
                capacity: self.capacity,
            });
        }
        if self.same_gender_only && member.gender != self.host.gender {
            return Err(DomainError::GenderMismatch {
                party_id: self.id,
                member_id: member.id,
            });
        }

        self.members.insert(member.id);
        self.version += 1;
        tracing::trace!(
            party_id = %self.id,
            member_id = %member.id,
            version = self.version,
            "member admitted"
        );
        Ok(())
    }

    /// Removes `member_id` from the party. When the host leaves, the party is
    /// marked deleted.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::AlreadyDeleted`] for a deleted party and
    /// [`DomainError::NotAMember`] when `member_id` is not in the party.
    pub fn remove(&mut self, member_id: MemberId) -> Result<(), DomainError> {
        if self.deleted {
            return Err(DomainError::AlreadyDeleted { party_id: self.id });
        }
        if !self.contains(member_id) {
            return Err(DomainError::NotAMember {
                party_id: self.id,
                member_id,
            });
        }

        self.members.remove(&member_id);
        if member_id == self.host.id {
            self.deleted = true;
        }
        self.version += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn host() -> MemberRef {
        MemberRef::new(MemberId(1), Gender::Female)
    }

    fn party(capacity: u32, same_gender_only: bool) -> Party {
        Party::new(PartyId(7), capacity, host(), same_gender_only)
    }

    #[test]
    fn new_party_contains_host() {
        let p = party(4, false);
        assert!(p.contains(MemberId(1)));
        assert_eq!(p.current_participants(), 1);
        assert_eq!(p.version(), 0);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let p = party(0, false);
        assert_eq!(p.capacity(), 1);
        assert!(p.is_full());
    }

    #[test]
    fn admit_bumps_version() {
        let mut p = party(4, false);
        p.admit(&MemberRef::new(MemberId(2), Gender::Male)).unwrap();
        assert_eq!(p.current_participants(), 2);
        assert_eq!(p.version(), 1);
    }

    #[test]
    fn admit_rejects_duplicate_member() {
        let mut p = party(4, false);
        let m = MemberRef::new(MemberId(2), Gender::Male);
        p.admit(&m).unwrap();
        let err = p.admit(&m).unwrap_err();
        assert!(matches!(err, DomainError::AlreadyMember { .. }));
        assert_eq!(p.version(), 1);
    }

    #[test]
    fn admit_rejects_when_full() {
        let mut p = party(2, false);
        p.admit(&MemberRef::new(MemberId(2), Gender::Male)).unwrap();
        let err = p
            .admit(&MemberRef::new(MemberId(3), Gender::Male))
            .unwrap_err();
        assert!(matches!(err, DomainError::PartyFull { capacity: 2, .. }));
        assert_eq!(p.current_participants(), 2);
    }

    #[test]
    fn admit_rejects_gender_mismatch_only_when_restricted() {
        let male = MemberRef::new(MemberId(2), Gender::Male);

        let mut restricted = party(4, true);
        let err = restricted.admit(&male).unwrap_err();
        assert!(matches!(err, DomainError::GenderMismatch { .. }));

        let mut open = party(4, false);
        assert!(open.admit(&male).is_ok());
    }

    #[test]
    fn full_is_reported_before_gender() {
        let mut p = party(1, true);
        let err = p
            .admit(&MemberRef::new(MemberId(2), Gender::Male))
            .unwrap_err();
        assert!(matches!(err, DomainError::PartyFull { .. }));
    }

    #[test]
    fn remove_non_member_fails() {
        let mut p = party(4, false);
        let err = p.remove(MemberId(9)).unwrap_err();
        assert!(matches!(err, DomainError::NotAMember { .. }));
    }

    #[test]
    fn host_leaving_deletes_party() {
        let mut p = party(4, false);
        p.remove(MemberId(1)).unwrap();
        assert!(p.is_deleted());

        let err = p
            .admit(&MemberRef::new(MemberId(2), Gender::Female))
            .unwrap_err();
        assert!(matches!(err, DomainError::AlreadyDeleted { .. }));
    }

    #[test]
    fn party_serializes_ids_transparently() {
        let p = party(3, false);
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["host"]["gender"], "FEMALE");
    }

    proptest! {
        #[test]
        fn admit_and_remove_never_break_capacity(
            capacity in 1u32..8,
            ops in proptest::collection::vec((any::<bool>(), 2u64..12, any::<bool>()), 0..64),
        ) {
            let mut p = party(capacity, false);
            for (join, id, female) in ops {
                let before = p.clone();
                let result = if join {
                    let gender = if female { Gender::Female } else { Gender::Male };
                    p.admit(&MemberRef::new(MemberId(id), gender))
                } else {
                    p.remove(MemberId(id))
                };
                match result {
                    Ok(()) => prop_assert_eq!(p.version(), before.version() + 1),
                    Err(_) => prop_assert_eq!(&p, &before),
                }
                prop_assert!(p.current_participants() <= p.capacity());
                prop_assert_eq!(p.current_participants() as usize, p.members().len());
            }
        }
    }
}
