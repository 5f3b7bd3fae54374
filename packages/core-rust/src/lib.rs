//! `joingate` core: party model, domain errors, and the membership and clock
//! contracts the join coordinator is built against.

pub mod clock;
pub mod error;
pub mod traits;
pub mod types;

pub use clock::{FixedClock, SystemClock, WallClock};
pub use error::{DomainError, StoreError};
pub use traits::PartyMembership;
pub use types::{Gender, MemberId, MemberRef, Party, PartyId};
