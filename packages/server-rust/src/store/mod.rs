//! Party membership stores implementing [`PartyMembership`](joingate_core::PartyMembership).

pub mod memory;

pub use memory::InMemoryPartyStore;
