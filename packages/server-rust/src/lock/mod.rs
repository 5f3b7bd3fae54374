//! Lock providers implementing [`DistributedMutex`](crate::coordination::DistributedMutex).

pub mod memory;

pub use memory::InMemoryFairLock;
