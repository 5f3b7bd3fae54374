//! Join coordination: strategy selection, the fair lock path, optimistic
//! retries, the circuit breaker and failure classification.

pub mod breaker;
pub mod classify;
pub mod coordinator;
pub mod mutex;
pub mod retry;
pub mod strategy;

pub use breaker::{
    BreakerFailure, BreakerMetrics, BreakerRecord, CallNotPermitted, CallPermit, CircuitBreaker,
    CircuitBreakerConfig, CircuitState,
};
pub use classify::{classify, CoordinationError, JoinError};
pub use coordinator::{lock_key, JoinCoordinator, JOIN_BREAKER};
pub use mutex::{DistributedMutex, LockGuard, LockToken, MutexAdapter, MutexError};
pub use retry::OptimisticRetry;
pub use strategy::{select_mode, CoordinationMode, StrategySelector, TrafficWindow};
