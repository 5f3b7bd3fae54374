//! `joingate` server: coordinates concurrent party joins behind a circuit
//! breaker, choosing between a fair distributed lock and optimistic retries
//! by time of day.

pub mod config;
pub mod coordination;
pub mod lock;
pub mod service;
pub mod store;
pub mod telemetry;

pub use config::JoinConfig;
pub use coordination::{JoinCoordinator, JoinError};
