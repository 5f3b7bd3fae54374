//! Request pipeline in front of the join coordinator.
//!
//! 1. **Request** (`join`): [`JoinRequest`] and the innermost [`JoinService`]
//! 2. **Middleware** (`middleware`): Tower layers (load-shedding, metrics)

pub mod join;
pub mod middleware;

pub use join::{JoinRequest, JoinService};
pub use middleware::{build_join_pipeline, JoinPipeline};
