//! Tower middleware layers for the join pipeline.
//!
//! - [`metrics`]: Join timing and outcome via `tracing` spans and `metrics`
//! - [`load_shed`]: Semaphore-based concurrency limiting
//! - [`pipeline`]: Composes all layers into a single service stack

pub mod load_shed;
pub mod metrics;
pub mod pipeline;

pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::{build_join_pipeline, JoinPipeline};
