//! Pipeline composition: combines all middleware layers into a single service stack.

use std::sync::Arc;

use tower::ServiceBuilder;

use super::load_shed::{LoadShedLayer, LoadShedService};
use super::metrics::{MetricsLayer, MetricsService};
use crate::coordination::JoinCoordinator;
use crate::service::join::JoinService;

/// The assembled join stack. Cloning shares the load-shed permits.
pub type JoinPipeline = LoadShedService<MetricsService<JoinService>>;

/// Build the join pipeline by wrapping a [`JoinService`] with middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- reject when saturated (fail fast before touching the lock)
/// 2. `MetricsLayer` -- record timing and outcome of joins that were admitted
///
/// The concurrency limit is read from the coordinator's configuration at
/// build time.
#[must_use]
pub fn build_join_pipeline(coordinator: Arc<JoinCoordinator>) -> JoinPipeline {
    let max_concurrent = coordinator.config().max_concurrent_joins;
    ServiceBuilder::new()
        .layer(LoadShedLayer::new(max_concurrent))
        .layer(MetricsLayer)
        .service(JoinService::new(coordinator))
}
