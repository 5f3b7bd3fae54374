//! In-flight limit for joins.
//!
//! Once `max_concurrent_joins` joins are running, further joins fail at once
//! with `JoinError::ServiceUnavailable` instead of piling up behind the party
//! lock. Shed joins never reach the metrics layer, so they are counted here.

use std::future::{self, Future};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use joingate_core::Party;
use tokio::sync::Semaphore;
use tower::{Layer, Service};

use super::metrics::JOIN_TOTAL;
use crate::coordination::JoinError;
use crate::service::join::JoinRequest;

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

/// Caps the joins in flight across every service it wraps.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    in_flight: Arc<Semaphore>,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            in_flight: Arc::new(Semaphore::new(max_concurrent as usize)),
        }
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    in_flight: Arc<Semaphore>,
}

/// Logs and counts a join turned away at the in-flight limit.
fn record_shed(req: &JoinRequest) {
    let outcome = JoinError::ServiceUnavailable.code();
    metrics::counter!(JOIN_TOTAL, "outcome" => outcome).increment(1);
    tracing::warn!(
        call_id = req.call_id,
        party_id = %req.party_id,
        member_id = %req.member_id,
        outcome,
        "join shed, in-flight limit reached"
    );
}

impl<S> Service<JoinRequest> for LoadShedService<S>
where
    S: Service<JoinRequest, Response = Party, Error = JoinError> + Send,
    S::Future: Send + 'static,
{
    type Response = Party;
    type Error = JoinError;
    type Future = Pin<Box<dyn Future<Output = Result<Party, JoinError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: JoinRequest) -> Self::Future {
        match Arc::clone(&self.in_flight).try_acquire_owned() {
            Ok(slot) => {
                let join = self.inner.call(req);
                Box::pin(async move {
                    // slot is held until the join settles
                    let _slot = slot;
                    join.await
                })
            }
            Err(_) => {
                record_shed(&req);
                Box::pin(future::ready(Err(JoinError::ServiceUnavailable)))
            }
        }
    }
}
