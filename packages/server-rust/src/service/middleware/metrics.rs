//! Metrics middleware for joins.
//!
//! Wraps each join in a `join` span and records its outcome twice: as span
//! fields for logs, and through the `metrics` facade as
//! `joingate_join_total{outcome}` and `joingate_join_duration_seconds{outcome}`.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use joingate_core::Party;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::coordination::JoinError;
use crate::service::join::JoinRequest;

/// Counter of settled joins, labelled by `outcome`.
pub(crate) const JOIN_TOTAL: &str = "joingate_join_total";

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records join duration and outcome.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

/// Outcome label: `joined`, or the [`JoinError::code`] of the rejection.
fn outcome_label(result: &Result<Party, JoinError>) -> &'static str {
    match result {
        Ok(_) => "joined",
        Err(err) => err.code(),
    }
}

impl<S> Service<JoinRequest> for MetricsService<S>
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
        let span = info_span!(
            "join",
            call_id = req.call_id,
            party_id = %req.party_id,
            member_id = %req.member_id,
            mode = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(req);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();
                let outcome = outcome_label(&result);

                metrics::counter!(JOIN_TOTAL, "outcome" => outcome).increment(1);
                metrics::histogram!("joingate_join_duration_seconds", "outcome" => outcome)
                    .record(elapsed.as_secs_f64());

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                let span = tracing::Span::current();
                span.record("duration_ms", duration_ms);
                span.record("outcome", outcome);

                match &result {
                    Ok(party) => tracing::info!(
                        duration_ms,
                        participants = party.current_participants(),
                        capacity = party.capacity(),
                        "join complete"
                    ),
                    Err(err) if err.is_user_fault() => {
                        tracing::info!(duration_ms, outcome, "join rejected");
                    }
                    Err(_) => tracing::warn!(duration_ms, outcome, "join failed"),
                }

                result
            }
            .instrument(span),
        )
    }
}
