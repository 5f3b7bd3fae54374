//! The innermost join service: hands each request to the coordinator.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use joingate_core::{MemberId, Party, PartyId};
use tokio_util::sync::CancellationToken;
use tower::Service;

use crate::coordination::{JoinCoordinator, JoinError};

/// One join attempt travelling through the pipeline.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    /// Caller-chosen correlation id, recorded on the request span.
    pub call_id: u64,
    pub party_id: PartyId,
    pub member_id: MemberId,
    /// Fires to abandon lock waits and retry delays.
    pub cancel: CancellationToken,
}

impl JoinRequest {
    #[must_use]
    pub fn new(call_id: u64, party_id: PartyId, member_id: MemberId) -> Self {
        Self {
            call_id,
            party_id,
            member_id,
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Tower service over a shared [`JoinCoordinator`].
#[derive(Debug, Clone)]
pub struct JoinService {
    coordinator: Arc<JoinCoordinator>,
}

impl JoinService {
    #[must_use]
    pub fn new(coordinator: Arc<JoinCoordinator>) -> Self {
        Self { coordinator }
    }
}

impl Service<JoinRequest> for JoinService {
    type Response = Party;
    type Error = JoinError;
    type Future = Pin<Box<dyn Future<Output = Result<Party, JoinError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: JoinRequest) -> Self::Future {
        let coordinator = Arc::clone(&self.coordinator);
        Box::pin(async move {
            coordinator
                .join_party_cancellable(req.party_id, req.member_id, &req.cancel)
                .await
        })
    }
}

#[cfg(test)]
mod tests {
    use joingate_core::{FixedClock, Gender, MemberRef};
    use tower::ServiceExt;

    use super::*;
    use crate::config::JoinConfig;
    use crate::lock::InMemoryFairLock;
    use crate::store::InMemoryPartyStore;

    #[tokio::test]
    async fn forwards_to_coordinator() {
        let store = Arc::new(InMemoryPartyStore::new());
        store.register_member(MemberRef::new(MemberId(1), Gender::Male));
        store.register_member(MemberRef::new(MemberId(2), Gender::Female));
        store.insert_party(Party::new(
            PartyId(5),
            2,
            MemberRef::new(MemberId(1), Gender::Male),
            false,
        ));
        let coordinator = Arc::new(JoinCoordinator::new(
            store,
            Arc::new(InMemoryFairLock::new()),
            Arc::new(FixedClock::at(9, 30, 0)),
            JoinConfig::default(),
        ));

        let svc = JoinService::new(coordinator);
        let party = svc
            .clone()
            .oneshot(JoinRequest::new(1, PartyId(5), MemberId(2)))
            .await
            .unwrap();
        assert!(party.is_full());

        let err = svc
            .oneshot(JoinRequest::new(2, PartyId(5), MemberId(2)))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            JoinError::AlreadyMember {
                party_id: PartyId(5),
                member_id: MemberId(2)
            }
        );
    }
}
