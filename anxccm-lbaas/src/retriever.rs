//! One tagged listing per round, shared by several load balancers.
//!
//! Each load balancer of a service runs its own reconciliation. Every one of
//! them asks for a snapshot per cycle, but they all carry the same service
//! tag, so the listing is done once per round by whoever arrives last and
//! everyone gets the part belonging to its load balancer.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::barrier::{Rendezvous, RendezvousError};
use crate::error::{LbaasError, Result};
use crate::provider::LbaasApi;
use crate::state::{RemoteState, StateSource};
use crate::types::{Identifier, Tag};

type SharedFetch = Result<Arc<RemoteState>>;

pub struct StateRetriever {
    api: Arc<dyn LbaasApi>,
    tag: Tag,
    barrier: Rendezvous<Identifier, SharedFetch>,
}

impl StateRetriever {
    /// Shared fetcher for `load_balancers`. Every one of them has to check in
    /// per round until it calls `done`.
    pub fn new(
        api: Arc<dyn LbaasApi>,
        tag: Tag,
        load_balancers: impl IntoIterator<Item = Identifier>,
    ) -> Self {
        let barrier = Rendezvous::new();
        for lb in load_balancers {
            if !barrier.register(lb.clone()) {
                debug!(lb = %lb, "Load balancer listed twice, registering once");
            }
        }
        info!(tag = %tag, parties = barrier.parties(), "State retriever ready");
        Self {
            api,
            tag,
            barrier,
        }
    }

    /// Number of load balancers still taking part.
    pub fn load_balancers(&self) -> usize {
        self.barrier.parties()
    }

    /// Completed shared fetches.
    pub fn rounds(&self) -> u64 {
        self.barrier.rounds()
    }

    /// Wait for all registered load balancers, then return `lb`'s part of the shared snapshot.
    pub async fn filtered_state(
        &self,
        lb: &Identifier,
        cancel: &CancellationToken,
    ) -> Result<RemoteState> {
        let api = self.api.as_ref();
        let tag = &self.tag;
        let shared = self
            .barrier
            .arrive(lb, cancel, move || async move {
                debug!(tag = %tag, "Fetching shared remote state");
                RemoteState::fetch(api, tag, cancel).await.map(Arc::new)
            })
            .await
            .map_err(|e| barrier_error(lb, e))??;

        Ok(shared.for_load_balancer(lb))
    }

    /// `lb` leaves the shared protocol. The others stop waiting for it.
    pub fn done(&self, lb: &Identifier) -> Result<()> {
        self.barrier.leave(lb).map_err(|e| barrier_error(lb, e))?;
        debug!(lb = %lb, remaining = self.barrier.parties(), "Load balancer left state retriever");
        Ok(())
    }
}

fn barrier_error(lb: &Identifier, e: RendezvousError) -> LbaasError {
    match e {
        RendezvousError::Unregistered => LbaasError::UnregisteredLoadBalancer(lb.clone()),
        RendezvousError::AlreadyWaiting => LbaasError::ConcurrentFetch(lb.clone()),
        RendezvousError::Canceled => LbaasError::Canceled,
    }
}

#[async_trait]
impl StateSource for StateRetriever {
    async fn fetch_state(
        &self,
        lb: &Identifier,
        cancel: &CancellationToken,
    ) -> Result<RemoteState> {
        self.filtered_state(lb, cancel).await
    }

    fn finish(&self, lb: &Identifier) -> Result<()> {
        self.done(lb)
    }
}
