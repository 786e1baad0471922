//! Remote state snapshots.
//!
//! The ownership tag is the only link between a service and its resources,
//! so every snapshot starts from a tag listing and is rebuilt from scratch
//! each cycle. The tag is service-scoped; `RemoteState::for_load_balancer`
//! narrows a snapshot down to the resources hanging off one load balancer.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{LbaasError, ProviderError, Result};
use crate::provider::LbaasApi;
use crate::resource::{
    Backend, Bind, Frontend, ReadinessState, Resource, ResourceKind, ServerResource,
};
use crate::types::{Identifier, Tag};

/// How many object details are fetched in parallel.
const FETCH_CONCURRENCY: usize = 8;

/// All resources carrying one ownership tag, grouped by kind.
///
/// Failed and progressing objects additionally show up in `failed` and
/// `progressing`, which the reconciliation core checks before planning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteState {
    pub backends: Vec<Backend>,
    pub frontends: Vec<Frontend>,
    pub binds: Vec<Bind>,
    pub servers: Vec<ServerResource>,
    pub failed: Vec<Resource>,
    pub progressing: Vec<Resource>,
}

impl RemoteState {
    /// List everything tagged with `tag` and fetch its details.
    ///
    /// Objects of unknown type and objects vanishing between listing and
    /// fetching are skipped.
    pub async fn fetch<A>(api: &A, tag: &Tag, cancel: &CancellationToken) -> Result<Self>
    where
        A: LbaasApi + ?Sized,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LbaasError::Canceled),
            state = Self::fetch_inner(api, tag) => state,
        }
    }

    async fn fetch_inner<A>(api: &A, tag: &Tag) -> Result<Self>
    where
        A: LbaasApi + ?Sized,
    {
        let listed = match api.list_tagged(tag).await {
            Ok(listed) => listed,
            Err(ProviderError::Unprocessable(msg)) => {
                debug!(tag = %tag, "Tag listing unprocessable, treating as empty: {}", msg);
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };

        let lookups = listed.into_iter().filter_map(|object| {
            match ResourceKind::from_type_identifier(&object.type_identifier) {
                Some(kind) => Some((kind, object.identifier)),
                None => {
                    debug!(
                        id = %object.identifier,
                        type_identifier = %object.type_identifier,
                        "Ignoring tagged object of unknown type"
                    );
                    None
                }
            }
        });

        let fetched: Vec<Option<Resource>> = stream::iter(lookups)
            .map(|(kind, id)| async move {
                match api.get(kind, &id).await {
                    Ok(resource) => Ok(Some(resource)),
                    Err(ProviderError::NotFound) => {
                        warn!(id = %id, %kind, "Tagged object vanished before it could be fetched");
                        Ok(None)
                    }
                    Err(e) => Err(LbaasError::from(e)),
                }
            })
            .buffered(FETCH_CONCURRENCY)
            .try_collect()
            .await?;

        let mut state = RemoteState::default();
        for resource in fetched.into_iter().flatten() {
            state.insert(resource);
        }
        debug!(
            tag = %tag,
            backends = state.backends.len(),
            frontends = state.frontends.len(),
            binds = state.binds.len(),
            servers = state.servers.len(),
            failed = state.failed.len(),
            progressing = state.progressing.len(),
            "Fetched remote state"
        );
        Ok(state)
    }

    fn insert(&mut self, resource: Resource) {
        match resource.readiness() {
            ReadinessState::Failed => self.failed.push(resource.clone()),
            ReadinessState::Progressing => self.progressing.push(resource.clone()),
            ReadinessState::Ready => {}
        }
        match resource {
            Resource::Backend(r) => self.backends.push(r),
            Resource::Frontend(r) => self.frontends.push(r),
            Resource::Bind(r) => self.binds.push(r),
            Resource::Server(r) => self.servers.push(r),
        }
    }

    /// The part of this snapshot belonging to load balancer `lb`.
    ///
    /// Backends and frontends name their load balancer; binds and servers
    /// are kept when their frontend or backend was kept.
    pub fn for_load_balancer(&self, lb: &Identifier) -> RemoteState {
        let backend_ids: HashSet<&Identifier> = self
            .backends
            .iter()
            .filter(|b| &b.load_balancer == lb)
            .filter_map(|b| b.identifier.as_ref())
            .collect();
        let frontend_ids: HashSet<&Identifier> = self
            .frontends
            .iter()
            .filter(|f| &f.load_balancer == lb)
            .filter_map(|f| f.identifier.as_ref())
            .collect();

        let belongs = |resource: &Resource| match resource {
            Resource::Backend(r) => &r.load_balancer == lb,
            Resource::Frontend(r) => &r.load_balancer == lb,
            Resource::Bind(r) => frontend_ids.contains(&r.frontend),
            Resource::Server(r) => backend_ids.contains(&r.backend),
        };

        RemoteState {
            backends: self
                .backends
                .iter()
                .filter(|b| &b.load_balancer == lb)
                .cloned()
                .collect(),
            frontends: self
                .frontends
                .iter()
                .filter(|f| &f.load_balancer == lb)
                .cloned()
                .collect(),
            binds: self
                .binds
                .iter()
                .filter(|b| frontend_ids.contains(&b.frontend))
                .cloned()
                .collect(),
            servers: self
                .servers
                .iter()
                .filter(|s| backend_ids.contains(&s.backend))
                .cloned()
                .collect(),
            failed: self.failed.iter().filter(|r| belongs(r)).cloned().collect(),
            progressing: self
                .progressing
                .iter()
                .filter(|r| belongs(r))
                .cloned()
                .collect(),
        }
    }

    /// Failed objects plus everything still referencing them.
    ///
    /// The provider refuses to destroy referenced objects, so binds of a
    /// failed frontend, and frontends and servers of a failed backend (with
    /// the binds of those frontends), have to go as well.
    pub fn failed_with_dependents(&self) -> Vec<Resource> {
        let failed: HashSet<&Identifier> = self
            .failed
            .iter()
            .filter_map(Resource::identifier)
            .collect();

        let frontends: HashSet<&Identifier> = self
            .frontends
            .iter()
            .filter(|f| failed.contains(&f.default_backend))
            .filter_map(|f| f.identifier.as_ref())
            .chain(
                self.failed
                    .iter()
                    .filter(|r| r.kind() == ResourceKind::Frontend)
                    .filter_map(Resource::identifier),
            )
            .collect();

        let dependents = self
            .frontends
            .iter()
            .filter(|f| failed.contains(&f.default_backend))
            .cloned()
            .map(Resource::from)
            .chain(
                self.binds
                    .iter()
                    .filter(|b| frontends.contains(&b.frontend))
                    .cloned()
                    .map(Resource::from),
            )
            .chain(
                self.servers
                    .iter()
                    .filter(|s| failed.contains(&s.backend))
                    .cloned()
                    .map(Resource::from),
            );

        let mut seen = HashSet::new();
        self.failed
            .iter()
            .cloned()
            .chain(dependents)
            .filter(|r| r.identifier().is_none_or(|id| seen.insert(id.clone())))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
            && self.frontends.is_empty()
            && self.binds.is_empty()
            && self.servers.is_empty()
    }
}

/// Where a reconciliation gets its remote state snapshots from.
#[async_trait]
pub trait StateSource: Send + Sync {
    /// Snapshot of the resources belonging to load balancer `lb`.
    async fn fetch_state(
        &self,
        lb: &Identifier,
        cancel: &CancellationToken,
    ) -> Result<RemoteState>;

    /// The reconciliation of `lb` will not fetch again.
    fn finish(&self, _lb: &Identifier) -> Result<()> {
        Ok(())
    }
}

/// Fetches straight from the provider, one listing per call.
pub struct DirectState {
    api: Arc<dyn LbaasApi>,
    tag: Tag,
}

impl DirectState {
    pub fn new(api: Arc<dyn LbaasApi>, tag: Tag) -> Self {
        Self { api, tag }
    }
}

#[async_trait]
impl StateSource for DirectState {
    async fn fetch_state(
        &self,
        lb: &Identifier,
        cancel: &CancellationToken,
    ) -> Result<RemoteState> {
        let state = RemoteState::fetch(self.api.as_ref(), &self.tag, cancel).await?;
        Ok(state.for_load_balancer(lb))
    }
}
