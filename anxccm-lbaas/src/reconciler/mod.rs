//! Reconciliation of one load balancer.
//!
//! A cycle fetches a fresh snapshot of everything carrying the service tag,
//! lets the stage planners derive the desired objects and diff them against
//! the snapshot, then takes one kind of action: destroy, create or wait.
//! Cycles repeat until a check comes back empty.
//!
//! Stages run backend, frontend, bind, server. A stage only plans ports
//! whose upstream object already exists as desired; the rest is picked up by
//! a later cycle once the upstream object was created.

mod backend;
mod bind;
mod frontend;
mod server;

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::compare::{Comparable, Diff, compare, find_match};
use crate::config::ReconcileConfig;
use crate::error::{LbaasError, ProviderError, Result};
use crate::provider::LbaasApi;
use crate::resource::Resource;
use crate::state::{DirectState, RemoteState, StateSource};
use crate::tagging::create_tagged;
use crate::types::{Identifier, ServiceDefinition, Tag};
use crate::waiter::wait_ready;

/// Port name to the identifier of the object serving that port.
type Resolved = BTreeMap<String, Identifier>;

/// What every stage planner gets besides the remote objects of its kind.
struct Inputs<'a> {
    service: &'a ServiceDefinition,
    load_balancer: &'a Identifier,
    config: &'a ReconcileConfig,
}

/// Outcome of an upstream stage.
struct Stage<T> {
    diff: Diff<T>,
    /// Ports whose desired object already exists remotely.
    resolved: Resolved,
}

impl<T: Comparable + Clone> Stage<T> {
    /// Diff the per-port `desired` objects against `remote` and resolve the
    /// identifiers of those already present.
    fn plan(
        desired: Vec<(String, T)>,
        remote: &[T],
        identifier: impl Fn(&T) -> Option<&Identifier>,
    ) -> Result<Self> {
        let targets: Vec<T> = desired.iter().map(|(_, t)| t.clone()).collect();
        let diff = compare(&targets, remote)?;

        let mut resolved = Resolved::new();
        for (port, target) in &desired {
            let Some(existing) = find_match(target, remote) else {
                continue;
            };
            let id = identifier(existing).ok_or_else(|| LbaasError::MissingIdentifier {
                kind: T::KIND,
                name: existing.name().to_string(),
            })?;
            resolved.insert(port.clone(), id.clone());
        }

        Ok(Self { diff, resolved })
    }
}

/// What one check found to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Desired objects missing remotely, in dependency order.
    pub create: Vec<Resource>,
    /// Remote objects not desired anymore.
    pub destroy: Vec<Resource>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.destroy.is_empty()
    }

    fn absorb<T: Into<Resource>>(&mut self, diff: Diff<T>) {
        self.create.extend(diff.create.into_iter().map(Into::into));
        self.destroy.extend(diff.destroy.into_iter().map(Into::into));
    }
}

fn identifiers(resources: &[Resource]) -> Vec<Identifier> {
    resources
        .iter()
        .filter_map(|r| r.identifier().cloned())
        .collect()
}

/// Converges the resources of one service on one load balancer.
pub struct Reconciliation {
    api: Arc<dyn LbaasApi>,
    state: Arc<dyn StateSource>,
    load_balancer: Identifier,
    service: ServiceDefinition,
    tag: Tag,
    config: ReconcileConfig,
    cancel: CancellationToken,
    latest: Option<RemoteState>,
}

impl Reconciliation {
    pub fn new(
        api: Arc<dyn LbaasApi>,
        state: Arc<dyn StateSource>,
        load_balancer: Identifier,
        service: ServiceDefinition,
        config: ReconcileConfig,
        cancel: CancellationToken,
    ) -> Self {
        let tag = service.tag();
        Self {
            api,
            state,
            load_balancer,
            service,
            tag,
            config,
            cancel,
            latest: None,
        }
    }

    /// Reconciliation fetching its own snapshots, for services on a single load balancer.
    pub fn direct(
        api: Arc<dyn LbaasApi>,
        load_balancer: Identifier,
        service: ServiceDefinition,
        config: ReconcileConfig,
        cancel: CancellationToken,
    ) -> Self {
        let state = Arc::new(DirectState::new(Arc::clone(&api), service.tag()));
        Self::new(api, state, load_balancer, service, config, cancel)
    }

    /// Fetch a snapshot and compute what to create and destroy, without
    /// touching the provider.
    ///
    /// Failed objects short-circuit into a destroy-only plan. Progressing
    /// objects yield `ResourceProgressing`.
    pub async fn reconcile_check(&mut self) -> Result<ReconcilePlan> {
        let remote = self
            .state
            .fetch_state(&self.load_balancer, &self.cancel)
            .await?;
        let plan = self.plan(&remote);
        self.latest = Some(remote);
        plan
    }

    fn plan(&self, remote: &RemoteState) -> Result<ReconcilePlan> {
        if !remote.failed.is_empty() {
            warn!(
                lb = %self.load_balancer,
                failed = remote.failed.len(),
                "Found failed resources, scheduling them for destruction"
            );
            return Ok(ReconcilePlan {
                create: Vec::new(),
                destroy: remote.failed_with_dependents(),
            });
        }
        if !remote.progressing.is_empty() {
            return Err(LbaasError::ResourceProgressing {
                identifiers: identifiers(&remote.progressing),
            });
        }

        let inputs = Inputs {
            service: &self.service,
            load_balancer: &self.load_balancer,
            config: &self.config,
        };
        let backends = backend::plan(&inputs, &remote.backends)?;
        let frontends = frontend::plan(&inputs, &backends.resolved, &remote.frontends)?;
        let binds = bind::plan(&inputs, &frontends.resolved, &remote.binds)?;
        let servers = server::plan(&inputs, &backends.resolved, &remote.servers)?;

        let mut plan = ReconcilePlan::default();
        plan.absorb(backends.diff);
        plan.absorb(frontends.diff);
        plan.absorb(binds);
        plan.absorb(servers);

        debug!(
            lb = %self.load_balancer,
            create = plan.create.len(),
            destroy = plan.destroy.len(),
            "Reconcile check done"
        );
        Ok(plan)
    }

    /// Run cycles until a check finds nothing to do.
    ///
    /// Leaves the state source afterwards, whatever the outcome. With a
    /// shared `StateRetriever` this means a reconciliation runs once.
    pub async fn reconcile(&mut self) -> Result<()> {
        let result = self.converge().await;
        if let Err(e) = self.state.finish(&self.load_balancer) {
            warn!(lb = %self.load_balancer, "Failed to leave state source: {}", e);
            return result.and(Err(e));
        }
        result
    }

    async fn converge(&mut self) -> Result<()> {
        info!(
            lb = %self.load_balancer,
            service = %self.service.name,
            "Reconciling load balancer"
        );

        for cycle in 1..=self.config.max_cycles {
            if self.cancel.is_cancelled() {
                return Err(LbaasError::Canceled);
            }

            let plan = match self.reconcile_check().await {
                Ok(plan) => plan,
                Err(LbaasError::ResourceProgressing { identifiers }) => {
                    info!(
                        lb = %self.load_balancer,
                        cycle,
                        progressing = identifiers.len(),
                        "Waiting for progressing resources"
                    );
                    let progressing = self
                        .latest
                        .as_ref()
                        .map(|s| s.progressing.clone())
                        .unwrap_or_default();
                    self.wait(&progressing).await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            // the snapshot no longer describes the provider once we act on it
            if !plan.is_empty() {
                self.latest = None;
            }

            if !plan.destroy.is_empty() {
                info!(
                    lb = %self.load_balancer,
                    cycle,
                    count = plan.destroy.len(),
                    "Destroying resources"
                );
                self.destroy(plan.destroy).await?;
            } else if !plan.create.is_empty() {
                info!(
                    lb = %self.load_balancer,
                    cycle,
                    count = plan.create.len(),
                    "Creating resources"
                );
                self.create(plan.create).await?;
            } else {
                info!(lb = %self.load_balancer, cycles = cycle, "Load balancer converged");
                return Ok(());
            }
        }

        Err(LbaasError::NotConverged {
            cycles: self.config.max_cycles,
        })
    }

    /// Create and tag `resources` upstream first, then wait for them.
    async fn create(&self, mut resources: Vec<Resource>) -> Result<()> {
        resources.sort_by_key(|r| r.kind().dependency_rank());

        let mut created = Vec::with_capacity(resources.len());
        for resource in &resources {
            if self.cancel.is_cancelled() {
                return Err(LbaasError::Canceled);
            }
            let resource = create_tagged(self.api.as_ref(), resource, &self.tag).await?;
            info!(lb = %self.load_balancer, "Created {}", resource);
            created.push(resource);
        }

        self.wait(&created).await
    }

    /// Wait for `resources`. Failed ones are left for the next cycle to destroy.
    async fn wait(&self, resources: &[Resource]) -> Result<()> {
        match wait_ready(
            self.api.as_ref(),
            resources,
            &self.config.backoff,
            &self.cancel,
        )
        .await
        {
            Err(LbaasError::ResourceFailed { identifiers }) => {
                warn!(
                    lb = %self.load_balancer,
                    ?identifiers,
                    "Resources failed to deploy"
                );
                Ok(())
            }
            other => other,
        }
    }

    /// Destroy `pending` dependents first.
    ///
    /// Failures are retried as long as a pass destroys at least one object.
    /// Throttling aborts at once, reporting everything not destroyed.
    async fn destroy(&self, mut pending: Vec<Resource>) -> Result<()> {
        pending.sort_by_key(|r| Reverse(r.kind().dependency_rank()));

        loop {
            let attempted = pending.len();
            let mut retry = Vec::new();
            let mut queue = pending.into_iter();

            while let Some(resource) = queue.next() {
                if self.cancel.is_cancelled() {
                    return Err(LbaasError::Canceled);
                }
                let id = resource
                    .identifier()
                    .cloned()
                    .ok_or_else(|| LbaasError::MissingIdentifier {
                        kind: resource.kind(),
                        name: resource.name().to_string(),
                    })?;

                match self.api.destroy(resource.kind(), &id).await {
                    Ok(()) => info!(lb = %self.load_balancer, "Destroyed {}", resource),
                    Err(ProviderError::NotFound) => {
                        debug!(lb = %self.load_balancer, "{} already gone", resource)
                    }
                    Err(ProviderError::RateLimited) => {
                        let remaining: Vec<Identifier> = std::iter::once(id)
                            .chain(identifiers(&retry))
                            .chain(queue.filter_map(|r| r.identifier().cloned()))
                            .collect();
                        warn!(
                            lb = %self.load_balancer,
                            remaining = remaining.len(),
                            "Rate limited while destroying resources"
                        );
                        return Err(LbaasError::RateLimited { remaining });
                    }
                    Err(e) => {
                        warn!(lb = %self.load_balancer, "Failed to destroy {}: {}", resource, e);
                        retry.push(resource);
                    }
                }
            }

            if retry.is_empty() {
                return Ok(());
            }
            if retry.len() == attempted {
                return Err(LbaasError::ResourcesNotDestroyable {
                    identifiers: identifiers(&retry),
                });
            }
            debug!(
                lb = %self.load_balancer,
                retry = retry.len(),
                "Retrying failed destroys"
            );
            pending = retry;
        }
    }

    /// External addresses and the ports bound on them.
    ///
    /// Reuses the snapshot of the latest check as long as nothing was
    /// created or destroyed since. Otherwise it lists the provider again,
    /// directly rather than through the state source, so it works after
    /// `reconcile` left a shared `StateRetriever`.
    pub async fn status(&mut self) -> Result<BTreeMap<IpAddr, Vec<u16>>> {
        let latest = match self.latest.take() {
            Some(latest) => latest,
            None => RemoteState::fetch(self.api.as_ref(), &self.tag, &self.cancel)
                .await?
                .for_load_balancer(&self.load_balancer),
        };

        let mut status: BTreeMap<IpAddr, Vec<u16>> = BTreeMap::new();
        for bind in &latest.binds {
            status.entry(bind.address).or_default().push(bind.port);
        }
        for ports in status.values_mut() {
            ports.sort_unstable();
            ports.dedup();
        }

        self.latest = Some(latest);
        Ok(status)
    }
}
