//! In-process LBaaS provider.
//!
//! Keeps objects plus a `tag -> identifiers` secondary index, enforces
//! referential integrity like a real provider would, and lets tests inject
//! the failure modes the engine has to cope with (throttling, failing
//! deployments, failing tag calls, slow deployments). The binary persists
//! its state between runs to act as an offline planner.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::ProviderError;
use crate::provider::{LbaasApi, TaggedObject};
use crate::resource::{ProviderStatus, Resource, ResourceKind};
use crate::types::{Identifier, Tag};

/// Persistent part of the provider: load balancers, objects and tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryState {
    #[serde(default)]
    pub load_balancers: BTreeSet<Identifier>,
    #[serde(default)]
    pub objects: BTreeMap<Identifier, Resource>,
    #[serde(default)]
    pub tags: BTreeMap<Tag, BTreeSet<Identifier>>,
}

/// Misbehaviour to inject.
#[derive(Debug, Clone)]
pub struct Faults {
    /// Number of `get` calls an object stays progressing after creation.
    pub ready_after_polls: u32,
    /// Destroy calls allowed before every further destroy is rate limited.
    pub rate_limit_after_destroys: Option<usize>,
    /// Names whose creation is rejected.
    pub reject_create: HashSet<String>,
    /// Names that deploy into the error state.
    pub deploy_failed: HashSet<String>,
    /// Objects whose destruction is rejected.
    pub reject_destroy: HashSet<Identifier>,
    /// Objects whose next destroy attempt fails once.
    pub flaky_destroy: HashSet<Identifier>,
    pub fail_tag: bool,
    pub fail_listing: bool,
    /// Answer listings of unknown tags with `Unprocessable` instead of an empty list.
    pub unprocessable_empty_listing: bool,
}

impl Default for Faults {
    fn default() -> Self {
        Self {
            ready_after_polls: 0,
            rate_limit_after_destroys: None,
            reject_create: HashSet::new(),
            deploy_failed: HashSet::new(),
            reject_destroy: HashSet::new(),
            flaky_destroy: HashSet::new(),
            fail_tag: false,
            fail_listing: false,
            unprocessable_empty_listing: true,
        }
    }
}

/// Record of the calls the provider served.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    /// Successful creations in call order.
    pub created: Vec<(ResourceKind, String)>,
    /// Successful destructions in call order.
    pub destroyed: Vec<Identifier>,
    pub listings: usize,
    pub gets: usize,
}

struct Inner {
    state: MemoryState,
    faults: Faults,
    polls: HashMap<Identifier, u32>,
    destroy_attempts: usize,
    journal: Journal,
}

/// LBaaS provider living in memory.
pub struct InMemoryLbaas {
    inner: Mutex<Inner>,
}

impl Default for InMemoryLbaas {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLbaas {
    pub fn new() -> Self {
        Self::from_state(MemoryState::default())
    }

    /// Resume from previously persisted state.
    pub fn from_state(state: MemoryState) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state,
                faults: Faults::default(),
                polls: HashMap::new(),
                destroy_attempts: 0,
                journal: Journal::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_load_balancer(&self, id: impl Into<Identifier>) -> Identifier {
        let id = id.into();
        self.lock().state.load_balancers.insert(id.clone());
        id
    }

    /// Adjust the injected faults.
    pub fn configure(&self, f: impl FnOnce(&mut Faults)) {
        f(&mut self.lock().faults);
    }

    /// Place an object directly, bypassing faults and validation.
    pub fn insert(&self, mut resource: Resource, tags: &[Tag]) -> Identifier {
        let mut inner = self.lock();
        let id = match resource.identifier() {
            Some(id) => id.clone(),
            None => {
                let id = new_identifier();
                resource.set_identifier(id.clone());
                id
            }
        };
        for tag in tags {
            inner
                .state
                .tags
                .entry(tag.clone())
                .or_default()
                .insert(id.clone());
        }
        inner.state.objects.insert(id.clone(), resource);
        id
    }

    /// Overwrite the status of an object.
    pub fn set_status(&self, id: &Identifier, status: ProviderStatus) {
        if let Some(resource) = self.lock().state.objects.get_mut(id) {
            resource.set_status(status);
        }
    }

    pub fn objects(&self, kind: ResourceKind) -> Vec<Resource> {
        self.lock()
            .state
            .objects
            .values()
            .filter(|r| r.kind() == kind)
            .cloned()
            .collect()
    }

    /// Objects currently carrying `tag`.
    pub fn tagged(&self, tag: &Tag) -> Vec<Resource> {
        let inner = self.lock();
        inner
            .state
            .tags
            .get(tag)
            .into_iter()
            .flatten()
            .filter_map(|id| inner.state.objects.get(id))
            .cloned()
            .collect()
    }

    pub fn journal(&self) -> Journal {
        self.lock().journal.clone()
    }

    pub fn state(&self) -> MemoryState {
        self.lock().state.clone()
    }
}

fn new_identifier() -> Identifier {
    Identifier::new(Uuid::new_v4().simple().to_string())
}

impl Inner {
    fn kind_of(&self, id: &Identifier) -> Option<ResourceKind> {
        self.state.objects.get(id).map(Resource::kind)
    }

    fn check_references(&self, resource: &Resource) -> Result<(), ProviderError> {
        let require = |id: &Identifier, kind: ResourceKind| {
            if self.kind_of(id) == Some(kind) {
                Ok(())
            } else {
                Err(ProviderError::Rejected(format!(
                    "{} references unknown {kind} {id}",
                    resource.name()
                )))
            }
        };
        let require_lb = |id: &Identifier| {
            if self.state.load_balancers.contains(id) {
                Ok(())
            } else {
                Err(ProviderError::Rejected(format!(
                    "{} references unknown load balancer {id}",
                    resource.name()
                )))
            }
        };

        match resource {
            Resource::Backend(r) => require_lb(&r.load_balancer),
            Resource::Frontend(r) => {
                require_lb(&r.load_balancer)?;
                require(&r.default_backend, ResourceKind::Backend)
            }
            Resource::Bind(r) => require(&r.frontend, ResourceKind::Frontend),
            Resource::Server(r) => require(&r.backend, ResourceKind::Backend),
        }
    }

    fn referenced_by(&self, id: &Identifier) -> Option<&Resource> {
        self.state
            .objects
            .values()
            .find(|r| r.references().contains(&id))
    }

    /// Advance a progressing object by one poll.
    fn poll(&mut self, id: &Identifier) {
        let ready_after = self.faults.ready_after_polls;
        let Some(resource) = self.state.objects.get_mut(id) else {
            return;
        };
        if resource.status() != ProviderStatus::Progressing {
            return;
        }
        let polls = self.polls.entry(id.clone()).or_default();
        *polls += 1;
        if *polls >= ready_after {
            let status = final_status(&self.faults, resource.name());
            resource.set_status(status);
            self.polls.remove(id);
        }
    }
}

fn final_status(faults: &Faults, name: &str) -> ProviderStatus {
    if faults.deploy_failed.contains(name) {
        ProviderStatus::FAILED
    } else {
        ProviderStatus::READY
    }
}

#[async_trait]
impl LbaasApi for InMemoryLbaas {
    async fn get(&self, kind: ResourceKind, id: &Identifier) -> Result<Resource, ProviderError> {
        let mut inner = self.lock();
        inner.journal.gets += 1;
        if inner.kind_of(id) != Some(kind) {
            return Err(ProviderError::NotFound);
        }
        inner.poll(id);
        inner
            .state
            .objects
            .get(id)
            .cloned()
            .ok_or(ProviderError::NotFound)
    }

    async fn list_tagged(&self, tag: &Tag) -> Result<Vec<TaggedObject>, ProviderError> {
        let mut inner = self.lock();
        inner.journal.listings += 1;
        if inner.faults.fail_listing {
            return Err(ProviderError::Transport("listing unavailable".into()));
        }

        let listed: Vec<TaggedObject> = inner
            .state
            .tags
            .get(tag)
            .into_iter()
            .flatten()
            .filter_map(|id| {
                inner.state.objects.get(id).map(|r| TaggedObject {
                    identifier: id.clone(),
                    type_identifier: r.kind().type_identifier().to_string(),
                })
            })
            .collect();

        if listed.is_empty() && inner.faults.unprocessable_empty_listing {
            return Err(ProviderError::Unprocessable(format!(
                "no objects tagged {tag}"
            )));
        }
        Ok(listed)
    }

    async fn create(&self, resource: &Resource) -> Result<Identifier, ProviderError> {
        let mut inner = self.lock();
        if inner.faults.reject_create.contains(resource.name()) {
            return Err(ProviderError::Rejected(format!(
                "creation of {} rejected",
                resource.name()
            )));
        }
        inner.check_references(resource)?;

        let id = new_identifier();
        let mut created = resource.clone();
        created.set_identifier(id.clone());
        let status = if inner.faults.ready_after_polls == 0 {
            final_status(&inner.faults, resource.name())
        } else {
            ProviderStatus::Progressing
        };
        created.set_status(status);

        debug!(id = %id, "created {}", created);
        inner
            .journal
            .created
            .push((created.kind(), created.name().to_string()));
        inner.state.objects.insert(id.clone(), created);
        Ok(id)
    }

    async fn destroy(&self, kind: ResourceKind, id: &Identifier) -> Result<(), ProviderError> {
        let mut inner = self.lock();
        if let Some(limit) = inner.faults.rate_limit_after_destroys {
            if inner.destroy_attempts >= limit {
                return Err(ProviderError::RateLimited);
            }
        }
        inner.destroy_attempts += 1;

        if inner.kind_of(id) != Some(kind) {
            return Err(ProviderError::NotFound);
        }
        if inner.faults.reject_destroy.contains(id) {
            return Err(ProviderError::Rejected(format!("{kind} {id} is locked")));
        }
        if inner.faults.flaky_destroy.remove(id) {
            return Err(ProviderError::Transport("connection reset".into()));
        }
        if let Some(dependent) = inner.referenced_by(id) {
            return Err(ProviderError::Rejected(format!(
                "{kind} {id} still referenced by {dependent}"
            )));
        }

        inner.state.objects.remove(id);
        inner.polls.remove(id);
        for ids in inner.state.tags.values_mut() {
            ids.remove(id);
        }
        inner.state.tags.retain(|_, ids| !ids.is_empty());
        inner.journal.destroyed.push(id.clone());
        debug!(id = %id, %kind, "destroyed");
        Ok(())
    }

    async fn tag(&self, id: &Identifier, tag: &Tag) -> Result<(), ProviderError> {
        let mut inner = self.lock();
        if !inner.state.objects.contains_key(id) {
            return Err(ProviderError::NotFound);
        }
        if inner.faults.fail_tag {
            return Err(ProviderError::Transport("tag service unavailable".into()));
        }
        inner
            .state
            .tags
            .entry(tag.clone())
            .or_default()
            .insert(id.clone());
        Ok(())
    }
}
