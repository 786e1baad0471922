pub mod barrier;
pub mod compare;
pub mod config;
pub mod error;
pub mod memory;
pub mod naming;
pub mod provider;
pub mod reconciler;
pub mod resource;
pub mod retriever;
pub mod state;
pub mod tagging;
pub mod types;
pub mod waiter;

pub use barrier::{Rendezvous, RendezvousError};
pub use config::ReconcileConfig;
pub use error::{LbaasError, ProviderError, Result};
pub use memory::{InMemoryLbaas, MemoryState};
pub use provider::{LbaasApi, TaggedObject};
pub use reconciler::{ReconcilePlan, Reconciliation};
pub use resource::{
    Backend, Bind, Frontend, HealthCheck, Mode, ProviderStatus, ReadinessState, Resource,
    ResourceKind, ServerResource,
};
pub use retriever::StateRetriever;
pub use state::{DirectState, RemoteState, StateSource};
pub use types::{Identifier, Port, Server, ServiceDefinition, Tag};
pub use waiter::Backoff;
