//! Error types for the reconciliation engine.

use thiserror::Error;

use crate::resource::ResourceKind;
use crate::types::Identifier;

/// Errors reported by an LBaaS provider.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Object does not exist (anymore).
    #[error("not found")]
    NotFound,

    /// Request was throttled by the provider.
    #[error("rate limited")]
    RateLimited,

    /// Request was syntactically fine but could not be processed.
    ///
    /// Listing by a tag nobody carries yields this instead of an empty list.
    #[error("unprocessable: {0}")]
    Unprocessable(String),

    /// Request was rejected, e.g. because of a dangling reference.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Anything on the wire going wrong.
    #[error("transport: {0}")]
    Transport(String),
}

/// Errors that can occur while reconciling a load balancer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LbaasError {
    /// Some owned resources are still being deployed.
    #[error("LBaaS resources still progressing: {identifiers:?}")]
    ResourceProgressing { identifiers: Vec<Identifier> },

    /// Some owned resources ended up in the provider's error state.
    #[error("LBaaS resources failed: {identifiers:?}")]
    ResourceFailed { identifiers: Vec<Identifier> },

    /// A full destroy pass made no progress.
    #[error("LBaaS resources not destroyable: {identifiers:?}")]
    ResourcesNotDestroyable { identifiers: Vec<Identifier> },

    /// Provider throttled us while destroying; `remaining` were not attempted or failed.
    #[error("rate limited by LBaaS provider, {} resources left", remaining.len())]
    RateLimited { remaining: Vec<Identifier> },

    #[error("failed to create {name}: {message}")]
    Create { name: String, message: String },

    #[error("failed to tag {identifier}: {message}")]
    Tag {
        identifier: Identifier,
        message: String,
    },

    /// A load balancer identifier was used with the state retriever without being registered.
    #[error("load balancer {0} is not registered")]
    UnregisteredLoadBalancer(Identifier),

    /// The load balancer is already waiting for the current shared fetch.
    #[error("load balancer {0} is already waiting for a shared fetch")]
    ConcurrentFetch(Identifier),

    #[error("canceled")]
    Canceled,

    /// Readiness polling ran out of steps.
    #[error("timed out waiting for resources to become ready: {identifiers:?}")]
    WaitTimeout { identifiers: Vec<Identifier> },

    /// Two desired resources are indistinguishable for the comparator.
    #[error("duplicate desired {kind} {name}")]
    DuplicateResource { kind: ResourceKind, name: String },

    /// Remote object came back without an identifier.
    #[error("remote {kind} {name} has no identifier")]
    MissingIdentifier { kind: ResourceKind, name: String },

    /// Settings that cannot be used, e.g. a negative backoff factor.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("not converged after {cycles} cycles")]
    NotConverged { cycles: u32 },

    #[error("provider: {0}")]
    Provider(#[from] ProviderError),
}

/// Result type for reconciliation operations.
pub type Result<T> = std::result::Result<T, LbaasError>;
