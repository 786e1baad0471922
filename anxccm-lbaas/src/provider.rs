//! Contract the engine needs from an LBaaS provider.
//!
//! The provider offers flat CRUD plus tag-based listing only: no
//! parent/child ownership and no transactions. Transport, rate limiting and
//! pagination are the implementation's business.

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::resource::{Resource, ResourceKind};
use crate::types::{Identifier, Tag};

/// An entry of a tag listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedObject {
    pub identifier: Identifier,
    /// Provider type identifier, see `ResourceKind::from_type_identifier`.
    pub type_identifier: String,
}

/// Trait for LBaaS provider clients.
#[async_trait]
pub trait LbaasApi: Send + Sync {
    /// Fetch full details of one object.
    async fn get(&self, kind: ResourceKind, id: &Identifier) -> Result<Resource, ProviderError>;

    /// List every object carrying `tag`.
    ///
    /// Providers may answer a tag nobody carries with `Unprocessable`.
    async fn list_tagged(&self, tag: &Tag) -> Result<Vec<TaggedObject>, ProviderError>;

    /// Create an object, returning its new identifier.
    async fn create(&self, resource: &Resource) -> Result<Identifier, ProviderError>;

    async fn destroy(&self, kind: ResourceKind, id: &Identifier) -> Result<(), ProviderError>;

    /// Attach `tag` to an existing object.
    async fn tag(&self, id: &Identifier, tag: &Tag) -> Result<(), ProviderError>;
}
