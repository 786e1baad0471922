//! Ownership tagging of freshly created resources.
//!
//! Create and tag are two separate provider calls. They run inside one
//! process-wide critical section so no listing-relevant partial state of one
//! reconciliation interleaves with another's. If tagging fails after a
//! successful create, the object stays behind untagged; it is not rolled back.

use tokio::sync::Mutex;
use tracing::{debug, error};

use crate::error::{LbaasError, Result};
use crate::provider::LbaasApi;
use crate::resource::Resource;
use crate::types::Tag;

static TAGGING: Mutex<()> = Mutex::const_new(());

/// Create `resource` and attach the ownership `tag` to it.
///
/// Returns the resource with its new identifier set.
pub async fn create_tagged<A>(api: &A, resource: &Resource, tag: &Tag) -> Result<Resource>
where
    A: LbaasApi + ?Sized,
{
    let _guard = TAGGING.lock().await;

    let id = api
        .create(resource)
        .await
        .map_err(|e| LbaasError::Create {
            name: resource.name().to_string(),
            message: e.to_string(),
        })?;

    if let Err(e) = api.tag(&id, tag).await {
        error!(id = %id, tag = %tag, "Created {} but failed to tag it: {}", resource, e);
        return Err(LbaasError::Tag {
            identifier: id,
            message: e.to_string(),
        });
    }

    debug!(id = %id, tag = %tag, "Created and tagged {}", resource);
    let mut created = resource.clone();
    created.set_identifier(id);
    Ok(created)
}
