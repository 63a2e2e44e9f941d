//! Default resources created when a singleton is absent

use kube::Resource;
use tracing::{info, warn};

use crate::controller::error::{Error, Result};
use crate::controller::generator::ClusterContext;
use crate::controller::store::ResourceStore;
use crate::crd::{
    ImagePruner, ImagePrunerSpec, ImageRegistry, ImageRegistrySpec, ImageRegistryStorage,
    ManagementState,
};
use crate::resources::secret::generate_http_secret;
use crate::storage;

/// Default `cluster` registry for the platform
///
/// Platforms without a default backend get a `Removed` registry with no
/// storage so nothing is deployed until an administrator picks one.
pub fn default_registry(name: &str, ctx: &ClusterContext, finalizer: &str) -> Result<ImageRegistry> {
    let mut spec = ImageRegistrySpec {
        http_secret: generate_http_secret(),
        ..Default::default()
    };

    match storage::infer_default(ctx.platform) {
        Ok(backend) => {
            spec.replicas = if storage::is_object_storage(&backend) { 2 } else { 1 };
            spec.storage = backend;
            spec.management_state = ManagementState::Managed;
        }
        Err(Error::StorageNotConfigured) => {
            warn!(platform = %ctx.platform, "no default storage for platform, registry starts removed");
            spec.storage = ImageRegistryStorage::default();
            spec.management_state = ManagementState::Removed;
        }
        Err(e) => return Err(e),
    }

    let mut registry = ImageRegistry::new(name, spec);
    registry.meta_mut().finalizers = Some(vec![finalizer.to_string()]);
    if registry.spec.management_state == ManagementState::Managed {
        storage::complete_configuration(&mut registry, ctx)?;
    }
    Ok(registry)
}

pub fn default_pruner(name: &str) -> ImagePruner {
    ImagePruner::new(name, ImagePrunerSpec::default())
}

/// Create `name` from `make` unless the authoritative store already has it
///
/// Returns the created resource, or `None` when another writer got there first.
pub async fn create_if_absent<K, F>(
    store: &dyn ResourceStore<K>,
    name: &str,
    make: F,
) -> Result<Option<K>>
where
    K: Resource<DynamicType = ()> + Send + Sync,
    F: FnOnce() -> Result<K>,
{
    if store.get(name).await?.is_some() {
        return Ok(None);
    }
    let desired = make()?;
    match store.create(&desired).await {
        Ok(created) => {
            info!(resource = %name, kind = %K::kind(&()), "bootstrapped default resource");
            Ok(Some(created))
        }
        Err(e) if e.is_already_exists() => Ok(None),
        Err(e) => Err(e),
    }
}
