//! Authoritative store boundary
//!
//! Reads through this boundary bypass the informer caches. Writes carry the
//! object's resourceVersion, so a stale write fails with a conflict instead
//! of overwriting someone else's change.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::controller::error::Result;
use crate::controller::objects::{ManagedObject, ObjectKey, ObjectKind, map_object};
use crate::crd::Route;

/// CRUD over managed objects of any kind
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Authoritative read; `None` when the object does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject>>;

    /// Objects of `kind` in `namespace` (ignored for cluster-scoped kinds) matching a label selector
    async fn list(
        &self,
        kind: ObjectKind,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ManagedObject>>;

    async fn create(&self, obj: &ManagedObject) -> Result<ManagedObject>;

    /// Fails with a conflict when the resourceVersion is stale
    async fn update(&self, obj: &ManagedObject) -> Result<ManagedObject>;

    async fn delete(&self, key: &ObjectKey) -> Result<()>;
}

/// CRUD over one custom resource type, including its status subresource
#[async_trait]
pub trait ResourceStore<K>: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<K>>;

    async fn create(&self, obj: &K) -> Result<K>;

    /// Writes metadata and spec; fails with a conflict when the resourceVersion is stale
    async fn update(&self, obj: &K) -> Result<K>;

    /// Writes the status subresource under the same conflict rules
    async fn update_status(&self, obj: &K) -> Result<K>;

    async fn delete(&self, name: &str) -> Result<()>;
}

/// Write the status produced by `desired`, re-reading once on conflict
///
/// `desired` maps the stored object to the object to write, or to `None`
/// when the stored status is already current. A second conflict is left for
/// the next pass, since the competing write is itself a change event.
/// Returns whether a write landed.
pub async fn update_status_with_retry<K, F>(
    store: &dyn ResourceStore<K>,
    name: &str,
    mut current: K,
    desired: F,
) -> Result<bool>
where
    F: Fn(&K) -> Option<K>,
{
    for attempt in 0..2 {
        let Some(updated) = desired(&current) else {
            debug!(resource = %name, "status unchanged");
            return Ok(false);
        };
        match store.update_status(&updated).await {
            Ok(_) => return Ok(true),
            Err(e) if e.is_conflict() && attempt == 0 => {
                debug!(resource = %name, "status conflict, re-reading");
                match store.get(name).await? {
                    Some(fresh) => current = fresh,
                    None => return Ok(false),
                }
            }
            Err(e) if e.is_conflict() => {
                warn!(resource = %name, "status write lost a second conflict, leaving it for the next pass");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(false)
}

/// Builds the typed API handle for a managed kind
trait ManagedKind:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + std::fmt::Debug + Send + Sync + 'static
{
    fn api(client: Client, namespace: Option<&str>) -> Api<Self>;
}

macro_rules! namespaced_kind {
    ($($ty:ty),*) => {
        $(impl ManagedKind for $ty {
            fn api(client: Client, namespace: Option<&str>) -> Api<Self> {
                match namespace {
                    Some(ns) => Api::namespaced(client, ns),
                    None => Api::default_namespaced(client),
                }
            }
        })*
    };
}

macro_rules! cluster_kind {
    ($($ty:ty),*) => {
        $(impl ManagedKind for $ty {
            fn api(client: Client, _namespace: Option<&str>) -> Api<Self> {
                Api::all(client)
            }
        })*
    };
}

namespaced_kind!(ServiceAccount, ConfigMap, Secret, Service, PodDisruptionBudget, Deployment, Route, CronJob);
cluster_kind!(ClusterRole, ClusterRoleBinding);

/// `ObjectStore` backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeObjectStore {
    client: Client,
    field_manager: String,
}

impl KubeObjectStore {
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self {
            client,
            field_manager: field_manager.to_string(),
        }
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(self.field_manager.clone()),
        }
    }

    fn api<T: ManagedKind>(&self, namespace: Option<&str>) -> Api<T> {
        T::api(self.client.clone(), namespace)
    }

    async fn get_typed<T: ManagedKind>(&self, key: &ObjectKey) -> Result<Option<T>> {
        Ok(self.api::<T>(key.namespace.as_deref()).get_opt(&key.name).await?)
    }

    async fn list_typed<T: ManagedKind>(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<T>> {
        let lp = ListParams::default().labels(label_selector);
        Ok(self.api::<T>(Some(namespace)).list(&lp).await?.items)
    }

    async fn create_typed<T: ManagedKind>(&self, obj: &T) -> Result<T> {
        let api = self.api::<T>(obj.namespace().as_deref());
        Ok(api.create(&self.post_params(), obj).await?)
    }

    async fn update_typed<T: ManagedKind>(&self, obj: &T) -> Result<T> {
        let api = self.api::<T>(obj.namespace().as_deref());
        Ok(api.replace(&obj.name_any(), &self.post_params(), obj).await?)
    }

    async fn delete_typed<T: ManagedKind>(&self, key: &ObjectKey) -> Result<()> {
        let api = self.api::<T>(key.namespace.as_deref());
        api.delete(&key.name, &DeleteParams::background()).await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject>> {
        let found = match key.kind {
            ObjectKind::ServiceAccount => self.get_typed(key).await?.map(ManagedObject::ServiceAccount),
            ObjectKind::ClusterRole => self.get_typed(key).await?.map(ManagedObject::ClusterRole),
            ObjectKind::ClusterRoleBinding => {
                self.get_typed(key).await?.map(ManagedObject::ClusterRoleBinding)
            }
            ObjectKind::ConfigMap => self.get_typed(key).await?.map(ManagedObject::ConfigMap),
            ObjectKind::Secret => self.get_typed(key).await?.map(ManagedObject::Secret),
            ObjectKind::Service => self.get_typed(key).await?.map(ManagedObject::Service),
            ObjectKind::PodDisruptionBudget => {
                self.get_typed(key).await?.map(ManagedObject::PodDisruptionBudget)
            }
            ObjectKind::Deployment => self.get_typed(key).await?.map(ManagedObject::Deployment),
            ObjectKind::Route => self.get_typed(key).await?.map(ManagedObject::Route),
            ObjectKind::CronJob => self.get_typed(key).await?.map(ManagedObject::CronJob),
        };
        Ok(found)
    }

    async fn list(
        &self,
        kind: ObjectKind,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ManagedObject>> {
        fn wrap<T>(items: Vec<T>, f: fn(T) -> ManagedObject) -> Vec<ManagedObject> {
            items.into_iter().map(f).collect()
        }
        let (ns, sel) = (namespace, label_selector);
        Ok(match kind {
            ObjectKind::ServiceAccount => wrap(self.list_typed(ns, sel).await?, ManagedObject::ServiceAccount),
            ObjectKind::ClusterRole => wrap(self.list_typed(ns, sel).await?, ManagedObject::ClusterRole),
            ObjectKind::ClusterRoleBinding => {
                wrap(self.list_typed(ns, sel).await?, ManagedObject::ClusterRoleBinding)
            }
            ObjectKind::ConfigMap => wrap(self.list_typed(ns, sel).await?, ManagedObject::ConfigMap),
            ObjectKind::Secret => wrap(self.list_typed(ns, sel).await?, ManagedObject::Secret),
            ObjectKind::Service => wrap(self.list_typed(ns, sel).await?, ManagedObject::Service),
            ObjectKind::PodDisruptionBudget => {
                wrap(self.list_typed(ns, sel).await?, ManagedObject::PodDisruptionBudget)
            }
            ObjectKind::Deployment => wrap(self.list_typed(ns, sel).await?, ManagedObject::Deployment),
            ObjectKind::Route => wrap(self.list_typed(ns, sel).await?, ManagedObject::Route),
            ObjectKind::CronJob => wrap(self.list_typed(ns, sel).await?, ManagedObject::CronJob),
        })
    }

    async fn create(&self, obj: &ManagedObject) -> Result<ManagedObject> {
        debug!(object = %obj.key(), "create");
        Ok(map_object!(obj, o => self.create_typed(o).await?))
    }

    async fn update(&self, obj: &ManagedObject) -> Result<ManagedObject> {
        debug!(object = %obj.key(), "update");
        Ok(map_object!(obj, o => self.update_typed(o).await?))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        debug!(object = %key, "delete");
        match key.kind {
            ObjectKind::ServiceAccount => self.delete_typed::<ServiceAccount>(key).await,
            ObjectKind::ClusterRole => self.delete_typed::<ClusterRole>(key).await,
            ObjectKind::ClusterRoleBinding => self.delete_typed::<ClusterRoleBinding>(key).await,
            ObjectKind::ConfigMap => self.delete_typed::<ConfigMap>(key).await,
            ObjectKind::Secret => self.delete_typed::<Secret>(key).await,
            ObjectKind::Service => self.delete_typed::<Service>(key).await,
            ObjectKind::PodDisruptionBudget => self.delete_typed::<PodDisruptionBudget>(key).await,
            ObjectKind::Deployment => self.delete_typed::<Deployment>(key).await,
            ObjectKind::Route => self.delete_typed::<Route>(key).await,
            ObjectKind::CronJob => self.delete_typed::<CronJob>(key).await,
        }
    }
}

/// `ResourceStore` for a cluster-scoped custom resource
pub struct KubeResourceStore<K> {
    api: Api<K>,
    field_manager: String,
}

impl<K> KubeResourceStore<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug,
{
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self {
            api: Api::all(client),
            field_manager: field_manager.to_string(),
        }
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(self.field_manager.clone()),
        }
    }
}

#[async_trait]
impl<K> ResourceStore<K> for KubeResourceStore<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + Serialize
        + DeserializeOwned
        + std::fmt::Debug
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, name: &str) -> Result<Option<K>> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn create(&self, obj: &K) -> Result<K> {
        Ok(self.api.create(&self.post_params(), obj).await?)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        Ok(self
            .api
            .replace(&obj.name_any(), &self.post_params(), obj)
            .await?)
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let data = serde_json::to_vec(obj)?;
        Ok(self
            .api
            .replace_status(&obj.name_any(), &self.post_params(), data)
            .await?)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.api.delete(name, &DeleteParams::background()).await?;
        Ok(())
    }
}
