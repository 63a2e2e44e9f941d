//! In-memory store and cache with API-server write semantics
//!
//! `MemoryResources<K>` stands in for a cluster-scoped custom resource
//! collection, `MemoryObjects` for every managed object kind. Both serve the
//! authoritative store boundary and the cache boundary from the same data,
//! so a cache read never lags in these tests.
//!
//! Semantics kept from the API server:
//! - `resourceVersion` compare on update, `Conflict` (409) on mismatch
//! - `AlreadyExists` (409) on create of an existing name
//! - `generation` bumps only when `spec` changes
//! - create and update ignore status, `update_status` only writes status
//! - delete of an object with finalizers sets `deletionTimestamp`; the object
//!   goes away once an update empties its finalizer list

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use image_registry_operator::controller::error::{Error, Result};
use image_registry_operator::controller::informer::{
    ChangeEvent, Handler, Lister, Notifier, Subscribers, Subscription,
};
use image_registry_operator::controller::{ManagedObject, ObjectKey, ObjectKind, ObjectStore, ResourceStore};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::core::ErrorResponse;
use kube::{Resource, ResourceExt};
use serde::Serialize;

pub fn api_error(code: u16, reason: &str) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: reason.to_string(),
        reason: reason.to_string(),
        code,
    }))
}

fn conflict(name: &str) -> Error {
    let mut err = api_error(409, "Conflict");
    if let Error::KubeError(kube::Error::Api(resp)) = &mut err {
        resp.message = format!("{} was modified, retry against the latest version", name);
    }
    err
}

/// Write counters
#[derive(Debug, Default)]
pub struct Writes {
    pub creates: AtomicUsize,
    pub updates: AtomicUsize,
    pub status_updates: AtomicUsize,
    pub deletes: AtomicUsize,
}

impl Writes {
    pub fn total(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
            + self.updates.load(Ordering::SeqCst)
            + self.status_updates.load(Ordering::SeqCst)
            + self.deletes.load(Ordering::SeqCst)
    }

    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

fn spec_of<K: Serialize>(obj: &K) -> serde_json::Value {
    serde_json::to_value(obj)
        .ok()
        .and_then(|mut v| v.get_mut("spec").map(serde_json::Value::take))
        .unwrap_or_default()
}

fn has_finalizers(meta: &ObjectMeta) -> bool {
    meta.finalizers.as_ref().is_some_and(|f| !f.is_empty())
}

/// Status accessors for the custom resources under test
pub trait HasStatus: Resource<DynamicType = ()> + Clone + Serialize + Send + Sync + 'static {
    fn copy_status_from(&mut self, other: &Self);

    fn clear_status(&mut self);
}

macro_rules! has_status {
    ($($ty:ty),*) => {
        $(impl HasStatus for $ty {
            fn copy_status_from(&mut self, other: &Self) {
                self.status = other.status.clone();
            }

            fn clear_status(&mut self) {
                self.status = None;
            }
        })*
    };
}

has_status!(
    image_registry_operator::crd::ImageRegistry,
    image_registry_operator::crd::ImagePruner,
    image_registry_operator::crd::ClusterOperator,
    image_registry_operator::crd::Infrastructure
);

/// Cluster-scoped custom resources of one kind
pub struct MemoryResources<K> {
    objects: Mutex<BTreeMap<String, K>>,
    versions: AtomicU64,
    subscribers: Subscribers,
    pub writes: Writes,
    /// Conflicts to inject into the next status writes
    pub status_conflicts: AtomicUsize,
    /// Conflicts to inject into the next spec and metadata writes
    pub update_conflicts: AtomicUsize,
    /// Applied to the stored copy right before the next update is checked
    concurrent_write: Mutex<Option<ConcurrentWrite<K>>>,
    get_errors: Mutex<VecDeque<Error>>,
}

type ConcurrentWrite<K> = Box<dyn FnOnce(&mut K) + Send>;

impl<K: HasStatus> Default for MemoryResources<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            versions: AtomicU64::new(0),
            subscribers: Subscribers::default(),
            writes: Writes::default(),
            status_conflicts: AtomicUsize::new(0),
            update_conflicts: AtomicUsize::new(0),
            concurrent_write: Mutex::new(None),
            get_errors: Mutex::new(VecDeque::new()),
        }
    }
}

impl<K: HasStatus> MemoryResources<K> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, K>> {
        self.objects.lock().unwrap()
    }

    fn next_version(&self) -> String {
        (self.versions.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn notify(&self, name: &str, deleted: bool) {
        let kind = K::kind(&()).to_string();
        let event = if deleted {
            ChangeEvent::Deleted { kind, namespace: None, name: name.to_string() }
        } else {
            ChangeEvent::Applied { kind, namespace: None, name: name.to_string() }
        };
        self.subscribers.notify(&event);
    }

    /// Insert as-is, outside the write counters (test setup)
    pub fn seed(&self, mut obj: K) {
        let name = obj.name_any();
        obj.meta_mut().resource_version = Some(self.next_version());
        if obj.meta().generation.is_none() {
            obj.meta_mut().generation = Some(1);
        }
        if obj.meta().uid.is_none() {
            obj.meta_mut().uid = Some(format!("uid-{}", name));
        }
        self.lock().insert(name.clone(), obj);
        self.notify(&name, false);
    }

    pub fn get_now(&self, name: &str) -> Option<K> {
        self.lock().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().contains_key(name)
    }

    /// Let another writer change the object just before the next update lands
    pub fn race_next_update<F>(&self, f: F)
    where
        F: FnOnce(&mut K) + Send + 'static,
    {
        *self.concurrent_write.lock().unwrap() = Some(Box::new(f));
    }

    /// Fail the next authoritative reads with `errors`, in order
    pub fn fail_next_gets(&self, errors: impl IntoIterator<Item = Error>) {
        self.get_errors.lock().unwrap().extend(errors);
    }

    fn take_conflict(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Bump the stored version as a competing write would
    fn interleave(&self, name: &str, f: Option<ConcurrentWrite<K>>) {
        if let Some(stored) = self.lock().get_mut(name) {
            if let Some(f) = f {
                f(stored);
            }
            stored.meta_mut().resource_version = Some(self.next_version());
        }
    }
}

#[async_trait]
impl<K: HasStatus> ResourceStore<K> for MemoryResources<K> {
    async fn get(&self, name: &str) -> Result<Option<K>> {
        if let Some(err) = self.get_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self.get_now(name))
    }

    async fn create(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let created = {
            let mut objects = self.lock();
            if objects.contains_key(&name) {
                return Err(api_error(409, "AlreadyExists"));
            }
            let mut created = obj.clone();
            created.clear_status();
            let meta = created.meta_mut();
            meta.resource_version = Some(self.next_version());
            meta.generation = Some(1);
            meta.uid = Some(format!("uid-{}", name));
            meta.creation_timestamp = Some(Time(Utc::now()));
            objects.insert(name.clone(), created.clone());
            created
        };
        Writes::bump(&self.writes.creates);
        self.notify(&name, false);
        Ok(created)
    }

    async fn update(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        let raced = self.concurrent_write.lock().unwrap().take();
        if raced.is_some() || Self::take_conflict(&self.update_conflicts) {
            self.interleave(&name, raced);
        }
        let (result, deleted) = {
            let mut objects = self.lock();
            let Some(stored) = objects.get(&name) else {
                return Err(api_error(404, "NotFound"));
            };
            if stored.meta().resource_version != obj.meta().resource_version {
                return Err(conflict(&name));
            }
            let mut next = obj.clone();
            next.copy_status_from(stored);
            let meta = next.meta_mut();
            meta.uid = stored.meta().uid.clone();
            meta.creation_timestamp = stored.meta().creation_timestamp.clone();
            meta.deletion_timestamp = stored.meta().deletion_timestamp.clone();
            meta.resource_version = Some(self.next_version());
            let generation = stored.meta().generation.unwrap_or(1);
            next.meta_mut().generation = Some(if spec_of(&next) != spec_of(stored) {
                generation + 1
            } else {
                generation
            });

            if next.meta().deletion_timestamp.is_some() && !has_finalizers(next.meta()) {
                objects.remove(&name);
                (next, true)
            } else {
                objects.insert(name.clone(), next.clone());
                (next, false)
            }
        };
        Writes::bump(&self.writes.updates);
        self.notify(&name, deleted);
        Ok(result)
    }

    async fn update_status(&self, obj: &K) -> Result<K> {
        let name = obj.name_any();
        if Self::take_conflict(&self.status_conflicts) {
            // Someone else wrote in between
            self.interleave(&name, None);
            return Err(conflict(&name));
        }
        let result = {
            let mut objects = self.lock();
            let Some(stored) = objects.get_mut(&name) else {
                return Err(api_error(404, "NotFound"));
            };
            if stored.meta().resource_version != obj.meta().resource_version {
                return Err(conflict(&name));
            }
            stored.copy_status_from(obj);
            stored.meta_mut().resource_version = Some(self.next_version());
            stored.clone()
        };
        Writes::bump(&self.writes.status_updates);
        self.notify(&name, false);
        Ok(result)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let deleted = {
            let mut objects = self.lock();
            let Some(stored) = objects.get_mut(name) else {
                return Err(api_error(404, "NotFound"));
            };
            if has_finalizers(stored.meta()) {
                if stored.meta().deletion_timestamp.is_none() {
                    stored.meta_mut().deletion_timestamp = Some(Time(Utc::now()));
                    stored.meta_mut().resource_version = Some(self.next_version());
                }
                false
            } else {
                objects.remove(name);
                true
            }
        };
        Writes::bump(&self.writes.deletes);
        self.notify(name, deleted);
        Ok(())
    }
}

impl<K: HasStatus> Notifier for MemoryResources<K> {
    fn subscribe(&self, handler: Handler) -> Subscription {
        self.subscribers.subscribe(handler)
    }

    fn has_synced(&self) -> bool {
        true
    }
}

impl<K: HasStatus> Lister<K> for MemoryResources<K> {
    fn get(&self, name: &str) -> Option<Arc<K>> {
        self.get_now(name).map(Arc::new)
    }

    fn list(&self) -> Vec<Arc<K>> {
        self.lock().values().cloned().map(Arc::new).collect()
    }
}

fn matches_selector(obj: &ManagedObject, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => obj.label(k) == Some(v),
            None => obj.label(term).is_some(),
        })
}

/// Every managed object kind, keyed by identity
#[derive(Default)]
pub struct MemoryObjects {
    objects: Mutex<BTreeMap<ObjectKey, ManagedObject>>,
    versions: AtomicU64,
    subscribers: Subscribers,
    pub writes: Writes,
}

impl MemoryObjects {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<ObjectKey, ManagedObject>> {
        self.objects.lock().unwrap()
    }

    fn next_version(&self) -> String {
        (self.versions.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn notify(&self, key: &ObjectKey, deleted: bool) {
        let (kind, namespace, name) = (key.kind.to_string(), key.namespace.clone(), key.name.clone());
        let event = if deleted {
            ChangeEvent::Deleted { kind, namespace, name }
        } else {
            ChangeEvent::Applied { kind, namespace, name }
        };
        self.subscribers.notify(&event);
    }

    /// Insert as-is, outside the write counters (test setup)
    pub fn seed(&self, mut obj: ManagedObject) {
        let key = obj.key();
        obj.meta_mut().resource_version = Some(self.next_version());
        self.lock().insert(key.clone(), obj);
        self.notify(&key, false);
    }

    pub fn get_now(&self, key: &ObjectKey) -> Option<ManagedObject> {
        self.lock().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.lock().keys().cloned().collect()
    }

    pub fn count(&self, kind: ObjectKind) -> usize {
        self.lock().keys().filter(|k| k.kind == kind).count()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Change a stored object the way another cluster component would
    pub fn mutate<F>(&self, key: &ObjectKey, f: F)
    where
        F: FnOnce(&mut ManagedObject),
    {
        if let Some(obj) = self.lock().get_mut(key) {
            f(obj);
            obj.meta_mut().resource_version = Some(self.next_version());
        }
        self.notify(key, false);
    }
}

#[async_trait]
impl ObjectStore for MemoryObjects {
    async fn get(&self, key: &ObjectKey) -> Result<Option<ManagedObject>> {
        Ok(self.get_now(key))
    }

    async fn list(
        &self,
        kind: ObjectKind,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ManagedObject>> {
        Ok(self
            .lock()
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .filter(|(key, _)| !kind.is_namespaced() || key.namespace.as_deref() == Some(namespace))
            .filter(|(_, obj)| matches_selector(obj, label_selector))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, obj: &ManagedObject) -> Result<ManagedObject> {
        let key = obj.key();
        let created = {
            let mut objects = self.lock();
            if objects.contains_key(&key) {
                return Err(api_error(409, "AlreadyExists"));
            }
            let mut created = obj.clone();
            created.meta_mut().resource_version = Some(self.next_version());
            created.meta_mut().uid = Some(format!("uid-{}", key));
            objects.insert(key.clone(), created.clone());
            created
        };
        Writes::bump(&self.writes.creates);
        self.notify(&key, false);
        Ok(created)
    }

    async fn update(&self, obj: &ManagedObject) -> Result<ManagedObject> {
        let key = obj.key();
        let updated = {
            let mut objects = self.lock();
            let Some(stored) = objects.get_mut(&key) else {
                return Err(api_error(404, "NotFound"));
            };
            if stored.meta().resource_version != obj.meta().resource_version {
                return Err(conflict(&key.name));
            }
            *stored = obj.clone();
            stored.meta_mut().resource_version = Some(self.next_version());
            stored.clone()
        };
        Writes::bump(&self.writes.updates);
        self.notify(&key, false);
        Ok(updated)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        if self.lock().remove(key).is_none() {
            return Err(api_error(404, "NotFound"));
        }
        Writes::bump(&self.writes.deletes);
        self.notify(key, true);
        Ok(())
    }
}

impl Notifier for MemoryObjects {
    fn subscribe(&self, handler: Handler) -> Subscription {
        self.subscribers.subscribe(handler)
    }

    fn has_synced(&self) -> bool {
        true
    }
}

/// Typed cache view over `MemoryObjects` for one namespace
pub struct ObjectLister<K> {
    objects: Arc<MemoryObjects>,
    namespace: String,
    _kind: std::marker::PhantomData<fn() -> K>,
}

impl<K> ObjectLister<K> {
    pub fn new(objects: &Arc<MemoryObjects>, namespace: &str) -> Arc<Self> {
        Arc::new(Self {
            objects: objects.clone(),
            namespace: namespace.to_string(),
            _kind: std::marker::PhantomData,
        })
    }
}

/// Managed kinds readable through an `ObjectLister`
pub trait Cached: Sized {
    const KIND: ObjectKind;
    fn unwrap(obj: ManagedObject) -> Option<Self>;
}

macro_rules! cached {
    ($($ty:ident),*) => {
        $(impl Cached for $ty {
            const KIND: ObjectKind = ObjectKind::$ty;
            fn unwrap(obj: ManagedObject) -> Option<Self> {
                match obj {
                    ManagedObject::$ty(o) => Some(o),
                    _ => None,
                }
            }
        })*
    };
}

cached!(Deployment, ConfigMap, Secret, CronJob);

impl<K: Send + Sync> Notifier for ObjectLister<K> {
    fn subscribe(&self, handler: Handler) -> Subscription {
        self.objects.subscribe(handler)
    }

    fn has_synced(&self) -> bool {
        true
    }
}

impl<K: Cached + Send + Sync> Lister<K> for ObjectLister<K> {
    fn get(&self, name: &str) -> Option<Arc<K>> {
        let key = ObjectKey::namespaced(K::KIND, &self.namespace, name);
        self.objects.get_now(&key).and_then(K::unwrap).map(Arc::new)
    }

    fn list(&self) -> Vec<Arc<K>> {
        self.objects
            .keys()
            .into_iter()
            .filter(|k| k.kind == K::KIND)
            .filter_map(|k| self.objects.get_now(&k))
            .filter_map(K::unwrap)
            .map(Arc::new)
            .collect()
    }
}
