//! Managed objects: the closed set of kinds a generator may produce
//!
//! Every kind supports the same capability set: identity, checksum of the
//! desired state, and merging desired state onto the live object while
//! preserving fields the cluster owns.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::controller::error::Result;
use crate::crd::Route;

/// Expands `$body` once per variant with `$obj` bound to the inner object
macro_rules! each_object {
    ($value:expr, $obj:ident => $body:expr) => {
        match $value {
            ManagedObject::ServiceAccount($obj) => $body,
            ManagedObject::ClusterRole($obj) => $body,
            ManagedObject::ClusterRoleBinding($obj) => $body,
            ManagedObject::ConfigMap($obj) => $body,
            ManagedObject::Secret($obj) => $body,
            ManagedObject::Service($obj) => $body,
            ManagedObject::PodDisruptionBudget($obj) => $body,
            ManagedObject::Deployment($obj) => $body,
            ManagedObject::Route($obj) => $body,
            ManagedObject::CronJob($obj) => $body,
        }
    };
}

/// Like `each_object!`, but re-wraps the result in the same variant
macro_rules! map_object {
    ($value:expr, $obj:ident => $body:expr) => {
        match $value {
            ManagedObject::ServiceAccount($obj) => ManagedObject::ServiceAccount($body),
            ManagedObject::ClusterRole($obj) => ManagedObject::ClusterRole($body),
            ManagedObject::ClusterRoleBinding($obj) => ManagedObject::ClusterRoleBinding($body),
            ManagedObject::ConfigMap($obj) => ManagedObject::ConfigMap($body),
            ManagedObject::Secret($obj) => ManagedObject::Secret($body),
            ManagedObject::Service($obj) => ManagedObject::Service($body),
            ManagedObject::PodDisruptionBudget($obj) => ManagedObject::PodDisruptionBudget($body),
            ManagedObject::Deployment($obj) => ManagedObject::Deployment($body),
            ManagedObject::Route($obj) => ManagedObject::Route($body),
            ManagedObject::CronJob($obj) => ManagedObject::CronJob($body),
        }
    };
}

pub(crate) use map_object;

/// Kind tag of a managed object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    ServiceAccount,
    ClusterRole,
    ClusterRoleBinding,
    ConfigMap,
    Secret,
    Service,
    PodDisruptionBudget,
    Deployment,
    Route,
    CronJob,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 10] = [
        ObjectKind::ServiceAccount,
        ObjectKind::ClusterRole,
        ObjectKind::ClusterRoleBinding,
        ObjectKind::ConfigMap,
        ObjectKind::Secret,
        ObjectKind::Service,
        ObjectKind::PodDisruptionBudget,
        ObjectKind::Deployment,
        ObjectKind::Route,
        ObjectKind::CronJob,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::ServiceAccount => "ServiceAccount",
            ObjectKind::ClusterRole => "ClusterRole",
            ObjectKind::ClusterRoleBinding => "ClusterRoleBinding",
            ObjectKind::ConfigMap => "ConfigMap",
            ObjectKind::Secret => "Secret",
            ObjectKind::Service => "Service",
            ObjectKind::PodDisruptionBudget => "PodDisruptionBudget",
            ObjectKind::Deployment => "Deployment",
            ObjectKind::Route => "Route",
            ObjectKind::CronJob => "CronJob",
        }
    }

    pub fn is_namespaced(self) -> bool {
        !matches!(self, ObjectKind::ClusterRole | ObjectKind::ClusterRoleBinding)
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a managed object in the store
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: ObjectKind, namespace: Option<&str>, name: &str) -> Self {
        Self {
            kind,
            namespace: if kind.is_namespaced() {
                namespace.map(str::to_string)
            } else {
                None
            },
            name: name.to_string(),
        }
    }

    pub fn namespaced(kind: ObjectKind, namespace: &str, name: &str) -> Self {
        Self::new(kind, Some(namespace), name)
    }

    pub fn cluster(kind: ObjectKind, name: &str) -> Self {
        Self::new(kind, None, name)
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// A subordinate object the operator owns
#[derive(Clone, Debug, PartialEq)]
pub enum ManagedObject {
    ServiceAccount(ServiceAccount),
    ClusterRole(ClusterRole),
    ClusterRoleBinding(ClusterRoleBinding),
    ConfigMap(ConfigMap),
    Secret(Secret),
    Service(Service),
    PodDisruptionBudget(PodDisruptionBudget),
    Deployment(Deployment),
    Route(Route),
    CronJob(CronJob),
}

impl ManagedObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ManagedObject::ServiceAccount(_) => ObjectKind::ServiceAccount,
            ManagedObject::ClusterRole(_) => ObjectKind::ClusterRole,
            ManagedObject::ClusterRoleBinding(_) => ObjectKind::ClusterRoleBinding,
            ManagedObject::ConfigMap(_) => ObjectKind::ConfigMap,
            ManagedObject::Secret(_) => ObjectKind::Secret,
            ManagedObject::Service(_) => ObjectKind::Service,
            ManagedObject::PodDisruptionBudget(_) => ObjectKind::PodDisruptionBudget,
            ManagedObject::Deployment(_) => ObjectKind::Deployment,
            ManagedObject::Route(_) => ObjectKind::Route,
            ManagedObject::CronJob(_) => ObjectKind::CronJob,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        each_object!(self, o => &o.metadata)
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        each_object!(self, o => &mut o.metadata)
    }

    pub fn name(&self) -> &str {
        self.meta().name.as_deref().unwrap_or_default()
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.kind(), self.meta().namespace.as_deref(), self.name())
    }

    pub fn annotation(&self, name: &str) -> Option<&str> {
        self.meta()
            .annotations
            .as_ref()
            .and_then(|a| a.get(name))
            .map(String::as_str)
    }

    pub fn set_annotation(&mut self, name: &str, value: &str) {
        self.meta_mut()
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(name.to_string(), value.to_string());
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.meta()
            .labels
            .as_ref()
            .and_then(|l| l.get(name))
            .map(String::as_str)
    }

    pub fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    fn to_value(&self) -> Result<Value> {
        Ok(each_object!(self, o => serde_json::to_value(o)?))
    }

    /// Hex SHA-256 of the desired state
    ///
    /// Status, server-populated metadata and the checksum annotation itself
    /// are excluded so the value only depends on what the generator decided.
    pub fn checksum(&self, checksum_annotation: &str) -> Result<String> {
        let mut value = self.to_value()?;
        if let Value::Object(root) = &mut value {
            root.remove("status");
            if let Some(Value::Object(meta)) = root.get_mut("metadata") {
                for field in [
                    "resourceVersion",
                    "uid",
                    "generation",
                    "creationTimestamp",
                    "deletionTimestamp",
                    "deletionGracePeriodSeconds",
                    "managedFields",
                    "finalizers",
                ] {
                    meta.remove(field);
                }
                if let Some(Value::Object(annotations)) = meta.get_mut("annotations") {
                    annotations.remove(checksum_annotation);
                    if annotations.is_empty() {
                        meta.remove("annotations");
                    }
                }
            }
        }
        let bytes = serde_json::to_vec(&value)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Overlay the mutable fields of `self` (desired) onto `current` (live)
    ///
    /// The result keeps the live object's resourceVersion and every field the
    /// cluster assigns, so it can be written back with optimistic concurrency.
    /// Returns `None` when the kinds differ.
    pub fn merge_onto(&self, current: &ManagedObject) -> Option<ManagedObject> {
        let merged = match (self, current) {
            (ManagedObject::ServiceAccount(d), ManagedObject::ServiceAccount(c)) => {
                let mut out = d.clone();
                out.metadata = merge_meta(&d.metadata, &c.metadata);
                if out.secrets.is_none() {
                    out.secrets = c.secrets.clone();
                }
                if out.image_pull_secrets.is_none() {
                    out.image_pull_secrets = c.image_pull_secrets.clone();
                }
                ManagedObject::ServiceAccount(out)
            }
            (ManagedObject::ClusterRole(d), ManagedObject::ClusterRole(c)) => {
                let mut out = d.clone();
                out.metadata = merge_meta(&d.metadata, &c.metadata);
                ManagedObject::ClusterRole(out)
            }
            (ManagedObject::ClusterRoleBinding(d), ManagedObject::ClusterRoleBinding(c)) => {
                let mut out = d.clone();
                out.metadata = merge_meta(&d.metadata, &c.metadata);
                // roleRef is immutable once created
                out.role_ref = c.role_ref.clone();
                ManagedObject::ClusterRoleBinding(out)
            }
            (ManagedObject::ConfigMap(d), ManagedObject::ConfigMap(c)) => {
                let mut out = d.clone();
                out.metadata = merge_meta(&d.metadata, &c.metadata);
                // data left unset is owned by an injector
                if out.data.is_none() {
                    out.data = c.data.clone();
                }
                if out.binary_data.is_none() {
                    out.binary_data = c.binary_data.clone();
                }
                ManagedObject::ConfigMap(out)
            }
            (ManagedObject::Secret(d), ManagedObject::Secret(c)) => {
                let mut out = d.clone();
                out.metadata = merge_meta(&d.metadata, &c.metadata);
                out.type_ = c.type_.clone();
                // keys written by others (credentials) survive
                let mut data = c.data.clone().unwrap_or_default();
                data.extend(d.data.clone().unwrap_or_default());
                out.data = if data.is_empty() { None } else { Some(data) };
                ManagedObject::Secret(out)
            }
            (ManagedObject::Service(d), ManagedObject::Service(c)) => {
                let mut out = d.clone();
                out.metadata = merge_meta(&d.metadata, &c.metadata);
                out.status = c.status.clone();
                if let (Some(spec), Some(live)) = (out.spec.as_mut(), c.spec.as_ref()) {
                    spec.cluster_ip = live.cluster_ip.clone();
                    spec.cluster_ips = live.cluster_ips.clone();
                    spec.ip_families = live.ip_families.clone();
                    if spec.ip_family_policy.is_none() {
                        spec.ip_family_policy = live.ip_family_policy.clone();
                    }
                    if spec.health_check_node_port.is_none() {
                        spec.health_check_node_port = live.health_check_node_port;
                    }
                    if let (Some(ports), Some(live_ports)) =
                        (spec.ports.as_mut(), live.ports.as_ref())
                    {
                        for port in ports.iter_mut().filter(|p| p.node_port.is_none()) {
                            port.node_port = live_ports
                                .iter()
                                .find(|lp| lp.port == port.port && lp.name == port.name)
                                .and_then(|lp| lp.node_port);
                        }
                    }
                }
                ManagedObject::Service(out)
            }
            (ManagedObject::PodDisruptionBudget(d), ManagedObject::PodDisruptionBudget(c)) => {
                let mut out = d.clone();
                out.metadata = merge_meta(&d.metadata, &c.metadata);
                out.status = c.status.clone();
                ManagedObject::PodDisruptionBudget(out)
            }
            (ManagedObject::Deployment(d), ManagedObject::Deployment(c)) => {
                let mut out = d.clone();
                out.metadata = merge_meta(&d.metadata, &c.metadata);
                out.status = c.status.clone();
                ManagedObject::Deployment(out)
            }
            (ManagedObject::Route(d), ManagedObject::Route(c)) => {
                let mut out = d.clone();
                out.metadata = merge_meta(&d.metadata, &c.metadata);
                // host is assigned by the router when left empty
                if out.spec.host.is_none() {
                    out.spec.host = c.spec.host.clone();
                }
                ManagedObject::Route(out)
            }
            (ManagedObject::CronJob(d), ManagedObject::CronJob(c)) => {
                let mut out = d.clone();
                out.metadata = merge_meta(&d.metadata, &c.metadata);
                out.status = c.status.clone();
                ManagedObject::CronJob(out)
            }
            _ => return None,
        };
        Some(merged)
    }
}

fn merge_maps(
    live: &Option<BTreeMap<String, String>>,
    desired: &Option<BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    match (live, desired) {
        (None, None) => None,
        _ => {
            let mut out = live.clone().unwrap_or_default();
            out.extend(desired.clone().unwrap_or_default());
            Some(out)
        }
    }
}

/// Live metadata with desired labels, annotations and owners layered on top
fn merge_meta(desired: &ObjectMeta, live: &ObjectMeta) -> ObjectMeta {
    let mut meta = live.clone();
    meta.labels = merge_maps(&live.labels, &desired.labels);
    meta.annotations = merge_maps(&live.annotations, &desired.annotations);
    if desired.owner_references.is_some() {
        meta.owner_references = desired.owner_references.clone();
    }
    meta
}
