//! Common utilities for managed object generation
//!
//! Shared labels, owner references and metadata so every generated object
//! can be found again by label selector during diffing and teardown.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

/// Operator field manager name and `managed-by` label value
pub const FIELD_MANAGER: &str = "image-registry-operator";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";

/// Component label value for the registry workload and its dependencies
pub const REGISTRY_COMPONENT: &str = "registry";

/// Component label value for the image pruner
pub const PRUNER_COMPONENT: &str = "pruner";

/// Generate an owner reference pointing at a custom resource
///
/// The owner is cluster-scoped, so it may own objects in any namespace.
pub fn owner_reference<K>(owner: &K) -> OwnerReference
where
    K: Resource<DynamicType = ()>,
{
    OwnerReference {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        name: owner.name_any(),
        uid: owner.meta().uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Labels carried by every object of a component
pub fn standard_labels(component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string()),
        (COMPONENT_LABEL.to_string(), component.to_string()),
    ])
}

/// Label selector matching `standard_labels(component)`
pub fn component_selector(component: &str) -> String {
    format!(
        "{}={},{}={}",
        MANAGED_BY_LABEL, FIELD_MANAGER, COMPONENT_LABEL, component
    )
}

/// Metadata for a generated object
pub fn object_meta(
    name: &str,
    namespace: Option<&str>,
    component: &str,
    owner: &OwnerReference,
) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(standard_labels(component)),
        owner_references: Some(vec![owner.clone()]),
        ..Default::default()
    }
}
