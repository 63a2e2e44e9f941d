//! PodDisruptionBudget for the registry
//!
//! Only generated with more than one replica; a budget on a single pod would
//! block node drains.

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::resources::common::object_meta;
use crate::resources::service::pod_selector;

pub const PDB_NAME: &str = "image-registry";

/// Keep all but one replica up during voluntary disruptions
pub fn registry_pdb(
    namespace: &str,
    replicas: i32,
    component: &str,
    owner: &OwnerReference,
) -> Option<PodDisruptionBudget> {
    if replicas <= 1 {
        return None;
    }
    Some(PodDisruptionBudget {
        metadata: object_meta(PDB_NAME, Some(namespace), component, owner),
        spec: Some(PodDisruptionBudgetSpec {
            min_available: Some(IntOrString::Int(replicas - 1)),
            selector: Some(LabelSelector {
                match_labels: Some(pod_selector()),
                ..Default::default()
            }),
            unhealthy_pod_eviction_policy: Some("IfHealthyBudget".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}
