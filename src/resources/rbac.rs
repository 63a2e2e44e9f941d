//! Service accounts and cluster RBAC for the registry and the pruner

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use crate::resources::common::object_meta;

pub fn service_account(
    name: &str,
    namespace: &str,
    component: &str,
    owner: &OwnerReference,
) -> ServiceAccount {
    ServiceAccount {
        metadata: object_meta(name, Some(namespace), component, owner),
        ..Default::default()
    }
}

pub fn cluster_role(
    name: &str,
    rules: Vec<PolicyRule>,
    component: &str,
    owner: &OwnerReference,
) -> ClusterRole {
    ClusterRole {
        metadata: object_meta(name, None, component, owner),
        rules: Some(rules),
        ..Default::default()
    }
}

/// Bind a cluster role to a service account
pub fn cluster_role_binding(
    name: &str,
    role: &str,
    service_account: &str,
    namespace: &str,
    component: &str,
    owner: &OwnerReference,
) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: object_meta(name, None, component, owner),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: role.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}

fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    PolicyRule {
        api_groups: Some(owned(groups)),
        resources: Some(owned(resources)),
        verbs: owned(verbs),
        ..Default::default()
    }
}

/// Permissions the registry needs to serve and authorize image pulls
pub fn registry_rules() -> Vec<PolicyRule> {
    vec![
        rule(&[""], &["limitranges", "resourcequotas"], &["list"]),
        rule(
            &["", "image.openshift.io"],
            &["imagestreamimages", "imagestreams/secrets", "imagestreamtags", "imagetags"],
            &["get"],
        ),
        rule(
            &["", "image.openshift.io"],
            &["imagestreams", "images"],
            &["get", "list", "watch"],
        ),
        rule(
            &["", "image.openshift.io"],
            &["imagestreams/layers"],
            &["get"],
        ),
        rule(
            &["", "image.openshift.io"],
            &["imagestreammappings", "images"],
            &["create", "update", "delete"],
        ),
        rule(&["", "image.openshift.io"], &["images"], &["patch"]),
        rule(
            &["authorization.k8s.io"],
            &["subjectaccessreviews"],
            &["create"],
        ),
    ]
}

/// Permissions the pruner job needs to find and delete unreferenced images
pub fn pruner_rules() -> Vec<PolicyRule> {
    vec![
        rule(
            &[""],
            &["pods", "replicationcontrollers", "namespaces"],
            &["list"],
        ),
        rule(
            &["apps"],
            &["daemonsets", "deployments", "replicasets", "statefulsets"],
            &["list"],
        ),
        rule(&["batch"], &["cronjobs", "jobs"], &["list"]),
        rule(&["build.openshift.io"], &["builds", "buildconfigs"], &["list"]),
        rule(&["apps.openshift.io"], &["deploymentconfigs"], &["list"]),
        rule(
            &["image.openshift.io"],
            &["images", "imagestreams"],
            &["get", "list", "watch", "delete", "update"],
        ),
        rule(&["image.openshift.io"], &["imagestreams/status"], &["update"]),
    ]
}
