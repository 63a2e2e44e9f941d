//! Generated objects and how the applier converges on them

use std::sync::atomic::Ordering;

use image_registry_operator::controller::{
    Applier, ApplyConfig, ClusterContext, Generator, ManagedObject, ObjectKind,
};
use image_registry_operator::crd::{ImageRegistry, PlatformType, RolloutStrategy};
use image_registry_operator::resources::RegistryGenerator;
use image_registry_operator::resources::deployment::{DEPENDENCIES_CHECKSUM_ANNOTATION, DEPLOYMENT_NAME};
use image_registry_operator::resources::route::DEFAULT_ROUTE_NAME;
use image_registry_operator::storage;

use crate::common::*;

fn cluster_context() -> ClusterContext {
    ClusterContext::new(TEST_NAMESPACE, "registry:test", "cli:test")
        .with_infrastructure(Some(&infrastructure(PlatformType::Aws)))
}

fn completed(mut registry: ImageRegistry) -> ImageRegistry {
    storage::complete_configuration(&mut registry, &cluster_context()).expect("storage defaults");
    registry
}

fn generate(registry: &ImageRegistry) -> Vec<ManagedObject> {
    RegistryGenerator
        .generate(registry, &cluster_context())
        .expect("generate")
}

fn deployment(objects: &[ManagedObject]) -> &k8s_openapi::api::apps::v1::Deployment {
    objects
        .iter()
        .find_map(|o| match o {
            ManagedObject::Deployment(d) => Some(d),
            _ => None,
        })
        .expect("deployment")
}

fn pod_checksum(objects: &[ManagedObject]) -> String {
    deployment(objects)
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.annotations.as_ref())
        .and_then(|a| a.get(DEPENDENCIES_CHECKSUM_ANNOTATION))
        .cloned()
        .expect("checksum annotation")
}

#[test]
fn test_generation_is_deterministic() {
    let registry = completed(ImageRegistryBuilder::s3(TEST_REGION).with_default_route().build());
    assert_eq!(generate(&registry), generate(&registry));
}

#[test]
fn test_objects_follow_dependency_order() {
    let registry = completed(ImageRegistryBuilder::s3(TEST_REGION).with_default_route().build());
    let kinds: Vec<ObjectKind> = generate(&registry).iter().map(ManagedObject::kind).collect();

    let position = |kind| kinds.iter().position(|k| *k == kind).expect("kind present");
    assert!(position(ObjectKind::ServiceAccount) < position(ObjectKind::Deployment));
    assert!(position(ObjectKind::ConfigMap) < position(ObjectKind::Deployment));
    assert!(position(ObjectKind::Secret) < position(ObjectKind::Deployment));
    assert!(position(ObjectKind::Deployment) < position(ObjectKind::Route));
}

#[test]
fn test_single_replica_storage_has_no_disruption_budget() {
    let s3 = generate(&completed(ImageRegistryBuilder::s3(TEST_REGION).build()));
    let pvc = generate(&completed(ImageRegistryBuilder::pvc().build()));

    assert!(s3.iter().any(|o| o.kind() == ObjectKind::PodDisruptionBudget));
    assert!(!pvc.iter().any(|o| o.kind() == ObjectKind::PodDisruptionBudget));
}

#[test]
fn test_claim_storage_recreates_pods() {
    let registry = completed(ImageRegistryBuilder::pvc().build());
    assert_eq!(registry.spec.rollout_strategy, Some(RolloutStrategy::Recreate));

    let strategy = deployment(&generate(&registry))
        .spec
        .as_ref()
        .and_then(|s| s.strategy.as_ref())
        .and_then(|s| s.type_.clone());
    assert_eq!(strategy.as_deref(), Some("Recreate"));
}

#[test]
fn test_http_secret_change_rolls_pods() {
    let registry = completed(ImageRegistryBuilder::s3(TEST_REGION).build());
    let mut rotated = registry.clone();
    rotated.spec.http_secret = "fedcba9876543210".to_string();

    assert_ne!(pod_checksum(&generate(&registry)), pod_checksum(&generate(&rotated)));
}

#[tokio::test]
async fn test_reapply_is_a_no_op() {
    let objects = MemoryObjects::new();
    let applier = Applier::new(objects.clone(), ApplyConfig::default());
    let desired = generate(&completed(ImageRegistryBuilder::s3(TEST_REGION).build()));

    let written = applier.apply_all(&desired).await.expect("first apply");
    assert_eq!(written.len(), desired.len());

    let written = applier.apply_all(&desired).await.expect("second apply");
    assert!(written.is_empty());
    assert_eq!(objects.writes.updates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_injected_bundle_survives_reapply() {
    let cluster = TestCluster::new(PlatformType::Aws);
    let applier = Applier::new(cluster.objects.clone(), ApplyConfig::default());
    let registry = completed(ImageRegistryBuilder::s3(TEST_REGION).build());
    applier.apply_all(&generate(&registry)).await.expect("apply");
    cluster.inject_trusted_ca();

    // a spec change forces an update of every changed object
    let mut scaled = registry.clone();
    scaled.spec.replicas = 4;
    applier.apply_all(&generate(&scaled)).await.expect("reapply");

    let key = cluster.key(ObjectKind::ConfigMap, "trusted-ca");
    match cluster.objects.get_now(&key) {
        Some(ManagedObject::ConfigMap(cm)) => assert!(cm.data.is_some_and(|d| !d.is_empty())),
        other => panic!("expected config map, got {:?}", other),
    }
    assert!(cluster.has(ObjectKind::Deployment, DEPLOYMENT_NAME));
}

#[tokio::test]
async fn test_dropped_route_is_pruned() {
    let objects = MemoryObjects::new();
    let applier = Applier::new(objects.clone(), ApplyConfig::default());
    let generator = RegistryGenerator;
    let with_route = completed(ImageRegistryBuilder::s3(TEST_REGION).with_default_route().build());
    applier.apply_all(&generate(&with_route)).await.expect("apply");
    assert_eq!(objects.count(ObjectKind::Route), 1);

    let mut without = with_route.clone();
    without.spec.default_route = false;
    let desired = generate(&without);
    applier.apply_all(&desired).await.expect("apply");
    let pruned = applier
        .prune_stale(
            &desired,
            generator.managed_kinds(),
            TEST_NAMESPACE,
            &generator.selector(),
        )
        .await
        .expect("prune");

    assert_eq!(pruned.len(), 1);
    assert_eq!(pruned[0].name, DEFAULT_ROUTE_NAME);
    assert_eq!(objects.count(ObjectKind::Route), 0);
}
