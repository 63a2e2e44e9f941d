//! Registry controller passes against an in-memory cluster

use std::sync::atomic::Ordering;
use std::time::Duration;

use image_registry_operator::controller::conditions::condition_types;
use image_registry_operator::controller::runner::Reconciler;
use image_registry_operator::controller::status::REASON_TRUSTED_CA_NOT_INJECTED;
use image_registry_operator::controller::{
    ManagedObject, ObjectKind, REGISTRY_FINALIZER, RESOURCE_NAME, RegistryController,
    ResourceStore,
};
use image_registry_operator::crd::{
    Condition, ConditionStatus, ImageRegistry, ManagementState, PlatformType, find_condition,
};
use image_registry_operator::resources::deployment::DEPLOYMENT_NAME;
use image_registry_operator::resources::registry::DUPLICATE_ROUTE_REASON;
use image_registry_operator::resources::service::SERVICE_NAME;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;

use crate::common::*;

fn conditions(registry: &ImageRegistry) -> Vec<Condition> {
    registry
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default()
}

fn condition(registry: &ImageRegistry, type_: &str) -> Condition {
    find_condition(&conditions(registry), type_)
        .cloned()
        .unwrap_or_else(|| panic!("condition {} missing", type_))
}

fn writes(cluster: &TestCluster) -> usize {
    cluster.registries.writes.total() + cluster.objects.writes.total()
}

async fn sync(controller: &RegistryController) {
    controller
        .sync(&CancellationToken::new())
        .await
        .expect("sync succeeds");
}

/// Seed a registry and run one pass
async fn seeded(platform: PlatformType, registry: ImageRegistry) -> (TestCluster, RegistryController) {
    let cluster = TestCluster::new(platform);
    cluster.registries.seed(registry);
    let controller = RegistryController::new(cluster.ctx.clone());
    sync(&controller).await;
    (cluster, controller)
}

#[tokio::test]
async fn test_bootstrap_creates_default_registry() {
    let cluster = TestCluster::new(PlatformType::Aws);
    let controller = RegistryController::new(cluster.ctx.clone());

    sync(&controller).await;

    let registry = cluster.registry();
    assert_eq!(registry.spec.management_state, ManagementState::Managed);
    assert_eq!(registry.spec.replicas, 2);
    assert!(registry.spec.storage.s3.is_some());
    assert!(registry.finalizers().contains(&REGISTRY_FINALIZER.to_string()));
    assert_eq!(cluster.registries.writes.creates.load(Ordering::SeqCst), 1);
    // objects wait for the next pass
    assert!(cluster.objects.is_empty());
}

#[tokio::test]
async fn test_bootstrap_does_not_overwrite_existing_registry() {
    let (cluster, controller) = seeded(
        PlatformType::Aws,
        ImageRegistryBuilder::pvc().with_finalizer(REGISTRY_FINALIZER).build(),
    )
    .await;
    sync(&controller).await;

    assert_eq!(cluster.registries.writes.creates.load(Ordering::SeqCst), 0);
    assert!(cluster.registry().spec.storage.pvc.is_some());
}

#[tokio::test]
async fn test_managed_registry_deploys_and_reports_rollout() {
    let cluster = TestCluster::new(PlatformType::Aws);
    let controller = RegistryController::new(cluster.ctx.clone());
    sync(&controller).await;
    sync(&controller).await;

    assert!(cluster.has(ObjectKind::Deployment, DEPLOYMENT_NAME));
    assert!(cluster.has(ObjectKind::Service, SERVICE_NAME));
    assert!(cluster.objects.count(ObjectKind::ClusterRole) >= 1);

    let registry = cluster.registry();
    let available = condition(&registry, condition_types::AVAILABLE);
    assert_eq!(available.status, ConditionStatus::False);
    assert_eq!(condition(&registry, condition_types::PROGRESSING).status, ConditionStatus::True);
    assert_eq!(registry.status.as_ref().and_then(|s| s.observed_generation), Some(1));

    cluster.roll_out_deployment();
    sync(&controller).await;

    let registry = cluster.registry();
    let available = condition(&registry, condition_types::AVAILABLE);
    assert_eq!((available.status, available.reason.as_str()), (ConditionStatus::True, "Ready"));
    let progressing = condition(&registry, condition_types::PROGRESSING);
    assert_eq!(progressing.status, ConditionStatus::False);
    assert_eq!(registry.status.as_ref().map(|s| s.ready_replicas), Some(2));
}

#[tokio::test]
async fn test_steady_state_pass_writes_nothing() {
    let cluster = TestCluster::new(PlatformType::Aws);
    let controller = RegistryController::new(cluster.ctx.clone());
    sync(&controller).await;
    sync(&controller).await;
    cluster.roll_out_deployment();
    sync(&controller).await;

    let before = writes(&cluster);
    sync(&controller).await;
    sync(&controller).await;
    assert_eq!(writes(&cluster), before);
}

#[tokio::test]
async fn test_transition_time_moves_only_on_flip() {
    let cluster = TestCluster::new(PlatformType::Aws);
    let controller = RegistryController::new(cluster.ctx.clone());
    sync(&controller).await;
    sync(&controller).await;
    let first = condition(&cluster.registry(), condition_types::DEGRADED);

    cluster.clock.advance(Duration::from_secs(30));
    cluster.roll_out_deployment();
    sync(&controller).await;

    let registry = cluster.registry();
    assert_eq!(
        condition(&registry, condition_types::DEGRADED).last_transition_time,
        first.last_transition_time
    );
    assert_ne!(
        condition(&registry, condition_types::AVAILABLE).last_transition_time,
        first.last_transition_time
    );
}

#[tokio::test]
async fn test_duplicate_route_names_degrade_without_retry() {
    let registry = ImageRegistryBuilder::pvc()
        .with_finalizer(REGISTRY_FINALIZER)
        .with_route("custom", None)
        .with_route("custom", None)
        .build();
    let cluster = TestCluster::new(PlatformType::OpenStack);
    cluster.registries.seed(registry);
    let controller = RegistryController::new(cluster.ctx.clone());

    // permanent errors end the pass successfully
    controller
        .sync(&CancellationToken::new())
        .await
        .expect("permanent errors are not retried");

    let registry = cluster.registry();
    let degraded = condition(&registry, condition_types::DEGRADED);
    assert_eq!(degraded.status, ConditionStatus::True);
    assert_eq!(degraded.reason, DUPLICATE_ROUTE_REASON);
    assert_eq!(condition(&registry, condition_types::PROGRESSING).status, ConditionStatus::False);
    assert!(!cluster.has(ObjectKind::Deployment, DEPLOYMENT_NAME));
}

#[tokio::test]
async fn test_missing_route_secret_is_retried() {
    let registry = ImageRegistryBuilder::pvc()
        .with_finalizer(REGISTRY_FINALIZER)
        .with_route("custom", Some("custom-tls"))
        .build();
    let cluster = TestCluster::new(PlatformType::OpenStack);
    cluster.registries.seed(registry);
    let controller = RegistryController::new(cluster.ctx.clone());

    let err = controller
        .sync(&CancellationToken::new())
        .await
        .expect_err("missing secret is retried");
    assert!(err.is_retryable());
    let progressing = condition(&cluster.registry(), condition_types::PROGRESSING);
    assert_eq!((progressing.status, progressing.reason.as_str()), (ConditionStatus::True, "Error"));
}

#[tokio::test]
async fn test_route_certificate_is_read_from_secret() {
    let registry = ImageRegistryBuilder::pvc()
        .with_finalizer(REGISTRY_FINALIZER)
        .with_route("custom", Some("custom-tls"))
        .build();
    let cluster = TestCluster::new(PlatformType::OpenStack);
    cluster.objects.seed(ManagedObject::Secret(Secret {
        metadata: ObjectMeta {
            name: Some("custom-tls".to_string()),
            namespace: Some(TEST_NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some(
            [
                ("tls.crt".to_string(), ByteString(b"CERT".to_vec())),
                ("tls.key".to_string(), ByteString(b"KEY".to_vec())),
            ]
            .into(),
        ),
        ..Default::default()
    }));
    cluster.registries.seed(registry);
    let controller = RegistryController::new(cluster.ctx.clone());
    sync(&controller).await;

    let route = match cluster.objects.get_now(&cluster.key(ObjectKind::Route, "custom")) {
        Some(ManagedObject::Route(route)) => route,
        other => panic!("expected route, got {:?}", other),
    };
    let tls = route.spec.tls.expect("tls");
    assert_eq!(tls.certificate.as_deref(), Some("CERT"));
    assert_eq!(tls.key.as_deref(), Some("KEY"));
    assert_eq!(tls.ca_certificate, None);
    // the user's secret is not ours to manage
    assert!(cluster.has(ObjectKind::Secret, "custom-tls"));
}

#[tokio::test]
async fn test_removed_state_tears_everything_down() {
    let (cluster, controller) = seeded(
        PlatformType::OpenStack,
        ImageRegistryBuilder::pvc().with_finalizer(REGISTRY_FINALIZER).build(),
    )
    .await;
    assert!(cluster.has(ObjectKind::Deployment, DEPLOYMENT_NAME));

    let mut registry = cluster.registry();
    registry.spec.management_state = ManagementState::Removed;
    ResourceStore::update(cluster.registries.as_ref(), &registry)
        .await
        .expect("update");
    sync(&controller).await;

    assert!(cluster.objects.is_empty());
    let registry = cluster.registry();
    let removed = condition(&registry, condition_types::REMOVED);
    assert_eq!(removed.status, ConditionStatus::True);
    let available = condition(&registry, condition_types::AVAILABLE);
    assert_eq!((available.status, available.reason.as_str()), (ConditionStatus::True, "Removed"));
    // the resource itself survives
    assert!(cluster.registries.contains(RESOURCE_NAME));
}

#[tokio::test]
async fn test_unmanaged_registry_is_left_alone() {
    let (cluster, _controller) = seeded(
        PlatformType::OpenStack,
        ImageRegistryBuilder::pvc()
            .with_finalizer(REGISTRY_FINALIZER)
            .with_state(ManagementState::Unmanaged)
            .build(),
    )
    .await;

    assert!(cluster.objects.is_empty());
    let progressing = condition(&cluster.registry(), condition_types::PROGRESSING);
    assert_eq!(progressing.reason, "Unmanaged");
}

#[tokio::test]
async fn test_deletion_tears_down_then_releases_finalizer() {
    let (cluster, controller) = seeded(
        PlatformType::OpenStack,
        ImageRegistryBuilder::pvc().with_finalizer(REGISTRY_FINALIZER).build(),
    )
    .await;
    assert!(!cluster.objects.is_empty());

    ResourceStore::delete(cluster.registries.as_ref(), RESOURCE_NAME)
        .await
        .expect("delete");
    assert!(cluster.registries.contains(RESOURCE_NAME), "held by the finalizer");

    sync(&controller).await;

    assert!(cluster.objects.is_empty());
    assert!(!cluster.registries.contains(RESOURCE_NAME));
}

#[tokio::test]
async fn test_finalizer_is_added_to_existing_registry() {
    let (cluster, _controller) =
        seeded(PlatformType::OpenStack, ImageRegistryBuilder::pvc().build()).await;

    let registry = cluster.registry();
    assert_eq!(registry.finalizers(), &[REGISTRY_FINALIZER.to_string()]);
    // the pvc default fills in the claim and forces Recreate
    assert!(registry.spec.rollout_strategy.is_some());
}

#[tokio::test]
async fn test_status_conflict_is_retried_once() {
    let cluster = TestCluster::new(PlatformType::OpenStack);
    cluster
        .registries
        .seed(ImageRegistryBuilder::pvc().with_finalizer(REGISTRY_FINALIZER).build());
    cluster.registries.status_conflicts.store(1, Ordering::SeqCst);
    let controller = RegistryController::new(cluster.ctx.clone());

    sync(&controller).await;

    assert_eq!(cluster.registries.writes.status_updates.load(Ordering::SeqCst), 1);
    assert!(cluster.registry().status.is_some());
}

#[tokio::test]
async fn test_second_status_conflict_waits_for_next_pass() {
    let cluster = TestCluster::new(PlatformType::OpenStack);
    cluster
        .registries
        .seed(ImageRegistryBuilder::pvc().with_finalizer(REGISTRY_FINALIZER).build());
    cluster.registries.status_conflicts.store(2, Ordering::SeqCst);
    let controller = RegistryController::new(cluster.ctx.clone());

    sync(&controller).await;
    assert_eq!(cluster.registries.writes.status_updates.load(Ordering::SeqCst), 0);

    sync(&controller).await;
    assert_eq!(cluster.registries.writes.status_updates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_spec_write_conflict_aborts_pass_for_requeue() {
    let cluster = TestCluster::new(PlatformType::OpenStack);
    // no finalizer yet, so the pass has to write the spec
    cluster.registries.seed(ImageRegistryBuilder::pvc().build());
    cluster.registries.update_conflicts.store(1, Ordering::SeqCst);
    let controller = RegistryController::new(cluster.ctx.clone());

    let err = controller
        .sync(&CancellationToken::new())
        .await
        .expect_err("conflicting spec write");

    assert!(err.is_conflict());
    assert!(err.is_retryable());
    assert_eq!(cluster.registries.writes.status_updates.load(Ordering::SeqCst), 0);
    assert!(cluster.registry().finalizers().is_empty());

    // the requeued pass starts from the fresh copy and lands
    sync(&controller).await;
    assert_eq!(cluster.registry().finalizers(), &[REGISTRY_FINALIZER.to_string()]);
    assert!(cluster.registry().status.is_some());
}

#[tokio::test]
async fn test_released_registry_pass_keeps_waiting_for_deletion() {
    let cluster = TestCluster::new(PlatformType::OpenStack);
    cluster
        .registries
        .seed(ImageRegistryBuilder::pvc().with_finalizer("example.com/other").build());
    ResourceStore::delete(cluster.registries.as_ref(), RESOURCE_NAME)
        .await
        .expect("delete");
    let controller = RegistryController::new(cluster.ctx.clone());

    let registries = cluster.registries.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        let mut registry = registries.get_now(RESOURCE_NAME).expect("registry");
        registry.metadata.finalizers = None;
        ResourceStore::update(registries.as_ref(), &registry)
            .await
            .expect("release other finalizer");
    });

    sync(&controller).await;
    assert!(!cluster.registries.contains(RESOURCE_NAME));
}

#[tokio::test]
async fn test_missing_trust_bundle_degrades_after_grace_period() {
    let (cluster, controller) = seeded(
        PlatformType::OpenStack,
        ImageRegistryBuilder::pvc().with_finalizer(REGISTRY_FINALIZER).build(),
    )
    .await;
    cluster.roll_out_deployment();
    sync(&controller).await;
    assert_eq!(
        condition(&cluster.registry(), condition_types::DEGRADED).status,
        ConditionStatus::False
    );

    cluster.clock.advance(Duration::from_secs(301));
    sync(&controller).await;
    let degraded = condition(&cluster.registry(), condition_types::DEGRADED);
    assert_eq!(degraded.status, ConditionStatus::True);
    assert_eq!(degraded.reason, REASON_TRUSTED_CA_NOT_INJECTED);

    cluster.inject_trusted_ca();
    sync(&controller).await;
    assert_eq!(
        condition(&cluster.registry(), condition_types::DEGRADED).status,
        ConditionStatus::False
    );
}

#[tokio::test]
async fn test_scaling_updates_deployment() {
    let (cluster, controller) = seeded(
        PlatformType::Aws,
        ImageRegistryBuilder::s3(TEST_REGION)
            .with_finalizer(REGISTRY_FINALIZER)
            .build(),
    )
    .await;

    let mut registry = cluster.registry();
    registry.spec.replicas = 3;
    ResourceStore::update(cluster.registries.as_ref(), &registry)
        .await
        .expect("update");
    sync(&controller).await;

    let deployment = match cluster
        .objects
        .get_now(&cluster.key(ObjectKind::Deployment, DEPLOYMENT_NAME))
    {
        Some(ManagedObject::Deployment(d)) => d,
        other => panic!("expected deployment, got {:?}", other),
    };
    assert_eq!(deployment.spec.and_then(|s| s.replicas), Some(3));
    assert_eq!(
        cluster.registry().status.as_ref().and_then(|s| s.observed_generation),
        Some(2)
    );
}
