//! Finalizer protocol against the in-memory store

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;

use image_registry_operator::controller::finalizer::{
    FinalizerCoordinator, FinalizerSettings, TeardownScope,
};
use image_registry_operator::controller::error::{API_SERVER_RETRY_AFTER, Result};
use image_registry_operator::controller::{
    Applier, ApplyConfig, ClusterContext, Error, Generator, ManagedObject, ObjectKey, ObjectKind,
    ObjectStore, REGISTRY_FINALIZER, RESOURCE_NAME, ResourceStore,
};
use image_registry_operator::crd::ImageRegistry;
use image_registry_operator::resources::RegistryGenerator;
use image_registry_operator::storage;
use kube::ResourceExt;
use kube::core::ErrorResponse;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::common::*;

struct Harness {
    registries: Arc<MemoryResources<ImageRegistry>>,
    objects: Arc<MemoryObjects>,
    coordinator: FinalizerCoordinator<ImageRegistry>,
    scope: TeardownScope,
}

fn harness(max_wait: Option<Duration>) -> Harness {
    let registries = MemoryResources::<ImageRegistry>::new();
    let objects = MemoryObjects::new();
    let applier = Applier::new(objects.clone(), ApplyConfig::default());
    let mut settings = FinalizerSettings::new(REGISTRY_FINALIZER);
    settings.poll_interval = Duration::from_millis(5);
    settings.max_wait = max_wait;
    let generator = RegistryGenerator;
    Harness {
        coordinator: FinalizerCoordinator::new(registries.clone(), applier, settings),
        registries,
        objects,
        scope: TeardownScope {
            kinds: generator.managed_kinds(),
            namespace: TEST_NAMESPACE.to_string(),
            selector: generator.selector(),
        },
    }
}

/// Seed a registry and every object it generates
async fn deployed(h: &Harness, mut registry: ImageRegistry) {
    let ctx = ClusterContext::new(TEST_NAMESPACE, "registry:test", "cli:test");
    storage::complete_configuration(&mut registry, &ctx).expect("storage defaults");
    let desired = RegistryGenerator.generate(&registry, &ctx).expect("generate");
    let applier = Applier::new(h.objects.clone(), ApplyConfig::default());
    applier.apply_all(&desired).await.expect("apply");
    h.registries.seed(registry);
}

#[test]
fn test_add_finalizer_is_idempotent() {
    let h = harness(None);
    let mut registry = ImageRegistryBuilder::pvc().build();

    assert!(h.coordinator.add_finalizer(&mut registry));
    assert!(!h.coordinator.add_finalizer(&mut registry));
    assert_eq!(registry.finalizers(), &[REGISTRY_FINALIZER.to_string()]);
    assert!(h.coordinator.has_finalizer(&registry));
}

#[tokio::test]
async fn test_finalize_tears_down_and_waits_for_removal() {
    let h = harness(Some(Duration::from_secs(1)));
    deployed(&h, ImageRegistryBuilder::pvc().with_finalizer(REGISTRY_FINALIZER).build()).await;
    assert!(h.objects.count(ObjectKind::Deployment) == 1);

    ResourceStore::delete(h.registries.as_ref(), RESOURCE_NAME)
        .await
        .expect("delete");
    h.coordinator
        .finalize(RESOURCE_NAME, &h.scope, &CancellationToken::new())
        .await
        .expect("finalize");

    assert!(h.objects.is_empty());
    assert!(!h.registries.contains(RESOURCE_NAME));
}

#[tokio::test]
async fn test_remove_finalizer_reports_absence() {
    let h = harness(None);
    assert!(!h.coordinator.remove_finalizer(RESOURCE_NAME).await.expect("missing resource"));

    h.registries.seed(ImageRegistryBuilder::pvc().with_finalizer("example.com/other").build());
    assert!(!h.coordinator.remove_finalizer(RESOURCE_NAME).await.expect("foreign finalizer"));
    assert_eq!(
        h.registries.get_now(RESOURCE_NAME).expect("registry").finalizers(),
        &["example.com/other".to_string()]
    );
}

#[tokio::test]
async fn test_foreign_finalizer_times_out_the_wait() {
    let h = harness(Some(Duration::from_millis(50)));
    deployed(
        &h,
        ImageRegistryBuilder::pvc()
            .with_finalizer(REGISTRY_FINALIZER)
            .with_finalizer("example.com/other")
            .build(),
    )
    .await;
    ResourceStore::delete(h.registries.as_ref(), RESOURCE_NAME)
        .await
        .expect("delete");

    let err = h
        .coordinator
        .finalize(RESOURCE_NAME, &h.scope, &CancellationToken::new())
        .await
        .expect_err("another finalizer holds the resource");

    assert!(matches!(err, Error::Timeout(_)), "got {:?}", err);
    // our part is done even though the resource stays
    assert!(h.objects.is_empty());
    let registry = h.registries.get_now(RESOURCE_NAME).expect("still present");
    assert_eq!(registry.finalizers(), &["example.com/other".to_string()]);
}

#[tokio::test]
async fn test_cancelled_wait_returns_cancelled() {
    let h = harness(None);
    h.registries.seed(ImageRegistryBuilder::pvc().with_finalizer("example.com/other").build());
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        child.cancel();
    });

    let err = h
        .coordinator
        .wait_for_deletion(RESOURCE_NAME, &token)
        .await
        .expect_err("cancelled");
    assert!(matches!(err, Error::Cancelled));
}

#[tokio::test]
async fn test_finalize_with_cancelled_token_does_nothing() {
    let h = harness(None);
    deployed(&h, ImageRegistryBuilder::pvc().with_finalizer(REGISTRY_FINALIZER).build()).await;
    let token = CancellationToken::new();
    token.cancel();

    let err = h
        .coordinator
        .finalize(RESOURCE_NAME, &h.scope, &token)
        .await
        .expect_err("cancelled");
    assert!(matches!(err, Error::Cancelled));
    assert!(!h.objects.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_wait_rides_out_throttling_and_transient_errors() {
    let h = harness(None);
    let throttled = Error::from(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: "too many requests, please try again later".to_string(),
        reason: "TooManyRequests".to_string(),
        code: 429,
    }));
    h.registries.fail_next_gets([
        throttled,
        Error::TransientError("connection reset by peer".to_string()),
        Error::TransientError("connection reset by peer".to_string()),
    ]);

    let start = Instant::now();
    h.coordinator
        .wait_for_deletion(RESOURCE_NAME, &CancellationToken::new())
        .await
        .expect("resource is gone once the API answers");

    // the throttled read waits for the server's hint, the others for one poll
    assert!(start.elapsed() >= API_SERVER_RETRY_AFTER + Duration::from_millis(10));
    assert!(start.elapsed() < API_SERVER_RETRY_AFTER * 2);
}

#[tokio::test]
async fn test_wait_stops_on_non_transient_error() {
    let h = harness(None);
    h.registries.fail_next_gets([Error::InvalidConfig("bad selector".to_string())]);

    let err = h
        .coordinator
        .wait_for_deletion(RESOURCE_NAME, &CancellationToken::new())
        .await
        .expect_err("not retried");
    assert!(matches!(err, Error::InvalidConfig(_)));
}

#[tokio::test(start_paused = true)]
async fn test_remove_finalizer_rereads_after_concurrent_write() {
    let h = harness(None);
    h.registries
        .seed(ImageRegistryBuilder::pvc().with_finalizer(REGISTRY_FINALIZER).build());
    h.registries.race_next_update(|registry| {
        registry
            .metadata
            .finalizers
            .get_or_insert_with(Vec::new)
            .push("example.com/other".to_string());
    });

    assert!(h.coordinator.remove_finalizer(RESOURCE_NAME).await.expect("removed"));

    // the competing finalizer survives; only ours is dropped
    let registry = h.registries.get_now(RESOURCE_NAME).expect("registry");
    assert_eq!(registry.finalizers(), &["example.com/other".to_string()]);
    assert_eq!(h.registries.writes.updates.load(Ordering::SeqCst), 1);
}

/// Accepts every call and never answers
struct StalledObjects;

#[async_trait]
impl ObjectStore for StalledObjects {
    async fn get(&self, _key: &ObjectKey) -> Result<Option<ManagedObject>> {
        std::future::pending().await
    }

    async fn list(&self, _kind: ObjectKind, _namespace: &str, _selector: &str) -> Result<Vec<ManagedObject>> {
        std::future::pending().await
    }

    async fn create(&self, _obj: &ManagedObject) -> Result<ManagedObject> {
        std::future::pending().await
    }

    async fn update(&self, _obj: &ManagedObject) -> Result<ManagedObject> {
        std::future::pending().await
    }

    async fn delete(&self, _key: &ObjectKey) -> Result<()> {
        std::future::pending().await
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_interrupts_stalled_teardown() {
    let h = harness(None);
    h.registries
        .seed(ImageRegistryBuilder::pvc().with_finalizer(REGISTRY_FINALIZER).build());
    let applier = Applier::new(Arc::new(StalledObjects), ApplyConfig::default());
    let coordinator = FinalizerCoordinator::new(
        h.registries.clone(),
        applier,
        FinalizerSettings::new(REGISTRY_FINALIZER),
    );

    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        child.cancel();
    });

    let err = tokio::time::timeout(
        Duration::from_secs(60),
        coordinator.finalize(RESOURCE_NAME, &h.scope, &token),
    )
    .await
    .expect("finalize returns after cancel")
    .expect_err("cancelled");
    assert!(matches!(err, Error::Cancelled));
    // the finalizer is kept so the next leader finishes the job
    assert!(h.registries.get_now(RESOURCE_NAME).is_some_and(|r| !r.finalizers().is_empty()));
}
