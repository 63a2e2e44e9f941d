//! Registry controller: reconciles the `cluster` ImageRegistry
//!
//! One pass reads the cached resource, works on a private copy, applies the
//! generated objects (or tears them down), then writes spec and status back
//! under optimistic concurrency.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::controller::applier::Applier;
use crate::controller::bootstrap::{create_if_absent, default_registry};
use crate::controller::context::{Context, RESOURCE_NAME};
use crate::controller::error::{Error, Result};
use crate::controller::finalizer::{FinalizerCoordinator, FinalizerSettings, TeardownScope};
use crate::controller::generator::{ClusterContext, Generator};
use crate::controller::retry::until_cancelled;
use crate::controller::runner::Reconciler;
use crate::controller::status::{RegistryObservation, WorkloadState, registry_conditions};
use crate::controller::store::update_status_with_retry;
use crate::crd::{ImageRegistry, ImageRegistryStatus, ManagementState};
use crate::resources::RegistryGenerator;
use crate::resources::configmap::{TRUSTED_CA_NAME, has_trusted_ca};
use crate::resources::deployment::DEPLOYMENT_NAME;
use crate::resources::secret::generate_http_secret;
use crate::storage;

pub const REGISTRY_FINALIZER: &str = "imageregistry.operator.openshift.io/finalizer";

const CONTROLLER_NAME: &str = "registry";

pub struct RegistryController {
    ctx: Context,
    generator: RegistryGenerator,
    applier: Applier,
    finalizer: FinalizerCoordinator<ImageRegistry>,
    /// First time the trust bundle was seen missing
    trusted_ca_missing_since: Mutex<Option<DateTime<Utc>>>,
}

impl RegistryController {
    pub fn new(ctx: Context) -> Self {
        let applier = Applier::new(ctx.stores.objects.clone(), ctx.apply.clone());
        let mut settings = FinalizerSettings::new(REGISTRY_FINALIZER);
        settings.poll_interval = ctx.config.finalizer_poll_interval;
        settings.max_wait = ctx.config.finalizer_max_wait;
        let finalizer =
            FinalizerCoordinator::new(ctx.stores.registries.clone(), applier.clone(), settings);
        Self {
            ctx,
            generator: RegistryGenerator,
            applier,
            finalizer,
            trusted_ca_missing_since: Mutex::new(None),
        }
    }

    fn teardown_scope(&self) -> TeardownScope {
        TeardownScope {
            kinds: self.generator.managed_kinds(),
            namespace: self.ctx.namespace().to_string(),
            selector: self.generator.selector(),
        }
    }

    async fn bootstrap(&self) -> Result<()> {
        let cluster = self.ctx.cluster_context();
        let created = create_if_absent(self.ctx.stores.registries.as_ref(), RESOURCE_NAME, || {
            default_registry(RESOURCE_NAME, &cluster, REGISTRY_FINALIZER)
        })
        .await?;
        if created.is_none() {
            debug!("registry already exists, waiting for the cache to catch up");
        }
        Ok(())
    }

    fn cluster_context(&self, registry: &ImageRegistry) -> ClusterContext {
        let mut cluster = self.ctx.cluster_context();
        for route in &registry.spec.routes {
            let Some(secret_name) = &route.secret_name else {
                continue;
            };
            if let Some(cert) = self.ctx.route_certificate(secret_name) {
                cluster.route_certificates.insert(secret_name.clone(), cert);
            }
        }
        cluster
    }

    /// Default, generate, apply, then delete what is no longer desired
    async fn apply(&self, registry: &mut ImageRegistry, cluster: &ClusterContext) -> Result<()> {
        if registry.spec.http_secret.is_empty() {
            registry.spec.http_secret = generate_http_secret();
        }
        storage::complete_configuration(registry, cluster)?;

        let desired = self.generator.generate(registry, cluster)?;
        let written = self.applier.apply_all(&desired).await?;
        for key in &written {
            self.ctx.metrics.record_applied(CONTROLLER_NAME, key.kind.as_str());
        }

        let pruned = self
            .applier
            .prune_stale(
                &desired,
                self.generator.managed_kinds(),
                self.ctx.namespace(),
                &self.generator.selector(),
            )
            .await?;
        if !written.is_empty() || !pruned.is_empty() {
            info!(written = written.len(), pruned = pruned.len(), "registry objects applied");
        }
        Ok(())
    }

    /// Count managed objects still present after a teardown pass
    async fn remove(&self) -> Result<usize> {
        let scope = self.teardown_scope();
        let deleted = self
            .applier
            .teardown(scope.kinds, &scope.namespace, &scope.selector)
            .await?;
        if deleted > 0 {
            info!(deleted, "registry objects removed");
        }
        self.applier
            .remaining(scope.kinds, &scope.namespace, &scope.selector)
            .await
    }

    fn workload(&self) -> Option<WorkloadState> {
        self.ctx
            .caches
            .deployments
            .get(DEPLOYMENT_NAME)
            .map(|d| WorkloadState::from_deployment(&d))
    }

    /// How long the trust bundle has been missing, remembering when it was first seen missing
    fn track_trusted_ca(&self, managed: bool) -> Option<std::time::Duration> {
        let injected = self
            .ctx
            .caches
            .config_maps
            .get(TRUSTED_CA_NAME)
            .is_some_and(|cm| has_trusted_ca(&cm));
        let mut since = self
            .trusted_ca_missing_since
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if !managed || injected {
            *since = None;
            return None;
        }
        let now = self.ctx.now();
        let first = *since.get_or_insert(now);
        (now - first).to_std().ok()
    }

    fn status(
        &self,
        previous: Option<&ImageRegistryStatus>,
        base: &ImageRegistry,
        obs: &RegistryObservation<'_>,
    ) -> ImageRegistryStatus {
        let conditions = registry_conditions(
            previous.map(|s| s.conditions.as_slice()).unwrap_or_default(),
            obs,
            self.ctx.now(),
        );
        let mut status = base.status.clone().unwrap_or_default();
        status.conditions = conditions;
        status.ready_replicas = obs.workload.as_ref().map_or(0, |w| w.ready_replicas);
        status
    }

    /// Status write, retried once against a fresh read on conflict
    async fn write_status(
        &self,
        current: ImageRegistry,
        working: &ImageRegistry,
        obs: &RegistryObservation<'_>,
    ) -> Result<()> {
        let store = self.ctx.stores.registries.as_ref();
        update_status_with_retry(store, RESOURCE_NAME, current, |stored| {
            let mut status = self.status(stored.status.as_ref(), working, obs);
            status.observed_generation = stored.metadata.generation;
            if stored.status.as_ref() == Some(&status) {
                return None;
            }
            let mut updated = stored.clone();
            updated.status = Some(status);
            Some(updated)
        })
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Reconciler for RegistryController {
    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    #[instrument(skip(self, token), fields(controller = CONTROLLER_NAME, name = RESOURCE_NAME))]
    async fn sync(&self, token: &CancellationToken) -> Result<()> {
        let Some(cached) = self.ctx.caches.registries.get(RESOURCE_NAME) else {
            return until_cancelled(token, self.bootstrap()).await;
        };
        let original: ImageRegistry = cached.as_ref().clone();
        let mut registry = original.clone();

        if registry.metadata.deletion_timestamp.is_some() {
            let name = registry.name_any();
            if self.finalizer.has_finalizer(&registry) {
                info!("registry is being deleted");
                return self
                    .finalizer
                    .finalize(&name, &self.teardown_scope(), token)
                    .await;
            }
            // released on an earlier pass whose wait did not finish
            debug!("finalizer already released, waiting for deletion");
            return self.finalizer.wait_for_deletion(&name, token).await;
        }

        if self.finalizer.add_finalizer(&mut registry) {
            debug!(finalizer = REGISTRY_FINALIZER, "adding finalizer");
        }

        let cluster = self.cluster_context(&registry);
        let state = registry.spec.management_state;
        let mut apply_error = None;
        let mut removal_remaining = None;
        match state {
            ManagementState::Removed => match until_cancelled(token, self.remove()).await {
                Ok(remaining) => removal_remaining = Some(remaining),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => apply_error = Some(e),
            },
            ManagementState::Managed => {
                match until_cancelled(token, self.apply(&mut registry, &cluster)).await {
                    Ok(()) => {}
                    Err(Error::Cancelled) => return Err(Error::Cancelled),
                    Err(e) => apply_error = Some(e),
                }
            }
            ManagementState::Unmanaged => debug!("registry is unmanaged"),
        }

        if let Some(e) = &apply_error {
            if e.is_permanent() {
                warn!(reason = %e.reason(), error = %e, "registry configuration is invalid");
            } else {
                warn!(error = %e, "applying registry objects failed");
            }
        }

        let obs = RegistryObservation {
            management_state: state,
            workload: self.workload(),
            apply_error: apply_error.as_ref(),
            removal_remaining,
            trusted_ca_missing_for: self.track_trusted_ca(state == ManagementState::Managed),
            trusted_ca_grace: self.ctx.config.trusted_ca_grace_period,
        };

        let mut current = original.clone();
        if registry.metadata != original.metadata || registry.spec != original.spec {
            info!("writing defaulted registry spec");
            current = until_cancelled(token, self.ctx.stores.registries.update(&registry)).await?;
        }

        until_cancelled(token, self.write_status(current, &registry, &obs)).await?;

        match apply_error {
            Some(e) if !e.is_permanent() => Err(e),
            _ => Ok(()),
        }
    }
}
