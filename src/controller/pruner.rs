//! Image-pruner controller: keeps the pruning CronJob in line with the `cluster` ImagePruner

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::controller::applier::Applier;
use crate::controller::bootstrap::{create_if_absent, default_pruner};
use crate::controller::context::{Context, RESOURCE_NAME};
use crate::controller::error::{Error, Result};
use crate::controller::generator::Generator;
use crate::controller::retry::until_cancelled;
use crate::controller::runner::Reconciler;
use crate::controller::status::{PrunerObservation, pruner_conditions};
use crate::controller::store::update_status_with_retry;
use crate::crd::{ImagePruner, ImagePrunerStatus};
use crate::resources::PrunerGenerator;
use crate::resources::cronjob::CRONJOB_NAME;

const CONTROLLER_NAME: &str = "pruner";

pub struct PrunerController {
    ctx: Context,
    generator: PrunerGenerator,
    applier: Applier,
}

impl PrunerController {
    pub fn new(ctx: Context) -> Self {
        let applier = Applier::new(ctx.stores.objects.clone(), ctx.apply.clone());
        Self {
            ctx,
            generator: PrunerGenerator,
            applier,
        }
    }

    async fn apply(&self, pruner: &ImagePruner) -> Result<()> {
        let cluster = self.ctx.cluster_context();
        let desired = self.generator.generate(pruner, &cluster)?;
        let written = self.applier.apply_all(&desired).await?;
        for key in &written {
            self.ctx.metrics.record_applied(CONTROLLER_NAME, key.kind.as_str());
        }
        self.applier
            .prune_stale(
                &desired,
                self.generator.managed_kinds(),
                self.ctx.namespace(),
                &self.generator.selector(),
            )
            .await?;
        Ok(())
    }

    fn status(&self, current: &ImagePruner, obs: &PrunerObservation<'_>) -> ImagePrunerStatus {
        let previous = current
            .status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default();
        ImagePrunerStatus {
            observed_generation: current.metadata.generation,
            conditions: pruner_conditions(previous, obs, self.ctx.now()),
        }
    }
}

#[async_trait]
impl Reconciler for PrunerController {
    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    #[instrument(skip(self, token), fields(controller = CONTROLLER_NAME, name = RESOURCE_NAME))]
    async fn sync(&self, token: &CancellationToken) -> Result<()> {
        let store = self.ctx.stores.pruners.as_ref();
        let Some(cached) = self.ctx.caches.pruners.get(RESOURCE_NAME) else {
            let bootstrap = create_if_absent(store, RESOURCE_NAME, || Ok(default_pruner(RESOURCE_NAME)));
            until_cancelled(token, bootstrap).await?;
            return Ok(());
        };
        if cached.metadata.deletion_timestamp.is_some() {
            debug!("pruner is being deleted");
            return Ok(());
        }
        let pruner: ImagePruner = cached.as_ref().clone();

        let apply_error = match until_cancelled(token, self.apply(&pruner)).await {
            Ok(()) => None,
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!(reason = %e.reason(), error = %e, "applying pruner objects failed");
                Some(e)
            }
        };

        let cronjob = self.ctx.caches.cron_jobs.get(CRONJOB_NAME);
        let obs = PrunerObservation {
            suspend: pruner.spec.suspend,
            cronjob: cronjob.as_deref(),
            apply_error: apply_error.as_ref(),
        };

        let write = update_status_with_retry(store, RESOURCE_NAME, pruner, |stored| {
            let status = self.status(stored, &obs);
            if stored.status.as_ref() == Some(&status) {
                return None;
            }
            let mut updated = stored.clone();
            updated.status = Some(status);
            Some(updated)
        });
        if until_cancelled(token, write).await? {
            info!("pruner status updated");
        }

        match apply_error {
            Some(e) if !e.is_permanent() => Err(e),
            _ => Ok(()),
        }
    }
}
