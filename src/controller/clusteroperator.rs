//! Cluster-operator status controller
//!
//! Folds the registry and pruner conditions into the `image-registry`
//! ClusterOperator. It never touches managed objects.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::controller::context::{Context, RESOURCE_NAME};
use crate::controller::error::{Error, Result};
use crate::controller::retry::until_cancelled;
use crate::controller::runner::Reconciler;
use crate::controller::status::{OperatorObservation, operator_status};
use crate::controller::store::update_status_with_retry;
use crate::crd::{ClusterOperator, ClusterOperatorSpec};

pub const CLUSTER_OPERATOR_NAME: &str = "image-registry";

const CONTROLLER_NAME: &str = "clusteroperator";

pub struct ClusterOperatorController {
    ctx: Context,
}

impl ClusterOperatorController {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    async fn current(&self) -> Result<ClusterOperator> {
        let store = self.ctx.stores.cluster_operators.as_ref();
        if let Some(existing) = store.get(CLUSTER_OPERATOR_NAME).await? {
            return Ok(existing);
        }
        let desired = ClusterOperator::new(CLUSTER_OPERATOR_NAME, ClusterOperatorSpec::default());
        match store.create(&desired).await {
            Ok(created) => {
                info!(name = CLUSTER_OPERATOR_NAME, "created cluster operator");
                Ok(created)
            }
            Err(e) if e.is_already_exists() => store
                .get(CLUSTER_OPERATOR_NAME)
                .await?
                .ok_or_else(|| Error::NotFound(CLUSTER_OPERATOR_NAME.to_string())),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Reconciler for ClusterOperatorController {
    fn name(&self) -> &'static str {
        CONTROLLER_NAME
    }

    #[instrument(skip(self, token), fields(controller = CONTROLLER_NAME, name = CLUSTER_OPERATOR_NAME))]
    async fn sync(&self, token: &CancellationToken) -> Result<()> {
        let registry = self.ctx.caches.registries.get(RESOURCE_NAME);
        let pruner = self.ctx.caches.pruners.get(RESOURCE_NAME);
        let obs = OperatorObservation {
            registry: registry
                .as_ref()
                .and_then(|r| r.status.as_ref())
                .map(|s| s.conditions.as_slice()),
            pruner: pruner
                .as_ref()
                .and_then(|p| p.status.as_ref())
                .map(|s| s.conditions.as_slice()),
            namespace: self.ctx.namespace(),
            release_version: &self.ctx.config.release_version,
        };

        let current = until_cancelled(token, self.current()).await?;
        let store = self.ctx.stores.cluster_operators.as_ref();
        let write = update_status_with_retry(store, CLUSTER_OPERATOR_NAME, current, |stored| {
            let previous = stored.status.clone().unwrap_or_default();
            let status = operator_status(&previous, &obs, self.ctx.now());
            if stored.status.as_ref() == Some(&status) {
                return None;
            }
            let mut updated = stored.clone();
            updated.status = Some(status);
            Some(updated)
        });
        if until_cancelled(token, write).await? {
            info!("cluster operator status updated");
        }
        Ok(())
    }
}
