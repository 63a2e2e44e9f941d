//! Finalizer protocol for operator-owned resources
//!
//! `Active` (finalizer present) → `Deleting` (deletionTimestamp set) →
//! `Finalized` (finalizer removed) → gone. Removing the finalizer only
//! permits deletion, so `finalize` also waits until the store stops
//! returning the resource.

use std::sync::Arc;
use std::time::Duration;

use kube::Resource;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::controller::applier::Applier;
use crate::controller::error::{Error, Result};
use crate::controller::objects::ObjectKind;
use crate::controller::retry::{ConflictRetry, retry_on_conflict, until_cancelled};
use crate::controller::store::ResourceStore;

#[derive(Clone, Debug)]
pub struct FinalizerSettings {
    pub finalizer: String,
    /// Interval between deletion-confirmation reads
    pub poll_interval: Duration,
    /// Give up waiting for deletion after this long; `None` waits until cancelled
    pub max_wait: Option<Duration>,
    pub conflict_retry: ConflictRetry,
}

impl FinalizerSettings {
    pub fn new(finalizer: &str) -> Self {
        Self {
            finalizer: finalizer.to_string(),
            poll_interval: Duration::from_secs(1),
            max_wait: None,
            conflict_retry: ConflictRetry::default(),
        }
    }
}

/// Managed objects torn down before the finalizer is released
#[derive(Clone, Debug)]
pub struct TeardownScope {
    pub kinds: &'static [ObjectKind],
    pub namespace: String,
    pub selector: String,
}

pub struct FinalizerCoordinator<K> {
    store: Arc<dyn ResourceStore<K>>,
    applier: Applier,
    settings: FinalizerSettings,
}

impl<K> FinalizerCoordinator<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn new(store: Arc<dyn ResourceStore<K>>, applier: Applier, settings: FinalizerSettings) -> Self {
        Self {
            store,
            applier,
            settings,
        }
    }

    pub fn finalizer(&self) -> &str {
        &self.settings.finalizer
    }

    pub fn has_finalizer(&self, obj: &K) -> bool {
        obj.meta()
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|s| s == &self.settings.finalizer))
    }

    /// Add the finalizer to `obj` in place; returns false when already present
    pub fn add_finalizer(&self, obj: &mut K) -> bool {
        if self.has_finalizer(obj) {
            return false;
        }
        obj.meta_mut()
            .finalizers
            .get_or_insert_with(Vec::new)
            .push(self.settings.finalizer.clone());
        true
    }

    /// Tear down, release the finalizer, then wait for the resource to go away
    pub async fn finalize(&self, name: &str, scope: &TeardownScope, token: &CancellationToken) -> Result<()> {
        let teardown = self
            .applier
            .teardown(scope.kinds, &scope.namespace, &scope.selector);
        let deleted = until_cancelled(token, teardown).await?;
        info!(resource = %name, deleted, "teardown complete");

        if until_cancelled(token, self.remove_finalizer(name)).await? {
            info!(resource = %name, finalizer = %self.settings.finalizer, "finalizer removed");
        }

        self.wait_for_deletion(name, token).await
    }

    /// Remove the finalizer, re-reading the authoritative copy on every conflict
    ///
    /// Returns false when the resource or the finalizer was already gone.
    pub async fn remove_finalizer(&self, name: &str) -> Result<bool> {
        let store = self.store.as_ref();
        let finalizer = self.settings.finalizer.as_str();

        retry_on_conflict(&self.settings.conflict_retry, "remove finalizer", move || async move {
            let Some(mut obj) = store.get(name).await? else {
                return Ok(false);
            };
            let Some(finalizers) = obj.meta_mut().finalizers.as_mut() else {
                return Ok(false);
            };
            let before = finalizers.len();
            finalizers.retain(|f| f != finalizer);
            if finalizers.len() == before {
                return Ok(false);
            }
            store.update(&obj).await?;
            Ok(true)
        })
        .await
    }

    /// Poll the authoritative store until `name` is not found
    ///
    /// Transient errors are retried indefinitely, honouring a server-suggested
    /// delay; any other error ends the wait.
    pub async fn wait_for_deletion(&self, name: &str, token: &CancellationToken) -> Result<()> {
        let deadline = self.settings.max_wait.map(|d| Instant::now() + d);

        loop {
            let result = tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                result = self.store.get(name) => result,
            };

            let delay = match result {
                Ok(None) => {
                    info!(resource = %name, "resource deleted");
                    return Ok(());
                }
                Ok(Some(_)) => {
                    debug!(resource = %name, "waiting for deletion");
                    self.settings.poll_interval
                }
                Err(e) if e.is_transient() => {
                    let delay = e.suggested_delay().unwrap_or(self.settings.poll_interval);
                    warn!(resource = %name, error = %e, delay_ms = delay.as_millis() as u64, "deletion check failed, retrying");
                    delay
                }
                Err(e) => return Err(e),
            };

            if let Some(deadline) = deadline {
                if Instant::now() + delay > deadline {
                    return Err(Error::Timeout(format!(
                        "{} still present after {:?}",
                        name,
                        self.settings.max_wait.unwrap_or_default()
                    )));
                }
            }

            tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
