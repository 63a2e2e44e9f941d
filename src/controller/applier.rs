//! Checksum-guarded create-or-update of managed objects

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::controller::error::{Error, Result};
use crate::controller::objects::{ManagedObject, ObjectKey, ObjectKind};
use crate::controller::retry::{ConflictRetry, retry_on_conflict};
use crate::controller::store::ObjectStore;

/// Settings shared by every apply made on behalf of one controller
#[derive(Clone, Debug)]
pub struct ApplyConfig {
    /// Annotation holding the checksum of the last applied desired state
    pub checksum_annotation: String,
    pub conflict_retry: ConflictRetry,
}

impl Default for ApplyConfig {
    fn default() -> Self {
        Self {
            checksum_annotation: "imageregistry.operator.openshift.io/checksum".to_string(),
            conflict_retry: ConflictRetry::default(),
        }
    }
}

#[derive(Clone)]
pub struct Applier {
    store: Arc<dyn ObjectStore>,
    config: ApplyConfig,
}

impl Applier {
    pub fn new(store: Arc<dyn ObjectStore>, config: ApplyConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn checksum_annotation(&self) -> &str {
        &self.config.checksum_annotation
    }

    /// Bring one object to its desired state; `Ok(true)` when a write happened
    ///
    /// Reads the live object from the store, skips the write when its checksum
    /// annotation already matches, otherwise merges and updates. Conflicts and
    /// create races are retried against a fresh read; every other error is
    /// returned as-is.
    pub async fn apply(&self, desired: &ManagedObject) -> Result<bool> {
        let annotation = self.config.checksum_annotation.as_str();
        let checksum = desired.checksum(annotation)?;
        let key = desired.key();
        let store = self.store.as_ref();
        let (key_ref, checksum_ref) = (&key, checksum.as_str());

        retry_on_conflict(
            &self.config.conflict_retry,
            "apply",
            move || async move {
                match store.get(key_ref).await? {
                    None => {
                        let mut obj = desired.clone();
                        obj.set_annotation(annotation, checksum_ref);
                        store.create(&obj).await?;
                        info!(object = %key_ref, "created");
                        Ok(true)
                    }
                    Some(current) => {
                        if current.annotation(annotation) == Some(checksum_ref) {
                            debug!(object = %key_ref, "up to date");
                            return Ok(false);
                        }
                        let mut merged = desired.merge_onto(&current).ok_or_else(|| {
                            Error::InvalidConfig(format!("{} changed kind in the store", key_ref))
                        })?;
                        merged.set_annotation(annotation, checksum_ref);
                        store.update(&merged).await?;
                        info!(object = %key_ref, "updated");
                        Ok(true)
                    }
                }
            },
        )
        .await
    }

    /// Apply objects in order, stopping at the first error
    ///
    /// Returns the keys that were actually written.
    pub async fn apply_all(&self, desired: &[ManagedObject]) -> Result<Vec<ObjectKey>> {
        let mut written = Vec::new();
        for obj in desired {
            if self.apply(obj).await? {
                written.push(obj.key());
            }
        }
        Ok(written)
    }

    /// Delete one object; `Ok(false)` when it was already gone
    pub async fn delete(&self, key: &ObjectKey) -> Result<bool> {
        match self.store.delete(key).await {
            Ok(()) => {
                info!(object = %key, "deleted");
                Ok(true)
            }
            Err(e) if e.is_not_found() => {
                debug!(object = %key, "already gone");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete every labelled object of `kinds`, last kind first
    pub async fn teardown(
        &self,
        kinds: &[ObjectKind],
        namespace: &str,
        label_selector: &str,
    ) -> Result<usize> {
        let mut deleted = 0;
        for kind in kinds.iter().rev() {
            for live in self.store.list(*kind, namespace, label_selector).await? {
                if live.is_deleting() {
                    continue;
                }
                if self.delete(&live.key()).await? {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    /// Number of labelled objects of `kinds` still present, including ones being deleted
    pub async fn remaining(
        &self,
        kinds: &[ObjectKind],
        namespace: &str,
        label_selector: &str,
    ) -> Result<usize> {
        let mut count = 0;
        for kind in kinds {
            count += self.store.list(*kind, namespace, label_selector).await?.len();
        }
        Ok(count)
    }

    /// Delete labelled objects of `kinds` that are not part of `desired`
    pub async fn prune_stale(
        &self,
        desired: &[ManagedObject],
        kinds: &[ObjectKind],
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<ObjectKey>> {
        let wanted: HashSet<ObjectKey> = desired.iter().map(ManagedObject::key).collect();
        let mut pruned = Vec::new();
        for kind in kinds {
            for live in self.store.list(*kind, namespace, label_selector).await? {
                let key = live.key();
                if wanted.contains(&key) || live.is_deleting() {
                    continue;
                }
                warn!(object = %key, "pruning object no longer desired");
                if self.delete(&key).await? {
                    pruned.push(key);
                }
            }
        }
        Ok(pruned)
    }
}
