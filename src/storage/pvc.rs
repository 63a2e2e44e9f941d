use k8s_openapi::api::core::v1::{EnvVar, PersistentVolumeClaimVolumeSource, Volume, VolumeMount};

use super::{StorageDriver, env, record_status};
use crate::controller::error::Result;
use crate::controller::generator::ClusterContext;
use crate::crd::{ImageRegistry, PvcStorage, RolloutStrategy};

pub const DEFAULT_CLAIM: &str = "image-registry-storage";
const ROOT_DIRECTORY: &str = "/registry";

pub struct PvcDriver {
    config: PvcStorage,
}

impl PvcDriver {
    pub fn new(config: PvcStorage) -> Self {
        Self { config }
    }
}

impl StorageDriver for PvcDriver {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn complete_configuration(&self, registry: &mut ImageRegistry, _ctx: &ClusterContext) -> Result<()> {
        let mut config = self.config.clone();
        let managed = config.claim.is_empty();
        if managed {
            config.claim = DEFAULT_CLAIM.to_string();
        }
        // old and new pods cannot mount the claim at once
        if registry.spec.rollout_strategy.is_none() {
            registry.spec.rollout_strategy = Some(RolloutStrategy::Recreate);
        }

        registry.spec.storage.pvc = Some(config);
        record_status(registry, managed);
        Ok(())
    }

    fn env(&self) -> Vec<EnvVar> {
        vec![
            env("REGISTRY_STORAGE", self.name()),
            env("REGISTRY_STORAGE_FILESYSTEM_ROOTDIRECTORY", ROOT_DIRECTORY),
        ]
    }

    fn volumes(&self) -> (Vec<Volume>, Vec<VolumeMount>) {
        let volume = Volume {
            name: "registry-storage".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: self.config.claim.clone(),
                read_only: None,
            }),
            ..Default::default()
        };
        let mount = VolumeMount {
            name: "registry-storage".to_string(),
            mount_path: ROOT_DIRECTORY.to_string(),
            ..Default::default()
        };
        (vec![volume], vec![mount])
    }

    fn supports_multiple_replicas(&self) -> bool {
        false
    }
}
