use k8s_openapi::api::core::v1::{EmptyDirVolumeSource, EnvVar, Volume, VolumeMount};

use super::{StorageDriver, env, record_status};
use crate::controller::error::Result;
use crate::controller::generator::ClusterContext;
use crate::crd::{EmptyDirStorage, ImageRegistry};

const ROOT_DIRECTORY: &str = "/registry";

/// Pod-local scratch storage; images are lost when the pod goes away
pub struct EmptyDirDriver {
    config: EmptyDirStorage,
}

impl EmptyDirDriver {
    pub fn new(config: EmptyDirStorage) -> Self {
        Self { config }
    }
}

impl StorageDriver for EmptyDirDriver {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    fn complete_configuration(&self, registry: &mut ImageRegistry, _ctx: &ClusterContext) -> Result<()> {
        if registry.spec.replicas > 1 {
            tracing::warn!(
                replicas = registry.spec.replicas,
                "emptyDir storage is not shared between registry replicas"
            );
        }
        registry.spec.storage.empty_dir = Some(self.config.clone());
        record_status(registry, false);
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
            empty_dir: Some(EmptyDirVolumeSource::default()),
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
