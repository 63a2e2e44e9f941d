use k8s_openapi::api::core::v1::{EnvVar, KeyToPath, SecretVolumeSource, Volume, VolumeMount};

use super::{
    INVALID_STORAGE_REASON, PRIVATE_CONFIGURATION_SECRET, StorageDriver, bucket_name, env,
    name_suffix, record_status,
};
use crate::controller::error::{Error, Result};
use crate::controller::generator::ClusterContext;
use crate::crd::{GcsStorage, ImageRegistry};

const KEYFILE_DIR: &str = "/gcs";
const KEYFILE_KEY: &str = "REGISTRY_STORAGE_GCS_KEYFILE";

pub struct GcsDriver {
    config: GcsStorage,
}

impl GcsDriver {
    pub fn new(config: GcsStorage) -> Self {
        Self { config }
    }
}

impl StorageDriver for GcsDriver {
    fn name(&self) -> &'static str {
        "gcs"
    }

    fn complete_configuration(&self, registry: &mut ImageRegistry, ctx: &ClusterContext) -> Result<()> {
        let mut config = self.config.clone();
        let mut managed = false;

        if config.region.is_empty() {
            config.region = ctx.region.clone();
        }
        if config.project_id.is_empty() {
            config.project_id = ctx.gcp_project.clone();
        }
        if config.bucket.is_empty() {
            if config.region.is_empty() {
                return Err(Error::permanent(
                    INVALID_STORAGE_REASON,
                    "gcs storage requires a region to name the bucket",
                ));
            }
            config.bucket = bucket_name(&[
                &ctx.infrastructure_name,
                "image-registry",
                &config.region,
                &name_suffix(registry, ctx),
            ]);
            managed = true;
        }

        registry.spec.storage.gcs = Some(config);
        record_status(registry, managed);
        Ok(())
    }

    fn env(&self) -> Vec<EnvVar> {
        vec![
            env("REGISTRY_STORAGE", self.name()),
            env("REGISTRY_STORAGE_GCS_BUCKET", &self.config.bucket),
            env("REGISTRY_STORAGE_GCS_KEYFILE", format!("{}/keyfile", KEYFILE_DIR)),
        ]
    }

    fn volumes(&self) -> (Vec<Volume>, Vec<VolumeMount>) {
        let volume = Volume {
            name: "gcs-keyfile".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(PRIVATE_CONFIGURATION_SECRET.to_string()),
                items: Some(vec![KeyToPath {
                    key: KEYFILE_KEY.to_string(),
                    path: "keyfile".to_string(),
                    mode: None,
                }]),
                optional: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mount = VolumeMount {
            name: "gcs-keyfile".to_string(),
            mount_path: KEYFILE_DIR.to_string(),
            read_only: Some(true),
            ..Default::default()
        };
        (vec![volume], vec![mount])
    }
}
