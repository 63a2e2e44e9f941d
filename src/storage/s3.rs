use k8s_openapi::api::core::v1::EnvVar;

use super::{INVALID_STORAGE_REASON, StorageDriver, bucket_name, env, name_suffix, record_status, secret_env};
use crate::controller::error::{Error, Result};
use crate::controller::generator::ClusterContext;
use crate::crd::{ImageRegistry, S3Storage};

pub struct S3Driver {
    config: S3Storage,
}

impl S3Driver {
    pub fn new(config: S3Storage) -> Self {
        Self { config }
    }
}

impl StorageDriver for S3Driver {
    fn name(&self) -> &'static str {
        "s3"
    }

    fn complete_configuration(&self, registry: &mut ImageRegistry, ctx: &ClusterContext) -> Result<()> {
        let mut config = self.config.clone();
        let mut managed = false;

        if config.region.is_empty() {
            config.region = ctx.region.clone();
        }
        if config.region.is_empty() {
            return Err(Error::permanent(
                INVALID_STORAGE_REASON,
                "s3 storage requires a region and none is known for this cluster",
            ));
        }
        if config.bucket.is_empty() {
            config.bucket = bucket_name(&[
                &ctx.infrastructure_name,
                "image-registry",
                &config.region,
                &name_suffix(registry, ctx),
            ]);
            config.encrypt = true;
            managed = true;
        }

        registry.spec.storage.s3 = Some(config);
        record_status(registry, managed);
        Ok(())
    }

    fn env(&self) -> Vec<EnvVar> {
        let mut vars = vec![
            env("REGISTRY_STORAGE", self.name()),
            env("REGISTRY_STORAGE_S3_BUCKET", &self.config.bucket),
            env("REGISTRY_STORAGE_S3_REGION", &self.config.region),
            env("REGISTRY_STORAGE_S3_ENCRYPT", self.config.encrypt.to_string()),
            env(
                "REGISTRY_STORAGE_S3_VIRTUALHOSTEDSTYLE",
                self.config.virtual_hosted_style.to_string(),
            ),
        ];
        if let Some(endpoint) = &self.config.region_endpoint {
            vars.push(env("REGISTRY_STORAGE_S3_REGIONENDPOINT", endpoint));
        }
        vars.push(secret_env("REGISTRY_STORAGE_S3_ACCESSKEY"));
        vars.push(secret_env("REGISTRY_STORAGE_S3_SECRETKEY"));
        vars
    }
}
