use k8s_openapi::api::core::v1::EnvVar;

use super::{
    INVALID_STORAGE_REASON, StorageDriver, bucket_name, env, name_suffix, record_status,
    secret_env,
};
use crate::controller::error::{Error, Result};
use crate::controller::generator::ClusterContext;
use crate::crd::{ImageRegistry, SwiftStorage};

pub struct SwiftDriver {
    config: SwiftStorage,
}

impl SwiftDriver {
    pub fn new(config: SwiftStorage) -> Self {
        Self { config }
    }
}

impl StorageDriver for SwiftDriver {
    fn name(&self) -> &'static str {
        "swift"
    }

    fn complete_configuration(&self, registry: &mut ImageRegistry, ctx: &ClusterContext) -> Result<()> {
        let mut config = self.config.clone();
        let mut managed = false;

        if config.auth_url.is_empty() {
            return Err(Error::permanent(
                INVALID_STORAGE_REASON,
                "swift storage requires authURL",
            ));
        }
        if config.container.is_empty() {
            config.container = bucket_name(&[
                &ctx.infrastructure_name,
                "image-registry",
                &name_suffix(registry, ctx),
            ]);
            managed = true;
        }

        registry.spec.storage.swift = Some(config);
        record_status(registry, managed);
        Ok(())
    }

    fn env(&self) -> Vec<EnvVar> {
        let mut vars = vec![
            env("REGISTRY_STORAGE", self.name()),
            env("REGISTRY_STORAGE_SWIFT_AUTHURL", &self.config.auth_url),
            env("REGISTRY_STORAGE_SWIFT_CONTAINER", &self.config.container),
        ];
        if let Some(region) = &self.config.region_name {
            vars.push(env("REGISTRY_STORAGE_SWIFT_REGION", region));
        }
        if let Some(domain) = &self.config.domain {
            vars.push(env("REGISTRY_STORAGE_SWIFT_DOMAIN", domain));
        }
        if let Some(tenant) = &self.config.tenant {
            vars.push(env("REGISTRY_STORAGE_SWIFT_TENANT", tenant));
        }
        vars.push(secret_env("REGISTRY_STORAGE_SWIFT_USERNAME"));
        vars.push(secret_env("REGISTRY_STORAGE_SWIFT_PASSWORD"));
        vars
    }
}
