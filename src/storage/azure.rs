use k8s_openapi::api::core::v1::EnvVar;

use super::{StorageDriver, bucket_name, env, name_suffix, record_status, secret_env};
use crate::controller::error::Result;
use crate::controller::generator::ClusterContext;
use crate::crd::{AzureStorage, ImageRegistry};

pub struct AzureDriver {
    config: AzureStorage,
}

impl AzureDriver {
    pub fn new(config: AzureStorage) -> Self {
        Self { config }
    }
}

/// Storage account names are 3-24 lowercase alphanumerics
fn account_name(infrastructure_name: &str, suffix: &str) -> String {
    let base: String = infrastructure_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .take(12)
        .collect();
    format!("{}registry{}", base, suffix)
        .chars()
        .take(24)
        .collect()
}

impl StorageDriver for AzureDriver {
    fn name(&self) -> &'static str {
        "azure"
    }

    fn complete_configuration(&self, registry: &mut ImageRegistry, ctx: &ClusterContext) -> Result<()> {
        let mut config = self.config.clone();
        let mut managed = false;
        let suffix = name_suffix(registry, ctx);

        if config.account_name.is_empty() {
            config.account_name = account_name(&ctx.infrastructure_name, &suffix);
            managed = true;
        }
        if config.container.is_empty() {
            config.container = bucket_name(&[&ctx.infrastructure_name, "image-registry", &suffix]);
            managed = true;
        }
        if config.cloud_name.is_none() {
            config.cloud_name = ctx.azure_cloud_name.clone();
        }

        registry.spec.storage.azure = Some(config);
        record_status(registry, managed);
        Ok(())
    }

    fn env(&self) -> Vec<EnvVar> {
        let mut vars = vec![
            env("REGISTRY_STORAGE", self.name()),
            env("REGISTRY_STORAGE_AZURE_ACCOUNTNAME", &self.config.account_name),
            env("REGISTRY_STORAGE_AZURE_CONTAINER", &self.config.container),
        ];
        if let Some(cloud) = &self.config.cloud_name {
            vars.push(env("REGISTRY_STORAGE_AZURE_REALM", realm(cloud)));
        }
        vars.push(secret_env("REGISTRY_STORAGE_AZURE_ACCOUNTKEY"));
        vars
    }
}

fn realm(cloud_name: &str) -> &'static str {
    match cloud_name {
        "AzureUSGovernmentCloud" => "core.usgovcloudapi.net",
        "AzureChinaCloud" => "core.chinacloudapi.cn",
        "AzureGermanCloud" => "core.cloudapi.de",
        _ => "core.windows.net",
    }
}
