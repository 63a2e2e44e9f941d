//! Storage-driver boundary
//!
//! One driver per backend variant of `ImageRegistryStorage`. A driver fills in
//! backend defaults (`complete_configuration`) and contributes environment and
//! volumes to the registry deployment. Provisioning of the backing bucket or
//! claim and credential discovery happen outside this crate.

mod azure;
mod emptydir;
mod gcs;
mod pvc;
mod s3;
mod swift;

pub use azure::AzureDriver;
pub use emptydir::EmptyDirDriver;
pub use gcs::GcsDriver;
pub use pvc::PvcDriver;
pub use s3::S3Driver;
pub use swift::SwiftDriver;

use k8s_openapi::api::core::v1::{EnvVar, EnvVarSource, SecretKeySelector, Volume, VolumeMount};
use kube::ResourceExt;
use sha2::{Digest, Sha256};

use crate::controller::error::{Error, Result};
use crate::controller::generator::ClusterContext;
use crate::crd::{
    AzureStorage, GcsStorage, ImageRegistry, ImageRegistryStorage, PlatformType, PvcStorage,
    S3Storage,
};

/// Reason reported when the storage selection is ambiguous or incomplete
pub const INVALID_STORAGE_REASON: &str = "InvalidStorageConfiguration";

/// Secret holding storage credentials and the registry HTTP secret
pub const PRIVATE_CONFIGURATION_SECRET: &str = "image-registry-private-configuration";

/// A registry storage backend
pub trait StorageDriver: Send + Sync {
    /// Value of `REGISTRY_STORAGE`
    fn name(&self) -> &'static str;

    /// Fill backend defaults into `registry.spec.storage` and record the
    /// result in the status
    fn complete_configuration(&self, registry: &mut ImageRegistry, ctx: &ClusterContext)
    -> Result<()>;

    /// Environment for the registry container
    fn env(&self) -> Vec<EnvVar>;

    /// Volumes and mounts for the registry pod
    fn volumes(&self) -> (Vec<Volume>, Vec<VolumeMount>) {
        (Vec::new(), Vec::new())
    }

    /// Whether several replicas may share this backend
    fn supports_multiple_replicas(&self) -> bool {
        true
    }
}

/// Driver for the single configured backend
///
/// No backend is `StorageNotConfigured`; more than one is a permanent error.
pub fn driver_for(storage: &ImageRegistryStorage) -> Result<Box<dyn StorageDriver>> {
    let configured = storage.configured_variants();
    if configured.len() > 1 {
        return Err(Error::permanent(
            INVALID_STORAGE_REASON,
            format!(
                "exactly one storage backend must be configured, found {}",
                configured.join(", ")
            ),
        ));
    }

    let driver: Box<dyn StorageDriver> = if let Some(s3) = &storage.s3 {
        Box::new(S3Driver::new(s3.clone()))
    } else if let Some(gcs) = &storage.gcs {
        Box::new(GcsDriver::new(gcs.clone()))
    } else if let Some(azure) = &storage.azure {
        Box::new(AzureDriver::new(azure.clone()))
    } else if let Some(swift) = &storage.swift {
        Box::new(SwiftDriver::new(swift.clone()))
    } else if let Some(pvc) = &storage.pvc {
        Box::new(PvcDriver::new(pvc.clone()))
    } else if let Some(empty_dir) = &storage.empty_dir {
        Box::new(EmptyDirDriver::new(empty_dir.clone()))
    } else {
        return Err(Error::StorageNotConfigured);
    };
    Ok(driver)
}

/// Default backend for a platform, or `StorageNotConfigured`
pub fn infer_default(platform: PlatformType) -> Result<ImageRegistryStorage> {
    let mut storage = ImageRegistryStorage::default();
    match platform {
        PlatformType::Aws => storage.s3 = Some(S3Storage::default()),
        PlatformType::Gcp => storage.gcs = Some(GcsStorage::default()),
        PlatformType::Azure => storage.azure = Some(AzureStorage::default()),
        PlatformType::OpenStack => storage.pvc = Some(PvcStorage::default()),
        PlatformType::BareMetal
        | PlatformType::VSphere
        | PlatformType::NoPlatform
        | PlatformType::Unknown => return Err(Error::StorageNotConfigured),
    }
    Ok(storage)
}

/// Whether the selected backend is an object store
pub fn is_object_storage(storage: &ImageRegistryStorage) -> bool {
    storage.s3.is_some() || storage.gcs.is_some() || storage.azure.is_some() || storage.swift.is_some()
}

/// Default storage when absent, then backend-specific defaults
///
/// Used by bootstrap and before every generate.
pub fn complete_configuration(registry: &mut ImageRegistry, ctx: &ClusterContext) -> Result<()> {
    if registry.spec.storage.is_empty() {
        registry.spec.storage = infer_default(ctx.platform)?;
    }
    driver_for(&registry.spec.storage)?.complete_configuration(registry, ctx)
}

/// Short deterministic suffix for operator-chosen bucket and container names
pub(crate) fn name_suffix(registry: &ImageRegistry, ctx: &ClusterContext) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ctx.infrastructure_name.as_bytes());
    hasher.update(b"/");
    hasher.update(registry.uid().unwrap_or_else(|| registry.name_any()).as_bytes());
    hex::encode(hasher.finalize())[..16].to_string()
}

/// Copy the completed spec into the observed status
pub(crate) fn record_status(registry: &mut ImageRegistry, managed: bool) {
    let storage = registry.spec.storage.clone();
    let status = registry.status.get_or_insert_with(Default::default);
    status.storage = storage;
    status.storage_managed = status.storage_managed || managed;
}

pub(crate) fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Env var read from the private configuration secret, absent keys tolerated
pub(crate) fn secret_env(name: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: PRIVATE_CONFIGURATION_SECRET.to_string(),
                key: name.to_string(),
                optional: Some(true),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Bucket-style names: lowercase, at most 63 chars, no trailing dash
pub(crate) fn bucket_name(parts: &[&str]) -> String {
    let joined = parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase();
    let mut name: String = joined
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .take(63)
        .collect();
    while name.ends_with('-') {
        name.pop();
    }
    name
}
