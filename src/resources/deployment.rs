//! Registry Deployment
//!
//! The pod template carries a checksum over the config maps and secret the
//! registry reads, so changing any of them rolls the pods.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction,
    KeyToPath, PodSpec, PodTemplateSpec, Probe, ResourceRequirements, SecretKeySelector,
    SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use sha2::{Digest, Sha256};

use crate::controller::error::Result;
use crate::controller::generator::ClusterContext;
use crate::controller::objects::ManagedObject;
use crate::crd::{ImageRegistry, RolloutStrategy};
use crate::resources::common::{object_meta, standard_labels};
use crate::resources::configmap::{TRUSTED_CA_KEY, TRUSTED_CA_NAME};
use crate::resources::secret::HTTP_SECRET_KEY;
use crate::resources::service::{REGISTRY_PORT, TLS_SECRET_NAME, pod_selector, service_host};
use crate::storage::{PRIVATE_CONFIGURATION_SECRET, StorageDriver};

pub const DEPLOYMENT_NAME: &str = "image-registry";
pub const REGISTRY_SERVICE_ACCOUNT: &str = "registry";

/// Pod annotation carrying the checksum of the registry's configuration inputs
pub const DEPENDENCIES_CHECKSUM_ANNOTATION: &str =
    "imageregistry.operator.openshift.io/dependencies-checksum";

const TLS_MOUNT_PATH: &str = "/etc/secrets";
const TRUSTED_CA_MOUNT_PATH: &str = "/etc/pki/ca-trust/extracted/pem";

/// Checksum over the objects the registry pods consume
///
/// Hashes the desired content, not the live objects, so injected data does
/// not cause rollouts on its own.
pub fn dependencies_checksum(dependencies: &[&ManagedObject]) -> Result<String> {
    let mut hasher = Sha256::new();
    for dep in dependencies {
        hasher.update(dep.key().to_string().as_bytes());
        hasher.update(dep.checksum(DEPENDENCIES_CHECKSUM_ANNOTATION)?.as_bytes());
    }
    Ok(hex::encode(hasher.finalize()))
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn registry_env(registry: &ImageRegistry, ctx: &ClusterContext, driver: &dyn StorageDriver) -> Vec<EnvVar> {
    let spec = &registry.spec;
    let mut vars = vec![
        env("REGISTRY_HTTP_ADDR", format!(":{}", REGISTRY_PORT)),
        env("REGISTRY_HTTP_NET", "tcp"),
        EnvVar {
            name: HTTP_SECRET_KEY.to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: PRIVATE_CONFIGURATION_SECRET.to_string(),
                    key: HTTP_SECRET_KEY.to_string(),
                    optional: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        env(
            "REGISTRY_HTTP_TLS_CERTIFICATE",
            format!("{}/tls.crt", TLS_MOUNT_PATH),
        ),
        env("REGISTRY_HTTP_TLS_KEY", format!("{}/tls.key", TLS_MOUNT_PATH)),
        env("REGISTRY_LOG_LEVEL", spec.log_level.registry_level()),
        env("REGISTRY_OPENSHIFT_SERVER_ADDR", service_host(&ctx.namespace)),
        env("REGISTRY_OPENSHIFT_QUOTA_ENABLED", "true"),
        env("REGISTRY_STORAGE_CACHE_BLOBDESCRIPTOR", "inmemory"),
        env("REGISTRY_STORAGE_DELETE_ENABLED", "true"),
        env(
            "REGISTRY_STORAGE_REDIRECT_DISABLE",
            spec.disable_redirect.to_string(),
        ),
    ];
    if spec.read_only {
        vars.push(env(
            "REGISTRY_STORAGE_MAINTENANCE_READONLY",
            r#"{"enabled":true}"#,
        ));
    }
    vars.extend(driver.env());
    vars
}

fn default_resources() -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity("100m".to_string())),
            ("memory".to_string(), Quantity("256Mi".to_string())),
        ])),
        ..Default::default()
    }
}

fn probe(initial_delay_seconds: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/healthz".to_string()),
            port: IntOrString::Int(REGISTRY_PORT),
            scheme: Some("HTTPS".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay_seconds),
        timeout_seconds: Some(5),
        ..Default::default()
    }
}

fn strategy(rollout: Option<RolloutStrategy>) -> DeploymentStrategy {
    DeploymentStrategy {
        type_: Some(rollout.unwrap_or(RolloutStrategy::RollingUpdate).to_string()),
        ..Default::default()
    }
}

fn volumes(driver: &dyn StorageDriver) -> (Vec<Volume>, Vec<VolumeMount>) {
    let mut volumes = vec![
        Volume {
            name: "registry-tls".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(TLS_SECRET_NAME.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "trusted-ca".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: TRUSTED_CA_NAME.to_string(),
                items: Some(vec![KeyToPath {
                    key: TRUSTED_CA_KEY.to_string(),
                    path: "tls-ca-bundle.pem".to_string(),
                    ..Default::default()
                }]),
                optional: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];
    let mut mounts = vec![
        VolumeMount {
            name: "registry-tls".to_string(),
            mount_path: TLS_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        },
        VolumeMount {
            name: "trusted-ca".to_string(),
            mount_path: TRUSTED_CA_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        },
    ];
    let (driver_volumes, driver_mounts) = driver.volumes();
    volumes.extend(driver_volumes);
    mounts.extend(driver_mounts);
    (volumes, mounts)
}

pub fn registry_deployment(
    registry: &ImageRegistry,
    ctx: &ClusterContext,
    driver: &dyn StorageDriver,
    dependencies_checksum: &str,
    component: &str,
    owner: &OwnerReference,
) -> Deployment {
    let spec = &registry.spec;
    let mut pod_labels = standard_labels(component);
    pod_labels.extend(pod_selector());
    let (volumes, volume_mounts) = volumes(driver);

    let container = Container {
        name: "registry".to_string(),
        image: Some(ctx.registry_image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        ports: Some(vec![ContainerPort {
            container_port: REGISTRY_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(registry_env(registry, ctx, driver)),
        volume_mounts: Some(volume_mounts),
        liveness_probe: Some(probe(5)),
        readiness_probe: Some(probe(15)),
        resources: Some(spec.resources.clone().unwrap_or_else(default_resources)),
        termination_message_policy: Some("FallbackToLogsOnError".to_string()),
        ..Default::default()
    };

    Deployment {
        metadata: object_meta(DEPLOYMENT_NAME, Some(&ctx.namespace), component, owner),
        spec: Some(DeploymentSpec {
            replicas: Some(spec.replicas),
            selector: LabelSelector {
                match_labels: Some(pod_selector()),
                ..Default::default()
            },
            strategy: Some(strategy(spec.rollout_strategy)),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    annotations: Some(BTreeMap::from([(
                        DEPENDENCIES_CHECKSUM_ANNOTATION.to_string(),
                        dependencies_checksum.to_string(),
                    )])),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(REGISTRY_SERVICE_ACCOUNT.to_string()),
                    priority_class_name: Some("system-cluster-critical".to_string()),
                    node_selector: (!spec.node_selector.is_empty())
                        .then(|| spec.node_selector.clone()),
                    containers: vec![container],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
