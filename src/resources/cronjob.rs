//! CronJob running the image pruner

use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, KeyToPath, PodSpec, PodTemplateSpec, ResourceRequirements,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use std::collections::BTreeMap;

use crate::crd::ImagePruner;
use crate::resources::common::{object_meta, standard_labels};
use crate::resources::configmap::{SERVICE_CA_NAME, TRUSTED_CA_KEY};
use crate::resources::service::service_host;

pub const CRONJOB_NAME: &str = "image-pruner";
pub const PRUNER_SERVICE_ACCOUNT: &str = "pruner";

const SERVICE_CA_MOUNT_PATH: &str = "/var/run/configmaps/serviceca";

/// Arguments for `oc adm prune images`
pub fn prune_args(pruner: &ImagePruner, namespace: &str) -> Vec<String> {
    let spec = &pruner.spec;
    let mut args = vec![
        "adm".to_string(),
        "prune".to_string(),
        "images".to_string(),
        format!("--certificate-authority={}/{}", SERVICE_CA_MOUNT_PATH, TRUSTED_CA_KEY),
        format!("--keep-tag-revisions={}", spec.keep_tag_revisions),
        format!("--keep-younger-than={}", spec.keep_younger_than_duration),
        format!(
            "--ignore-invalid-refs={}",
            spec.ignore_invalid_image_references
        ),
        format!("--registry-url=https://{}", service_host(namespace)),
        "--confirm=true".to_string(),
    ];
    args.push(format!("--loglevel={}", spec.log_level.verbosity()));
    args
}

pub fn pruner_cronjob(
    pruner: &ImagePruner,
    namespace: &str,
    image: &str,
    component: &str,
    owner: &OwnerReference,
) -> CronJob {
    let spec = &pruner.spec;

    let container = Container {
        name: "image-pruner".to_string(),
        image: Some(image.to_string()),
        command: Some(vec!["oc".to_string()]),
        args: Some(prune_args(pruner, namespace)),
        volume_mounts: Some(vec![VolumeMount {
            name: SERVICE_CA_NAME.to_string(),
            mount_path: SERVICE_CA_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity("100m".to_string())),
                ("memory".to_string(), Quantity("256Mi".to_string())),
            ])),
            ..Default::default()
        }),
        termination_message_policy: Some("FallbackToLogsOnError".to_string()),
        ..Default::default()
    };

    CronJob {
        metadata: object_meta(CRONJOB_NAME, Some(namespace), component, owner),
        spec: Some(CronJobSpec {
            schedule: spec.schedule.clone(),
            suspend: Some(spec.suspend),
            concurrency_policy: Some("Forbid".to_string()),
            successful_jobs_history_limit: Some(spec.successful_jobs_history_limit),
            failed_jobs_history_limit: Some(spec.failed_jobs_history_limit),
            job_template: JobTemplateSpec {
                metadata: None,
                spec: Some(JobSpec {
                    backoff_limit: Some(0),
                    template: PodTemplateSpec {
                        metadata: Some(ObjectMeta {
                            labels: Some(standard_labels(component)),
                            ..Default::default()
                        }),
                        spec: Some(PodSpec {
                            service_account_name: Some(PRUNER_SERVICE_ACCOUNT.to_string()),
                            restart_policy: Some("Never".to_string()),
                            containers: vec![container],
                            volumes: Some(vec![Volume {
                                name: SERVICE_CA_NAME.to_string(),
                                config_map: Some(ConfigMapVolumeSource {
                                    name: SERVICE_CA_NAME.to_string(),
                                    items: Some(vec![KeyToPath {
                                        key: "service-ca.crt".to_string(),
                                        path: TRUSTED_CA_KEY.to_string(),
                                        ..Default::default()
                                    }]),
                                    ..Default::default()
                                }),
                                ..Default::default()
                            }]),
                            ..Default::default()
                        }),
                    },
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
