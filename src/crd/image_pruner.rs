use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::Condition;
use super::image_registry::LogLevel;

/// ImagePruner configures the periodic job that prunes unreferenced images
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "imageregistry.operator.openshift.io",
    version = "v1",
    kind = "ImagePruner",
    plural = "imagepruners",
    status = "ImagePrunerStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Schedule", "type":"string", "jsonPath":".spec.schedule"}"#,
    printcolumn = r#"{"name":"Suspend", "type":"boolean", "jsonPath":".spec.suspend"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ImagePrunerSpec {
    /// Stop creating prune jobs
    #[serde(default)]
    pub suspend: bool,

    /// Cron schedule for the prune job
    #[serde(default = "default_schedule")]
    pub schedule: String,

    /// Number of tag revisions to keep per image stream
    #[serde(default = "default_keep_tag_revisions")]
    pub keep_tag_revisions: i32,

    /// Images younger than this are never pruned (e.g. "60m")
    #[serde(default = "default_keep_younger_than")]
    pub keep_younger_than_duration: String,

    /// Keep going when an image reference cannot be parsed
    #[serde(default = "default_true")]
    pub ignore_invalid_image_references: bool,

    #[serde(default = "default_history_limit")]
    pub successful_jobs_history_limit: i32,

    #[serde(default = "default_history_limit")]
    pub failed_jobs_history_limit: i32,

    #[serde(default)]
    pub log_level: LogLevel,
}

fn default_schedule() -> String {
    "0 0 * * *".to_string()
}

fn default_keep_tag_revisions() -> i32 {
    3
}

fn default_keep_younger_than() -> String {
    "60m".to_string()
}

fn default_true() -> bool {
    true
}

fn default_history_limit() -> i32 {
    3
}

impl Default for ImagePrunerSpec {
    fn default() -> Self {
        Self {
            suspend: false,
            schedule: default_schedule(),
            keep_tag_revisions: default_keep_tag_revisions(),
            keep_younger_than_duration: default_keep_younger_than(),
            ignore_invalid_image_references: true,
            successful_jobs_history_limit: default_history_limit(),
            failed_jobs_history_limit: default_history_limit(),
            log_level: LogLevel::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImagePrunerStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
