use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{Condition, ManagementState};

/// ImageRegistry is the singleton `cluster` configuration of the internal image registry
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(
    group = "imageregistry.operator.openshift.io",
    version = "v1",
    kind = "Config",
    root = "ImageRegistry",
    plural = "configs",
    status = "ImageRegistryStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Management", "type":"string", "jsonPath":".spec.managementState"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ImageRegistrySpec {
    /// Whether the operator manages, ignores, or removes the registry
    #[serde(default)]
    pub management_state: ManagementState,

    /// Desired number of registry pods
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Storage backend; exactly one variant must be set
    #[serde(default)]
    pub storage: ImageRegistryStorage,

    /// Secret used to sign upload state between registry replicas
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub http_secret: String,

    /// Deployment rollout strategy (derived from storage when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_strategy: Option<RolloutStrategy>,

    /// Expose the registry through a generated default route
    #[serde(default)]
    pub default_route: bool,

    /// Additional routes exposing the registry
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<ImageRegistryConfigRoute>,

    /// Registry log verbosity
    #[serde(default)]
    pub log_level: LogLevel,

    /// Reject pushes
    #[serde(default)]
    pub read_only: bool,

    /// Serve blobs through the registry instead of redirecting to the backend
    #[serde(default)]
    pub disable_redirect: bool,

    /// Node selector for registry pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Compute resources for the registry container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

fn default_replicas() -> i32 {
    1
}

impl Default for ImageRegistrySpec {
    fn default() -> Self {
        Self {
            management_state: ManagementState::Managed,
            replicas: default_replicas(),
            storage: ImageRegistryStorage::default(),
            http_secret: String::new(),
            rollout_strategy: None,
            default_route: false,
            routes: Vec::new(),
            log_level: LogLevel::default(),
            read_only: false,
            disable_redirect: false,
            node_selector: BTreeMap::new(),
            resources: None,
        }
    }
}

/// Storage backend selector
///
/// Modelled as optional fields rather than an enum so that an ambiguous
/// (several set) or absent selection survives deserialization and can be
/// reported as a configuration defect.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageRegistryStorage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Storage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcs: Option<GcsStorage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureStorage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swift: Option<SwiftStorage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc: Option<PvcStorage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirStorage>,
}

impl ImageRegistryStorage {
    /// Names of the variants that are set, in declaration order
    pub fn configured_variants(&self) -> Vec<&'static str> {
        let mut variants = Vec::new();
        if self.s3.is_some() {
            variants.push("s3");
        }
        if self.gcs.is_some() {
            variants.push("gcs");
        }
        if self.azure.is_some() {
            variants.push("azure");
        }
        if self.swift.is_some() {
            variants.push("swift");
        }
        if self.pvc.is_some() {
            variants.push("pvc");
        }
        if self.empty_dir.is_some() {
            variants.push("emptyDir");
        }
        variants
    }

    pub fn is_empty(&self) -> bool {
        self.configured_variants().is_empty()
    }
}

/// Amazon S3 (or compatible) bucket
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3Storage {
    #[serde(default)]
    pub bucket: String,

    #[serde(default)]
    pub region: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_endpoint: Option<String>,

    #[serde(default)]
    pub encrypt: bool,

    #[serde(default)]
    pub virtual_hosted_style: bool,
}

/// Google Cloud Storage bucket
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GcsStorage {
    #[serde(default)]
    pub bucket: String,

    #[serde(default)]
    pub region: String,

    #[serde(default, rename = "projectID")]
    pub project_id: String,
}

/// Azure blob container
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzureStorage {
    #[serde(default)]
    pub account_name: String,

    #[serde(default)]
    pub container: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_name: Option<String>,
}

/// OpenStack Swift container
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SwiftStorage {
    #[serde(default, rename = "authURL")]
    pub auth_url: String,

    #[serde(default)]
    pub container: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

/// Persistent volume claim
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PvcStorage {
    #[serde(default)]
    pub claim: String,
}

/// Ephemeral pod-local storage (testing only)
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct EmptyDirStorage {}

/// Deployment rollout strategy
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq)]
pub enum RolloutStrategy {
    RollingUpdate,
    Recreate,
}

impl std::fmt::Display for RolloutStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RolloutStrategy::RollingUpdate => write!(f, "RollingUpdate"),
            RolloutStrategy::Recreate => write!(f, "Recreate"),
        }
    }
}

/// Registry log verbosity
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum LogLevel {
    #[default]
    Normal,
    Debug,
    Trace,
    TraceAll,
}

impl LogLevel {
    /// Level understood by the registry binary
    pub fn registry_level(self) -> &'static str {
        match self {
            LogLevel::Normal => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace | LogLevel::TraceAll => "debug",
        }
    }

    /// Verbosity flag understood by the pruner CLI
    pub fn verbosity(self) -> i32 {
        match self {
            LogLevel::Normal => 2,
            LogLevel::Debug => 4,
            LogLevel::Trace => 6,
            LogLevel::TraceAll => 8,
        }
    }
}

/// An additional route exposing the registry
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageRegistryConfigRoute {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Secret holding the route's TLS certificate and key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

/// Observed state of the registry
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageRegistryStatus {
    /// Generation last acted upon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Kubernetes-style conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Storage configuration the registry is running with
    #[serde(default)]
    pub storage: ImageRegistryStorage,

    /// The operator chose the bucket/container name and owns its lifecycle
    #[serde(default)]
    pub storage_managed: bool,

    /// Ready registry pods
    #[serde(default)]
    pub ready_replicas: i32,
}
