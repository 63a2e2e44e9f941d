use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Cluster-wide infrastructure description, read-only for this operator
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[kube(
    group = "config.openshift.io",
    version = "v1",
    kind = "Infrastructure",
    plural = "infrastructures",
    status = "InfrastructureStatus",
    derive = "PartialEq"
)]
pub struct InfrastructureSpec {}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureStatus {
    /// Unique cluster infrastructure identifier used to name cloud resources
    #[serde(default)]
    pub infrastructure_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_status: Option<PlatformStatus>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct PlatformStatus {
    #[serde(rename = "type", default)]
    pub type_: PlatformType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsPlatformStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcp: Option<GcpPlatformStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzurePlatformStatus>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq)]
pub enum PlatformType {
    #[serde(rename = "AWS")]
    Aws,
    #[serde(rename = "GCP")]
    Gcp,
    Azure,
    OpenStack,
    BareMetal,
    #[serde(rename = "VSphere")]
    VSphere,
    #[default]
    #[serde(rename = "None")]
    NoPlatform,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for PlatformType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PlatformType::Aws => "AWS",
            PlatformType::Gcp => "GCP",
            PlatformType::Azure => "Azure",
            PlatformType::OpenStack => "OpenStack",
            PlatformType::BareMetal => "BareMetal",
            PlatformType::VSphere => "VSphere",
            PlatformType::NoPlatform => "None",
            PlatformType::Unknown => "Unknown",
        };
        write!(f, "{}", name)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
pub struct AwsPlatformStatus {
    #[serde(default)]
    pub region: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GcpPlatformStatus {
    #[serde(default)]
    pub region: String,

    #[serde(default, rename = "projectID")]
    pub project_id: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzurePlatformStatus {
    #[serde(default)]
    pub resource_group_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_name: Option<String>,
}

impl Infrastructure {
    /// Platform type, `None` when the status is not populated yet
    pub fn platform(&self) -> PlatformType {
        self.status
            .as_ref()
            .and_then(|s| s.platform_status.as_ref())
            .map(|p| p.type_)
            .unwrap_or_default()
    }

    pub fn infrastructure_name(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.infrastructure_name.as_str())
            .unwrap_or_default()
    }
}
