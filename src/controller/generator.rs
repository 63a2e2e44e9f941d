//! Desired-state generator contract

use std::collections::BTreeMap;

use crate::controller::error::Result;
use crate::controller::objects::{ManagedObject, ObjectKind};
use crate::crd::{Infrastructure, PlatformType};

/// TLS material for an additional route, read from its secret
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RouteCertificate {
    pub certificate: Option<String>,
    pub key: Option<String>,
    pub ca_certificate: Option<String>,
}

/// Read-only cluster facts a generator may depend on
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterContext {
    /// Namespace holding every namespaced managed object
    pub namespace: String,
    pub platform: PlatformType,
    pub infrastructure_name: String,
    pub region: String,
    pub gcp_project: String,
    pub azure_cloud_name: Option<String>,
    pub registry_image: String,
    pub pruner_image: String,
    /// Route secrets by name, read by the caller before generating
    pub route_certificates: BTreeMap<String, RouteCertificate>,
}

impl ClusterContext {
    pub fn new(namespace: &str, registry_image: &str, pruner_image: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            registry_image: registry_image.to_string(),
            pruner_image: pruner_image.to_string(),
            ..Default::default()
        }
    }

    /// Fill platform facts from the cluster Infrastructure, when known
    pub fn with_infrastructure(mut self, infra: Option<&Infrastructure>) -> Self {
        let Some(infra) = infra else {
            return self;
        };
        self.platform = infra.platform();
        self.infrastructure_name = infra.infrastructure_name().to_string();
        let platform_status = infra.status.as_ref().and_then(|s| s.platform_status.as_ref());
        if let Some(ps) = platform_status {
            if let Some(aws) = &ps.aws {
                self.region = aws.region.clone();
            }
            if let Some(gcp) = &ps.gcp {
                self.region = gcp.region.clone();
                self.gcp_project = gcp.project_id.clone();
            }
            if let Some(azure) = &ps.azure {
                self.azure_cloud_name = azure.cloud_name.clone();
            }
        }
        self
    }
}

/// Derives the ordered set of objects a resource needs
///
/// Implementations are pure: identical input yields identical output, in the
/// same order, so checksums stay stable between reconciles.
pub trait Generator<R>: Send + Sync {
    /// Objects to apply, in dependency order
    fn generate(&self, resource: &R, ctx: &ClusterContext) -> Result<Vec<ManagedObject>>;

    /// Kinds this generator may produce, in apply order
    fn managed_kinds(&self) -> &'static [ObjectKind];

    /// Label selector matching every object this generator produced
    fn selector(&self) -> String;
}
