//! Service fronting the registry pods

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::resources::common::object_meta;

pub const SERVICE_NAME: &str = "image-registry";
pub const REGISTRY_PORT: i32 = 5000;

/// Secret the service CA operator issues the serving certificate into
pub const TLS_SECRET_NAME: &str = "image-registry-tls";

const SERVING_CERT_ANNOTATION: &str = "service.beta.openshift.io/serving-cert-secret-name";

/// Labels selecting registry pods
pub fn pod_selector() -> BTreeMap<String, String> {
    BTreeMap::from([("docker-registry".to_string(), "default".to_string())])
}

pub fn registry_service(namespace: &str, component: &str, owner: &OwnerReference) -> Service {
    let mut metadata = object_meta(SERVICE_NAME, Some(namespace), component, owner);
    metadata.annotations = Some(BTreeMap::from([(
        SERVING_CERT_ANNOTATION.to_string(),
        TLS_SECRET_NAME.to_string(),
    )]));

    Service {
        metadata,
        spec: Some(ServiceSpec {
            selector: Some(pod_selector()),
            ports: Some(vec![ServicePort {
                name: Some(format!("{}-tcp", REGISTRY_PORT)),
                port: REGISTRY_PORT,
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::Int(REGISTRY_PORT)),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            session_affinity: Some("None".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// In-cluster address of the registry
pub fn service_host(namespace: &str) -> String {
    format!("{}.{}.svc:{}", SERVICE_NAME, namespace, REGISTRY_PORT)
}
