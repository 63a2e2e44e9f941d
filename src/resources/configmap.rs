//! Config maps whose content is injected by other cluster components

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use crate::resources::common::object_meta;

pub const TRUSTED_CA_NAME: &str = "trusted-ca";
pub const SERVICE_CA_NAME: &str = "serviceca";

/// Key the cluster trust bundle is injected under
pub const TRUSTED_CA_KEY: &str = "ca-bundle.crt";

const INJECT_TRUSTED_CABUNDLE_LABEL: &str = "config.openshift.io/inject-trusted-cabundle";
const INJECT_SERVICE_CABUNDLE_ANNOTATION: &str = "service.beta.openshift.io/inject-cabundle";

/// Config map the network operator fills with the cluster trust bundle
///
/// `data` is left unset so apply never overwrites the injected bundle.
pub fn trusted_ca(namespace: &str, component: &str, owner: &OwnerReference) -> ConfigMap {
    let mut metadata = object_meta(TRUSTED_CA_NAME, Some(namespace), component, owner);
    metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(INJECT_TRUSTED_CABUNDLE_LABEL.to_string(), "true".to_string());
    ConfigMap {
        metadata,
        ..Default::default()
    }
}

/// Config map the service CA operator fills with the service signing CA
pub fn service_ca(namespace: &str, component: &str, owner: &OwnerReference) -> ConfigMap {
    let mut metadata = object_meta(SERVICE_CA_NAME, Some(namespace), component, owner);
    metadata.annotations = Some(BTreeMap::from([(
        INJECT_SERVICE_CABUNDLE_ANNOTATION.to_string(),
        "true".to_string(),
    )]));
    ConfigMap {
        metadata,
        ..Default::default()
    }
}

/// Whether an injected trust bundle is present
pub fn has_trusted_ca(config_map: &ConfigMap) -> bool {
    config_map
        .data
        .as_ref()
        .and_then(|d| d.get(TRUSTED_CA_KEY))
        .is_some_and(|bundle| !bundle.trim().is_empty())
}
