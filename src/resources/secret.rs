use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use rand::Rng;

use crate::resources::common::object_meta;
use crate::storage::PRIVATE_CONFIGURATION_SECRET;

pub const HTTP_SECRET_KEY: &str = "REGISTRY_HTTP_SECRET";

/// Generate a random HTTP secret, hex encoded
pub fn generate_http_secret() -> String {
    let mut bytes = [0u8; 64];
    rand::rng().fill(&mut bytes[..]);
    hex::encode(bytes)
}

/// Secret with the registry's private configuration
///
/// Storage credentials are added to the same secret by the credential flow;
/// apply merges keys so they survive.
pub fn private_configuration(
    namespace: &str,
    http_secret: &str,
    component: &str,
    owner: &OwnerReference,
) -> Secret {
    Secret {
        metadata: object_meta(PRIVATE_CONFIGURATION_SECRET, Some(namespace), component, owner),
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(
            HTTP_SECRET_KEY.to_string(),
            ByteString(http_secret.as_bytes().to_vec()),
        )])),
        ..Default::default()
    }
}
