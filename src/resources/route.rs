//! Routes exposing the registry outside the cluster

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use crate::controller::error::{Error, Result};
use crate::controller::generator::ClusterContext;
use crate::crd::{ImageRegistryConfigRoute, Route, RoutePort, RouteSpec, RouteTargetReference, TlsConfig};
use crate::resources::common::object_meta;
use crate::resources::service::{REGISTRY_PORT, SERVICE_NAME};

pub const DEFAULT_ROUTE_NAME: &str = "default-route";

fn route_spec(host: Option<String>, tls: TlsConfig) -> RouteSpec {
    RouteSpec {
        host,
        to: RouteTargetReference {
            kind: "Service".to_string(),
            name: SERVICE_NAME.to_string(),
            weight: Some(100),
        },
        port: Some(RoutePort {
            target_port: format!("{}-tcp", REGISTRY_PORT),
        }),
        tls: Some(tls),
    }
}

fn reencrypt() -> TlsConfig {
    TlsConfig {
        termination: "reencrypt".to_string(),
        insecure_edge_termination_policy: Some("Redirect".to_string()),
        ..Default::default()
    }
}

/// Route with a router-assigned host
pub fn default_route(namespace: &str, component: &str, owner: &OwnerReference) -> Route {
    Route {
        metadata: object_meta(DEFAULT_ROUTE_NAME, Some(namespace), component, owner),
        spec: route_spec(None, reencrypt()),
    }
}

/// Route for a user-declared hostname
///
/// When the route names a TLS secret, its certificate must already be in
/// `ctx.route_certificates`; a missing secret is reported as `NotFound` and
/// retried.
pub fn additional_route(
    route: &ImageRegistryConfigRoute,
    ctx: &ClusterContext,
    component: &str,
    owner: &OwnerReference,
) -> Result<Route> {
    let mut tls = reencrypt();
    if let Some(secret_name) = &route.secret_name {
        let cert = ctx.route_certificates.get(secret_name).ok_or_else(|| {
            Error::NotFound(format!(
                "secret {}/{} for route {}",
                ctx.namespace, secret_name, route.name
            ))
        })?;
        tls.certificate = cert.certificate.clone();
        tls.key = cert.key.clone();
        tls.ca_certificate = cert.ca_certificate.clone();
    }

    Ok(Route {
        metadata: object_meta(&route.name, Some(&ctx.namespace), component, owner),
        spec: route_spec(route.hostname.clone(), tls),
    })
}
